//! Construction of signed oplogs

use serde::Serialize;

use strand_core::{Id, Op, Oplog, StrandResult};
use strand_crypto::{sign_oplog, Identity};
use strand_time::Env;

/// Where a new log hangs in its chain and who authorizes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainPosition {
    pub pre_log_id: Id,
    /// `None` makes the log authorize itself (entity genesis master)
    pub master_log_id: Option<Id>,
}

impl ChainPosition {
    /// First log of an object, authorized by `master_log_id`
    pub fn root(master_log_id: Id) -> Self {
        ChainPosition {
            pre_log_id: Id::NIL,
            master_log_id: Some(master_log_id),
        }
    }

    pub fn after(pre_log_id: Id, master_log_id: Id) -> Self {
        ChainPosition {
            pre_log_id,
            master_log_id: Some(master_log_id),
        }
    }

    pub fn self_authorized() -> Self {
        ChainPosition {
            pre_log_id: Id::NIL,
            master_log_id: None,
        }
    }
}

/// Builds oplogs signed by one identity
pub struct OplogBuilder<'a> {
    env: &'a Env,
    identity: &'a Identity,
}

impl<'a> OplogBuilder<'a> {
    pub fn new(env: &'a Env, identity: &'a Identity) -> Self {
        OplogBuilder { env, identity }
    }

    pub fn build<T: Serialize + ?Sized>(
        &self,
        op: Op,
        obj_id: Id,
        position: ChainPosition,
        extra: &T,
    ) -> StrandResult<Oplog> {
        let creator = self.identity.id();
        let id = self.env.new_id(&creator);
        let master_log_id = position.master_log_id.unwrap_or(id);

        let mut log = Oplog::new(
            id,
            obj_id,
            op,
            position.pre_log_id,
            master_log_id,
            creator,
            self.env.now(),
        );
        log.extra = serde_json::to_vec(extra)?;
        sign_oplog(self.identity, &mut log, &self.env.salt.salt())?;
        Ok(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::{NodeId, Timestamp};
    use strand_crypto::verify_oplog;

    #[test]
    fn test_self_authorized_build() {
        let env = Env::deterministic(Timestamp::from_secs(1), 1);
        let identity = Identity::generate(env.random.as_ref(), NodeId::new(1));
        let builder = OplogBuilder::new(&env, &identity);

        let log = builder
            .build(Op::AddMaster, identity.id(), ChainPosition::self_authorized(), &())
            .unwrap();

        assert!(log.is_self_authorized());
        assert!(log.is_root());
        assert!(log.id.is_created_by(&identity.id()));
        assert!(verify_oplog(&log).is_ok());
    }

    #[test]
    fn test_chained_build() {
        let env = Env::deterministic(Timestamp::from_secs(1), 1);
        let identity = Identity::generate(env.random.as_ref(), NodeId::new(1));
        let builder = OplogBuilder::new(&env, &identity);
        let master = Id::new([1; 32]);
        let pre = Id::new([2; 32]);

        let log = builder
            .build(Op::UpdateObject, Id::new([3; 32]), ChainPosition::after(pre, master), "body")
            .unwrap();

        assert_eq!(log.pre_log_id, pre);
        assert_eq!(log.master_log_id, master);
        assert_eq!(log.extra_as::<String>().unwrap(), "body");
    }
}
