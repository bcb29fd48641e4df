//! Oplog signing and verification

use strand_core::{MasterSign, Oplog, StrandError, StrandResult};

use crate::{hash, Identity, PublicIdentity};

/// Fill in salt, hash, signature and creator fields of `log`
///
/// `log.creator_id` must be the signer's ID. The creator's own signature
/// becomes the first entry of `master_signs`.
pub fn sign_oplog(identity: &Identity, log: &mut Oplog, salt: &[u8]) -> StrandResult<()> {
    if log.creator_id != identity.id() {
        return Err(StrandError::CreatorMismatch(log.creator_id));
    }

    log.salt = salt.to_vec();
    let digest = hash(&log.signable_bytes()?);
    let sig = identity.sign(&digest);

    log.hash = digest.to_vec();
    log.sig = sig.to_vec();
    log.pubkey = identity.verifying_key_bytes().to_vec();
    log.creator_hash = identity.id().owner().to_vec();
    log.master_signs = vec![MasterSign {
        id: identity.id(),
        sig: sig.to_vec(),
    }];
    Ok(())
}

/// Check hash, creator binding and signature of a received log
pub fn verify_oplog(log: &Oplog) -> StrandResult<()> {
    let expected = hash(&log.signable_bytes()?);
    if log.hash.as_slice() != expected.as_slice() {
        return Err(StrandError::InvalidHash(log.id));
    }

    let pubkey: [u8; 32] = log
        .pubkey
        .as_slice()
        .try_into()
        .map_err(|_| StrandError::CreatorMismatch(log.creator_id))?;
    let public =
        PublicIdentity::from_bytes(&pubkey).ok_or(StrandError::InvalidSignature(log.id))?;

    let owner = public.owner();
    if owner != log.creator_id.owner() || log.creator_hash.as_slice() != owner.as_slice() {
        return Err(StrandError::CreatorMismatch(log.creator_id));
    }

    let sig: [u8; 64] = log
        .sig
        .as_slice()
        .try_into()
        .map_err(|_| StrandError::InvalidSignature(log.id))?;
    if !public.verify(&log.hash, &sig) {
        tracing::debug!(log = %log.id, creator = %log.creator_id, "Oplog signature rejected");
        return Err(StrandError::InvalidSignature(log.id));
    }
    Ok(())
}

/// Append `identity`'s co-signature unless it already signed. Returns
/// whether a signature was added.
pub fn co_sign(identity: &Identity, log: &mut Oplog) -> bool {
    if log.is_signed_by(&identity.id()) {
        return false;
    }
    log.master_signs.push(MasterSign {
        id: identity.id(),
        sig: identity.sign(&log.hash).to_vec(),
    });
    true
}
