//! Oplog categories and operation kinds
//!
//! Every entity keeps one independent chain space per category:
//! - Master: who may sign for the entity
//! - Member: who belongs to the entity
//! - OpKey: rotating symmetric keys for the entity's encrypted channel
//! - Me: identity-level events of a "Me" identity
//! - Content: generic per-object mutations of the entity's content

use serde::{Deserialize, Serialize};

/// Oplog category determines which merger and apply function handle a log
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum OplogCategory {
    Master = 0x00,
    Member = 0x01,
    OpKey = 0x02,
    Me = 0x03,
    Content = 0x04,
}

impl OplogCategory {
    pub const ALL: [OplogCategory; 5] = [
        OplogCategory::Master,
        OplogCategory::Member,
        OplogCategory::OpKey,
        OplogCategory::Me,
        OplogCategory::Content,
    ];

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(OplogCategory::Master),
            0x01 => Some(OplogCategory::Member),
            0x02 => Some(OplogCategory::OpKey),
            0x03 => Some(OplogCategory::Me),
            0x04 => Some(OplogCategory::Content),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Short name used in storage keys and logs
    pub fn name(self) -> &'static str {
        match self {
            OplogCategory::Master => "master",
            OplogCategory::Member => "member",
            OplogCategory::OpKey => "opkey",
            OplogCategory::Me => "me",
            OplogCategory::Content => "content",
        }
    }
}

impl std::fmt::Display for OplogCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Operation kind; the high nibble selects the category
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Op {
    // Master
    AddMaster = 0x01,
    TransferMaster = 0x02,
    RevokeMaster = 0x03,

    // Member
    AddMember = 0x11,
    DeleteMember = 0x12,

    // Op key
    CreateOpKey = 0x21,
    RevokeOpKey = 0x22,

    // Me
    CreateMe = 0x31,
    CreateEntity = 0x32,
    JoinEntity = 0x33,
    AddDevice = 0x34,
    MigrateMe = 0x35,

    // Content
    CreateObject = 0x41,
    UpdateObject = 0x42,
    DeleteObject = 0x43,
}

impl Op {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Op::AddMaster),
            0x02 => Some(Op::TransferMaster),
            0x03 => Some(Op::RevokeMaster),
            0x11 => Some(Op::AddMember),
            0x12 => Some(Op::DeleteMember),
            0x21 => Some(Op::CreateOpKey),
            0x22 => Some(Op::RevokeOpKey),
            0x31 => Some(Op::CreateMe),
            0x32 => Some(Op::CreateEntity),
            0x33 => Some(Op::JoinEntity),
            0x34 => Some(Op::AddDevice),
            0x35 => Some(Op::MigrateMe),
            0x41 => Some(Op::CreateObject),
            0x42 => Some(Op::UpdateObject),
            0x43 => Some(Op::DeleteObject),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn category(self) -> OplogCategory {
        match self.to_byte() >> 4 {
            0x0 => OplogCategory::Master,
            0x1 => OplogCategory::Member,
            0x2 => OplogCategory::OpKey,
            0x3 => OplogCategory::Me,
            _ => OplogCategory::Content,
        }
    }
}
