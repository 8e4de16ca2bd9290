//! Decoded picture buffer management.
//!
//! Each codec carries its own reference state machine. The three variants
//! share the sequence/picture start/end surface but deliberately do not
//! share an abstraction over their internals: H.264 field-pair marking and
//! AV1 virtual-buffer rotation have nothing in common worth unifying.

pub mod av1;
pub mod h264;
pub mod h265;

/// Reference marking of a stored picture (or of one of its fields).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Marking {
    #[default]
    Unused,
    ShortTerm,
    LongTerm,
}

impl Marking {
    pub fn is_reference(self) -> bool {
        self != Marking::Unused
    }
}

/// Reference picture lists produced for one picture, as DPB slot indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefPicLists {
    pub l0: Vec<u8>,
    pub l1: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum DpbError {
    #[error("no free DPB slot available")]
    Full,
    #[error("invalid reference marking operation")]
    InvalidMarking,
    #[error("DPB slot index {0} out of range")]
    BadSlot(usize),
}
