use borsh::{BorshDeserialize, BorshSerialize};

/// Snapshot of the system view's committed state, embedded into local
/// writer blocks so any participant can resume from the log alone.
///
/// `length` is the system core length the snapshot was taken at; `payload`
/// is opaque to the oplog layer (the system view stores its encoded digest
/// there).
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Checkpoint {
    pub length: u64,
    pub payload: Vec<u8>,
}

impl Checkpoint {
    pub fn new(length: u64, payload: Vec<u8>) -> Self {
        Self { length, payload }
    }
}
