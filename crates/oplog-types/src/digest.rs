use borsh::{BorshDeserialize, BorshSerialize};
use braid_primitives::IndexHead;

use crate::{Checkpoint, CodecError};

/// Authoritative membership record, persisted as the tail of the system
/// view's log.
///
/// `writers` is the current writer set with each writer's indexed length;
/// `heads` are the committed tips in force at the flush that produced the
/// digest. Both lists are ordered by writer key so independently produced
/// digests compare bytewise.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SystemDigest {
    pub writers: Vec<IndexHead>,
    pub heads: Vec<IndexHead>,
    pub checkpoint: Option<Checkpoint>,
}

impl SystemDigest {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        self.validate()?;
        Ok(borsh::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let digest: SystemDigest = borsh::from_slice(bytes)?;
        digest.validate()?;
        Ok(digest)
    }

    /// Indexed length recorded for `key`, if the writer is a member.
    pub fn writer_length(&self, key: &braid_primitives::WriterKey) -> Option<u64> {
        self.writers
            .iter()
            .find(|entry| entry.key == *key)
            .map(|entry| entry.length)
    }

    fn validate(&self) -> Result<(), CodecError> {
        let sorted = |entries: &[IndexHead]| entries.windows(2).all(|w| w[0].key < w[1].key);
        if !sorted(&self.writers) {
            return Err(CodecError::Invalid("digest writers must be key-ordered"));
        }
        if !sorted(&self.heads) {
            return Err(CodecError::Invalid("digest heads must be key-ordered"));
        }
        if self.heads.iter().any(|head| head.length == 0) {
            return Err(CodecError::Invalid("digest head lengths start at one"));
        }
        Ok(())
    }
}
