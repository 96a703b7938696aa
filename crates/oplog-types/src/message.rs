use borsh::{BorshDeserialize, BorshSerialize};
use braid_primitives::IndexHead;

use crate::{Checkpoint, CodecError};

/// Block layout of a local writer's oplog.
///
/// `value` is the opaque user payload; `None` marks a heartbeat entry
/// (published by `ack` to advance heads without touching user views).
/// `heads` are the writer tips observed when the entry was produced.
/// `batch` counts down within an atomic group: intermediate members carry
/// `batch > 1`, the final member carries `batch = 1`.
///
/// `checkpointer` is the hop distance back to the nearest block carrying a
/// checkpoint; it is zero exactly when `checkpoint` is present on this
/// block.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct OplogMessage {
    pub value: Option<Vec<u8>>,
    pub heads: Vec<IndexHead>,
    pub batch: u32,
    pub checkpointer: u32,
    pub checkpoint: Option<Checkpoint>,
}

impl OplogMessage {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        self.validate()?;
        Ok(borsh::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let message: OplogMessage = borsh::from_slice(bytes)?;
        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<(), CodecError> {
        if self.batch == 0 {
            return Err(CodecError::Invalid("batch must be positive"));
        }
        if (self.checkpointer == 0) != self.checkpoint.is_some() {
            return Err(CodecError::Invalid(
                "checkpointer must be zero exactly when a checkpoint is embedded",
            ));
        }
        if self.heads.iter().any(|head| head.length == 0) {
            return Err(CodecError::Invalid("head lengths start at one"));
        }
        Ok(())
    }
}
