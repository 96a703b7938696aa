//! Wire records for braid oplogs: the local writer block layout, the
//! checkpoint record it embeds, and the system membership digest.

mod checkpoint;
mod digest;
mod error;
mod message;

pub use checkpoint::Checkpoint;
pub use digest::SystemDigest;
pub use error::CodecError;
pub use message::OplogMessage;
