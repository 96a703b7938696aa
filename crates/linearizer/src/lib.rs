//! Causal-DAG linearization: per-writer log state, dependency resolution,
//! and the deterministic total order with its committed prefix.

mod error;
mod linearizer;
mod node;
mod writer;

pub use error::{LinearizerError, Result};
pub use linearizer::{Linearizer, OrderUpdate};
pub use node::Node;
pub use writer::{IndexedLookup, Writer, WriterSet};
