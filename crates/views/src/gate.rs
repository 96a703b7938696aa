use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Marker for an active apply call.
///
/// Every view handle carries a reference to the gate; mutations check it
/// and fail outside an apply. A single flag suffices because applies never
/// nest (the advance loop is one logical task).
#[derive(Debug, Default)]
pub struct ApplyGate {
    applying: AtomicBool,
}

impl ApplyGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enter(&self) {
        self.applying.store(true, Ordering::Release);
    }

    pub fn exit(&self) {
        self.applying.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.applying.load(Ordering::Acquire)
    }
}
