//! Lock-free live weight shared between the polling thread and the orchestrator.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Last reported weight of one station, stored as `f32` bits.
///
/// Clones share the same cell. This is the only Station field that may be
/// written from a thread other than the orchestrator's.
#[derive(Debug, Clone, Default)]
pub struct WeightCell(Arc<AtomicU32>);

impl WeightCell {
    pub fn new(grams: f32) -> Self {
        Self(Arc::new(AtomicU32::new(grams.to_bits())))
    }

    #[inline]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, grams: f32) {
        self.0.store(grams.to_bits(), Ordering::Release);
    }
}
