use std::sync::atomic::{AtomicU32, Ordering};

/// An `f32` cell supporting lock-free atomic addition.
///
/// The value is stored as its bit pattern in an [`AtomicU32`]; `fetch_add`
/// retries a compare-exchange until no other worker raced the update.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub const fn zero() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self, order: Ordering) -> f32 {
        f32::from_bits(self.0.load(order))
    }

    pub fn store(&self, value: f32, order: Ordering) {
        self.0.store(value.to_bits(), order)
    }

    /// Adds `value` and returns the previous contents.
    pub fn fetch_add(&self, value: f32, order: Ordering) -> f32 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let next = (f32::from_bits(current) + value).to_bits();
            match self
                .0
                .compare_exchange_weak(current, next, order, Ordering::Relaxed)
            {
                Ok(prev) => return f32::from_bits(prev),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn into_inner(self) -> f32 {
        f32::from_bits(self.0.into_inner())
    }
}
