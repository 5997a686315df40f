pub mod permutation;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Process-relative wall clock, threaded explicitly through every component
/// that needs timestamps. Tests drive a manual source instead of real time.
#[derive(Debug, Clone)]
pub enum Clock {
    Real(Instant),
    Manual(Arc<AtomicU64>),
}

impl Clock {
    pub fn system() -> Self {
        Self::Real(Instant::now())
    }

    /// Manual clock for deterministic tests; the returned handle advances it.
    pub fn manual() -> (Self, Arc<AtomicU64>) {
        let micros = Arc::new(AtomicU64::new(0));
        (Self::Manual(micros.clone()), micros)
    }

    /// Seconds elapsed since process (or test) start.
    pub fn elapsed(&self) -> f32 {
        match self {
            Self::Real(origin) => origin.elapsed().as_secs_f32(),
            Self::Manual(micros) => micros.load(Ordering::Relaxed) as f32 * 1e-6,
        }
    }
}

#[cfg(test)]
pub fn advance(micros: &AtomicU64, seconds: f32) {
    micros.fetch_add((seconds * 1e6) as u64, Ordering::Relaxed);
}
