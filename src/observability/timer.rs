//! Elapsed-time measurement for slow query detection

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct Timer {
    started: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// True once `threshold_ms` has passed; a zero threshold disables it
    pub fn exceeded(&self, threshold_ms: u64) -> bool {
        threshold_ms > 0 && self.elapsed_ms() > threshold_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_threshold_never_exceeded() {
        let timer = Timer::start();
        std::thread::sleep(Duration::from_millis(2));
        assert!(!timer.exceeded(0));
        assert!(timer.exceeded(1));
    }
}
