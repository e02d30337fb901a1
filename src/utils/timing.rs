use std::fmt;
use std::time::Duration;

use quanta::Instant;
use serde::{Deserialize, Serialize};

/// Wall-clock timer of one transfer run.
pub struct RunTimer {
    start: Instant,
}

impl RunTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Summarize `iterations` transfers of `size` bytes each.
    pub fn finish(&self, size: usize, iterations: u64) -> RunStats {
        RunStats::from_elapsed(self.start.elapsed(), size, iterations)
    }
}

/// Run time and bandwidth of a transfer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub iterations: u64,
    pub bytes_per_iter: usize,
    pub secs: f64,
    pub usec_per_iter: f64,

    /// Decimal megabytes per second.
    pub mb_per_sec: f64,
}

impl RunStats {
    pub fn from_elapsed(elapsed: Duration, size: usize, iterations: u64) -> Self {
        let secs = elapsed.as_secs_f64();
        let usec = secs * 1e6;
        let (usec_per_iter, mb_per_sec) = if iterations == 0 || usec == 0.0 {
            (0.0, 0.0)
        } else {
            (
                usec / iterations as f64,
                (size as f64 * iterations as f64) / usec,
            )
        };
        Self {
            iterations,
            bytes_per_iter: size,
            secs,
            usec_per_iter,
            mb_per_sec,
        }
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} iters in {:.2} seconds = {:.2} usec/iter, {:.2} MB/sec",
            self.iterations, self.secs, self.usec_per_iter, self.mb_per_sec
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bandwidth() {
        let stats = RunStats::from_elapsed(Duration::from_secs(2), 4096, 1000);
        assert_eq!(stats.usec_per_iter, 2000.0);
        assert!((stats.mb_per_sec - 2.048).abs() < 1e-9);
        assert_eq!(
            stats.to_string(),
            "1000 iters in 2.00 seconds = 2000.00 usec/iter, 2.05 MB/sec"
        );

        let idle = RunStats::from_elapsed(Duration::ZERO, 4096, 0);
        assert_eq!(idle.mb_per_sec, 0.0);
    }
}
