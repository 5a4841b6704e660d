// src/timebase.rs
//! Shared clock for all ranks.
//!
//! Each rank anchors a monotonic clock right after a barrier, so `now()`
//! values from different ranks share (approximately) the same zero point.
//! Wall clocks are exchanged once to report how far the hosts disagree.

use crate::comm::{CommError, Communicator};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Timebase {
    anchor: Instant,
    /// This rank's wall clock minus rank 0's, in seconds
    wall_clock_delta: f64,
    /// Largest disagreement between any two ranks' wall clocks
    deviation: f64,
}

impl Timebase {
    /// Single-rank clock starting now (tests, standalone tools).
    pub fn start() -> Self {
        Self {
            anchor: Instant::now(),
            wall_clock_delta: 0.0,
            deviation: 0.0,
        }
    }

    /// Collectively establish the common zero point.
    pub fn synchronize<C: Communicator>(comm: &C) -> Result<Self, CommError> {
        comm.barrier()?;
        let anchor = Instant::now();
        let wall = wall_clock_seconds();

        let walls: Vec<f64> = comm
            .all_gather_f64(&[wall])?
            .into_iter()
            .flatten()
            .collect();
        let root = walls.first().copied().unwrap_or(wall);
        let min = walls.iter().copied().fold(f64::INFINITY, f64::min);
        let max = walls.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let deviation = (max - min).max(0.0);

        if comm.rank() == 0 {
            info!(
                ranks = comm.size(),
                "clock deviation across ranks: {:.6}s",
                deviation
            );
            if deviation > 1.0 {
                warn!("wall clocks differ by more than a second; start/end timestamps are not comparable across hosts");
            }
        }

        Ok(Self {
            anchor,
            wall_clock_delta: wall - root,
            deviation,
        })
    }

    /// Seconds since the common zero point.
    pub fn now(&self) -> f64 {
        self.anchor.elapsed().as_secs_f64()
    }

    pub fn wall_clock_delta(&self) -> f64 {
        self.wall_clock_delta
    }

    pub fn deviation(&self) -> f64 {
        self.deviation
    }
}

fn wall_clock_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Human-readable local time for run headers
pub fn timestamp_string() -> String {
    chrono::Local::now().format("%m/%d/%Y %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalGroup;

    #[test]
    fn test_now_is_monotonic() {
        let tb = Timebase::start();
        let a = tb.now();
        let b = tb.now();
        assert!(b >= a);
        assert!(a >= 0.0);
    }

    #[test]
    fn test_synchronized_ranks_share_zero() {
        let clocks = LocalGroup::run(3, |comm| Ok(Timebase::synchronize(&comm)?)).unwrap();
        for tb in &clocks {
            // same host, so the ranks agree to well within a second
            assert!(tb.deviation() < 1.0);
            assert!(tb.wall_clock_delta().abs() < 1.0);
        }
        let spread = clocks
            .iter()
            .map(|t| t.now())
            .fold(f64::NEG_INFINITY, f64::max)
            - clocks.iter().map(|t| t.now()).fold(f64::INFINITY, f64::min);
        assert!(spread < 1.0);
    }
}
