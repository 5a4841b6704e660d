// src/stonewall.rs
//! Stonewall deadlines and the wear-out protocol.
//!
//! A stonewalled loop stops once its phase deadline has passed and records
//! how many items it finished. With wear-out enabled, all ranks then agree
//! on the largest count seen anywhere and every rank that stopped short
//! keeps going, deadline off, until it reaches that count. Later phases
//! address `[0, max)` and depend on those items existing on every rank.
//!
//! Early termination is expected behaviour and is reported, not raised.

use crate::comm::{CommError, Communicator, ReduceOp};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Which phases honour the deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StonewallScope {
    /// Only create phases (the usual benchmark setup)
    #[default]
    Create,
    /// Create, stat and read phases
    CreateAndRead,
    /// Every item phase, removal included
    All,
}

impl std::str::FromStr for StonewallScope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(StonewallScope::Create),
            "create_and_read" | "create-and-read" | "reads" => Ok(StonewallScope::CreateAndRead),
            "all" => Ok(StonewallScope::All),
            other => anyhow::bail!("unknown stonewall scope '{}' (create|create_and_read|all)", other),
        }
    }
}

/// Deadline settings resolved from the run configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StonewallSettings {
    /// Zero disables the deadline entirely
    pub deadline: Duration,
    pub wear_out: bool,
}

impl StonewallSettings {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        !self.deadline.is_zero()
    }
}

/// Per-phase progress owned by one rank
#[derive(Debug, Clone)]
pub struct Progress {
    start: Instant,
    deadline: Option<Duration>,
    items_done: u64,
}

impl Progress {
    /// Start the phase clock. A zero deadline never expires.
    pub fn begin(deadline: Duration) -> Self {
        Self {
            start: Instant::now(),
            deadline: (!deadline.is_zero()).then_some(deadline),
            items_done: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn expired(&self) -> bool {
        match self.deadline {
            Some(deadline) => self.start.elapsed() > deadline,
            None => false,
        }
    }

    pub fn record_local_progress(&mut self, items: u64) {
        self.items_done = items;
    }

    pub fn items_done(&self) -> u64 {
        self.items_done
    }

    /// The wear-out extension runs with the deadline off
    fn begin_extension(&mut self) {
        self.deadline = None;
    }
}

/// Counts agreed on after a stonewalled loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WearOut {
    pub local: u64,
    pub min: u64,
    pub max: u64,
}

/// Collectively find the smallest and largest completed counts.
///
/// A rank that finished nothing still takes part with a count of zero.
pub fn wear_out<C: Communicator>(comm: &C, progress: &Progress) -> Result<WearOut, CommError> {
    let local = progress.items_done();
    let max = comm.all_reduce_u64(local, ReduceOp::Max)?;
    let min = comm.all_reduce_u64(local, ReduceOp::Min)?;
    Ok(WearOut { local, min, max })
}

/// What a stonewalled loop reports about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StonewallReport {
    /// Items this rank finished before the deadline (or the range end)
    pub done_before_deadline: u64,
    /// Group-wide minimum before extension (local count without wear-out)
    pub min: u64,
    /// Group-wide maximum before extension (local count without wear-out)
    pub max: u64,
    /// Whether this rank ran extra items after the deadline
    pub extended: bool,
    /// Whether the deadline fired on this rank
    pub hit: bool,
}

/// Result of a stonewalled loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StonewallOutcome {
    /// Items completed, the count later phases must use
    pub items_done: u64,
    /// `None` when no deadline was configured
    pub report: Option<StonewallReport>,
}

/// Run `op(0..count)` under the stonewall protocol.
///
/// `op` receives the offset of the item within this rank's range. With the
/// deadline disabled this is a plain loop with no collective calls. With it
/// enabled and wear-out on, every rank must call this function.
pub fn run_stonewalled<C, F>(
    comm: &C,
    settings: StonewallSettings,
    count: u64,
    mut op: F,
) -> Result<StonewallOutcome>
where
    C: Communicator,
    F: FnMut(u64) -> Result<()>,
{
    let mut progress = Progress::begin(settings.deadline);
    let mut done = 0;
    let mut hit = false;
    while done < count {
        op(done)?;
        done += 1;
        if progress.expired() {
            hit = done < count;
            break;
        }
    }
    progress.record_local_progress(done);

    if !progress.is_enabled() {
        return Ok(StonewallOutcome {
            items_done: done,
            report: None,
        });
    }

    if hit {
        debug!(rank = comm.rank(), items = done, "stonewall hit");
    }

    if !settings.wear_out {
        return Ok(StonewallOutcome {
            items_done: done,
            report: Some(StonewallReport {
                done_before_deadline: done,
                min: done,
                max: done,
                extended: false,
                hit,
            }),
        });
    }

    let agreed = wear_out(comm, &progress)?;
    if comm.rank() == 0 && agreed.min != agreed.max {
        info!(
            "continue stonewall hit min: {} max: {}",
            agreed.min, agreed.max
        );
    }

    let target = agreed.max.min(count);
    let extended = done < target;
    if extended {
        debug!(rank = comm.rank(), from = done, to = target, "wear-out extension");
        progress.begin_extension();
        while done < target {
            op(done)?;
            done += 1;
        }
        progress.record_local_progress(done);
    }

    Ok(StonewallOutcome {
        items_done: done,
        report: Some(StonewallReport {
            done_before_deadline: agreed.local,
            min: agreed.min,
            max: agreed.max,
            extended,
            hit,
        }),
    })
}
