// src/comm.rs
//! Process-group collaborator: collectives and point-to-point messages.
//!
//! The benchmark core is SPMD. Every rank runs the same code and only
//! synchronizes through the [`Communicator`] collectives (barrier, gather,
//! reduce, broadcast) and, for the distributed walker, through a
//! [`Mailbox`] carrying opaque byte messages.
//!
//! [`LocalGroup`] implements both traits with one thread per rank. Each rank
//! owns its own [`LocalComm`]; nothing else is shared between ranks besides
//! the group state behind the collectives.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

/// How often a rank blocked in a collective re-checks the abort flag
const ABORT_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    #[error("process group aborted by rank {rank}: {reason}")]
    Aborted { rank: usize, reason: String },

    #[error("rank {0} is not reachable")]
    Disconnected(usize),

    #[error("collective mismatch: {0}")]
    Mismatch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Max,
    Min,
    Sum,
}

impl ReduceOp {
    fn fold_u64(self, values: &[u64]) -> u64 {
        match self {
            ReduceOp::Max => values.iter().copied().max().unwrap_or(0),
            ReduceOp::Min => values.iter().copied().min().unwrap_or(0),
            ReduceOp::Sum => values.iter().sum(),
        }
    }

    fn fold_f64(self, values: &[f64]) -> f64 {
        match self {
            ReduceOp::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            ReduceOp::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            ReduceOp::Sum => values.iter().sum(),
        }
    }
}

/// Collective operations over a fixed group of ranks.
///
/// Every method except `rank`, `size` and `abort` is collective: all ranks
/// of the group must call it, in the same order, before any returns.
pub trait Communicator: Send {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn barrier(&self) -> Result<(), CommError>;

    /// Gather one value from every rank, indexed by rank, on every rank.
    fn all_gather_u64(&self, value: u64) -> Result<Vec<u64>, CommError>;

    /// Gather a vector from every rank, indexed by rank, on every rank.
    fn all_gather_f64(&self, values: &[f64]) -> Result<Vec<Vec<f64>>, CommError>;

    /// Build a sub-group of the first `members` ranks. Ranks outside the
    /// sub-group receive `None`.
    fn split(&self, members: usize) -> Result<Option<Self>, CommError>
    where
        Self: Sized;

    /// Abort the whole group. Ranks blocked in, or later entering, a
    /// collective fail with [`CommError::Aborted`].
    fn abort(&self, reason: &str);

    fn all_reduce_u64(&self, value: u64, op: ReduceOp) -> Result<u64, CommError> {
        Ok(op.fold_u64(&self.all_gather_u64(value)?))
    }

    fn all_reduce_f64(&self, value: f64, op: ReduceOp) -> Result<f64, CommError> {
        let gathered = self.all_gather_f64(&[value])?;
        let flat: Vec<f64> = gathered.into_iter().flatten().collect();
        Ok(op.fold_f64(&flat))
    }

    fn broadcast_u64(&self, value: u64, root: usize) -> Result<u64, CommError> {
        let gathered = self.all_gather_u64(value)?;
        gathered
            .get(root)
            .copied()
            .ok_or_else(|| CommError::Mismatch(format!("broadcast root {} out of range", root)))
    }
}

/// Point-to-point byte messages, tagged with the sender's rank.
pub trait Mailbox: Send {
    fn send(&self, to: usize, payload: Vec<u8>) -> Result<(), CommError>;
    fn try_recv(&self) -> Result<Option<(usize, Vec<u8>)>, CommError>;
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<(usize, Vec<u8>)>, CommError>;
}

// -----------------------------------------------------------------------------
// In-process implementation
// -----------------------------------------------------------------------------

type Envelope = (usize, Vec<u8>);

/// Abort flag shared by a root group and every sub-group split from it
#[derive(Default)]
struct AbortCell {
    raised: AtomicBool,
    reason: Mutex<Option<(usize, String)>>,
}

impl AbortCell {
    fn raise(&self, rank: usize, reason: &str) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            *slot = Some((rank, reason.to_string()));
        }
        self.raised.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CommError> {
        if !self.raised.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (rank, reason) = self
            .reason
            .lock()
            .clone()
            .unwrap_or((0, "unknown".to_string()));
        Err(CommError::Aborted { rank, reason })
    }
}

struct BarrierState {
    arrived: usize,
    generation: u64,
}

struct GroupState {
    size: usize,
    abort: Arc<AbortCell>,
    barrier: Mutex<BarrierState>,
    released: Condvar,
    slots_u64: Mutex<Vec<u64>>,
    slots_f64: Mutex<Vec<Vec<f64>>>,
    senders: Vec<Sender<Envelope>>,
    receivers: Mutex<Vec<Option<Receiver<Envelope>>>>,
    splits: Mutex<HashMap<u64, Arc<GroupState>>>,
}

impl GroupState {
    fn new(size: usize, abort: Arc<AbortCell>) -> Self {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size)
            .map(|_| {
                let (tx, rx) = unbounded();
                (tx, Some(rx))
            })
            .unzip();
        Self {
            size,
            abort,
            barrier: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            released: Condvar::new(),
            slots_u64: Mutex::new(vec![0; size]),
            slots_f64: Mutex::new(vec![Vec::new(); size]),
            senders,
            receivers: Mutex::new(receivers),
            splits: Mutex::new(HashMap::new()),
        }
    }

    fn take_receiver(&self, rank: usize) -> Result<Receiver<Envelope>, CommError> {
        self.receivers
            .lock()
            .get_mut(rank)
            .and_then(Option::take)
            .ok_or_else(|| CommError::Mismatch(format!("mailbox of rank {} already taken", rank)))
    }

    fn wait(&self) -> Result<(), CommError> {
        self.abort.check()?;
        let mut state = self.barrier.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation += 1;
            self.released.notify_all();
            return Ok(());
        }
        loop {
            self.released.wait_for(&mut state, ABORT_POLL);
            if state.generation != generation {
                return Ok(());
            }
            self.abort.check()?;
        }
    }
}

/// One rank's handle on an in-process group.
pub struct LocalComm {
    rank: usize,
    state: Arc<GroupState>,
    inbox: Receiver<Envelope>,
    split_epoch: Cell<u64>,
}

impl std::fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("size", &self.state.size)
            .finish_non_exhaustive()
    }
}

/// Constructors for thread-per-rank groups
pub struct LocalGroup;

impl LocalGroup {
    /// Create `size` connected rank handles, one per future thread.
    pub fn new(size: usize) -> Vec<LocalComm> {
        let state = Arc::new(GroupState::new(size.max(1), Arc::new(AbortCell::default())));
        (0..state.size)
            .filter_map(|rank| {
                let inbox = state.take_receiver(rank).ok()?;
                Some(LocalComm {
                    rank,
                    state: Arc::clone(&state),
                    inbox,
                    split_epoch: Cell::new(0),
                })
            })
            .collect()
    }

    /// Run `body` on `size` ranks, one named thread each, and collect the
    /// per-rank results in rank order.
    ///
    /// A rank that returns an error aborts the group so no peer is left
    /// blocked in a collective. The first non-abort error is returned.
    pub fn run<T, F>(size: usize, body: F) -> anyhow::Result<Vec<T>>
    where
        T: Send,
        F: Fn(LocalComm) -> anyhow::Result<T> + Sync,
    {
        let comms = LocalGroup::new(size);
        let body = &body;
        let outcomes: Vec<anyhow::Result<T>> = std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(comms.len());
            for comm in comms {
                let rank = comm.rank;
                let abort = Arc::clone(&comm.state.abort);
                let spawned = std::thread::Builder::new()
                    .name(format!("rank-{}", rank))
                    .spawn_scoped(scope, move || {
                        let guard = AbortOnPanic { rank, abort: Arc::clone(&abort) };
                        let outcome = body(comm);
                        if let Err(e) = &outcome {
                            if !is_abort(e) {
                                error!(rank, "rank failed: {:#}", e);
                            }
                            abort.raise(rank, &format!("{:#}", e));
                        }
                        drop(guard);
                        outcome
                    });
                handles.push((rank, spawned));
            }
            handles
                .into_iter()
                .map(|(rank, spawned)| match spawned {
                    Ok(handle) => handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow::anyhow!("rank {} panicked", rank))),
                    Err(e) => Err(anyhow::anyhow!("failed to spawn rank {}: {}", rank, e)),
                })
                .collect()
        });

        let mut results = Vec::with_capacity(outcomes.len());
        let mut first_abort = None;
        for outcome in outcomes {
            match outcome {
                Ok(value) => results.push(value),
                Err(e) if is_abort(&e) => {
                    first_abort.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        match first_abort {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}

fn is_abort(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<CommError>(), Some(CommError::Aborted { .. }))
}

struct AbortOnPanic {
    rank: usize,
    abort: Arc<AbortCell>,
}

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.abort.raise(self.rank, "rank panicked");
        }
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.state.size
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.state.wait()
    }

    fn all_gather_u64(&self, value: u64) -> Result<Vec<u64>, CommError> {
        self.state.slots_u64.lock()[self.rank] = value;
        self.state.wait()?;
        let gathered = self.state.slots_u64.lock().clone();
        self.state.wait()?;
        Ok(gathered)
    }

    fn all_gather_f64(&self, values: &[f64]) -> Result<Vec<Vec<f64>>, CommError> {
        self.state.slots_f64.lock()[self.rank] = values.to_vec();
        self.state.wait()?;
        let gathered = self.state.slots_f64.lock().clone();
        self.state.wait()?;
        Ok(gathered)
    }

    fn split(&self, members: usize) -> Result<Option<Self>, CommError> {
        if members == 0 || members > self.state.size {
            return Err(CommError::Mismatch(format!(
                "cannot split {} ranks out of a group of {}",
                members, self.state.size
            )));
        }
        let epoch = self.split_epoch.get();
        self.split_epoch.set(epoch + 1);

        let child = Arc::clone(
            self.state
                .splits
                .lock()
                .entry(epoch)
                .or_insert_with(|| Arc::new(GroupState::new(members, Arc::clone(&self.state.abort)))),
        );
        if child.size != members {
            return Err(CommError::Mismatch(format!(
                "split {} requested {} members, group has {}",
                epoch, members, child.size
            )));
        }
        self.barrier()?;

        let sub = if self.rank < members {
            Some(LocalComm {
                rank: self.rank,
                inbox: child.take_receiver(self.rank)?,
                state: child,
                split_epoch: Cell::new(0),
            })
        } else {
            None
        };
        self.barrier()?;
        if self.rank == 0 {
            self.state.splits.lock().remove(&epoch);
        }
        debug!(rank = self.rank, members, in_group = sub.is_some(), "split process group");
        Ok(sub)
    }

    fn abort(&self, reason: &str) {
        self.state.abort.raise(self.rank, reason);
    }
}

impl Mailbox for LocalComm {
    fn send(&self, to: usize, payload: Vec<u8>) -> Result<(), CommError> {
        let sender = self
            .state
            .senders
            .get(to)
            .ok_or(CommError::Disconnected(to))?;
        sender
            .send((self.rank, payload))
            .map_err(|_| CommError::Disconnected(to))
    }

    fn try_recv(&self) -> Result<Option<Envelope>, CommError> {
        match self.inbox.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(CommError::Disconnected(self.rank)),
        }
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope>, CommError> {
        self.state.abort.check()?;
        match self.inbox.recv_timeout(timeout) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CommError::Disconnected(self.rank)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_ops() {
        let results = LocalGroup::run(4, |comm| {
            let rank = comm.rank() as u64;
            let max = comm.all_reduce_u64(rank * 10, ReduceOp::Max)?;
            let min = comm.all_reduce_u64(rank * 10 + 1, ReduceOp::Min)?;
            let sum = comm.all_reduce_f64(0.5, ReduceOp::Sum)?;
            Ok((max, min, sum))
        })
        .unwrap();
        for (max, min, sum) in results {
            assert_eq!(max, 30);
            assert_eq!(min, 1);
            assert!((sum - 2.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_broadcast_from_root() {
        let results = LocalGroup::run(3, |comm| {
            let mine = if comm.rank() == 0 { 42 } else { 7 };
            Ok(comm.broadcast_u64(mine, 0)?)
        })
        .unwrap();
        assert_eq!(results, vec![42, 42, 42]);
    }

    #[test]
    fn test_gather_vectors_in_rank_order() {
        let results = LocalGroup::run(3, |comm| {
            let r = comm.rank() as f64;
            Ok(comm.all_gather_f64(&[r, r + 0.5])?)
        })
        .unwrap();
        assert_eq!(results[1], vec![vec![0.0, 0.5], vec![1.0, 1.5], vec![2.0, 2.5]]);
    }

    #[test]
    fn test_split_builds_prefix_group() {
        let results = LocalGroup::run(4, |comm| {
            let sub = comm.split(2)?;
            let inner = match &sub {
                Some(sub) => Some((sub.size(), sub.all_reduce_u64(1, ReduceOp::Sum)?)),
                None => None,
            };
            comm.barrier()?;
            let again = comm.split(3)?.map(|s| s.size());
            Ok((inner, again))
        })
        .unwrap();
        assert_eq!(results[0], (Some((2, 2)), Some(3)));
        assert_eq!(results[1], (Some((2, 2)), Some(3)));
        assert_eq!(results[2], (None, Some(3)));
        assert_eq!(results[3], (None, None));
    }

    #[test]
    fn test_abort_releases_blocked_ranks() {
        let err = LocalGroup::run(3, |comm| {
            if comm.rank() == 1 {
                anyhow::bail!("create failed on /tmp/x");
            }
            comm.barrier()?;
            Ok(())
        })
        .unwrap_err();
        assert!(err.to_string().contains("create failed"));
    }

    #[test]
    fn test_mailbox_delivers_with_sender_rank() {
        let results = LocalGroup::run(2, |comm| {
            let peer = 1 - comm.rank();
            comm.send(peer, vec![comm.rank() as u8; 3])?;
            let got = loop {
                if let Some(envelope) = comm.recv_timeout(Duration::from_millis(10))? {
                    break envelope;
                }
            };
            Ok(got)
        })
        .unwrap();
        assert_eq!(results[0], (1, vec![1, 1, 1]));
        assert_eq!(results[1], (0, vec![0, 0, 0]));
    }
}
