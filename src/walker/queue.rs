// src/walker/queue.rs
//! Distributed work queue with work stealing and termination detection.
//!
//! Each rank keeps a local deque. An idle rank asks a random victim for
//! work; a victim with at least `WALKER_MIN_SPLIT` items hands over the
//! older half of its deque. Global quiescence is detected with Safra's token
//! ring: every work message is counted (+1 sent, -1 received) and a receiver
//! turns black; rank 0 declares termination when a token returns white with
//! a zero balance while rank 0 is itself white and idle.
//!
//! All messages are byte strings on a [`Mailbox`]; nothing here depends on
//! how they travel.

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::comm::Mailbox;
use crate::constants::{WALKER_IDLE_POLL, WALKER_MIN_SPLIT};

/// What a work item points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemTag {
    Dir,
    File,
    Other,
}

impl ItemTag {
    fn to_byte(self) -> u8 {
        match self {
            ItemTag::Dir => b'd',
            ItemTag::File => b'f',
            ItemTag::Other => b'o',
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'd' => Some(ItemTag::Dir),
            b'f' => Some(ItemTag::File),
            b'o' => Some(ItemTag::Other),
            _ => None,
        }
    }
}

/// Tagged path; owned by whichever rank dequeues it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub tag: ItemTag,
    pub path: PathBuf,
}

impl WorkItem {
    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self {
            tag: ItemTag::Dir,
            path: path.into(),
        }
    }

    /// Tag byte followed by the raw path bytes
    pub fn encode(&self) -> Vec<u8> {
        let bytes = self.path.as_os_str().as_bytes();
        let mut out = Vec::with_capacity(bytes.len() + 1);
        out.push(self.tag.to_byte());
        out.extend_from_slice(bytes);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (&tag, path) = bytes.split_first()?;
        Some(Self {
            tag: ItemTag::from_byte(tag)?,
            path: Path::new(OsStr::from_bytes(path)).to_path_buf(),
        })
    }
}

/// Safra token: accumulated message balance and whether anyone was black
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub black: bool,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request,
    Work(Vec<WorkItem>),
    NoWork,
    Token(Token),
    Terminate,
}

const MSG_REQUEST: u8 = 1;
const MSG_WORK: u8 = 2;
const MSG_NO_WORK: u8 = 3;
const MSG_TOKEN: u8 = 4;
const MSG_TERMINATE: u8 = 5;

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::Request => vec![MSG_REQUEST],
            Message::NoWork => vec![MSG_NO_WORK],
            Message::Terminate => vec![MSG_TERMINATE],
            Message::Token(t) => {
                let mut out = vec![MSG_TOKEN, u8::from(t.black)];
                out.extend_from_slice(&t.count.to_le_bytes());
                out
            }
            Message::Work(items) => {
                let mut out = vec![MSG_WORK];
                out.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for item in items {
                    let encoded = item.encode();
                    out.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
                    out.extend_from_slice(&encoded);
                }
                out
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let Some((&kind, rest)) = bytes.split_first() else {
            bail!("empty walker message");
        };
        match kind {
            MSG_REQUEST => Ok(Message::Request),
            MSG_NO_WORK => Ok(Message::NoWork),
            MSG_TERMINATE => Ok(Message::Terminate),
            MSG_TOKEN => {
                if rest.len() != 9 {
                    bail!("malformed token message ({} bytes)", bytes.len());
                }
                let mut count = [0u8; 8];
                count.copy_from_slice(&rest[1..9]);
                Ok(Message::Token(Token {
                    black: rest[0] != 0,
                    count: i64::from_le_bytes(count),
                }))
            }
            MSG_WORK => {
                let mut cursor = rest;
                let n = take_u32(&mut cursor)?;
                let mut items = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let len = take_u32(&mut cursor)? as usize;
                    if cursor.len() < len {
                        bail!("truncated work item");
                    }
                    let (item, tail) = cursor.split_at(len);
                    match WorkItem::decode(item) {
                        Some(item) => items.push(item),
                        None => bail!("malformed work item"),
                    }
                    cursor = tail;
                }
                Ok(Message::Work(items))
            }
            other => bail!("unknown walker message type {}", other),
        }
    }
}

fn take_u32(cursor: &mut &[u8]) -> Result<u32> {
    if cursor.len() < 4 {
        bail!("truncated walker message");
    }
    let (head, tail) = cursor.split_at(4);
    let mut raw = [0u8; 4];
    raw.copy_from_slice(head);
    *cursor = tail;
    Ok(u32::from_le_bytes(raw))
}

/// Counters for one queue run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub processed: u64,
    pub steals_sent: u64,
    pub items_given: u64,
    pub items_received: u64,
}

pub struct DistributedQueue<'m, M: Mailbox> {
    mailbox: &'m M,
    rank: usize,
    size: usize,
    local: VecDeque<WorkItem>,
    /// Work messages sent minus received
    balance: i64,
    black: bool,
    token: Option<Token>,
    probe_in_flight: bool,
    request_outstanding: bool,
    terminated: bool,
    rng: StdRng,
    stats: QueueStats,
}

impl<'m, M: Mailbox> DistributedQueue<'m, M> {
    pub fn new(mailbox: &'m M, rank: usize, size: usize) -> Self {
        Self {
            mailbox,
            rank,
            size: size.max(1),
            local: VecDeque::new(),
            balance: 0,
            black: false,
            token: None,
            probe_in_flight: false,
            request_outstanding: false,
            terminated: false,
            rng: StdRng::seed_from_u64(0x5eed ^ rank as u64),
            stats: QueueStats::default(),
        }
    }

    pub fn push(&mut self, item: WorkItem) {
        self.local.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    /// Process items until every rank is idle and no work is in flight.
    ///
    /// `process` consumes one item and returns the items it discovered.
    /// Every rank of the group must call this.
    pub fn run<F>(&mut self, mut process: F) -> Result<QueueStats>
    where
        F: FnMut(WorkItem) -> Result<Vec<WorkItem>>,
    {
        loop {
            while let Some((from, payload)) = self.mailbox.try_recv()? {
                self.handle(from, &payload)?;
            }
            if self.terminated {
                break;
            }

            if let Some(item) = self.local.pop_back() {
                let discovered = process(item)?;
                self.local.extend(discovered);
                self.stats.processed += 1;
                continue;
            }

            if self.size == 1 {
                break;
            }
            self.on_idle()?;
            if self.terminated {
                break;
            }
            if let Some((from, payload)) = self.mailbox.recv_timeout(WALKER_IDLE_POLL)? {
                self.handle(from, &payload)?;
            }
        }
        debug!(rank = self.rank, stats = ?self.stats, "walker queue drained");
        Ok(self.stats)
    }

    fn send(&self, to: usize, message: &Message) -> Result<()> {
        trace!(rank = self.rank, to, ?message, "walker send");
        self.mailbox.send(to, message.encode())?;
        Ok(())
    }

    fn handle(&mut self, from: usize, payload: &[u8]) -> Result<()> {
        match Message::decode(payload)? {
            Message::Request => {
                if self.local.len() >= WALKER_MIN_SPLIT {
                    let half = self.local.len() / 2;
                    let items: Vec<WorkItem> = self.local.drain(..half).collect();
                    self.stats.items_given += items.len() as u64;
                    self.send(from, &Message::Work(items))?;
                    self.balance += 1;
                } else {
                    self.send(from, &Message::NoWork)?;
                }
            }
            Message::Work(items) => {
                self.stats.items_received += items.len() as u64;
                self.local.extend(items);
                self.balance -= 1;
                self.black = true;
                self.request_outstanding = false;
            }
            Message::NoWork => self.request_outstanding = false,
            Message::Token(token) => self.token = Some(token),
            Message::Terminate => self.terminated = true,
        }
        Ok(())
    }

    /// Token passing and steal requests while the local deque is empty
    fn on_idle(&mut self) -> Result<()> {
        let next = (self.rank + 1) % self.size;

        if self.rank == 0 && !self.probe_in_flight {
            self.probe_in_flight = true;
            self.black = false;
            self.send(next, &Message::Token(Token { black: false, count: 0 }))?;
        }

        if let Some(token) = self.token.take() {
            if self.rank == 0 {
                self.probe_in_flight = false;
                if !token.black && !self.black && token.count + self.balance == 0 {
                    for peer in 1..self.size {
                        self.send(peer, &Message::Terminate)?;
                    }
                    self.terminated = true;
                    return Ok(());
                }
            } else {
                let forwarded = Token {
                    black: token.black || self.black,
                    count: token.count + self.balance,
                };
                self.black = false;
                self.send(next, &Message::Token(forwarded))?;
            }
        }

        if !self.request_outstanding {
            let pick = self.rng.gen_range(0..self.size - 1);
            let victim = if pick >= self.rank { pick + 1 } else { pick };
            self.send(victim, &Message::Request)?;
            self.request_outstanding = true;
            self.stats.steals_sent += 1;
        }
        Ok(())
    }
}

/// Discard whatever is still queued for this rank (late steal requests,
/// refusals). Call between two barriers after a run.
pub fn drain_mailbox<M: Mailbox>(mailbox: &M) -> Result<usize> {
    let mut dropped = 0;
    while mailbox.try_recv()?.is_some() {
        dropped += 1;
    }
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{Communicator, LocalGroup};

    #[test]
    fn test_work_item_codec() {
        let item = WorkItem {
            tag: ItemTag::File,
            path: PathBuf::from("/data/run 1/file.txt"),
        };
        let bytes = item.encode();
        assert_eq!(bytes[0], b'f');
        assert_eq!(WorkItem::decode(&bytes), Some(item));
        assert_eq!(WorkItem::decode(b"x/tmp"), None);
        assert_eq!(WorkItem::decode(b""), None);
    }

    #[test]
    fn test_message_codec() {
        let messages = [
            Message::Request,
            Message::NoWork,
            Message::Terminate,
            Message::Token(Token { black: true, count: -3 }),
            Message::Work(vec![WorkItem::dir("/a"), WorkItem::dir("/a/b")]),
            Message::Work(Vec::new()),
        ];
        for m in messages {
            assert_eq!(Message::decode(&m.encode()).unwrap(), m);
        }
        assert!(Message::decode(&[]).is_err());
        assert!(Message::decode(&[MSG_TOKEN, 0]).is_err());
        assert!(Message::decode(&[MSG_WORK, 1, 0, 0, 0, 9, 0]).is_err());
        assert!(Message::decode(&[42]).is_err());
    }

    #[test]
    fn test_single_rank_runs_to_completion() {
        let comms = LocalGroup::new(1);
        let mut queue = DistributedQueue::new(&comms[0], 0, 1);
        queue.push(WorkItem::dir("0"));
        // each item n < 5 spawns n+1 twice
        let stats = queue
            .run(|item| {
                let n: u32 = item.path.to_string_lossy().parse()?;
                Ok(if n < 5 {
                    vec![WorkItem::dir((n + 1).to_string()), WorkItem::dir((n + 1).to_string())]
                } else {
                    Vec::new()
                })
            })
            .unwrap();
        assert_eq!(stats.processed, 63);
    }

    #[test]
    fn test_work_is_shared_and_counted_once() {
        let per_rank = LocalGroup::run(4, |comm| {
            let mut queue = DistributedQueue::new(&comm, comm.rank(), comm.size());
            if comm.rank() == 0 {
                queue.push(WorkItem::dir("0"));
            }
            let stats = queue.run(|item| {
                let n: u32 = item.path.to_string_lossy().parse()?;
                std::thread::sleep(std::time::Duration::from_micros(200));
                Ok(if n < 8 {
                    vec![WorkItem::dir((n + 1).to_string()), WorkItem::dir((n + 1).to_string())]
                } else {
                    Vec::new()
                })
            })?;
            comm.barrier()?;
            drain_mailbox(&comm)?;
            comm.barrier()?;
            Ok(stats)
        })
        .unwrap();

        let total: u64 = per_rank.iter().map(|s| s.processed).sum();
        assert_eq!(total, (1 << 9) - 1);
        let given: u64 = per_rank.iter().map(|s| s.items_given).sum();
        let received: u64 = per_rank.iter().map(|s| s.items_received).sum();
        assert_eq!(given, received);
        assert!(per_rank.iter().filter(|s| s.processed > 0).count() > 1);
    }
}
