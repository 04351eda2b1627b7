//! In-process communicator: every rank is a handle in the same process and
//! peers exchange byte messages over tokio channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::{DgcError, Result};
use crate::types::{DataType, Rank, ReduceOp};

use super::Communicator;
use super::reduce::reduce_slice;

/// Timeout for a single receive inside a collective.
const COLLECTIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Sub-groups built by a split but not yet claimed by all their members,
/// keyed by `(parent comm id, split generation, color)`.
type PendingSplits = HashMap<(u64, u64, u32), Vec<Option<LocalComm>>>;

/// One rank of an in-process communicator.
pub struct LocalComm {
    rank: Rank,
    world_size: u32,
    comm_id: u64,
    /// Sender into each peer's inbox for messages from this rank.
    outbox: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    /// Messages from each peer, in the order they were sent.
    inbox: Vec<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    split_generation: AtomicU64,
    pending_splits: Arc<Mutex<PendingSplits>>,
}

impl LocalComm {
    /// Create a fully connected group of `world_size` ranks.
    ///
    /// Element `r` of the result is rank `r`; hand each one to its own
    /// thread or task.
    pub fn group(world_size: u32) -> Vec<LocalComm> {
        Self::build(world_size, 0, Arc::new(Mutex::new(HashMap::new())))
    }

    fn build(world_size: u32, comm_id: u64, pending: Arc<Mutex<PendingSplits>>) -> Vec<LocalComm> {
        let n = world_size as usize;
        // senders[src][dst] / receivers[dst][src]
        let mut senders: Vec<Vec<_>> = (0..n).map(|_| Vec::with_capacity(n)).collect();
        let mut receivers: Vec<Vec<Option<_>>> = (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
        for (src, outbox) in senders.iter_mut().enumerate() {
            for dst_inbox in receivers.iter_mut() {
                let (tx, rx) = mpsc::unbounded_channel();
                outbox.push(tx);
                dst_inbox[src] = Some(rx);
            }
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (outbox, inbox))| LocalComm {
                rank: rank as Rank,
                world_size,
                comm_id,
                outbox,
                inbox: inbox
                    .into_iter()
                    .flatten()
                    .map(tokio::sync::Mutex::new)
                    .collect(),
                split_generation: AtomicU64::new(0),
                pending_splits: Arc::clone(&pending),
            })
            .collect()
    }

    fn send_bytes(&self, dest: Rank, data: &[u8], operation: &'static str) -> Result<()> {
        self.outbox[dest as usize]
            .send(data.to_vec())
            .map_err(|_| DgcError::CollectiveFailed {
                operation,
                rank: dest,
                reason: "peer dropped its communicator".into(),
            })
    }

    async fn recv_bytes(&self, src: Rank, operation: &'static str) -> Result<Vec<u8>> {
        let recv = async { self.inbox[src as usize].lock().await.recv().await };
        match tokio::time::timeout(COLLECTIVE_TIMEOUT, recv).await {
            Ok(Some(buf)) => Ok(buf),
            Ok(None) => Err(DgcError::CollectiveFailed {
                operation,
                rank: src,
                reason: "peer dropped its communicator".into(),
            }),
            Err(_) => Err(DgcError::CollectiveFailed {
                operation,
                rank: src,
                reason: format!("recv timed out after {}s", COLLECTIVE_TIMEOUT.as_secs()),
            }),
        }
    }

    fn neighbors(&self) -> (Rank, Rank) {
        let next = (self.rank + 1) % self.world_size;
        let prev = (self.rank + self.world_size - 1) % self.world_size;
        (next, prev)
    }

    /// Ring all-gather: after `world - 1` rounds every rank holds every chunk.
    async fn ring_all_gather(&self, send: &[u8]) -> Result<Vec<u8>> {
        let world = self.world_size as usize;
        let rank = self.rank as usize;
        let (next, prev) = self.neighbors();

        let mut chunks: Vec<Vec<u8>> = vec![Vec::new(); world];
        chunks[rank] = send.to_vec();

        for step in 0..world.saturating_sub(1) {
            let send_idx = (rank + world - step) % world;
            let recv_idx = (rank + world - step - 1) % world;
            self.send_bytes(next, &chunks[send_idx], "allgather")?;
            chunks[recv_idx] = self.recv_bytes(prev, "allgather").await?;
        }

        Ok(chunks.concat())
    }

    /// Ring all-reduce: reduce-scatter, then all-gather of the reduced chunks.
    async fn ring_all_reduce(&self, buf: &mut [u8], dtype: DataType, op: ReduceOp) -> Result<()> {
        let world = self.world_size as usize;
        if world <= 1 {
            return Ok(());
        }
        let rank = self.rank as usize;
        let (next, prev) = self.neighbors();
        let elem = dtype.size_in_bytes();
        let layout = ChunkLayout::new(buf.len() / elem, world);

        for step in 0..world - 1 {
            let send = layout.byte_range((rank + world - step) % world, elem);
            let recv = layout.byte_range((rank + world - step - 1) % world, elem);
            self.send_bytes(next, &buf[send], "allreduce")?;
            let received = self.recv_bytes(prev, "allreduce").await?;
            reduce_slice(&mut buf[recv], &received, dtype, op)?;
        }

        for step in 0..world - 1 {
            let send = layout.byte_range((rank + world + 1 - step) % world, elem);
            let recv = layout.byte_range((rank + world - step) % world, elem);
            self.send_bytes(next, &buf[send], "allreduce")?;
            let received = self.recv_bytes(prev, "allreduce").await?;
            let dst = &mut buf[recv];
            if received.len() != dst.len() {
                return Err(DgcError::BufferSizeMismatch {
                    expected: dst.len(),
                    actual: received.len(),
                });
            }
            dst.copy_from_slice(&received);
        }
        Ok(())
    }

    /// Binary-tree broadcast with `root` remapped to logical rank 0.
    async fn tree_broadcast(&self, buf: &mut [u8], root: Rank) -> Result<()> {
        let world = self.world_size;
        if root >= world {
            return Err(DgcError::InvalidRank {
                rank: root,
                world_size: world,
            });
        }
        if world <= 1 {
            return Ok(());
        }

        let logical = (self.rank + world - root) % world;
        let physical = |l: Rank| (l + root) % world;

        if logical != 0 {
            let parent = physical((logical - 1) / 2);
            let received = self.recv_bytes(parent, "broadcast").await?;
            if received.len() != buf.len() {
                return Err(DgcError::BufferSizeMismatch {
                    expected: buf.len(),
                    actual: received.len(),
                });
            }
            buf.copy_from_slice(&received);
        }

        for child in [2 * logical + 1, 2 * logical + 2] {
            if child < world {
                self.send_bytes(physical(child), buf, "broadcast")?;
            }
        }
        Ok(())
    }

    async fn split_impl(&self, color: u32, key: u32) -> Result<Arc<dyn Communicator>> {
        let mut info = [0u8; 8];
        info[..4].copy_from_slice(&color.to_le_bytes());
        info[4..].copy_from_slice(&key.to_le_bytes());
        let all = self.ring_all_gather(&info).await?;

        let mut members: Vec<(u32, Rank)> = all
            .chunks_exact(8)
            .enumerate()
            .filter_map(|(r, entry)| {
                let c = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
                let k = u32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]);
                (c == color).then_some((k, r as Rank))
            })
            .collect();
        members.sort_unstable();

        let new_rank = members
            .iter()
            .position(|&(_, r)| r == self.rank)
            .ok_or(DgcError::CollectiveFailed {
                operation: "split",
                rank: self.rank,
                reason: "own rank missing from its color group".into(),
            })?;

        let generation = self.split_generation.fetch_add(1, Ordering::Relaxed);
        let slot_key = (self.comm_id, generation, color);

        // The first member to arrive builds the whole sub-group; every
        // member then claims its own handle.
        let mut pending = self
            .pending_splits
            .lock()
            .map_err(|_| DgcError::LockPoisoned("split registry"))?;
        let slots = pending.entry(slot_key).or_insert_with(|| {
            let child_id = child_comm_id(self.comm_id, generation, color);
            LocalComm::build(members.len() as u32, child_id, Arc::clone(&self.pending_splits))
                .into_iter()
                .map(Some)
                .collect()
        });
        let comm = slots[new_rank].take().ok_or(DgcError::CollectiveFailed {
            operation: "split",
            rank: self.rank,
            reason: "sub-group handle already claimed".into(),
        })?;
        if slots.iter().all(Option::is_none) {
            pending.remove(&slot_key);
        }

        tracing::trace!(
            parent = self.comm_id,
            child = comm.comm_id,
            color,
            rank = comm.rank,
            world = comm.world_size,
            "split communicator"
        );
        Ok(Arc::new(comm))
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world_size
    }

    fn all_reduce<'a>(
        &'a self,
        buf: &'a mut [u8],
        dtype: DataType,
        op: ReduceOp,
    ) -> BoxFuture<'a, Result<()>> {
        self.ring_all_reduce(buf, dtype, op).boxed()
    }

    fn all_gather<'a>(&'a self, send: &'a [u8]) -> BoxFuture<'a, Result<Vec<u8>>> {
        self.ring_all_gather(send).boxed()
    }

    fn broadcast<'a>(&'a self, buf: &'a mut [u8], root: Rank) -> BoxFuture<'a, Result<()>> {
        self.tree_broadcast(buf, root).boxed()
    }

    fn split(&self, color: u32, key: u32) -> BoxFuture<'_, Result<Arc<dyn Communicator>>> {
        self.split_impl(color, key).boxed()
    }
}

impl std::fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("comm_id", &self.comm_id)
            .finish_non_exhaustive()
    }
}

/// FNV-1a over `(parent, generation, color)`; never 0, which is the root group.
fn child_comm_id(parent: u64, generation: u64, color: u32) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    let bytes = parent
        .to_le_bytes()
        .into_iter()
        .chain(generation.to_le_bytes())
        .chain(color.to_le_bytes());
    for b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    if h == 0 { 1 } else { h }
}

/// Element ranges of the `world` chunks a ring all-reduce works on.
///
/// The first `count % world` chunks carry one extra element.
struct ChunkLayout {
    offsets: Vec<usize>,
    count: usize,
}

impl ChunkLayout {
    fn new(count: usize, world: usize) -> Self {
        let base = count / world;
        let extra = count % world;
        let mut offsets = Vec::with_capacity(world);
        let mut off = 0;
        for i in 0..world {
            offsets.push(off);
            off += base + usize::from(i < extra);
        }
        Self { offsets, count }
    }

    fn byte_range(&self, idx: usize, elem: usize) -> std::ops::Range<usize> {
        let start = self.offsets[idx];
        let end = self.offsets.get(idx + 1).copied().unwrap_or(self.count);
        start * elem..end * elem
    }
}

/// Run `f` for every rank of a fresh group on its own task and collect the
/// results in rank order.
#[cfg(test)]
pub(crate) async fn run_group<T, F, Fut>(world: u32, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(Arc<LocalComm>) -> Fut,
    Fut: std::future::Future<Output = T> + Send + 'static,
{
    let handles: Vec<_> = LocalComm::group(world)
        .into_iter()
        .map(|comm| tokio::spawn(f(Arc::new(comm))))
        .collect();
    futures::future::try_join_all(handles)
        .await
        .expect("rank task panicked")
}
