//! Collective communication seen by the compression engine.
//!
//! The engine only needs four collectives. [`Communicator`] abstracts them so
//! the same exchange code runs over the in-process [`LocalComm`] or any
//! network backend. [`CommGroups`] carries the global group together with
//! the intra-node and cross-node groups used by hierarchical reduction.

mod local;
mod reduce;
mod topology;

pub use local::LocalComm;
pub use topology::form_comm_groups;

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{DataType, Rank, ReduceOp};

/// A group of ranks that run collectives together.
///
/// Every member must issue the same collectives in the same order. A
/// communicator is driven by one task at a time.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> Rank;

    fn world_size(&self) -> u32;

    /// In-place element-wise reduction across all ranks.
    fn all_reduce<'a>(
        &'a self,
        buf: &'a mut [u8],
        dtype: DataType,
        op: ReduceOp,
    ) -> BoxFuture<'a, Result<()>>;

    /// Concatenation of every rank's `send`, in rank order.
    fn all_gather<'a>(&'a self, send: &'a [u8]) -> BoxFuture<'a, Result<Vec<u8>>>;

    /// Overwrite `buf` on every rank with the contents on `root`.
    fn broadcast<'a>(&'a self, buf: &'a mut [u8], root: Rank) -> BoxFuture<'a, Result<()>>;

    /// Partition the group by `color`; ranks inside a part are ordered by
    /// `(key, rank)`.
    fn split(&self, color: u32, key: u32) -> BoxFuture<'_, Result<Arc<dyn Communicator>>>;
}

/// The communicators one rank takes part in.
#[derive(Clone)]
pub struct CommGroups {
    /// All ranks.
    pub global: Arc<dyn Communicator>,
    /// Ranks on the same node.
    pub local: Arc<dyn Communicator>,
    /// One lead (local rank 0) per node. Only present on leads.
    pub cross: Option<Arc<dyn Communicator>>,
    pub num_nodes: u32,
    pub node_rank: u32,
}

impl CommGroups {
    /// Treat every rank of `global` as living on a single node.
    pub fn single_node(global: Arc<dyn Communicator>) -> Self {
        Self {
            local: Arc::clone(&global),
            global,
            cross: None,
            num_nodes: 1,
            node_rank: 0,
        }
    }

    pub fn is_lead(&self) -> bool {
        self.local.rank() == 0
    }
}

impl std::fmt::Debug for CommGroups {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommGroups")
            .field("global_rank", &self.global.rank())
            .field("global_size", &self.global.world_size())
            .field("local_rank", &self.local.rank())
            .field("local_size", &self.local.world_size())
            .field("num_nodes", &self.num_nodes)
            .field("node_rank", &self.node_rank)
            .finish()
    }
}

/// Reduce `buf` across all ranks in three stages: reduce within the node,
/// reduce across node leads, broadcast back within the node.
pub async fn hierarchical_all_reduce(
    groups: &CommGroups,
    buf: &mut [u8],
    dtype: DataType,
    op: ReduceOp,
) -> Result<()> {
    if groups.num_nodes <= 1 {
        return groups.global.all_reduce(buf, dtype, op).await;
    }

    groups.local.all_reduce(buf, dtype, op).await?;
    if let Some(cross) = &groups.cross {
        cross.all_reduce(buf, dtype, op).await?;
    }
    groups.local.broadcast(buf, 0).await
}
