use std::sync::Arc;

use crate::error::{DgcError, Result};

use super::{CommGroups, Communicator};

/// Max hostname buffer size (256 bytes, null-padded).
const HOSTNAME_BUF_SIZE: usize = 256;

/// Build the node hierarchy by exchanging hostnames over `global`.
///
/// Ranks reporting the same `hostname` form a node. Nodes are numbered in
/// order of first appearance, and the lowest global rank on each node is its
/// lead. All ranks must call this collectively.
pub async fn form_comm_groups(global: Arc<dyn Communicator>, hostname: &str) -> Result<CommGroups> {
    let mut send_buf = [0u8; HOSTNAME_BUF_SIZE];
    let bytes = hostname.as_bytes();
    let copy_len = bytes.len().min(HOSTNAME_BUF_SIZE);
    send_buf[..copy_len].copy_from_slice(&bytes[..copy_len]);

    let gathered = global.all_gather(&send_buf).await?;
    let world = global.world_size() as usize;
    if gathered.len() != HOSTNAME_BUF_SIZE * world {
        return Err(DgcError::BufferSizeMismatch {
            expected: HOSTNAME_BUF_SIZE * world,
            actual: gathered.len(),
        });
    }

    let hosts: Vec<&[u8]> = gathered
        .chunks_exact(HOSTNAME_BUF_SIZE)
        .map(|buf| {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(HOSTNAME_BUF_SIZE);
            &buf[..end]
        })
        .collect();

    let mut nodes: Vec<&[u8]> = Vec::new();
    for host in &hosts {
        if !nodes.contains(host) {
            nodes.push(host);
        }
    }

    let me = global.rank();
    let my_host = hosts[me as usize];
    let node_rank = nodes
        .iter()
        .position(|h| *h == my_host)
        .ok_or_else(|| DgcError::CollectiveFailed {
            operation: "form_comm_groups",
            rank: me,
            reason: "own hostname not found in gathered data".into(),
        })? as u32;

    let local = global.split(node_rank, me).await?;

    // Leads get color 0, everyone else color 1; only leads keep the result.
    let is_lead = local.rank() == 0;
    let leads = global.split(u32::from(!is_lead), me).await?;
    let cross = is_lead.then_some(leads);

    tracing::debug!(
        rank = me,
        node_rank,
        num_nodes = nodes.len(),
        local_rank = local.rank(),
        local_size = local.world_size(),
        "formed communicator groups"
    );

    Ok(CommGroups {
        global,
        local,
        cross,
        num_nodes: nodes.len() as u32,
        node_rank,
    })
}
