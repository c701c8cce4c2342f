//! Core types shared by the balancing layer and the remote contract.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Storage node identifier in the cluster.
pub type NodeId = u64;

/// Zone (datacenter) identifier.
pub type ZoneId = u32;

/// Replication group identifier.
pub type GroupId = u32;

/// Identifies one replicated node instance of a data partition.
///
/// The group is part of the identity, so an RN belongs to exactly one
/// replication group for its whole life. Which storage node hosts it is a
/// topology question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RnId {
    /// Replication group the RN belongs to.
    pub group: GroupId,
    /// Member number within the group.
    pub member: u32,
}

impl RnId {
    /// Create a new RN id.
    pub const fn new(group: GroupId, member: u32) -> Self {
        Self { group, member }
    }

    /// Whether two RNs are members of the same replication group.
    pub fn same_group(&self, other: &RnId) -> bool {
        self.group == other.group
    }
}

impl fmt::Display for RnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rg{}-rn{}", self.group, self.member)
    }
}

/// Replication role an RN reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicationRole {
    /// Authoritative for writes in its group.
    Master,
    /// Non-authoritative member.
    Replica,
    /// Role not known (e.g. during an election).
    Unknown,
    /// RN process has left the group or exited.
    Detached,
}

impl fmt::Display for ReplicationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationRole::Master => write!(f, "master"),
            ReplicationRole::Replica => write!(f, "replica"),
            ReplicationRole::Unknown => write!(f, "unknown"),
            ReplicationRole::Detached => write!(f, "detached"),
        }
    }
}

/// A role change observed for one RN.
///
/// Transient: produced on every observed change and consumed once by the
/// control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateInfo {
    /// The RN whose role changed.
    pub rn_id: RnId,
    /// The new role.
    pub role: ReplicationRole,
    /// Topology sequence number known to the reporter.
    pub topo_seq: u64,
}

impl StateInfo {
    /// Create a new state notification.
    pub fn new(rn_id: RnId, role: ReplicationRole, topo_seq: u64) -> Self {
        Self {
            rn_id,
            role,
            topo_seq,
        }
    }

    /// Notification for an RN that has exited.
    pub fn detached(rn_id: RnId) -> Self {
        Self::new(rn_id, ReplicationRole::Detached, 0)
    }
}

/// Snapshot of one node's master density.
///
/// Derived densities are computed, never stored. All densities are integer
/// percentages of `rn_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdInfo {
    /// Masters currently hosted.
    pub master_count: u32,
    /// Leases outstanding on the node.
    pub master_lease_count: u32,
    /// RNs resident on the node, always > 0.
    pub rn_count: u32,
    /// Balanced master density for the node.
    pub balanced_md: u32,
}

impl MdInfo {
    /// Density with `masters` masters on this node.
    pub fn md_for(&self, masters: u32) -> u32 {
        if self.rn_count == 0 {
            return 0;
        }
        masters.saturating_mul(100) / self.rn_count
    }

    /// Current master density.
    pub fn md(&self) -> u32 {
        self.md_for(self.master_count)
    }

    /// Density if one more master were added, counting outstanding leases.
    pub fn ptmd(&self) -> u32 {
        // Peer-supplied counts.
        let masters = self
            .master_lease_count
            .saturating_add(self.master_count)
            .saturating_add(1);
        self.md_for(masters)
    }

    /// Whether the node hosts more masters than its balanced density allows.
    pub fn has_excess_masters(&self) -> bool {
        self.md() > self.balanced_md
    }
}

/// A lease request, and the record kept for a granted lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterLeaseInfo {
    /// Node asking for the lease.
    pub requesting_node: NodeId,
    /// RN the lease reserves.
    pub rn_id: RnId,
    /// Maximum post-transfer density the grantor may reach.
    pub density_limit: u32,
    /// Lease lifetime in milliseconds.
    pub duration_ms: u64,
}

impl MasterLeaseInfo {
    /// Create a new lease request.
    pub fn new(
        requesting_node: NodeId,
        rn_id: RnId,
        density_limit: u32,
        duration: Duration,
    ) -> Self {
        Self {
            requesting_node,
            rn_id,
            density_limit,
            duration_ms: duration.as_millis().min(u128::from(u64::MAX)) as u64,
        }
    }

    /// The lease lifetime.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}
