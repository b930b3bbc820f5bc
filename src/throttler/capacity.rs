//! Capacity math and activator-set sharding

use std::collections::BTreeSet;

/// This activator's position among the replicas assigned to a revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignedShare {
    /// Index of our address in the sorted activator set
    pub index: usize,
    /// Number of activators that split the revision's capacity
    pub participants: usize,
}

/// Derive our share from the sorted activator address set.
///
/// `num_activators == 0` means every known activator participates;
/// otherwise only the first `num_activators` addresses in sorted order
/// do, and the rest hold zero capacity as warm standby. A requested
/// count larger than the set is treated as the whole set. Returns None
/// when this activator holds no share, including when our address is
/// missing from the set entirely (assumed transient).
pub fn assigned_share(
    own_ip: &str,
    activator_ips: &BTreeSet<String>,
    num_activators: u32,
) -> Option<AssignedShare> {
    let index = activator_ips
        .iter()
        .position(|addr| addr == own_ip || addr.split(':').next() == Some(own_ip))?;

    let participants = if num_activators == 0 {
        activator_ips.len()
    } else {
        (num_activators as usize).min(activator_ips.len())
    };

    if index >= participants {
        return None;
    }
    Some(AssignedShare {
        index,
        participants,
    })
}

/// Capacity this activator may admit for a revision:
/// `ceil(container_concurrency * pod_count / participants)`.
/// Zero pods or zero participants always yields zero.
pub fn local_capacity(container_concurrency: u32, pod_count: usize, participants: usize) -> u32 {
    if pod_count == 0 || participants == 0 {
        return 0;
    }
    let total = container_concurrency as u64 * pod_count as u64;
    let share = (total + participants as u64 - 1) / participants as u64;
    share.min(u32::MAX as u64) as u32
}
