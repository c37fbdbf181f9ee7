//! VM convergence primitives.
//!
//! The hypervisor agent converges a running VM toward its declared shape by
//! comparing two [`VmDescriptor`]s:
//!
//! - **want**: translated from the instance's desired state.
//! - **have**: observed from the hypervisor.
//!
//! Processor/memory/adapter drift is reported by [`changed`] and needs a
//! restart to apply. Disk drift is hot-pluggable and is reported by
//! [`disk_changed`] as an explicit changeset.
//!
//! # Invariants
//!
//! - Disk indices are unique within one descriptor.
//! - Disks are compared by index slot, adapters by position.
//! - All functions here are pure and deterministic.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use fleet_id::{ImageId, InstanceId, VpcId};
use serde::{Deserialize, Serialize};

// ============================================================================
// Descriptor
// ============================================================================

/// A disk attached to a VM at a fixed index slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmDisk {
    pub index: u32,
    pub path: PathBuf,
}

impl VmDisk {
    pub fn new(index: u32, path: impl Into<PathBuf>) -> Self {
        Self {
            index,
            path: path.into(),
        }
    }
}

/// Network adapter attachment type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    #[default]
    Bridge,
}

/// A virtual NIC, bound to a VPC once the instance has one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAdapter {
    pub kind: AdapterKind,
    pub mac_address: String,
    pub vpc: Option<VpcId>,
}

/// Hypervisor-facing resource shape of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDescriptor {
    pub id: InstanceId,
    pub image: Option<ImageId>,
    pub processors: u32,
    /// Memory in MiB.
    pub memory: u32,
    pub disks: Vec<VmDisk>,
    pub network_adapters: Vec<NetworkAdapter>,
}

impl VmDescriptor {
    /// Find the disk occupying an index slot.
    pub fn disk_at(&self, index: u32) -> Option<&VmDisk> {
        self.disks.iter().find(|d| d.index == index)
    }
}

// ============================================================================
// Comparison
// ============================================================================

/// Returns true when `have` needs a restart to match `want`.
///
/// Sensitive to memory, processor count, a missing adapter position and the
/// VPC binding of each positional adapter pair. MAC addresses and adapters
/// beyond `want`'s length are ignored.
pub fn changed(want: &VmDescriptor, have: &VmDescriptor) -> bool {
    if want.memory != have.memory || want.processors != have.processors {
        return true;
    }

    for (position, adapter) in want.network_adapters.iter().enumerate() {
        let Some(current) = have.network_adapters.get(position) else {
            return true;
        };

        if adapter.vpc != current.vpc {
            return true;
        }
    }

    false
}

/// Disk attach/detach operations needed to converge `have` to `want`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskChanges {
    pub to_add: Vec<VmDisk>,
    pub to_remove: Vec<VmDisk>,
}

impl DiskChanges {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// Apply the changeset to a disk list: detach first, then attach.
    pub fn apply_to(&self, disks: &mut Vec<VmDisk>) {
        let removed: HashSet<&VmDisk> = self.to_remove.iter().collect();
        disks.retain(|d| !removed.contains(d));
        disks.extend(self.to_add.iter().cloned());
    }
}

/// Compute the disk changeset keyed by index slot.
///
/// A `have` disk whose index is absent from `want` is removed. A `want` disk
/// with no disk at its index is added. A disk at the same index with a
/// different path is removed and the wanted one added; there is no in-place
/// rename. Output order follows `have` for removals of missing slots, then
/// `want` order.
pub fn disk_changed(want: &VmDescriptor, have: &VmDescriptor) -> DiskChanges {
    let mut changes = DiskChanges::default();

    let wanted: HashSet<u32> = want.disks.iter().map(|d| d.index).collect();
    let mut matched: HashMap<u32, &VmDisk> = HashMap::new();

    for disk in &have.disks {
        if wanted.contains(&disk.index) {
            matched.insert(disk.index, disk);
        } else {
            changes.to_remove.push(disk.clone());
        }
    }

    for disk in &want.disks {
        match matched.get(&disk.index) {
            None => changes.to_add.push(disk.clone()),
            Some(current) if current.path != disk.path => {
                changes.to_remove.push((*current).clone());
                changes.to_add.push(disk.clone());
            }
            Some(_) => {}
        }
    }

    changes
}

// ============================================================================
// Retry tracking
// ============================================================================

/// Default retry limit per resource inside one window.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Retry tracker for failed convergence attempts.
#[derive(Debug, Clone)]
pub struct RetryTracker<K> {
    max_retries: u32,
    window: Duration,
    /// key -> (failure count, first failure in the current window)
    failures: BTreeMap<K, (u32, Instant)>,
}

impl<K: Ord + Clone> RetryTracker<K> {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure. Returns true if retries are now exhausted.
    pub fn record_failure(&mut self, key: &K) -> bool {
        self.record_failure_at(key, Instant::now())
    }

    fn record_failure_at(&mut self, key: &K, now: Instant) -> bool {
        let (count, first) = self.failures.entry(key.clone()).or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Check if retries are exhausted for a key.
    pub fn is_exhausted(&self, key: &K) -> bool {
        self.is_exhausted_at(key, Instant::now())
    }

    fn is_exhausted_at(&self, key: &K, now: Instant) -> bool {
        let Some((count, first)) = self.failures.get(key) else {
            return false;
        };

        if now.duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_retries
    }

    /// Clear failure tracking for a key (on success).
    pub fn clear(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Drop entries whose window has passed.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= window);
    }

    /// Number of keys with failures inside the window.
    pub fn tracked(&self) -> usize {
        self.failures.len()
    }
}

impl<K: Ord + Clone> Default for RetryTracker<K> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW)
    }
}
