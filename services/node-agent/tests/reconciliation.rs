//! Reconciler tests against the mock hypervisor and the in-memory store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fleet_control_plane::InstanceService;
use fleet_events::BroadcastPublisher;
use fleet_id::{DiskId, ImageId, InstanceId, NodeId, OrgId, VpcId, ZoneId};
use fleet_model::{disk_path, DesiredState, Disk, DisplayStatus, InstanceSpec, VmState};
use fleet_networking::VpcAddressPool;
use fleet_node_agent::hypervisor::HypervisorOp;
use fleet_node_agent::{
    Hypervisor, MockHypervisor, ReconcileOutcome, Reconciler, ReconcilerConfig, ReconcilerDeps,
    VmSnapshot,
};
use fleet_reconcile::VmDisk;
use fleet_store::{DiskStore, InstanceStore, MemoryStore};

const VIRT_ROOT: &str = "/var/lib/fleet";

struct Harness {
    node: NodeId,
    store: Arc<MemoryStore>,
    hypervisor: Arc<MockHypervisor>,
    service: Arc<InstanceService>,
    reconciler: Reconciler,
}

impl Harness {
    fn new() -> Self {
        Self::with(MockHypervisor::new(), ReconcilerConfig::default())
    }

    fn with(hypervisor: MockHypervisor, config: ReconcilerConfig) -> Self {
        let node = NodeId::new();
        let store = Arc::new(MemoryStore::new());
        let hypervisor = Arc::new(hypervisor);
        let service = Arc::new(InstanceService::new(
            store.clone(),
            Arc::new(VpcAddressPool::new()),
            Arc::new(BroadcastPublisher::new()),
        ));
        let deps = ReconcilerDeps {
            hypervisor: hypervisor.clone(),
            instances: store.clone(),
            disks: store.clone(),
            service: service.clone(),
        };
        let reconciler = Reconciler::new(node, PathBuf::from(VIRT_ROOT), deps, config);
        Self {
            node,
            store,
            hypervisor,
            service,
            reconciler,
        }
    }

    /// Create a validated instance on this node with disks at `slots`.
    async fn instance(&self, slots: &[&str]) -> (InstanceSpec, Vec<Disk>) {
        let mut spec = InstanceSpec::new(InstanceId::new());
        spec.organization = Some(OrgId::new());
        spec.zone = Some(ZoneId::new());
        spec.node = Some(self.node);
        spec.image = Some(ImageId::new());
        spec.vpc = Some(VpcId::new());
        spec.processors = 2;
        spec.memory = 1024;
        let spec = self.service.create(spec).await.unwrap();

        let mut disks = Vec::new();
        for slot in slots {
            let disk = Disk::new(DiskId::new(), spec.id, *slot);
            self.store.put_disk(&disk).await.unwrap();
            disks.push(disk);
        }
        (spec, disks)
    }

    async fn reconcile(&self, id: InstanceId) -> ReconcileOutcome {
        let spec = self.store.find_instance(id).await.unwrap();
        self.reconciler.reconcile(&spec).await.unwrap()
    }

    async fn stored(&self, id: InstanceId) -> InstanceSpec {
        self.store.find_instance(id).await.unwrap()
    }

    async fn set_state(&self, id: InstanceId, state: DesiredState) {
        self.service
            .update(id, |spec| spec.state = Some(state))
            .await
            .unwrap();
    }

    async fn vm(&self, id: InstanceId) -> Option<VmSnapshot> {
        self.hypervisor.describe(id).await.unwrap()
    }
}

fn slots(vm: &VmSnapshot) -> Vec<u32> {
    let mut slots: Vec<u32> = vm.descriptor.disks.iter().map(|d| d.index).collect();
    slots.sort_unstable();
    slots
}

#[tokio::test]
async fn test_missing_vm_is_created_and_started() {
    let h = Harness::new();
    let (spec, _) = h.instance(&["0", "1", "boot"]).await;

    let outcome = h.reconcile(spec.id).await;

    assert!(outcome.created);
    assert!(outcome.started);
    assert_eq!(outcome.observed, Some(VmState::Running));
    assert_eq!(
        h.hypervisor.ops(),
        vec![HypervisorOp::Create(spec.id), HypervisorOp::Start(spec.id)]
    );

    let vm = h.vm(spec.id).await.unwrap();
    assert_eq!(slots(&vm), vec![0, 1]);
    assert_eq!(vm.descriptor.processors, 2);
    assert_eq!(vm.descriptor.memory, 1024);
    assert_eq!(vm.descriptor.network_adapters.len(), 1);

    let stored = h.stored(spec.id).await;
    assert_eq!(stored.vm_state, Some(VmState::Running));
    assert_eq!(stored.status(), DisplayStatus::Running);
}

#[tokio::test]
async fn test_converged_instance_needs_no_operations() {
    let h = Harness::new();
    let (spec, _) = h.instance(&["0"]).await;
    h.reconcile(spec.id).await;
    h.hypervisor.clear_ops();

    let outcome = h.reconcile(spec.id).await;

    assert_eq!(
        outcome,
        ReconcileOutcome {
            observed: Some(VmState::Running),
            ..ReconcileOutcome::default()
        }
    );
    assert!(h.hypervisor.ops().is_empty());
}

#[tokio::test]
async fn test_stopped_instance_without_vm_is_left_alone() {
    let h = Harness::new();
    let (spec, _) = h.instance(&[]).await;
    h.set_state(spec.id, DesiredState::Stop).await;

    let outcome = h.reconcile(spec.id).await;

    assert_eq!(outcome, ReconcileOutcome::default());
    assert!(h.hypervisor.ops().is_empty());
    assert!(h.vm(spec.id).await.is_none());
}

#[tokio::test]
async fn test_shape_change_flags_restart_without_restarting() {
    let h = Harness::new();
    let (spec, _) = h.instance(&["0"]).await;
    h.reconcile(spec.id).await;
    h.hypervisor.clear_ops();

    h.service
        .update(spec.id, |s| s.memory = 4096)
        .await
        .unwrap();
    let outcome = h.reconcile(spec.id).await;

    assert!(outcome.restart_required);
    assert!(h.hypervisor.ops().is_empty());
    let stored = h.stored(spec.id).await;
    assert!(stored.restart);
    assert_eq!(stored.memory, 4096);
    assert_eq!(stored.status(), DisplayStatus::RestartRequired);

    let again = h.reconcile(spec.id).await;
    assert!(!again.restart_required);
    assert!(h.stored(spec.id).await.restart);
}

#[tokio::test]
async fn test_stale_pass_does_not_flag_restart_after_stop() {
    let h = Harness::new();
    let (spec, _) = h.instance(&["0"]).await;
    h.reconcile(spec.id).await;
    let listed = h.stored(spec.id).await;

    h.service
        .update(spec.id, |s| {
            s.memory = 4096;
            s.state = Some(DesiredState::Stop);
        })
        .await
        .unwrap();
    let mut drifted = listed.clone();
    drifted.memory = 4096;

    let outcome = h.reconciler.reconcile(&drifted).await.unwrap();

    assert!(outcome.restart_required);
    let stored = h.stored(spec.id).await;
    assert_eq!(stored.state, Some(DesiredState::Stop));
    assert!(!stored.restart);
}

#[tokio::test]
async fn test_disk_changes_are_hot_plugged() {
    let h = Harness::new();
    let (spec, disks) = h.instance(&["0", "1"]).await;
    let root = Path::new(VIRT_ROOT);

    let mut have = spec.translate(&disks, root);
    have.disks = vec![
        VmDisk::new(0, "/srv/old/a.qcow2"),
        VmDisk::new(3, "/srv/old/x.qcow2"),
    ];
    h.hypervisor.insert(VmSnapshot {
        descriptor: have,
        state: VmState::Running,
    });

    let outcome = h.reconcile(spec.id).await;

    assert_eq!(outcome.detached, 2);
    assert_eq!(outcome.attached, 2);
    assert!(!outcome.restart_required);
    assert_eq!(
        h.hypervisor.ops(),
        vec![
            HypervisorOp::DetachDisk(spec.id, 3),
            HypervisorOp::DetachDisk(spec.id, 0),
            HypervisorOp::AttachDisk(spec.id, 0),
            HypervisorOp::AttachDisk(spec.id, 1),
        ]
    );

    let vm = h.vm(spec.id).await.unwrap();
    assert_eq!(slots(&vm), vec![0, 1]);
    assert_eq!(
        vm.descriptor.disk_at(0).map(|d| d.path.clone()),
        Some(disk_path(root, &disks[0].id))
    );
}

#[tokio::test]
async fn test_detached_disk_record_is_unplugged() {
    let h = Harness::new();
    let (spec, disks) = h.instance(&["0", "1"]).await;
    h.reconcile(spec.id).await;
    h.hypervisor.clear_ops();

    h.store.remove_disk(disks[1].id).await.unwrap();
    let outcome = h.reconcile(spec.id).await;

    assert_eq!(outcome.detached, 1);
    assert_eq!(outcome.attached, 0);
    assert_eq!(
        h.hypervisor.ops(),
        vec![HypervisorOp::DetachDisk(spec.id, 1)]
    );
    assert_eq!(slots(&h.vm(spec.id).await.unwrap()), vec![0]);
}

#[tokio::test]
async fn test_stop_request_stops_running_vm() {
    let h = Harness::new();
    let (spec, _) = h.instance(&["0"]).await;
    h.reconcile(spec.id).await;
    h.hypervisor.clear_ops();

    h.set_state(spec.id, DesiredState::Stop).await;
    let outcome = h.reconcile(spec.id).await;

    assert!(outcome.stopped);
    assert_eq!(h.hypervisor.ops(), vec![HypervisorOp::Stop(spec.id)]);
    let stored = h.stored(spec.id).await;
    assert_eq!(stored.vm_state, Some(VmState::Stopped));
    assert_eq!(stored.status(), DisplayStatus::Stopped);
}

#[tokio::test]
async fn test_restart_redefines_and_returns_to_start() {
    let h = Harness::new();
    let (spec, _) = h.instance(&["0"]).await;
    h.reconcile(spec.id).await;
    h.hypervisor.clear_ops();

    h.service
        .update(spec.id, |s| {
            s.memory = 2048;
            s.state = Some(DesiredState::Restart);
        })
        .await
        .unwrap();
    assert_eq!(h.stored(spec.id).await.status(), DisplayStatus::Restarting);

    let outcome = h.reconcile(spec.id).await;

    assert!(outcome.stopped);
    assert!(outcome.redefined);
    assert!(outcome.started);
    assert_eq!(
        h.hypervisor.ops(),
        vec![
            HypervisorOp::Stop(spec.id),
            HypervisorOp::Redefine(spec.id),
            HypervisorOp::Start(spec.id),
        ]
    );
    assert_eq!(h.vm(spec.id).await.unwrap().descriptor.memory, 2048);

    let stored = h.stored(spec.id).await;
    assert_eq!(stored.state, Some(DesiredState::Start));
    assert!(!stored.restart);
    assert_eq!(stored.status(), DisplayStatus::Running);
}

#[tokio::test]
async fn test_destroy_removes_vm_and_instance() {
    let h = Harness::new();
    let (spec, _) = h.instance(&["0"]).await;
    h.reconcile(spec.id).await;
    h.hypervisor.clear_ops();

    h.set_state(spec.id, DesiredState::Destroy).await;
    let outcome = h.reconcile(spec.id).await;

    assert!(outcome.stopped);
    assert!(outcome.destroyed);
    assert_eq!(
        h.hypervisor.ops(),
        vec![HypervisorOp::Stop(spec.id), HypervisorOp::Destroy(spec.id)]
    );
    assert!(h.vm(spec.id).await.is_none());
    assert!(h
        .store
        .find_instance(spec.id)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_reconcile_all_covers_only_this_node() {
    let h = Harness::new();
    let (local, _) = h.instance(&[]).await;

    let mut foreign = InstanceSpec::new(InstanceId::new());
    foreign.node = Some(NodeId::new());
    h.store.insert_instance(&foreign).await.unwrap();

    h.reconciler.reconcile_all().await;

    assert!(h.vm(local.id).await.is_some());
    assert!(h.vm(foreign.id).await.is_none());
}

#[tokio::test]
async fn test_failing_instance_is_skipped_after_retries_run_out() {
    let config = ReconcilerConfig {
        max_retries: 1,
        ..ReconcilerConfig::default()
    };
    let h = Harness::with(MockHypervisor::failing(), config);
    let (spec, _) = h.instance(&[]).await;

    h.reconciler.reconcile_all().await;
    h.reconciler.reconcile_all().await;
    h.reconciler.reconcile_all().await;

    assert_eq!(h.hypervisor.start_attempts(), 2);
    assert_eq!(h.hypervisor.ops(), vec![HypervisorOp::Create(spec.id)]);
    assert_eq!(h.stored(spec.id).await.vm_state, None);
}
