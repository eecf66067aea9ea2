mod common;

use futures::future::join_all;
use std::time::Duration;

use cloud_orchestrator::agent::{Fault, SimulatorAgent};
use cloud_orchestrator::core::ledger::{CapacitySnapshot, ResourceType};
use cloud_orchestrator::core::state_machine::VmEvent;
use cloud_orchestrator::core::store::DataStore;
use cloud_orchestrator::core::vm::{HostId, HostStatus, VmState};
use cloud_orchestrator::errors::{AgentError, CapacityError, CloudError, VmError};
use common::{medium, small, test_settings, Fixture};

const CPU_TOTAL: u64 = 8000;
const MEM_TOTAL: u64 = 16_384;

fn cpu(used: u64, reserved: u64) -> CapacitySnapshot {
    CapacitySnapshot {
        total: CPU_TOTAL,
        used,
        reserved,
    }
}

fn mem(used: u64, reserved: u64) -> CapacitySnapshot {
    CapacitySnapshot {
        total: MEM_TOTAL,
        used,
        reserved,
    }
}

#[tokio::test]
async fn start_commits_usage_on_the_chosen_host() {
    let fx = Fixture::new(2).await;
    let vm_id = fx.allocate_on("web", medium(), Some(HostId(1))).await;

    let state = fx.orchestrator.start(vm_id).await.unwrap();

    assert_eq!(state, VmState::Running);
    let vm = fx.orchestrator.vm(vm_id).await.unwrap();
    assert_eq!(vm.host_id, Some(HostId(1)));
    assert_eq!(vm.last_host_id, Some(HostId(1)));
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(4000, 0));
    assert_eq!(fx.capacity(1, ResourceType::Memory).await, mem(4096, 0));
    assert_eq!(fx.capacity(2, ResourceType::Cpu).await, cpu(0, 0));
    assert_eq!(fx.agent.host_of(vm_id).await, Some(HostId(1)));
}

#[tokio::test]
async fn agent_reported_stop_keeps_a_reservation() {
    let fx = Fixture::new(1).await;
    let vm_id = fx.running_on("web", medium(), 1).await;

    let out = fx
        .orchestrator
        .report_agent_event(vm_id, VmEvent::AgentReportStopped, None)
        .await
        .unwrap();

    assert_eq!(out.state(), VmState::Stopped);
    assert_eq!(out.vm.host_id, None);
    assert_eq!(out.vm.last_host_id, Some(HostId(1)));
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(0, 4000));
    assert_eq!(fx.capacity(1, ResourceType::Memory).await, mem(0, 4096));

    // Starting again on the same host turns the reservation back into usage.
    fx.orchestrator.start(vm_id).await.unwrap();
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(4000, 0));
}

#[tokio::test(start_paused = true)]
async fn migration_reserves_then_moves_usage() {
    let agent = SimulatorAgent::new().with_latency(Duration::from_millis(100));
    let fx = Fixture::with(test_settings(), agent, 2).await;
    let vm_id = fx.running_on("web", medium(), 1).await;

    let orchestrator = fx.orchestrator.clone();
    let migration = tokio::spawn(async move { orchestrator.migrate(vm_id, HostId(2)).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let vm = fx.orchestrator.vm(vm_id).await.unwrap();
    assert_eq!(vm.state, VmState::Migrating);
    assert_eq!(vm.host_id, Some(HostId(2)));
    assert_eq!(vm.last_host_id, Some(HostId(1)));
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(4000, 0));
    assert_eq!(fx.capacity(2, ResourceType::Cpu).await, cpu(0, 4000));

    assert_eq!(migration.await.unwrap().unwrap(), VmState::Running);
    let vm = fx.orchestrator.vm(vm_id).await.unwrap();
    assert_eq!(vm.host_id, Some(HostId(2)));
    assert_eq!(vm.last_host_id, Some(HostId(2)));
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(0, 0));
    assert_eq!(fx.capacity(2, ResourceType::Cpu).await, cpu(4000, 0));
    assert_eq!(fx.capacity(2, ResourceType::Memory).await, mem(4096, 0));
    assert_eq!(fx.agent.host_of(vm_id).await, Some(HostId(2)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transitions_from_one_state_have_one_winner() {
    let fx = Fixture::new(2).await;

    for n in 0..20 {
        let vm_id = fx.allocate(&format!("vm-{n}"), small()).await;
        let vm = fx.orchestrator.vm(vm_id).await.unwrap();
        let machine = fx.orchestrator.state_machine();

        let results = join_all([
            machine.apply(vm.clone(), VmEvent::StartRequested, Some(HostId(1))),
            machine.apply(vm.clone(), VmEvent::StartRequested, Some(HostId(2))),
        ])
        .await;

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1, "round {n}");
        assert!(results.iter().any(|r| matches!(
            r,
            Err(CloudError::Vm(VmError::ConcurrentModification { .. }))
        )));

        let stored = fx.orchestrator.vm(vm_id).await.unwrap();
        assert_eq!(stored.state, VmState::Starting);
        assert_eq!(stored.version, vm.version + 1);
    }

    // Only the winners' usage made it into the ledger.
    let used = fx.capacity(1, ResourceType::Cpu).await.used + fx.capacity(2, ResourceType::Cpu).await.used;
    assert_eq!(used, 20 * 1000);
}

#[tokio::test]
async fn lost_update_leaves_the_ledger_untouched() {
    let fx = Fixture::new(1).await;
    let vm_id = fx.allocate("web", medium()).await;

    fx.store.inject_vm_conflicts(1);
    let err = fx
        .orchestrator
        .state_machine()
        .transition(vm_id, VmEvent::StartRequested, Some(HostId(1)))
        .await
        .unwrap_err();

    assert!(matches!(err, CloudError::Vm(VmError::ConcurrentModification { .. })));
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(0, 0));
    assert_eq!(fx.orchestrator.vm(vm_id).await.unwrap().state, VmState::Stopped);
}

#[tokio::test]
async fn illegal_event_is_rejected_without_side_effects() {
    let fx = Fixture::new(1).await;
    let vm_id = fx.allocate("web", medium()).await;

    let err = fx
        .orchestrator
        .report_agent_event(vm_id, VmEvent::MigrationFailedOnDest, None)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CloudError::Vm(VmError::IllegalTransition {
            state: VmState::Stopped,
            event: VmEvent::MigrationFailedOnDest,
            ..
        })
    ));
    assert_eq!(fx.orchestrator.vm(vm_id).await.unwrap().version, 0);
}

#[tokio::test]
async fn failed_start_moves_on_to_another_host() {
    let fx = Fixture::new(2).await;
    fx.agent.set_fault(HostId(1), Some(Fault::FailCommands)).await;
    let vm_id = fx.allocate_on("web", medium(), Some(HostId(1))).await;

    let state = fx.orchestrator.start(vm_id).await.unwrap();

    assert_eq!(state, VmState::Running);
    let vm = fx.orchestrator.vm(vm_id).await.unwrap();
    assert_eq!(vm.host_id, Some(HostId(2)));
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(0, 0));
    assert_eq!(fx.capacity(2, ResourceType::Cpu).await, cpu(4000, 0));
}

#[tokio::test(start_paused = true)]
async fn start_that_times_out_everywhere_ends_stopped() {
    let fx = Fixture::new(3).await;
    for host in 1..=3 {
        fx.agent.set_fault(HostId(host), Some(Fault::Hang)).await;
    }
    let vm_id = fx.allocate("web", medium()).await;

    let err = fx.orchestrator.start(vm_id).await.unwrap_err();

    assert!(matches!(err, CloudError::Agent(AgentError::Timeout { .. })));
    let vm = fx.orchestrator.vm(vm_id).await.unwrap();
    assert_eq!(vm.state, VmState::Stopped);
    assert_eq!(vm.host_id, None);
    assert_eq!(vm.last_host_id, None);
    for host in 1..=3 {
        assert_eq!(fx.capacity(host, ResourceType::Cpu).await, cpu(0, 0));
        assert_eq!(fx.capacity(host, ResourceType::Memory).await, mem(0, 0));
    }
}

#[tokio::test]
async fn failed_start_on_last_host_keeps_its_reservation() {
    let mut settings = test_settings();
    settings.orchestrator.start_attempts = 1;
    let fx = Fixture::with(settings, SimulatorAgent::new(), 1).await;
    let vm_id = fx.running_on("web", medium(), 1).await;
    fx.orchestrator.stop(vm_id, false).await.unwrap();
    fx.agent.set_fault(HostId(1), Some(Fault::FailCommands)).await;

    assert!(fx.orchestrator.start(vm_id).await.is_err());

    let vm = fx.orchestrator.vm(vm_id).await.unwrap();
    assert_eq!(vm.state, VmState::Stopped);
    assert_eq!(vm.last_host_id, Some(HostId(1)));
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(0, 4000));
}

#[tokio::test]
async fn start_without_room_is_refused() {
    let fx = Fixture::new(2).await;
    let mut huge = medium();
    huge.cpu_count = 16;

    let vm_id = fx.allocate("huge", huge).await;
    let err = fx.orchestrator.start(vm_id).await.unwrap_err();

    assert!(matches!(
        err,
        CloudError::Capacity(CapacityError::InsufficientCapacity { .. })
    ));
    assert_eq!(fx.orchestrator.vm(vm_id).await.unwrap().state, VmState::Stopped);
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(0, 0));
    assert_eq!(fx.capacity(2, ResourceType::Cpu).await, cpu(0, 0));
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let fx = Fixture::new(1).await;
    let vm_id = fx.running_on("web", medium(), 1).await;

    assert_eq!(fx.orchestrator.start(vm_id).await.unwrap(), VmState::Running);
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(4000, 0));

    assert_eq!(fx.orchestrator.stop(vm_id, false).await.unwrap(), VmState::Stopped);
    assert_eq!(fx.orchestrator.stop(vm_id, false).await.unwrap(), VmState::Stopped);
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(0, 4000));
}

#[tokio::test]
async fn failed_stop_leaves_the_vm_running() {
    let fx = Fixture::new(1).await;
    let vm_id = fx.running_on("web", medium(), 1).await;
    fx.agent.set_fault(HostId(1), Some(Fault::FailCommands)).await;

    assert!(fx.orchestrator.stop(vm_id, false).await.is_err());

    assert_eq!(fx.orchestrator.vm(vm_id).await.unwrap().state, VmState::Running);
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(4000, 0));
}

#[tokio::test]
async fn forced_stop_ends_stopped_when_agent_is_gone() {
    let fx = Fixture::new(1).await;
    let vm_id = fx.running_on("web", medium(), 1).await;
    fx.agent.set_fault(HostId(1), Some(Fault::Unavailable)).await;

    let state = fx.orchestrator.stop(vm_id, true).await.unwrap();

    assert_eq!(state, VmState::Stopped);
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(0, 4000));
}

#[tokio::test]
async fn reboot_retries_an_unreachable_agent() {
    let mut settings = test_settings();
    settings.orchestrator.agent_retries = 2;
    let fx = Fixture::with(settings, SimulatorAgent::new(), 1).await;
    let vm_id = fx.running_on("web", medium(), 1).await;
    fx.agent.set_fault(HostId(1), Some(Fault::Unavailable)).await;

    let err = fx.orchestrator.reboot(vm_id).await.unwrap_err();
    assert!(matches!(err, CloudError::Agent(AgentError::Unavailable { .. })));

    fx.agent.set_fault(HostId(1), None).await;
    assert_eq!(fx.orchestrator.reboot(vm_id).await.unwrap(), VmState::Running);
}

#[tokio::test]
async fn migration_failing_on_source_keeps_vm_where_it_was() {
    let fx = Fixture::new(2).await;
    let vm_id = fx.running_on("web", medium(), 1).await;
    fx.agent.set_fault(HostId(2), Some(Fault::FailCommands)).await;

    assert!(fx.orchestrator.migrate(vm_id, HostId(2)).await.is_err());

    let vm = fx.orchestrator.vm(vm_id).await.unwrap();
    assert_eq!(vm.state, VmState::Running);
    assert_eq!(vm.host_id, Some(HostId(1)));
    assert_eq!(vm.last_host_id, Some(HostId(1)));
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(4000, 0));
    assert_eq!(fx.capacity(2, ResourceType::Cpu).await, cpu(0, 0));
}

#[tokio::test(start_paused = true)]
async fn migration_timeout_is_compensated_on_source() {
    let fx = Fixture::new(2).await;
    let vm_id = fx.running_on("web", medium(), 1).await;
    fx.agent.set_fault(HostId(1), Some(Fault::Hang)).await;

    let err = fx
        .orchestrator
        .migrate_within(vm_id, HostId(2), Duration::from_secs(30))
        .await
        .unwrap_err();

    assert!(matches!(err, CloudError::Agent(AgentError::Timeout { .. })));
    let vm = fx.orchestrator.vm(vm_id).await.unwrap();
    assert_eq!(vm.state, VmState::Running);
    assert_eq!(vm.host_id, Some(HostId(1)));
    assert_eq!(fx.capacity(2, ResourceType::Cpu).await, cpu(0, 0));
}

#[tokio::test(start_paused = true)]
async fn migration_deadline_is_not_stretched_by_agent_retries() {
    let mut settings = test_settings();
    settings.orchestrator.agent_retries = 2;
    settings.orchestrator.retry_backoff_ms = 500;
    let fx = Fixture::with(settings, SimulatorAgent::new(), 2).await;
    let vm_id = fx.running_on("web", medium(), 1).await;
    fx.agent.set_fault(HostId(1), Some(Fault::Hang)).await;

    let started = tokio::time::Instant::now();
    let err = fx
        .orchestrator
        .migrate_within(vm_id, HostId(2), Duration::from_secs(10))
        .await
        .unwrap_err();

    assert!(started.elapsed() <= Duration::from_secs(11), "{:?}", started.elapsed());
    assert!(matches!(err, CloudError::Agent(AgentError::Timeout { .. })));
    let vm = fx.orchestrator.vm(vm_id).await.unwrap();
    assert_eq!(vm.state, VmState::Running);
    assert_eq!(vm.host_id, Some(HostId(1)));
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(4000, 0));
    assert_eq!(fx.capacity(2, ResourceType::Cpu).await, cpu(0, 0));
}

#[tokio::test]
async fn migration_failing_on_destination_stops_the_vm() {
    let fx = Fixture::new(2).await;
    let vm_id = fx.running_on("web", medium(), 1).await;
    fx.agent
        .set_fault(HostId(2), Some(Fault::RejectIncomingMigrations))
        .await;

    assert!(fx.orchestrator.migrate(vm_id, HostId(2)).await.is_err());

    let vm = fx.orchestrator.vm(vm_id).await.unwrap();
    assert_eq!(vm.state, VmState::Stopped);
    assert_eq!(vm.host_id, None);
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(0, 0));
    assert_eq!(fx.capacity(2, ResourceType::Cpu).await, cpu(0, 0));
    assert_eq!(fx.agent.host_of(vm_id).await, None);
}

#[tokio::test]
async fn migration_requests_are_validated() {
    let fx = Fixture::new(2).await;
    fx.add_cluster(2).await;
    fx.orchestrator
        .register_host(common::host(9, 2))
        .await
        .unwrap();
    let vm_id = fx.running_on("web", medium(), 1).await;

    for dest in [HostId(1), HostId(9)] {
        let err = fx.orchestrator.migrate(vm_id, dest).await.unwrap_err();
        assert!(matches!(err, CloudError::Vm(VmError::InvalidRequest { .. })), "{dest}");
    }

    fx.orchestrator
        .set_host_status(HostId(2), HostStatus::Maintenance)
        .await
        .unwrap();
    assert!(fx.orchestrator.migrate(vm_id, HostId(2)).await.is_err());
    assert_eq!(fx.orchestrator.vm(vm_id).await.unwrap().version, 2);
}

#[tokio::test]
async fn expunge_releases_everything_and_hides_the_vm() {
    let fx = Fixture::new(1).await;
    let vm_id = fx.running_on("web", medium(), 1).await;
    fx.orchestrator.stop(vm_id, false).await.unwrap();
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(0, 4000));

    assert_eq!(fx.orchestrator.expunge(vm_id).await.unwrap(), VmState::Expunging);

    assert!(matches!(
        fx.orchestrator.vm(vm_id).await,
        Err(CloudError::Vm(VmError::NotFound { .. }))
    ));
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(0, 0));
    assert_eq!(fx.capacity(1, ResourceType::Memory).await, mem(0, 0));
}

#[tokio::test]
async fn running_vm_cannot_be_expunged() {
    let fx = Fixture::new(1).await;
    let vm_id = fx.running_on("web", medium(), 1).await;

    assert!(fx.orchestrator.expunge(vm_id).await.is_err());
    assert_eq!(fx.orchestrator.vm(vm_id).await.unwrap().state, VmState::Running);
}

#[tokio::test]
async fn destroyed_vm_can_be_recovered() {
    let fx = Fixture::new(1).await;
    let vm_id = fx.running_on("web", medium(), 1).await;
    fx.orchestrator.stop(vm_id, false).await.unwrap();

    assert_eq!(fx.orchestrator.destroy(vm_id).await.unwrap(), VmState::Destroyed);
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(0, 0));

    assert_eq!(fx.orchestrator.recover(vm_id).await.unwrap(), VmState::Stopped);
    let vm = fx.orchestrator.vm(vm_id).await.unwrap();
    assert_eq!(vm.last_host_id, None);

    assert_eq!(fx.orchestrator.start(vm_id).await.unwrap(), VmState::Running);
}

#[tokio::test]
async fn host_down_loses_vms_until_an_agent_finds_them() {
    let fx = Fixture::new(2).await;
    let first = fx.running_on("a", medium(), 1).await;
    let second = fx.running_on("b", small(), 1).await;

    assert_eq!(fx.orchestrator.host_down(HostId(1)).await.unwrap(), 2);

    assert_eq!(fx.store.find_host(HostId(1)).await.unwrap().status, HostStatus::Down);
    for vm_id in [first, second] {
        let vm = fx.orchestrator.vm(vm_id).await.unwrap();
        assert_eq!(vm.state, VmState::Unknown);
        assert_eq!(vm.host_id, None);
        assert_eq!(vm.last_host_id, Some(HostId(1)));
    }
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(0, 5000));

    // Found running elsewhere: the old reservation goes, usage lands on 2.
    fx.orchestrator
        .report_agent_event(first, VmEvent::AgentReportRunning, Some(HostId(2)))
        .await
        .unwrap();
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(0, 1000));
    assert_eq!(fx.capacity(2, ResourceType::Cpu).await, cpu(4000, 0));

    // A lost VM can be stopped by force without an agent.
    assert_eq!(fx.orchestrator.stop(second, true).await.unwrap(), VmState::Stopped);
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(0, 1000));
}

#[tokio::test]
async fn lost_vms_are_found_by_asking_the_agent() {
    let fx = Fixture::new(2).await;
    let first = fx.running_on("a", medium(), 1).await;
    let second = fx.running_on("b", small(), 1).await;
    fx.orchestrator.host_down(HostId(1)).await.unwrap();

    // The agent on host 2 has never seen `second`.
    assert_eq!(
        fx.orchestrator.sync_power_state(second, HostId(2)).await.unwrap(),
        VmState::Unknown
    );
    assert_eq!(fx.capacity(2, ResourceType::Cpu).await, cpu(0, 0));

    fx.orchestrator
        .set_host_status(HostId(1), HostStatus::Up)
        .await
        .unwrap();
    assert_eq!(
        fx.orchestrator.sync_power_state(first, HostId(1)).await.unwrap(),
        VmState::Running
    );
    let vm = fx.orchestrator.vm(first).await.unwrap();
    assert_eq!(vm.host_id, Some(HostId(1)));
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(4000, 1000));

    let err = fx
        .orchestrator
        .sync_power_state(first, HostId(1))
        .await
        .unwrap_err();
    assert!(matches!(err, CloudError::Vm(VmError::InvalidRequest { .. })));
}

#[tokio::test]
async fn resize_adjusts_the_held_reservation() {
    let fx = Fixture::new(1).await;
    let vm_id = fx.running_on("web", small(), 1).await;
    fx.orchestrator.stop(vm_id, false).await.unwrap();

    let vm = fx.orchestrator.resize(vm_id, medium()).await.unwrap();

    assert_eq!(vm.offering, medium());
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(0, 4000));
    assert_eq!(fx.capacity(1, ResourceType::Memory).await, mem(0, 4096));
}

#[tokio::test]
async fn running_vm_cannot_be_resized() {
    let fx = Fixture::new(1).await;
    let vm_id = fx.running_on("web", small(), 1).await;

    assert!(fx.orchestrator.resize(vm_id, medium()).await.is_err());
    assert_eq!(fx.capacity(1, ResourceType::Cpu).await, cpu(1000, 0));
}
