use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{AgentAnswer, AgentCommand, AgentDispatcher, PowerState};
use crate::core::vm::{HostId, HypervisorType, VirtualMachineInstance};
use crate::errors::AgentError;

/// What the orchestrator needs from a hypervisor family.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    fn hypervisor(&self) -> HypervisorType;

    async fn start(
        &self,
        host_id: HostId,
        vm: &VirtualMachineInstance,
    ) -> Result<AgentAnswer, AgentError>;

    async fn stop(
        &self,
        host_id: HostId,
        vm: &VirtualMachineInstance,
        force: bool,
    ) -> Result<AgentAnswer, AgentError>;

    async fn reboot(
        &self,
        host_id: HostId,
        vm: &VirtualMachineInstance,
    ) -> Result<AgentAnswer, AgentError>;

    async fn migrate(
        &self,
        source_host_id: HostId,
        dest_host_id: HostId,
        vm: &VirtualMachineInstance,
    ) -> Result<AgentAnswer, AgentError>;

    async fn query(
        &self,
        host_id: HostId,
        vm: &VirtualMachineInstance,
    ) -> Result<PowerState, AgentError>;
}

/// Shared command plumbing: every family talks to its agent through the
/// same dispatcher and differs only in the start definition.
struct Commands {
    dispatcher: Arc<dyn AgentDispatcher>,
}

impl Commands {
    async fn start(
        &self,
        host_id: HostId,
        vm: &VirtualMachineInstance,
        definition: Option<String>,
    ) -> Result<AgentAnswer, AgentError> {
        self.dispatcher
            .send(
                host_id,
                AgentCommand::StartVm {
                    vm_id: vm.id,
                    name: vm.name.clone(),
                    cpu_count: vm.offering.cpu_count,
                    cpu_speed_mhz: vm.offering.cpu_speed_mhz,
                    ram_mb: vm.offering.ram_mb,
                    definition,
                },
            )
            .await
    }

    async fn stop(
        &self,
        host_id: HostId,
        vm: &VirtualMachineInstance,
        force: bool,
    ) -> Result<AgentAnswer, AgentError> {
        self.dispatcher
            .send(
                host_id,
                AgentCommand::StopVm {
                    vm_id: vm.id,
                    name: vm.name.clone(),
                    force,
                },
            )
            .await
    }

    async fn reboot(
        &self,
        host_id: HostId,
        vm: &VirtualMachineInstance,
    ) -> Result<AgentAnswer, AgentError> {
        self.dispatcher
            .send(
                host_id,
                AgentCommand::RebootVm {
                    vm_id: vm.id,
                    name: vm.name.clone(),
                },
            )
            .await
    }

    async fn migrate(
        &self,
        source_host_id: HostId,
        dest_host_id: HostId,
        vm: &VirtualMachineInstance,
    ) -> Result<AgentAnswer, AgentError> {
        self.dispatcher
            .send(
                source_host_id,
                AgentCommand::MigrateVm {
                    vm_id: vm.id,
                    name: vm.name.clone(),
                    dest_host_id,
                },
            )
            .await
    }

    async fn query(
        &self,
        host_id: HostId,
        vm: &VirtualMachineInstance,
    ) -> Result<PowerState, AgentError> {
        let answer = self
            .dispatcher
            .send(
                host_id,
                AgentCommand::CheckVmState {
                    vm_id: vm.id,
                    name: vm.name.clone(),
                },
            )
            .await?;
        Ok(answer.power_state.unwrap_or(PowerState::Missing))
    }
}

/// KVM hosts are driven through libvirt, which wants a domain definition
/// with every start.
pub struct KvmDriver {
    commands: Commands,
}

impl KvmDriver {
    pub fn new(dispatcher: Arc<dyn AgentDispatcher>) -> Self {
        Self {
            commands: Commands { dispatcher },
        }
    }

    pub fn domain_xml(vm: &VirtualMachineInstance) -> String {
        format!(
            r#"<domain type='kvm'>
  <name>{}</name>
  <uuid>{}</uuid>
  <memory unit='MiB'>{}</memory>
  <vcpu placement='static'>{}</vcpu>
  <cputune><shares>{}</shares></cputune>
  <os>
    <type arch='x86_64' machine='pc-q35-7.0'>hvm</type>
    <boot dev='hd'/>
  </os>
  <devices>
    <graphics type='vnc' autoport='yes' listen='0.0.0.0'/>
  </devices>
</domain>"#,
            vm.name,
            vm.id,
            vm.offering.ram_mb,
            vm.offering.cpu_count,
            vm.offering.cpu_mhz(),
        )
    }
}

#[async_trait]
impl HypervisorDriver for KvmDriver {
    fn hypervisor(&self) -> HypervisorType {
        HypervisorType::Kvm
    }

    async fn start(
        &self,
        host_id: HostId,
        vm: &VirtualMachineInstance,
    ) -> Result<AgentAnswer, AgentError> {
        self.commands
            .start(host_id, vm, Some(Self::domain_xml(vm)))
            .await
    }

    async fn stop(
        &self,
        host_id: HostId,
        vm: &VirtualMachineInstance,
        force: bool,
    ) -> Result<AgentAnswer, AgentError> {
        self.commands.stop(host_id, vm, force).await
    }

    async fn reboot(
        &self,
        host_id: HostId,
        vm: &VirtualMachineInstance,
    ) -> Result<AgentAnswer, AgentError> {
        self.commands.reboot(host_id, vm).await
    }

    async fn migrate(
        &self,
        source_host_id: HostId,
        dest_host_id: HostId,
        vm: &VirtualMachineInstance,
    ) -> Result<AgentAnswer, AgentError> {
        self.commands.migrate(source_host_id, dest_host_id, vm).await
    }

    async fn query(
        &self,
        host_id: HostId,
        vm: &VirtualMachineInstance,
    ) -> Result<PowerState, AgentError> {
        self.commands.query(host_id, vm).await
    }
}

/// Families whose agent builds the machine itself from the offering.
pub struct GenericDriver {
    hypervisor: HypervisorType,
    commands: Commands,
}

impl GenericDriver {
    pub fn new(hypervisor: HypervisorType, dispatcher: Arc<dyn AgentDispatcher>) -> Self {
        Self {
            hypervisor,
            commands: Commands { dispatcher },
        }
    }
}

#[async_trait]
impl HypervisorDriver for GenericDriver {
    fn hypervisor(&self) -> HypervisorType {
        self.hypervisor
    }

    async fn start(
        &self,
        host_id: HostId,
        vm: &VirtualMachineInstance,
    ) -> Result<AgentAnswer, AgentError> {
        self.commands.start(host_id, vm, None).await
    }

    async fn stop(
        &self,
        host_id: HostId,
        vm: &VirtualMachineInstance,
        force: bool,
    ) -> Result<AgentAnswer, AgentError> {
        self.commands.stop(host_id, vm, force).await
    }

    async fn reboot(
        &self,
        host_id: HostId,
        vm: &VirtualMachineInstance,
    ) -> Result<AgentAnswer, AgentError> {
        self.commands.reboot(host_id, vm).await
    }

    async fn migrate(
        &self,
        source_host_id: HostId,
        dest_host_id: HostId,
        vm: &VirtualMachineInstance,
    ) -> Result<AgentAnswer, AgentError> {
        self.commands.migrate(source_host_id, dest_host_id, vm).await
    }

    async fn query(
        &self,
        host_id: HostId,
        vm: &VirtualMachineInstance,
    ) -> Result<PowerState, AgentError> {
        self.commands.query(host_id, vm).await
    }
}

/// Lookup table from hypervisor family to driver, filled at startup.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<HypervisorType, Arc<dyn HypervisorDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// KVM through libvirt definitions, every other family generic.
    pub fn with_dispatcher(dispatcher: Arc<dyn AgentDispatcher>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(KvmDriver::new(dispatcher.clone())));
        for hypervisor in [
            HypervisorType::Xen,
            HypervisorType::Vmware,
            HypervisorType::Simulator,
        ] {
            registry.register(Arc::new(GenericDriver::new(hypervisor, dispatcher.clone())));
        }
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn HypervisorDriver>) {
        debug!(hypervisor = ?driver.hypervisor(), "Registered hypervisor driver");
        self.drivers.insert(driver.hypervisor(), driver);
    }

    pub fn get(&self, hypervisor: HypervisorType) -> Result<Arc<dyn HypervisorDriver>, AgentError> {
        self.drivers
            .get(&hypervisor)
            .cloned()
            .ok_or(AgentError::NoDriver(hypervisor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vm::{PlacementHints, ServiceOffering, VmSpec, VmType};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(HostId, AgentCommand)>>,
    }

    #[async_trait]
    impl AgentDispatcher for Recorder {
        async fn send(
            &self,
            host_id: HostId,
            command: AgentCommand,
        ) -> Result<AgentAnswer, AgentError> {
            self.sent.lock().unwrap().push((host_id, command));
            Ok(AgentAnswer::success("ok"))
        }
    }

    fn vm(hypervisor: HypervisorType) -> VirtualMachineInstance {
        VirtualMachineInstance::new(
            VmSpec {
                name: "web-1".into(),
                vm_type: VmType::User,
                hypervisor,
            },
            ServiceOffering {
                id: 1,
                name: "small".into(),
                cpu_count: 1,
                cpu_speed_mhz: 1000,
                ram_mb: 1024,
            },
            PlacementHints::default(),
            chrono::Utc::now(),
        )
    }

    #[tokio::test]
    async fn kvm_start_carries_a_domain_definition() {
        let recorder = Arc::new(Recorder::default());
        let registry = DriverRegistry::with_dispatcher(recorder.clone());
        let vm = vm(HypervisorType::Kvm);

        let driver = registry.get(HypervisorType::Kvm).unwrap();
        driver.start(HostId(3), &vm).await.unwrap();

        let sent = recorder.sent.lock().unwrap();
        match &sent[0] {
            (HostId(3), AgentCommand::StartVm { definition: Some(xml), .. }) => {
                assert!(xml.contains("<name>web-1</name>"));
                assert!(xml.contains("<memory unit='MiB'>1024</memory>"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn migrate_is_sent_to_the_source_host() {
        let recorder = Arc::new(Recorder::default());
        let registry = DriverRegistry::with_dispatcher(recorder.clone());
        let vm = vm(HypervisorType::Xen);

        registry
            .get(HypervisorType::Xen)
            .unwrap()
            .migrate(HostId(1), HostId(2), &vm)
            .await
            .unwrap();

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent[0].0, HostId(1));
        assert!(matches!(
            sent[0].1,
            AgentCommand::MigrateVm { dest_host_id: HostId(2), .. }
        ));
    }

    #[test]
    fn unknown_family_has_no_driver() {
        let registry = DriverRegistry::new();
        assert!(matches!(
            registry.get(HypervisorType::Vmware),
            Err(AgentError::NoDriver(HypervisorType::Vmware))
        ));
    }
}
