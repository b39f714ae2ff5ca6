//! Aggregate service facade for the Hyper-V orchestration crate.
//!
//! Owns the runner and console launcher, delegates to the domain managers
//! and applies the logging policy to every result. The service holds no
//! mutable state, so one instance is shared as [`HyperVServiceState`] and
//! independent operations run concurrently.

use crate::console::{ConsoleLauncher, ConsoleManager, ProcessLauncher};
use crate::elevation::{ElevationHelper, PrivilegedAction};
use crate::error::{HyperVError, HyperVResult};
use crate::network::NetworkManager;
use crate::powershell::{PsExecutor, PsRunner};
use crate::snapshot::SnapshotManager;
use crate::transfer::TransferManager;
use crate::types::*;
use crate::vm::VmManager;
use log::{info, log, Level};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared handle for callers.
pub type HyperVServiceState = Arc<HyperVService>;

/// Central Hyper-V management service.
pub struct HyperVService {
    ps: Arc<dyn PsRunner>,
    launcher: Arc<dyn ConsoleLauncher>,
    config: HyperVConfig,
}

impl Default for HyperVService {
    fn default() -> Self {
        Self::new()
    }
}

impl HyperVService {
    /// Create a new service with default config.
    pub fn new() -> Self {
        Self::with_config(HyperVConfig::default())
    }

    /// Create a new service running the real PowerShell executor.
    pub fn with_config(config: HyperVConfig) -> Self {
        Self::with_runner(Arc::new(PsExecutor::new(&config)), config)
    }

    /// Create a service on top of any runner.
    pub fn with_runner(ps: Arc<dyn PsRunner>, config: HyperVConfig) -> Self {
        Self {
            ps,
            launcher: Arc::new(ProcessLauncher),
            config,
        }
    }

    /// Replace the console launcher.
    pub fn with_launcher(mut self, launcher: Arc<dyn ConsoleLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn config(&self) -> &HyperVConfig {
        &self.config
    }

    fn ps(&self) -> &dyn PsRunner {
        self.ps.as_ref()
    }

    /// Check whether the Hyper-V module is available.
    pub async fn check_module(&self, cancel: &CancellationToken) -> HyperVResult<bool> {
        observe("Hyper-V module check", self.ps().check_module(cancel).await)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  VM Lifecycle
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn list_vms(&self, cancel: &CancellationToken) -> HyperVResult<Vec<VirtualMachineInfo>> {
        observe("List VMs", VmManager::list_vms(self.ps(), cancel).await)
    }

    pub async fn get_vm(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<VirtualMachineInfo> {
        observe(
            &format!("Get VM '{}'", name),
            VmManager::get_vm(self.ps(), name, cancel).await,
        )
    }

    pub async fn start_vm(&self, name: &str, cancel: &CancellationToken) -> HyperVResult<()> {
        observe(
            &format!("Start VM '{}'", name),
            VmManager::start_vm(self.ps(), name, cancel).await,
        )
    }

    pub async fn stop_vm_graceful(&self, name: &str, cancel: &CancellationToken) -> HyperVResult<()> {
        observe(
            &format!("Shut down VM '{}'", name),
            VmManager::stop_vm_graceful(self.ps(), name, cancel).await,
        )
    }

    pub async fn turn_off_vm(&self, name: &str, cancel: &CancellationToken) -> HyperVResult<()> {
        observe(
            &format!("Turn off VM '{}'", name),
            VmManager::turn_off_vm(self.ps(), name, cancel).await,
        )
    }

    pub async fn restart_vm(&self, name: &str, cancel: &CancellationToken) -> HyperVResult<()> {
        observe(
            &format!("Restart VM '{}'", name),
            VmManager::restart_vm(self.ps(), name, cancel).await,
        )
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Networking
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn list_switches(
        &self,
        cancel: &CancellationToken,
    ) -> HyperVResult<Vec<VirtualSwitchInfo>> {
        observe(
            "List virtual switches",
            NetworkManager::list_switches(self.ps(), cancel).await,
        )
    }

    pub async fn list_adapters(
        &self,
        vm_name: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<Vec<NetworkAdapterInfo>> {
        observe(
            &format!("List adapters of VM '{}'", vm_name),
            NetworkManager::list_adapters(self.ps(), vm_name, cancel).await,
        )
    }

    pub async fn get_current_switch(
        &self,
        vm_name: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<Option<String>> {
        observe(
            &format!("Get current switch of VM '{}'", vm_name),
            NetworkManager::get_current_switch(self.ps(), vm_name, cancel).await,
        )
    }

    pub async fn connect_adapter(
        &self,
        vm_name: &str,
        switch_name: &str,
        adapter_name: Option<&str>,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        observe(
            &format!("Connect VM '{}' to switch '{}'", vm_name, switch_name),
            NetworkManager::connect_adapter(self.ps(), vm_name, switch_name, adapter_name, cancel)
                .await,
        )
    }

    pub async fn disconnect_adapter(
        &self,
        vm_name: &str,
        adapter_name: Option<&str>,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        observe(
            &format!("Disconnect VM '{}'", vm_name),
            NetworkManager::disconnect_adapter(self.ps(), vm_name, adapter_name, cancel).await,
        )
    }

    pub async fn rename_adapter(
        &self,
        vm_name: &str,
        old_name: &str,
        new_name: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        observe(
            &format!("Rename adapter '{}' of VM '{}'", old_name, vm_name),
            NetworkManager::rename_adapter(self.ps(), vm_name, old_name, new_name, cancel).await,
        )
    }

    pub async fn list_host_network_adapters_with_uplink(
        &self,
        cancel: &CancellationToken,
    ) -> HyperVResult<Vec<HostNetworkAdapterInfo>> {
        observe(
            "List host uplink adapters",
            NetworkManager::list_host_network_adapters_with_uplink(self.ps(), cancel).await,
        )
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Console
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn open_console(
        &self,
        vm_name: &str,
        host: &str,
        session_edit: bool,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        observe(
            &format!("Open console of VM '{}'", vm_name),
            ConsoleManager::open_console(
                self.launcher.as_ref(),
                &self.config.vmconnect_path,
                vm_name,
                host,
                session_edit,
                cancel,
            ),
        )
    }

    pub async fn reopen_console_with_session_edit(
        &self,
        vm_name: &str,
        host: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        observe(
            &format!("Reopen console of VM '{}'", vm_name),
            ConsoleManager::reopen_with_session_edit(
                self.ps(),
                self.launcher.as_ref(),
                &self.config.vmconnect_path,
                vm_name,
                host,
                cancel,
            )
            .await,
        )
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Checkpoints
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn list_checkpoints(
        &self,
        vm_name: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<Vec<CheckpointInfo>> {
        observe(
            &format!("List checkpoints of VM '{}'", vm_name),
            SnapshotManager::list_checkpoints(self.ps(), vm_name, cancel).await,
        )
    }

    pub async fn checkpoint_tree(
        &self,
        vm_name: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<Vec<CheckpointTreeNode>> {
        observe(
            &format!("Checkpoint tree of VM '{}'", vm_name),
            SnapshotManager::checkpoint_tree(self.ps(), vm_name, cancel).await,
        )
    }

    pub async fn create_checkpoint(
        &self,
        vm_name: &str,
        checkpoint_name: &str,
        description: Option<&str>,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        observe(
            &format!("Create checkpoint '{}' of VM '{}'", checkpoint_name, vm_name),
            SnapshotManager::create_checkpoint(
                self.ps(),
                vm_name,
                checkpoint_name,
                description,
                cancel,
            )
            .await,
        )
    }

    pub async fn apply_checkpoint(
        &self,
        vm_name: &str,
        checkpoint_name: &str,
        checkpoint_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        observe(
            &format!("Apply checkpoint '{}' of VM '{}'", checkpoint_name, vm_name),
            SnapshotManager::apply_checkpoint(
                self.ps(),
                vm_name,
                checkpoint_name,
                checkpoint_id,
                cancel,
            )
            .await,
        )
    }

    pub async fn remove_checkpoint(
        &self,
        vm_name: &str,
        checkpoint_name: &str,
        checkpoint_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        observe(
            &format!("Remove checkpoint '{}' of VM '{}'", checkpoint_name, vm_name),
            SnapshotManager::remove_checkpoint(
                self.ps(),
                vm_name,
                checkpoint_name,
                checkpoint_id,
                cancel,
            )
            .await,
        )
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Export / Import
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn check_disk_space(
        &self,
        vm_name: &str,
        destination: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<DiskSpaceCheckResult> {
        observe(
            &format!("Disk space check for VM '{}'", vm_name),
            TransferManager::check_disk_space(self.ps(), vm_name, destination, cancel).await,
        )
    }

    pub async fn export_vm(
        &self,
        vm_name: &str,
        destination: &str,
        progress: &dyn ProgressObserver,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        observe(
            &format!("Export of VM '{}'", vm_name),
            TransferManager::export_vm(self.ps(), vm_name, destination, progress, cancel).await,
        )
    }

    pub async fn import_vm(
        &self,
        import_path: &str,
        destination: &str,
        progress: &dyn ProgressObserver,
        cancel: &CancellationToken,
    ) -> HyperVResult<ImportResult> {
        observe(
            &format!("Import from '{}'", import_path),
            TransferManager::import_vm(self.ps(), import_path, destination, progress, cancel)
                .await,
        )
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Elevation
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Restart HNS by relaunching the running executable elevated.
    pub async fn restart_hns(&self, cancel: &CancellationToken) -> HyperVResult<ElevationOutcome> {
        let exe = std::env::current_exe().map_err(|e| {
            HyperVError::process("Path of the current executable could not be determined", e.to_string())
        });
        match exe {
            Ok(exe) => self.restart_hns_with(&exe, cancel).await,
            Err(e) => {
                e.log("HNS restart");
                Err(e)
            }
        }
    }

    /// Restart HNS through a specific helper executable.
    pub async fn restart_hns_with(
        &self,
        exe_path: &Path,
        cancel: &CancellationToken,
    ) -> HyperVResult<ElevationOutcome> {
        observe_outcome(
            "HNS restart",
            ElevationHelper::restart_privileged_service(self.ps(), exe_path, cancel).await,
        )
    }

    /// Run an action in the already elevated helper process.
    pub async fn run_privileged_action(
        &self,
        action: PrivilegedAction,
        cancel: &CancellationToken,
    ) -> ElevationOutcome {
        ElevationHelper::run_privileged_action(self.ps(), action, cancel).await
    }
}

/// Log the outcome of an operation at the level its result calls for.
fn observe<T>(operation: &str, result: HyperVResult<T>) -> HyperVResult<T> {
    match &result {
        Ok(_) => info!("{} succeeded", operation),
        Err(e) => e.log(operation),
    }
    result
}

/// Like [`observe`] for elevated runs, where `Ok` may still carry a
/// declined or failed outcome.
fn observe_outcome(
    operation: &str,
    result: HyperVResult<ElevationOutcome>,
) -> HyperVResult<ElevationOutcome> {
    if let Ok(outcome) = &result {
        let (level, text) = outcome_log_line(operation, outcome);
        log!(level, "{}", text);
        return result;
    }
    observe(operation, result)
}

fn outcome_log_line(operation: &str, outcome: &ElevationOutcome) -> (Level, String) {
    if outcome.success {
        (Level::Info, format!("{} succeeded", operation))
    } else {
        (
            Level::Warn,
            format!("{} did not succeed: {}", operation, outcome.message),
        )
    }
}
