//! VM lifecycle management: list, query, start, graceful stop, turn off,
//! restart, rename.

use crate::error::{require_name, HyperVError, HyperVResult};
use crate::powershell::{PsRunner, PsScripts};
use crate::rows::RowView;
use crate::types::*;
use log::{debug, info};
use tokio_util::sync::CancellationToken;

/// Projection shared by `list_vms` and `get_vm`; expects `$vms` in scope.
const VM_PROJECTION: &str = r#"
@($vms | ForEach-Object {
    $adapter = Get-VMNetworkAdapter -VM $_ -ErrorAction SilentlyContinue | Select-Object -First 1
    [PSCustomObject]@{
        Name              = $_.Name
        State             = $_.State.ToString()
        Status            = $_.Status
        CurrentSwitchName = if ($adapter) { $adapter.SwitchName } else { $null }
    }
}) | ConvertTo-Json -Depth 3 -Compress
"#;

/// Manager for Hyper-V virtual machine lifecycle operations.
pub struct VmManager;

impl VmManager {
    // ── Query / List ─────────────────────────────────────────────────

    /// List all VMs with the switch of their first adapter.
    pub async fn list_vms(
        ps: &dyn PsRunner,
        cancel: &CancellationToken,
    ) -> HyperVResult<Vec<VirtualMachineInfo>> {
        let script = format!("$vms = Get-VM\n{}", VM_PROJECTION);
        let rows = ps.run_rows(&script, cancel).await?;
        let vms: Vec<VirtualMachineInfo> = rows.iter().map(vm_from_row).collect();
        debug!("Found {} VMs", vms.len());
        Ok(vms)
    }

    /// Get a single VM by name.
    pub async fn get_vm(
        ps: &dyn PsRunner,
        name: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<VirtualMachineInfo> {
        require_name(name, "VM name")?;
        let script = format!(
            "$vms = Get-VM -Name {} -ErrorAction SilentlyContinue\n{}",
            PsScripts::quote(name),
            VM_PROJECTION
        );
        let rows = ps.run_rows(&script, cancel).await?;
        rows.iter()
            .map(vm_from_row)
            .next()
            .ok_or_else(|| HyperVError::not_found(format!("VM '{}' not found", name)))
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub async fn start_vm(
        ps: &dyn PsRunner,
        name: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        require_name(name, "VM name")?;
        info!("Starting VM '{}'", name);
        ps.run_void(&format!("Start-VM -Name {} -Confirm:$false", PsScripts::quote(name)), cancel)
            .await
    }

    /// Ask the guest OS to shut down.
    pub async fn stop_vm_graceful(
        ps: &dyn PsRunner,
        name: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        require_name(name, "VM name")?;
        info!("Shutting down VM '{}'", name);
        ps.run_void(
            &format!("Stop-VM -Name {} -Shutdown -Confirm:$false", PsScripts::quote(name)),
            cancel,
        )
        .await
    }

    /// Cut power immediately.
    pub async fn turn_off_vm(
        ps: &dyn PsRunner,
        name: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        require_name(name, "VM name")?;
        info!("Turning off VM '{}'", name);
        ps.run_void(
            &format!("Stop-VM -Name {} -TurnOff -Confirm:$false", PsScripts::quote(name)),
            cancel,
        )
        .await
    }

    pub async fn restart_vm(
        ps: &dyn PsRunner,
        name: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        require_name(name, "VM name")?;
        info!("Restarting VM '{}'", name);
        ps.run_void(
            &format!("Restart-VM -Name {} -Force -Confirm:$false", PsScripts::quote(name)),
            cancel,
        )
        .await
    }

    // ── Naming ───────────────────────────────────────────────────────

    /// Names of every VM on the host.
    pub async fn list_vm_names(
        ps: &dyn PsRunner,
        cancel: &CancellationToken,
    ) -> HyperVResult<Vec<String>> {
        let rows = ps
            .run_rows(
                "@(Get-VM | Select-Object Name) | ConvertTo-Json -Compress",
                cancel,
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| r.string("Name"))
            .filter(|n| !n.is_empty())
            .collect())
    }

    /// Rename the VM with this id. Addressing by id keeps duplicate names
    /// apart.
    pub async fn rename_vm_by_id(
        ps: &dyn PsRunner,
        id: &str,
        new_name: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        require_name(id, "VM id")?;
        require_name(new_name, "New VM name")?;
        info!("Renaming VM {} -> '{}'", id, new_name);
        ps.run_void(
            &format!(
                "Get-VM -Id {} | Rename-VM -NewName {}",
                PsScripts::quote(id),
                PsScripts::quote(new_name)
            ),
            cancel,
        )
        .await
    }
}

fn vm_from_row(row: &RowView) -> VirtualMachineInfo {
    let state_text = row.string("State");
    VirtualMachineInfo {
        name: row.string("Name"),
        state: VmState::from_ps_string(&state_text),
        state_text,
        status: row.string("Status"),
        current_switch_name: row.opt_string("CurrentSwitchName"),
    }
}
