//! VM console windows through `vmconnect.exe`.

use crate::error::{require_name, HyperVError, HyperVResult};
use crate::powershell::{PsRunner, PsScripts};
use log::{info, warn};
use std::process::{Command, Stdio};
use tokio_util::sync::CancellationToken;

/// Starts a program detached from this process.
pub trait ConsoleLauncher: Send + Sync {
    fn launch(&self, program: &str, args: &[String]) -> HyperVResult<()>;
}

/// Launches real processes; nothing waits for them.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl ConsoleLauncher for ProcessLauncher {
    fn launch(&self, program: &str, args: &[String]) -> HyperVResult<()> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(0x0000_0008); // DETACHED_PROCESS
        }
        cmd.spawn().map(drop).map_err(|e| {
            HyperVError::process(format!("Failed to start '{}'", program), e.to_string())
        })
    }
}

/// Opens and reopens VM console windows.
pub struct ConsoleManager;

impl ConsoleManager {
    /// Open a console window for a VM on `host`.
    pub fn open_console(
        launcher: &dyn ConsoleLauncher,
        vmconnect_path: &str,
        vm_name: &str,
        host: &str,
        session_edit: bool,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        if cancel.is_cancelled() {
            return Err(HyperVError::cancelled());
        }
        require_name(vm_name, "VM name")?;
        let args = vmconnect_args(host, vm_name, session_edit);
        launcher.launch(vmconnect_path, &args)?;
        info!(
            "vmconnect started for VM '{}' on host '{}' (session edit: {})",
            vm_name, args[0], session_edit
        );
        Ok(())
    }

    /// Close consoles already showing this VM, then open one in
    /// session-edit mode. Closing is best effort.
    pub async fn reopen_with_session_edit(
        ps: &dyn PsRunner,
        launcher: &dyn ConsoleLauncher,
        vmconnect_path: &str,
        vm_name: &str,
        host: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        require_name(vm_name, "VM name")?;
        let script = format!(
            "Get-Process -Name vmconnect -ErrorAction SilentlyContinue | \
             Where-Object {{ $_.MainWindowTitle -and $_.MainWindowTitle.IndexOf({}, [StringComparison]::OrdinalIgnoreCase) -ge 0 }} | \
             Stop-Process -Force -ErrorAction SilentlyContinue",
            PsScripts::quote(vm_name)
        );
        match ps.run_void(&script, cancel).await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => warn!(
                "Could not close existing console windows of VM '{}': {}",
                vm_name, e
            ),
        }
        Self::open_console(launcher, vmconnect_path, vm_name, host, true, cancel)
    }
}

/// `vmconnect.exe` arguments: host, VM, optional `/edit`.
pub fn vmconnect_args(host: &str, vm_name: &str, session_edit: bool) -> Vec<String> {
    let host = if host.trim().is_empty() {
        "localhost"
    } else {
        host.trim()
    };
    let mut args = vec![host.to_string(), vm_name.to_string()];
    if session_edit {
        args.push("/edit".to_string());
    }
    args
}
