//! Command handlers: resolve defaults from the config, call the service,
//! print the result.

use crate::cli::{CheckpointAction, Command};
use crate::config::HyperToolConfig;
use anyhow::{anyhow, Result};
use hypertool_hyperv::elevation::should_restart_hns_after_connect;
use hypertool_hyperv::snapshot::default_checkpoint_name;
use hypertool_hyperv::types::{CheckpointTreeNode, ElevationOutcome, ProgressObserver};
use hypertool_hyperv::{CancellationToken, HyperVServiceState};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fmt::Write as _;
use std::process::ExitCode;
use tracing::{info, warn};

pub struct App {
    service: HyperVServiceState,
    config: HyperToolConfig,
    cancel: CancellationToken,
    json: bool,
}

impl App {
    pub fn new(
        service: HyperVServiceState,
        config: HyperToolConfig,
        cancel: CancellationToken,
        json: bool,
    ) -> Self {
        Self {
            service,
            config,
            cancel,
            json,
        }
    }

    pub async fn execute(&self, command: Command) -> Result<ExitCode> {
        let cancel = &self.cancel;
        match command {
            Command::Check => {
                let available = self.service.check_module(cancel).await?;
                self.emit(&available, |ok| {
                    if *ok {
                        "Hyper-V PowerShell module is available".to_string()
                    } else {
                        "Hyper-V PowerShell module is NOT available".to_string()
                    }
                })?;
                return Ok(if available { ExitCode::SUCCESS } else { ExitCode::FAILURE });
            }

            Command::Vms => {
                let vms = self.service.list_vms(cancel).await?;
                self.emit(&vms, |vms| {
                    let mut out = String::new();
                    for vm in vms {
                        let label = self
                            .config
                            .find_vm(&vm.name)
                            .map(|d| d.display_label())
                            .filter(|l| *l != vm.name)
                            .map(|l| format!(" ({})", l))
                            .unwrap_or_default();
                        let _ = writeln!(
                            out,
                            "{:<32} {:<10} {}{}",
                            vm.name,
                            vm.state_text,
                            vm.current_switch_name.as_deref().unwrap_or("-"),
                            label
                        );
                    }
                    out
                })?;
            }

            Command::Start { vm } => {
                let vm = self.vm(vm)?;
                self.service.start_vm(&vm, cancel).await?;
                println!("Started '{}'", vm);
            }
            Command::Stop { vm } => {
                let vm = self.vm(vm)?;
                self.service.stop_vm_graceful(&vm, cancel).await?;
                println!("Shutdown requested for '{}'", vm);
            }
            Command::TurnOff { vm } => {
                let vm = self.vm(vm)?;
                self.service.turn_off_vm(&vm, cancel).await?;
                println!("Turned off '{}'", vm);
            }
            Command::Restart { vm } => {
                let vm = self.vm(vm)?;
                self.service.restart_vm(&vm, cancel).await?;
                println!("Restarted '{}'", vm);
            }

            Command::Switches => {
                let switches = self.service.list_switches(cancel).await?;
                self.emit(&switches, |switches| {
                    let mut out = String::new();
                    for s in switches {
                        let _ = writeln!(out, "{:<32} {:?}", s.name, s.switch_type);
                    }
                    out
                })?;
            }
            Command::Adapters { vm } => {
                let vm = self.vm(vm)?;
                let adapters = self.service.list_adapters(&vm, cancel).await?;
                self.emit(&adapters, |adapters| {
                    let mut out = String::new();
                    for a in adapters {
                        let _ = writeln!(
                            out,
                            "{:<24} {:<18} {}",
                            a.display_name(),
                            a.mac_address,
                            a.switch_name.as_deref().unwrap_or("(disconnected)")
                        );
                    }
                    out
                })?;
            }
            Command::Connect {
                switch,
                adapter,
                no_hns_restart,
                vm,
            } => {
                let vm = self.vm(vm)?;
                let switch = non_blank(switch)
                    .unwrap_or_else(|| self.config.default_switch_name.clone());
                let adapter = non_blank(adapter).or_else(|| {
                    self.config
                        .find_vm(&vm)
                        .and_then(|d| d.tray_adapter_name.clone())
                });
                self.service
                    .connect_adapter(&vm, &switch, adapter.as_deref(), cancel)
                    .await?;
                println!("Connected '{}' to '{}'", vm, switch);

                if !no_hns_restart
                    && should_restart_hns_after_connect(
                        &self.config.hns,
                        &switch,
                        &self.config.default_switch_name,
                    )
                {
                    info!("Restarting HNS after connecting to '{}'", switch);
                    let outcome = self.service.restart_hns(cancel).await?;
                    self.report_outcome(&outcome);
                }
            }
            Command::Disconnect { adapter, vm } => {
                let vm = self.vm(vm)?;
                let adapter = non_blank(adapter).or_else(|| {
                    self.config
                        .find_vm(&vm)
                        .and_then(|d| d.tray_adapter_name.clone())
                });
                self.service
                    .disconnect_adapter(&vm, adapter.as_deref(), cancel)
                    .await?;
                println!("Disconnected '{}'", vm);
            }
            Command::RenameAdapter {
                vm,
                old_name,
                new_name,
            } => {
                self.service
                    .rename_adapter(&vm, &old_name, &new_name, cancel)
                    .await?;
                println!("Renamed adapter '{}' to '{}' on '{}'", old_name, new_name, vm);
            }

            Command::Checkpoints { vm } => {
                let vm = self.vm(vm)?;
                let tree = self.service.checkpoint_tree(&vm, cancel).await?;
                self.emit(&tree, |tree| {
                    if tree.is_empty() {
                        format!("'{}' has no checkpoints", vm)
                    } else {
                        render_tree(tree)
                    }
                })?;
            }
            Command::Checkpoint { action } => self.checkpoint(action).await?,

            Command::DiskCheck { vm, destination } => {
                let result = self
                    .service
                    .check_disk_space(&vm, &destination, cancel)
                    .await?;
                self.emit(&result, |r| {
                    format!(
                        "{} required: {}, available on {}: {}",
                        if r.has_enough_space { "OK" } else { "NOT ENOUGH SPACE" },
                        format_bytes(r.required_bytes),
                        r.target_drive,
                        format_bytes(r.available_bytes)
                    )
                })?;
                if !result.has_enough_space {
                    return Ok(ExitCode::FAILURE);
                }
            }
            Command::Export { vm, destination } => {
                let bar = transfer_bar(format!("Exporting {}", vm));
                let observer = progress_observer(&bar);
                let result = self
                    .service
                    .export_vm(&vm, &destination, &observer, cancel)
                    .await;
                finish_bar(&bar, result.is_ok());
                result?;
                println!("Exported '{}' to '{}'", vm, destination);
            }
            Command::Import { path, destination } => {
                let bar = transfer_bar(format!("Importing {}", path));
                let observer = progress_observer(&bar);
                let result = self
                    .service
                    .import_vm(&path, &destination, &observer, cancel)
                    .await;
                finish_bar(&bar, result.is_ok());
                let imported = result?;
                self.emit(&imported, |r| {
                    if r.renamed_due_to_conflict {
                        format!(
                            "Imported '{}' as '{}' (name already in use)",
                            r.original_name, r.vm_name
                        )
                    } else {
                        format!("Imported '{}'", r.vm_name)
                    }
                })?;
            }

            Command::Console {
                host,
                session_edit,
                reopen,
                vm,
            } => {
                let vm = self.vm(vm)?;
                let host = non_blank(host)
                    .unwrap_or_else(|| self.config.vm_connect_computer_name.clone());
                if reopen {
                    self.service
                        .reopen_console_with_session_edit(&vm, &host, cancel)
                        .await?;
                } else {
                    let session_edit = session_edit
                        || self
                            .config
                            .find_vm(&vm)
                            .map_or(false, |d| d.open_console_with_session_edit);
                    self.service.open_console(&vm, &host, session_edit, cancel)?;
                }
                println!("Console for '{}' opened", vm);
            }

            Command::HostNetwork => {
                let adapters = self
                    .service
                    .list_host_network_adapters_with_uplink(cancel)
                    .await?;
                self.emit(&adapters, |adapters| {
                    let mut out = String::new();
                    for a in adapters {
                        let _ = writeln!(
                            out,
                            "{}{}\n  IP:      {}\n  Subnet:  {}\n  Gateway: {}\n  DNS:     {}",
                            a.adapter_name,
                            if a.is_default_switch { " [Default Switch]" } else { "" },
                            dash(&a.ip_addresses),
                            dash(&a.subnets),
                            a.gateway.as_deref().unwrap_or("-"),
                            dash(&a.dns_servers)
                        );
                    }
                    out
                })?;
            }

            Command::RestartHns => {
                let outcome = self.service.restart_hns(cancel).await?;
                self.report_outcome(&outcome);
                if !outcome.success {
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Ok(ExitCode::SUCCESS)
    }

    async fn checkpoint(&self, action: CheckpointAction) -> Result<()> {
        let cancel = &self.cancel;
        match action {
            CheckpointAction::Create {
                name,
                description,
                vm,
            } => {
                let vm = self.vm(vm)?;
                let name = non_blank(name).unwrap_or_else(default_checkpoint_name);
                self.service
                    .create_checkpoint(&vm, &name, description.as_deref(), cancel)
                    .await?;
                println!("Created checkpoint '{}' on '{}'", name, vm);
            }
            CheckpointAction::Apply { vm, name, id } => {
                self.service
                    .apply_checkpoint(&vm, &name, id.as_deref(), cancel)
                    .await?;
                println!("Applied checkpoint '{}' on '{}'", name, vm);
            }
            CheckpointAction::Remove { vm, name, id } => {
                self.service
                    .remove_checkpoint(&vm, &name, id.as_deref(), cancel)
                    .await?;
                println!("Removed checkpoint '{}' from '{}'", name, vm);
            }
        }
        Ok(())
    }

    fn vm(&self, explicit: Option<String>) -> Result<String> {
        self.config
            .resolve_vm_name(explicit.as_deref())
            .ok_or_else(|| anyhow!("No VM given and no default VM configured"))
    }

    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            let text = text(value);
            println!("{}", text.trim_end());
        }
        Ok(())
    }

    fn report_outcome(&self, outcome: &ElevationOutcome) {
        if outcome.success {
            println!("{}", outcome.message);
        } else {
            warn!("{}", outcome.message);
            eprintln!("{}", outcome.message);
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn dash(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}

/// Indented checkpoint forest; `*` marks the current checkpoint.
pub fn render_tree(nodes: &[CheckpointTreeNode]) -> String {
    fn walk(nodes: &[CheckpointTreeNode], depth: usize, out: &mut String) {
        for node in nodes {
            let _ = writeln!(
                out,
                "{}{} {}  {}  {}{}",
                "  ".repeat(depth),
                if node.is_current() { "*" } else { "-" },
                node.checkpoint.name,
                node.checkpoint.created.format("%Y-%m-%d %H:%M"),
                node.checkpoint.checkpoint_type,
                if node.is_latest { "  (latest)" } else { "" }
            );
            walk(&node.children, depth + 1, out);
        }
    }
    let mut out = String::new();
    walk(nodes, 0, &mut out);
    out
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn transfer_bar(message: String) -> ProgressBar {
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::with_template(
        "{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos:>3}% ({elapsed})",
    )
    .map(|s| s.progress_chars("#>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar.set_message(message);
    bar.enable_steady_tick(std::time::Duration::from_millis(120));
    bar
}

fn progress_observer(bar: &ProgressBar) -> impl ProgressObserver {
    let bar = bar.clone();
    move |percent: u8| bar.set_position(u64::from(percent))
}

fn finish_bar(bar: &ProgressBar, ok: bool) {
    if ok {
        bar.finish_with_message("done");
    } else {
        bar.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use hypertool_hyperv::snapshot::build_checkpoint_tree;
    use hypertool_hyperv::types::CheckpointInfo;

    fn checkpoint(id: &str, parent: Option<&str>, name: &str, day: u32) -> CheckpointInfo {
        CheckpointInfo {
            id: id.into(),
            parent_id: parent.map(str::to_string),
            is_current: id == "b",
            name: name.into(),
            created: Utc.with_ymd_and_hms(2024, 3, day, 9, 30, 0).unwrap(),
            checkpoint_type: "Standard".into(),
        }
    }

    #[test]
    fn tree_rendering_indents_children() {
        let tree = build_checkpoint_tree(&[
            checkpoint("a", None, "Base", 1),
            checkpoint("b", Some("a"), "Updated", 2),
        ]);
        let text = render_tree(&tree);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "- Base  2024-03-01 09:30  Standard");
        assert_eq!(lines[1], "  * Updated  2024-03-02 09:30  Standard  (latest)");
    }

    #[test]
    fn byte_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5_000_000_000), "4.7 GiB");
    }

    #[test]
    fn blank_options_are_dropped() {
        assert_eq!(non_blank(Some("  ".into())), None);
        assert_eq!(non_blank(Some(" LAN ".into())).as_deref(), Some("LAN"));
    }
}
