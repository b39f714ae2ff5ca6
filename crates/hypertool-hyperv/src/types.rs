//! Shared types for the Hyper-V orchestration crate.
//!
//! Covers VM state, virtual switch & adapter snapshots, host uplink info,
//! checkpoint info and tree nodes, export / import results, job progress
//! and executor configuration. Every type is a fresh snapshot of host
//! state; nothing here is cached or written back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── VM State ────────────────────────────────────────────────────────

/// Runtime state of a Hyper-V virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum VmState {
    Off,
    Running,
    Paused,
    Saved,
    Starting,
    Stopping,
    Saving,
    Pausing,
    Resuming,
    Reset,
    /// A state we didn't map yet.
    Other,
}

impl Default for VmState {
    fn default() -> Self {
        Self::Off
    }
}

impl VmState {
    /// Parse from the string representation returned by Get-VM.
    pub fn from_ps_string(s: &str) -> Self {
        match s.trim() {
            "Off" => Self::Off,
            "Running" => Self::Running,
            "Paused" => Self::Paused,
            "Saved" => Self::Saved,
            "Starting" => Self::Starting,
            "Stopping" => Self::Stopping,
            "Saving" => Self::Saving,
            "Pausing" => Self::Pausing,
            "Resuming" => Self::Resuming,
            "Reset" => Self::Reset,
            _ => Self::Other,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

// ─── VM Info ─────────────────────────────────────────────────────────

/// Summary of a virtual machine as shown in the VM list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInfo {
    pub name: String,
    pub state: VmState,
    /// State exactly as the host reported it.
    #[serde(default)]
    pub state_text: String,
    /// Status string (e.g. "Operating normally").
    #[serde(default)]
    pub status: String,
    /// Switch of the VM's first network adapter.
    #[serde(default)]
    pub current_switch_name: Option<String>,
}

// ─── Virtual Switches ────────────────────────────────────────────────

/// Virtual switch type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchType {
    External,
    Internal,
    Private,
    Unknown,
}

impl SwitchType {
    pub fn from_ps_string(s: &str) -> Self {
        match s.trim() {
            "External" | "2" => Self::External,
            "Internal" | "1" => Self::Internal,
            "Private" | "0" => Self::Private,
            _ => Self::Unknown,
        }
    }
}

/// Virtual switch summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualSwitchInfo {
    pub name: String,
    pub switch_type: SwitchType,
}

// ─── Network Adapters ────────────────────────────────────────────────

/// A VM's virtual network adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAdapterInfo {
    /// Adapter name; the correlation key for connect / disconnect / rename.
    pub name: String,
    /// Connected switch name, `None` when disconnected.
    #[serde(default)]
    pub switch_name: Option<String>,
    #[serde(default)]
    pub mac_address: String,
}

impl NetworkAdapterInfo {
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            "Network Adapter"
        } else {
            &self.name
        }
    }

    pub fn is_connected(&self) -> bool {
        self.switch_name.is_some()
    }
}

/// Host-level adapter with an uplink (gateway or live link).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostNetworkAdapterInfo {
    pub adapter_name: String,
    #[serde(default)]
    pub interface_description: String,
    /// Comma-joined IP addresses.
    #[serde(default)]
    pub ip_addresses: String,
    /// Comma-joined subnet masks / prefixes, aligned with `ip_addresses`.
    #[serde(default)]
    pub subnets: String,
    #[serde(default)]
    pub gateway: Option<String>,
    /// Comma-joined DNS servers.
    #[serde(default)]
    pub dns_servers: String,
    /// Whether this is the NAT adapter of the "Default Switch".
    #[serde(default)]
    pub is_default_switch: bool,
}

impl HostNetworkAdapterInfo {
    pub fn has_gateway(&self) -> bool {
        self.gateway
            .as_deref()
            .map(|g| !g.trim().is_empty())
            .unwrap_or(false)
    }
}

// ─── Checkpoints ─────────────────────────────────────────────────────

/// Hyper-V checkpoint type setting of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointKind {
    Disabled,
    Production,
    ProductionOnly,
    Standard,
    /// A value this crate does not know; passed back verbatim.
    Other(String),
}

impl Default for CheckpointKind {
    fn default() -> Self {
        Self::Production
    }
}

impl CheckpointKind {
    pub fn from_ps_string(s: &str) -> Self {
        match s.trim() {
            "Disabled" => Self::Disabled,
            "Production" => Self::Production,
            "ProductionOnly" => Self::ProductionOnly,
            "Standard" => Self::Standard,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_ps(&self) -> &str {
        match self {
            Self::Disabled => "Disabled",
            Self::Production => "Production",
            Self::ProductionOnly => "ProductionOnly",
            Self::Standard => "Standard",
            Self::Other(s) => s.as_str(),
        }
    }

    /// Whether `Checkpoint-VM` already attempts a production checkpoint.
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production | Self::ProductionOnly)
    }
}

/// A single checkpoint (snapshot) of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointInfo {
    /// Host-assigned id; may be empty on older hosts.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub is_current: bool,
    pub name: String,
    pub created: DateTime<Utc>,
    /// Checkpoint type text (`Standard`, `Production`, …).
    #[serde(default)]
    pub checkpoint_type: String,
}

/// Derived forest node; children ordered by creation time, then name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointTreeNode {
    pub checkpoint: CheckpointInfo,
    pub children: Vec<CheckpointTreeNode>,
    /// Most recently created checkpoint of the whole set.
    pub is_latest: bool,
}

impl CheckpointTreeNode {
    pub fn is_current(&self) -> bool {
        self.checkpoint.is_current
    }

    /// Number of nodes in this subtree, including itself.
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(|c| c.len()).sum::<usize>()
    }
}

// ─── Export / Import ─────────────────────────────────────────────────

/// Outcome of the pre-export free space check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpaceCheckResult {
    pub has_enough_space: bool,
    pub required_bytes: u64,
    pub available_bytes: u64,
    /// Volume root the destination resolves to, e.g. `D:\`.
    pub target_drive: String,
}

/// Outcome of an import, including name conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    /// Name the VM ended up with.
    pub vm_name: String,
    /// Name recorded in the imported configuration.
    pub original_name: String,
    pub renamed_due_to_conflict: bool,
}

/// Lifecycle of a host-side export / import job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    NotStarted,
    Running,
    Completed,
    Failed,
}

impl JobState {
    /// Map a PowerShell `JobState` name.
    pub fn from_ps_string(s: &str) -> Self {
        match s.trim() {
            "NotStarted" => Self::NotStarted,
            "Running" | "Stopping" | "Suspending" | "Suspended" | "Blocked" => Self::Running,
            "Completed" => Self::Completed,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Receives percent-complete updates (0–100) of a long-running job.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, percent: u8);
}

impl<F> ProgressObserver for F
where
    F: Fn(u8) + Send + Sync,
{
    fn on_progress(&self, percent: u8) {
        self(percent)
    }
}

impl ProgressObserver for tokio::sync::mpsc::UnboundedSender<u8> {
    fn on_progress(&self, percent: u8) {
        // A dropped receiver only means nobody is watching any more.
        let _ = self.send(percent);
    }
}

/// Observer that ignores every update.
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_progress(&self, _percent: u8) {}
}

// ─── Elevation ───────────────────────────────────────────────────────

/// Result of an elevated helper run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElevationOutcome {
    pub success: bool,
    pub message: String,
}

impl ElevationOutcome {
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }

    /// Process exit code of the elevated helper: 0 on success, else 1.
    pub fn exit_code(&self) -> i32 {
        if self.success {
            0
        } else {
            1
        }
    }
}

// ─── Configuration ───────────────────────────────────────────────────

/// Executor and launcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HyperVConfig {
    /// PowerShell executable path.
    #[serde(default = "default_pwsh_path")]
    pub powershell_path: String,
    /// Console viewer executable.
    #[serde(default = "default_vmconnect_path")]
    pub vmconnect_path: String,
}

fn default_pwsh_path() -> String {
    "powershell.exe".to_string()
}

fn default_vmconnect_path() -> String {
    "vmconnect.exe".to_string()
}

impl Default for HyperVConfig {
    fn default() -> Self {
        Self {
            powershell_path: default_pwsh_path(),
            vmconnect_path: default_vmconnect_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn vm_state_from_host_text() {
        assert_eq!(VmState::from_ps_string("Running"), VmState::Running);
        assert_eq!(VmState::from_ps_string(" Saved "), VmState::Saved);
        assert_eq!(VmState::from_ps_string("FastSaved"), VmState::Other);
    }

    #[test]
    fn checkpoint_kind_round_trips_unknown_values() {
        let kind = CheckpointKind::from_ps_string("ProductionOnly");
        assert_eq!(kind, CheckpointKind::ProductionOnly);
        let other = CheckpointKind::from_ps_string("Future");
        assert_eq!(other.as_ps(), "Future");
    }

    #[test]
    fn job_state_mapping() {
        assert_eq!(JobState::from_ps_string("Running"), JobState::Running);
        assert_eq!(JobState::from_ps_string("Completed"), JobState::Completed);
        assert_eq!(JobState::from_ps_string("Failed"), JobState::Failed);
        assert_eq!(JobState::from_ps_string("Stopped"), JobState::Failed);
        assert!(!JobState::NotStarted.is_terminal());
    }

    #[test]
    fn adapter_display_name_fallback() {
        let adapter = NetworkAdapterInfo {
            name: " ".into(),
            switch_name: None,
            mac_address: String::new(),
        };
        assert_eq!(adapter.display_name(), "Network Adapter");
        assert!(!adapter.is_connected());
    }

    #[test]
    fn closures_observe_progress() {
        let seen = Mutex::new(Vec::new());
        let observer = |p: u8| seen.lock().unwrap().push(p);
        observer.on_progress(5);
        observer.on_progress(70);
        assert_eq!(*seen.lock().unwrap(), vec![5, 70]);
    }

    #[test]
    fn channel_observes_progress() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tx.on_progress(42);
        assert_eq!(rx.try_recv().unwrap(), 42);
    }

    #[test]
    fn host_adapter_gateway() {
        let mut info = HostNetworkAdapterInfo {
            adapter_name: "Ethernet".into(),
            interface_description: String::new(),
            ip_addresses: String::new(),
            subnets: String::new(),
            gateway: Some("  ".into()),
            dns_servers: String::new(),
            is_default_switch: false,
        };
        assert!(!info.has_gateway());
        info.gateway = Some("192.168.1.1".into());
        assert!(info.has_gateway());
    }
}
