//! `HyperTool.config.json`: the VMs the tool manages, the switch treated
//! as "Default Switch", the console host and the HNS restart policy.
//!
//! The file is only ever read. Missing, unreadable or invalid files fall
//! back to defaults and every correction is kept in memory.

use hypertool_hyperv::elevation::HnsSettings;
use hypertool_hyperv::HyperVConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const CONFIG_FILE_NAME: &str = "HyperTool.config.json";
pub const DEFAULT_SWITCH_NAME: &str = "Default Switch";
pub const DEFAULT_CONSOLE_HOST: &str = "localhost";

/// A VM the tool offers in its lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmDefinition {
    pub name: String,
    pub label: String,
    /// Adapter that quick switch actions target; all adapters when unset.
    pub tray_adapter_name: Option<String>,
    /// Open consoles of this VM in session-edit mode.
    pub open_console_with_session_edit: bool,
}

impl VmDefinition {
    pub fn display_label(&self) -> &str {
        if self.label.trim().is_empty() {
            &self.name
        } else {
            &self.label
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HyperToolConfig {
    pub default_vm_name: String,
    pub vms: Vec<VmDefinition>,
    pub default_switch_name: String,
    pub vm_connect_computer_name: String,
    pub hns: HnsSettings,
    #[serde(flatten)]
    pub hyperv: HyperVConfig,
}

impl Default for HyperToolConfig {
    fn default() -> Self {
        Self {
            default_vm_name: String::new(),
            vms: Vec::new(),
            default_switch_name: DEFAULT_SWITCH_NAME.to_string(),
            vm_connect_computer_name: DEFAULT_CONSOLE_HOST.to_string(),
            hns: HnsSettings::default(),
            hyperv: HyperVConfig::default(),
        }
    }
}

impl HyperToolConfig {
    /// Fix up loaded values in place; returns a note per correction.
    pub fn normalize(&mut self) -> Vec<String> {
        let mut notices = Vec::new();

        let before = self.vms.len();
        for vm in &mut self.vms {
            vm.name = vm.name.trim().to_string();
            vm.label = vm.label.trim().to_string();
            if vm.label.is_empty() {
                vm.label = vm.name.clone();
            }
            vm.tray_adapter_name = vm
                .tray_adapter_name
                .take()
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty());
        }
        self.vms.retain(|vm| !vm.name.is_empty());
        if self.vms.len() != before {
            notices.push(format!(
                "Removed {} VM entries without a name",
                before - self.vms.len()
            ));
        }

        self.default_vm_name = self.default_vm_name.trim().to_string();
        if let Some(first) = self.vms.first() {
            if self.find_vm(&self.default_vm_name).is_none() {
                if !self.default_vm_name.is_empty() {
                    notices.push(format!(
                        "Default VM '{}' is not configured, using '{}'",
                        self.default_vm_name, first.name
                    ));
                }
                self.default_vm_name = first.name.clone();
            }
        }

        if self.default_switch_name.trim().is_empty() {
            self.default_switch_name = DEFAULT_SWITCH_NAME.to_string();
            notices.push(format!("Default switch name was empty, using '{}'", DEFAULT_SWITCH_NAME));
        } else {
            self.default_switch_name = self.default_switch_name.trim().to_string();
        }

        if self.vm_connect_computer_name.trim().is_empty() {
            self.vm_connect_computer_name = DEFAULT_CONSOLE_HOST.to_string();
        } else {
            self.vm_connect_computer_name = self.vm_connect_computer_name.trim().to_string();
        }

        let defaults = HyperVConfig::default();
        if self.hyperv.powershell_path.trim().is_empty() {
            self.hyperv.powershell_path = defaults.powershell_path;
        }
        if self.hyperv.vmconnect_path.trim().is_empty() {
            self.hyperv.vmconnect_path = defaults.vmconnect_path;
        }

        notices
    }

    /// Configured VM by name, ignoring case.
    pub fn find_vm(&self, name: &str) -> Option<&VmDefinition> {
        let name = name.trim();
        self.vms.iter().find(|vm| vm.name.eq_ignore_ascii_case(name))
    }

    /// The VM a command targets: the explicit name, else the default VM.
    pub fn resolve_vm_name(&self, explicit: Option<&str>) -> Option<String> {
        explicit
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .or_else(|| Some(self.default_vm_name.as_str()).filter(|n| !n.is_empty()))
            .map(str::to_string)
    }
}

/// Result of [`load`].
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: HyperToolConfig,
    pub path: PathBuf,
    /// Defaults are in use because the file was missing or unusable.
    pub is_default: bool,
    pub notices: Vec<String>,
}

/// Where the config lives: the override, else beside the executable when
/// a file exists there, else the per-user config directory.
pub fn resolve_config_path(override_path: Option<&Path>) -> PathBuf {
    if let Some(path) = override_path {
        return path.to_path_buf();
    }
    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(CONFIG_FILE_NAME)));
    if let Some(path) = beside_exe.as_ref().filter(|p| p.is_file()) {
        return path.clone();
    }
    match dirs::config_dir() {
        Some(dir) => dir.join("HyperTool").join(CONFIG_FILE_NAME),
        None => beside_exe.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME)),
    }
}

/// Read and normalise the config at `path`. Never fails.
pub fn load(path: &Path) -> LoadedConfig {
    let fallback = |notice: String| LoadedConfig {
        config: HyperToolConfig::default(),
        path: path.to_path_buf(),
        is_default: true,
        notices: vec![notice],
    };

    if !path.exists() {
        warn!("Config file not found at {}, using defaults", path.display());
        return fallback(format!("No configuration at {}", path.display()));
    }

    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Config file {} could not be read: {}", path.display(), e);
            return fallback(format!("Configuration could not be read: {}", e));
        }
    };

    let mut config: HyperToolConfig = match serde_json::from_str(raw.trim_start_matches('\u{feff}')) {
        Ok(config) => config,
        Err(e) => {
            warn!("Config file {} is invalid: {}", path.display(), e);
            return fallback(format!("Configuration is invalid: {}", e));
        }
    };

    let notices = config.normalize();
    for notice in &notices {
        warn!("Config: {}", notice);
    }
    info!(
        "Loaded config from {} ({} VMs, default '{}')",
        path.display(),
        config.vms.len(),
        config.default_vm_name
    );
    debug!("Config: {:?}", config);
    LoadedConfig {
        config,
        path: path.to_path_buf(),
        is_default: false,
        notices,
    }
}
