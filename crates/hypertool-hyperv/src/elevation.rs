//! Elevated helper for host-wide actions (restarting the Host Network
//! Service).
//!
//! The unelevated process relaunches its own executable through the UAC
//! prompt with an action flag; the elevated instance runs only
//! [`ElevationHelper::run_privileged_action`] and reports through its exit
//! code.

use crate::error::{HyperVError, HyperVErrorKind, HyperVResult};
use crate::powershell::{classify_failure, PsRunner, PsScripts};
use crate::types::ElevationOutcome;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Win32 `ERROR_CANCELLED`, raised when the UAC prompt is dismissed.
const ERROR_CANCELLED: &str = "1223";

/// A host-wide action that needs an elevated process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegedAction {
    RestartHns,
}

impl PrivilegedAction {
    pub const ALL: [PrivilegedAction; 1] = [PrivilegedAction::RestartHns];

    /// Command-line flag the elevated instance is started with.
    pub fn flag(&self) -> &'static str {
        match self {
            Self::RestartHns => "--restart-hns",
        }
    }

    fn script(&self) -> &'static str {
        match self {
            Self::RestartHns => "Restart-Service -Name hns -Force -ErrorAction Stop",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::RestartHns => "HNS restart",
        }
    }

    /// The action requested by a command line, if any (flags compare
    /// ignoring case).
    pub fn from_args<I, S>(args: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        args.into_iter().find_map(|arg| {
            Self::ALL
                .iter()
                .copied()
                .find(|a| a.flag().eq_ignore_ascii_case(arg.as_ref()))
        })
    }
}

/// Host Network Service restart policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HnsSettings {
    pub enabled: bool,
    pub auto_restart_after_default_switch: bool,
    pub auto_restart_after_any_connect: bool,
}

impl Default for HnsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_restart_after_default_switch: true,
            auto_restart_after_any_connect: false,
        }
    }
}

/// Whether connecting to `connected_switch` should be followed by an
/// HNS restart.
pub fn should_restart_hns_after_connect(
    settings: &HnsSettings,
    connected_switch: &str,
    default_switch: &str,
) -> bool {
    if !settings.enabled {
        return false;
    }
    if settings.auto_restart_after_any_connect {
        return true;
    }
    settings.auto_restart_after_default_switch
        && connected_switch
            .trim()
            .eq_ignore_ascii_case(default_switch.trim())
}

pub struct ElevationHelper;

impl ElevationHelper {
    /// Relaunch `exe_path` elevated with the action's flag and wait for it.
    ///
    /// A declined prompt is `ElevationDeclined`; a helper that ran but
    /// failed yields an unsuccessful outcome carrying its exit code.
    pub async fn run_elevated(
        ps: &dyn PsRunner,
        exe_path: &Path,
        action: PrivilegedAction,
        cancel: &CancellationToken,
    ) -> HyperVResult<ElevationOutcome> {
        let exe = exe_path.to_string_lossy();
        if exe.trim().is_empty() {
            return Err(HyperVError::invalid_argument(
                "Path of the current executable could not be determined",
            ));
        }
        info!("Requesting elevation for {} via '{}'", action.description(), exe);
        let script = format!(
            "$p = Start-Process -FilePath {} -ArgumentList {} -Verb RunAs -Wait -PassThru -WindowStyle Hidden\nexit $p.ExitCode",
            PsScripts::quote(&exe),
            PsScripts::quote(action.flag())
        );
        let output = ps.run(&script, cancel).await?;

        if output.success() {
            info!("Elevated {} succeeded", action.description());
            return Ok(ElevationOutcome::succeeded(format!(
                "{} succeeded",
                action.description()
            )));
        }

        let diagnostic = output.diagnostic().to_lowercase();
        if diagnostic.contains("canceled by the user")
            || diagnostic.contains("cancelled by the user")
            || diagnostic.contains(ERROR_CANCELLED)
        {
            return Err(HyperVError::elevation_declined());
        }
        if !output.stderr.trim().is_empty() {
            return Err(classify_failure(&output));
        }
        warn!(
            "Elevated {} helper exited with code {}",
            action.description(),
            output.exit_code
        );
        Ok(ElevationOutcome::failed(format!(
            "Elevated helper for {} exited with code {}",
            action.description(),
            output.exit_code
        )))
    }

    /// Restart the Host Network Service through an elevated helper. A
    /// declined prompt is reported as an outcome, not as an error.
    pub async fn restart_privileged_service(
        ps: &dyn PsRunner,
        exe_path: &Path,
        cancel: &CancellationToken,
    ) -> HyperVResult<ElevationOutcome> {
        match Self::run_elevated(ps, exe_path, PrivilegedAction::RestartHns, cancel).await {
            Err(e) if e.kind == HyperVErrorKind::ElevationDeclined => {
                warn!("HNS restart not performed: the elevation prompt was declined");
                Ok(ElevationOutcome::failed(
                    "The elevation prompt was declined; HNS was not restarted.",
                ))
            }
            other => other,
        }
    }

    /// Body of the elevated instance. Never fails; the outcome's
    /// [`ElevationOutcome::exit_code`] becomes the process exit code.
    pub async fn run_privileged_action(
        ps: &dyn PsRunner,
        action: PrivilegedAction,
        cancel: &CancellationToken,
    ) -> ElevationOutcome {
        info!("Running privileged action: {}", action.description());
        match ps.run_void(action.script(), cancel).await {
            Ok(()) => {
                info!("{} succeeded", action.description());
                ElevationOutcome::succeeded("OK")
            }
            Err(e) => {
                error!("{} failed: {}", action.description(), e);
                ElevationOutcome::failed(e.to_string())
            }
        }
    }
}
