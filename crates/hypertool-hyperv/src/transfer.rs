//! VM export and import as host-side background jobs with progress.
//!
//! Each transfer runs as one streamed PowerShell process: it starts the
//! cmdlet with `-AsJob`, polls the job every 500 ms and prints marker
//! lines (see [`crate::rows::parse_marker`]) that a [`JobTracker`] turns
//! into progress updates. Killing the process stops the polling; the
//! Hyper-V jobs of the VM being transferred are then asked to terminate
//! on a best-effort basis.

use crate::error::{require_name, HyperVError, HyperVErrorKind, HyperVResult};
use crate::powershell::{ensure_success, PsRunner, PsScripts};
use crate::rows::{parse_marker, parse_rows, Marker};
use crate::types::*;
use crate::vm::VmManager;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Upper bound for the post-cancellation job cleanup.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Polls `$job` until it reaches a terminal state, printing state and
/// percent markers. A job that did not complete writes its failure
/// reason to stderr and exits 1.
const POLL_JOB: &str = r#"
$last = -1
$child = $null
while ($true) {
    $state = $job.State.ToString()
    [Console]::Out.WriteLine('##HT-STATE:' + $state)
    $child = $job.ChildJobs | Select-Object -First 1
    if ($child -and $child.Progress.Count -gt 0) {
        $pct = [int]$child.Progress[$child.Progress.Count - 1].PercentComplete
        if ($pct -ge 0 -and $pct -le 100 -and $pct -ne $last) {
            [Console]::Out.WriteLine('##HT-PROGRESS:' + $pct)
            $last = $pct
        }
    }
    if ($state -eq 'Completed' -or $state -eq 'Failed' -or $state -eq 'Stopped') { break }
    Start-Sleep -Milliseconds 500
}
if ($state -ne 'Completed') {
    $reason = $null
    if ($child -and $child.JobStateInfo.Reason) { $reason = $child.JobStateInfo.Reason.Message }
    if (-not $reason -and $job.JobStateInfo.Reason) { $reason = $job.JobStateInfo.Reason.Message }
    if (-not $reason) {
        $err = $child.Error | Select-Object -First 1
        if ($err) { $reason = $err.ToString() }
    }
    if (-not $reason) { $reason = "Hyper-V job ended in state $state" }
    [Console]::Error.WriteLine($reason)
    exit 1
}
"#;

/// Prints the imported VM's name and id; expects a completed `$job`.
const REPORT_IMPORTED_VM: &str = r#"
$imported = Receive-Job -Job $job | Select-Object -First 1
$payload = [PSCustomObject]@{ Name = $imported.Name; Id = $imported.Id.ToString() } | ConvertTo-Json -Compress
[Console]::Out.WriteLine('##HT-RESULT:' + $payload)
"#;

/// Asks the still-running Hyper-V export / import jobs of one VM to
/// terminate. Jobs are matched through their affected element, so other
/// VMs' transfers keep running.
pub fn terminate_transfer_jobs_script(vm_name: &str) -> String {
    format!(
        r#"
$target = {vm}
Get-CimInstance -Namespace 'root\virtualization\v2' -ClassName Msvm_ConcreteJob -ErrorAction SilentlyContinue |
    Where-Object {{ $_.JobState -eq 4 -and ("$($_.Caption) $($_.Description)" -match 'export|import') }} |
    Where-Object {{
        @(Get-CimAssociatedInstance -InputObject $_ -Association Msvm_AffectedJobElement -ErrorAction SilentlyContinue |
            Where-Object {{ $_.ElementName -eq $target }}).Count -gt 0
    }} |
    ForEach-Object {{ Invoke-CimMethod -InputObject $_ -MethodName RequestStateChange -Arguments @{{ RequestedState = [uint16]4 }} | Out-Null }}
"#,
        vm = PsScripts::quote(vm_name)
    )
}

// ─── Job tracking ────────────────────────────────────────────────────

/// State machine for one polled job.
///
/// Progress is forwarded only when it strictly increases, so observers
/// see a deduplicated, non-decreasing sequence that ends at 100 when the
/// job completes.
#[derive(Debug)]
pub struct JobTracker {
    state: JobState,
    last_reported: Option<u8>,
    result: Option<String>,
    target: Option<String>,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self {
            state: JobState::NotStarted,
            last_reported: None,
            result: None,
            target: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Last percentage handed to the observer.
    pub fn last_reported(&self) -> Option<u8> {
        self.last_reported
    }

    /// Record a host state; terminal states are final.
    pub fn observe_state(&mut self, text: &str) {
        if self.state.is_terminal() {
            return;
        }
        let next = JobState::from_ps_string(text);
        if next != self.state {
            debug!("Job state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    pub fn observe_progress(&mut self, percent: u8, observer: &dyn ProgressObserver) {
        let percent = percent.min(100);
        if self.last_reported.map_or(true, |last| percent > last) {
            self.last_reported = Some(percent);
            observer.on_progress(percent);
        }
    }

    /// Feed one stdout line; returns whether it was a marker.
    pub fn handle_line(&mut self, line: &str, observer: &dyn ProgressObserver) -> bool {
        match parse_marker(line) {
            Some(Marker::Progress(pct)) => {
                if self.state == JobState::NotStarted {
                    self.state = JobState::Running;
                }
                self.observe_progress(pct, observer);
                true
            }
            Some(Marker::State(state)) => {
                self.observe_state(&state);
                true
            }
            Some(Marker::Result(payload)) => {
                self.result = Some(payload);
                true
            }
            Some(Marker::Target(name)) => {
                self.target = Some(name);
                true
            }
            None => false,
        }
    }

    /// Mark the job completed and make sure the observer saw 100.
    pub fn complete(&mut self, observer: &dyn ProgressObserver) {
        self.state = JobState::Completed;
        self.observe_progress(100, observer);
    }

    pub fn fail(&mut self) {
        self.state = JobState::Failed;
    }

    pub fn take_result(&mut self) -> Option<String> {
        self.result.take()
    }

    /// VM named by the script's target marker.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }
}

// ─── Manager ─────────────────────────────────────────────────────────

/// Manager for export, import and the pre-export disk check.
pub struct TransferManager;

impl TransferManager {
    /// Compare the VM's disk footprint with the destination's free space.
    pub async fn check_disk_space(
        ps: &dyn PsRunner,
        vm_name: &str,
        destination: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<DiskSpaceCheckResult> {
        require_name(vm_name, "VM name")?;
        require_name(destination, "Destination path")?;
        let script = format!(
            r#"
$vm = Get-VM -Name {vm}
$vhdBytes = [int64]0
$fileBytes = [int64]0
foreach ($p in @(Get-VMHardDiskDrive -VM $vm | ForEach-Object {{ $_.Path }} | Where-Object {{ $_ }})) {{
    $vhd = Get-VHD -Path $p -ErrorAction SilentlyContinue
    if ($vhd) {{ $vhdBytes += [int64]$vhd.FileSize }}
    $item = Get-Item -LiteralPath $p -ErrorAction SilentlyContinue
    if ($item) {{ $fileBytes += [int64]$item.Length }}
}}
$root = [System.IO.Path]::GetPathRoot([System.IO.Path]::GetFullPath({dest}))
$drive = New-Object System.IO.DriveInfo($root)
[PSCustomObject]@{{
    VhdBytes       = $vhdBytes
    FileBytes      = $fileBytes
    AvailableBytes = [int64]$drive.AvailableFreeSpace
    TargetDrive    = $drive.Name
}} | ConvertTo-Json -Compress
"#,
            vm = PsScripts::quote(vm_name),
            dest = PsScripts::quote(destination)
        );
        let rows = ps.run_rows(&script, cancel).await?;
        let row = rows.first().ok_or_else(|| {
            HyperVError::parse(format!("Disk space check for VM '{}' returned no data", vm_name))
        })?;

        let vhd_bytes = row.i64("VhdBytes").max(0) as u64;
        let file_bytes = row.i64("FileBytes").max(0) as u64;
        let required_bytes = if vhd_bytes > 0 { vhd_bytes } else { file_bytes }.max(1);
        let available_bytes = row.i64("AvailableBytes").max(0) as u64;
        let target_drive = row
            .opt_string("TargetDrive")
            .unwrap_or_else(|| path_root(destination));

        let result = DiskSpaceCheckResult {
            has_enough_space: available_bytes >= required_bytes,
            required_bytes,
            available_bytes,
            target_drive,
        };
        debug!("Disk space check for '{}': {:?}", vm_name, result);
        Ok(result)
    }

    /// Export a VM into `destination`, reporting progress.
    pub async fn export_vm(
        ps: &dyn PsRunner,
        vm_name: &str,
        destination: &str,
        progress: &dyn ProgressObserver,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        let space = Self::check_disk_space(ps, vm_name, destination, cancel).await?;
        if !space.has_enough_space {
            return Err(HyperVError::with_details(
                HyperVErrorKind::InsufficientDiskSpace,
                format!("Not enough free space on {} to export VM '{}'", space.target_drive, vm_name),
                format!(
                    "required {} bytes, available {} bytes",
                    space.required_bytes, space.available_bytes
                ),
            ));
        }

        info!("Exporting VM '{}' to '{}'", vm_name, destination);
        let script = format!(
            r#"
$dest = {dest}
if (-not (Test-Path -LiteralPath $dest)) {{ New-Item -ItemType Directory -Path $dest -Force | Out-Null }}
$job = Export-VM -Name {vm} -Path $dest -AsJob
{poll}"#,
            dest = PsScripts::quote(destination),
            vm = PsScripts::quote(vm_name),
            poll = POLL_JOB
        );
        Self::run_job(ps, &script, Some(vm_name), progress, cancel).await?;
        info!("Export of VM '{}' completed", vm_name);
        Ok(())
    }

    /// Import a VM as a copy with a new id. A directory is searched for the
    /// newest configuration file. A name clash with an existing VM is
    /// resolved by renaming the imported one.
    pub async fn import_vm(
        ps: &dyn PsRunner,
        import_path: &str,
        destination: &str,
        progress: &dyn ProgressObserver,
        cancel: &CancellationToken,
    ) -> HyperVResult<ImportResult> {
        require_name(import_path, "Import path")?;
        require_name(destination, "Destination path")?;

        let search_root = PathBuf::from(import_path);
        let config_path = tokio::task::spawn_blocking(move || locate_vm_config(&search_root))
            .await
            .map_err(|e| HyperVError::process("VM configuration lookup failed", e.to_string()))??;
        let config_text = config_path.to_string_lossy().into_owned();
        debug!("Import uses configuration '{}'", config_text);

        let existing = VmManager::list_vm_names(ps, cancel).await?;

        info!("Importing VM from '{}' into '{}'", config_text, destination);
        let script = format!(
            r#"
$dest = {dest}
$report = Compare-VM -Path {cfg} -Copy -GenerateNewId -VirtualMachinePath $dest -VhdDestinationPath (Join-Path $dest 'Virtual Hard Disks') -SnapshotFilePath $dest -SmartPagingFilePath $dest -ErrorAction Stop
[Console]::Out.WriteLine('##HT-TARGET:' + $report.VM.Name)
$job = Import-VM -CompatibilityReport $report -AsJob
{poll}{report}"#,
            dest = PsScripts::quote(destination),
            cfg = PsScripts::quote(&config_text),
            poll = POLL_JOB,
            report = REPORT_IMPORTED_VM
        );
        let payload = Self::run_job(ps, &script, None, progress, cancel)
            .await?
            .ok_or_else(|| HyperVError::parse("Import completed without reporting the imported VM"))?;

        let rows = parse_rows(&payload)?;
        let row = rows
            .first()
            .ok_or_else(|| HyperVError::parse("Import result was empty"))?;
        let original_name = row.string("Name");
        let vm_id = row.string("Id");
        if original_name.is_empty() {
            return Err(HyperVError::parse("Import result carries no VM name"));
        }

        let conflict = existing.iter().any(|n| n.eq_ignore_ascii_case(&original_name));
        if !conflict {
            info!("Imported VM '{}'", original_name);
            return Ok(ImportResult {
                vm_name: original_name.clone(),
                original_name,
                renamed_due_to_conflict: false,
            });
        }

        let taken = VmManager::list_vm_names(ps, cancel).await?;
        let new_name = next_import_name(&original_name, &taken);
        warn!(
            "Imported VM name '{}' already exists, renaming the import to '{}'",
            original_name, new_name
        );
        VmManager::rename_vm_by_id(ps, &vm_id, &new_name, cancel).await?;
        Ok(ImportResult {
            vm_name: new_name,
            original_name,
            renamed_due_to_conflict: true,
        })
    }

    /// Stream a polling script through a [`JobTracker`]; returns the
    /// result marker payload, if any. On cancellation the jobs of `vm_name`
    /// (or of the VM the script announced) are asked to terminate.
    async fn run_job(
        ps: &dyn PsRunner,
        script: &str,
        vm_name: Option<&str>,
        progress: &dyn ProgressObserver,
        cancel: &CancellationToken,
    ) -> HyperVResult<Option<String>> {
        let mut tracker = JobTracker::new();
        let streamed = {
            let mut sink = |line: &str| tracker.handle_line(line, progress);
            ps.run_streaming(script, cancel, &mut sink).await
        };

        let output = match streamed {
            Ok(output) => output,
            Err(e) if e.is_cancelled() => {
                tracker.fail();
                match vm_name.or(tracker.target()) {
                    Some(target) => Self::terminate_transfer_jobs(ps, target).await,
                    None => debug!("Cancelled before the job announced its VM, nothing to terminate"),
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        match ensure_success(output) {
            Ok(_) => {
                tracker.complete(progress);
                Ok(tracker.take_result())
            }
            Err(e) => {
                tracker.fail();
                Err(e)
            }
        }
    }

    /// Best-effort termination of a VM's orphaned Hyper-V transfer jobs.
    async fn terminate_transfer_jobs(ps: &dyn PsRunner, vm_name: &str) {
        let token = CancellationToken::new();
        let script = terminate_transfer_jobs_script(vm_name);
        match tokio::time::timeout(CLEANUP_TIMEOUT, ps.run_void(&script, &token)).await {
            Ok(Ok(())) => debug!("Requested termination of transfer jobs for VM '{}'", vm_name),
            Ok(Err(e)) => warn!("Could not terminate transfer jobs for VM '{}': {}", vm_name, e),
            Err(_) => warn!(
                "Terminating transfer jobs for VM '{}' timed out after {:?}",
                vm_name, CLEANUP_TIMEOUT
            ),
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

/// First free `<name>-import` / `<name>-import-N` (N from 2), compared
/// ignoring case.
pub fn next_import_name(base: &str, taken: &[String]) -> String {
    let is_taken = |candidate: &str| taken.iter().any(|t| t.eq_ignore_ascii_case(candidate));
    let first = format!("{}-import", base);
    if !is_taken(&first) {
        return first;
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{}-import-{}", base, n);
        if !is_taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Resolve an import path to a VM configuration file. A directory yields
/// its most recently modified `*.vmcx`, else its newest `*.xml`.
pub fn locate_vm_config(path: &Path) -> HyperVResult<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if !path.is_dir() {
        return Err(HyperVError::not_found(format!(
            "Import path '{}' does not exist",
            path.display()
        )));
    }

    let mut newest_vmcx: Option<(SystemTime, PathBuf)> = None;
    let mut newest_xml: Option<(SystemTime, PathBuf)> = None;
    for entry in WalkDir::new(path).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let ext = entry
            .path()
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        let slot = match ext.as_deref() {
            Some("vmcx") => &mut newest_vmcx,
            Some("xml") => &mut newest_xml,
            _ => continue,
        };
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if slot.as_ref().map_or(true, |(t, _)| modified > *t) {
            *slot = Some((modified, entry.into_path()));
        }
    }

    newest_vmcx
        .or(newest_xml)
        .map(|(_, p)| p)
        .ok_or_else(|| {
            HyperVError::not_found(format!(
                "No VM configuration (*.vmcx or *.xml) found under '{}'",
                path.display()
            ))
        })
}

/// Volume root of a Windows path: `D:\exports` -> `D:\`,
/// `\\server\share\dir` -> `\\server\share\`.
pub fn path_root(path: &str) -> String {
    let trimmed = path.trim();
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return format!("{}:\\", (bytes[0] as char).to_ascii_uppercase());
    }
    if let Some(rest) = trimmed.strip_prefix("\\\\") {
        let parts: Vec<&str> = rest.split('\\').filter(|p| !p.is_empty()).take(2).collect();
        if parts.len() == 2 {
            return format!("\\\\{}\\{}\\", parts[0], parts[1]);
        }
    }
    trimmed.to_string()
}
