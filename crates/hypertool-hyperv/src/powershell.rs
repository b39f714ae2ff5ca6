//! PowerShell execution engine for Hyper-V cmdlets.
//!
//! Wraps `tokio::process::Command` to invoke Windows PowerShell with a
//! restricted, non-interactive profile. Scripts travel as `-EncodedCommand`
//! so no shell quoting applies to the command line itself; the only quoting
//! that matters is PowerShell's single-quoted string literal, handled by
//! [`PsScripts::quote`]. Failure classification happens here and nowhere
//! else.

use crate::error::{HyperVError, HyperVResult};
use crate::rows::{parse_rows, RowView};
use crate::types::HyperVConfig;
use async_trait::async_trait;
use base64::Engine;
use log::{debug, trace};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Time a child gets to exit after a graceful termination request.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Result of a PowerShell invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PsOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl PsOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// Whether the command completed successfully (exit 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The most useful diagnostic text: stderr, else stdout, else the code.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        format!("PowerShell exited with code {}", self.exit_code)
    }
}

// ─── Classification ──────────────────────────────────────────────────

/// Lower-case phrases that identify an authorization failure.
const PERMISSION_PHRASES: &[&str] = &[
    "access is denied",
    "access denied",
    "unauthorizedaccess",
    "authorization policy",
    "required permission",
    "not authorized",
    "hyper-v administrators",
    "virtualizationauthorization",
    "zugriff verweigert",
];

/// Turn a non-zero exit into a typed error.
pub fn classify_failure(output: &PsOutput) -> HyperVError {
    let diagnostic = output.diagnostic();
    let haystack = format!("{}\n{}", output.stderr, output.stdout).to_lowercase();

    if PERMISSION_PHRASES.iter().any(|p| haystack.contains(p)) {
        return HyperVError::permission_denied(diagnostic);
    }
    if haystack.contains("is not recognized as") && haystack.contains("-vm") {
        let mut err = HyperVError::module_not_available();
        err.details = Some(diagnostic);
        return err;
    }
    HyperVError::command_failed(diagnostic)
}

/// Pass successful output through, classify anything else.
pub fn ensure_success(output: PsOutput) -> HyperVResult<PsOutput> {
    if output.success() {
        Ok(output)
    } else {
        Err(classify_failure(&output))
    }
}

// ─── Runner seam ─────────────────────────────────────────────────────

/// Receives every stdout line of a streaming run; returns `true` when the
/// line was consumed (it is then left out of the accumulated stdout).
pub type LineSink<'a> = dyn FnMut(&str) -> bool + Send + 'a;

/// Something that can run a PowerShell script out-of-process.
///
/// [`PsExecutor`] is the production implementation; tests substitute a
/// scripted fake. Only `run` is required.
#[async_trait]
pub trait PsRunner: Send + Sync {
    /// Run a script and return its raw output, whatever the exit code.
    async fn run(&self, script: &str, cancel: &CancellationToken) -> HyperVResult<PsOutput>;

    /// Run a script, offering each stdout line to `on_line` as it arrives.
    async fn run_streaming(
        &self,
        script: &str,
        cancel: &CancellationToken,
        on_line: &mut LineSink<'_>,
    ) -> HyperVResult<PsOutput> {
        let mut output = self.run(script, cancel).await?;
        let mut kept = String::new();
        for line in output.stdout.lines() {
            if !on_line(line) {
                kept.push_str(line);
                kept.push('\n');
            }
        }
        output.stdout = kept;
        Ok(output)
    }

    /// Run and assert success, classifying failures.
    async fn run_ok(&self, script: &str, cancel: &CancellationToken) -> HyperVResult<PsOutput> {
        ensure_success(self.run(script, cancel).await?)
    }

    /// Run and decode the JSON output into rows.
    async fn run_rows(
        &self,
        script: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<Vec<RowView>> {
        let output = self.run_ok(script, cancel).await?;
        parse_rows(&output.stdout)
    }

    /// Run a script that produces no output; just assert success.
    async fn run_void(&self, script: &str, cancel: &CancellationToken) -> HyperVResult<()> {
        self.run_ok(script, cancel).await?;
        Ok(())
    }

    /// Check whether the Hyper-V module is available.
    async fn check_module(&self, cancel: &CancellationToken) -> HyperVResult<bool> {
        let rows = self
            .run_rows(
                "@(Get-Module -ListAvailable -Name Hyper-V | Select-Object -First 1 Name) | ConvertTo-Json -Compress",
                cancel,
            )
            .await?;
        Ok(rows.iter().any(|r| !r.string("Name").is_empty()))
    }
}

// ─── Executor ────────────────────────────────────────────────────────

/// PowerShell executor for Hyper-V management.
#[derive(Debug, Clone)]
pub struct PsExecutor {
    config: HyperVConfig,
}

impl PsExecutor {
    /// Create a new executor from configuration.
    pub fn new(config: &HyperVConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn config(&self) -> &HyperVConfig {
        &self.config
    }

    /// Prepend the UTF-8 / error-handling preamble to a script body.
    fn wrap_script(body: &str) -> String {
        format!(
            "$ErrorActionPreference = 'Stop'; $ProgressPreference = 'SilentlyContinue'; \
             [Console]::OutputEncoding = [System.Text.Encoding]::UTF8; \
             [Console]::InputEncoding = [System.Text.Encoding]::UTF8; \
             $OutputEncoding = [System.Text.Encoding]::UTF8; {}",
            body
        )
    }

    fn build_command(&self, script: &str) -> Command {
        let full_script = Self::wrap_script(script);
        debug!(
            "HyperV PS exec ({} chars): {}",
            full_script.len(),
            truncate(script, 200)
        );
        let encoded = encode_command(&full_script);
        let mut cmd = Command::new(&self.config.powershell_path);
        cmd.args([
            "-NoLogo",
            "-NoProfile",
            "-NonInteractive",
            "-ExecutionPolicy",
            "Bypass",
            "-OutputFormat",
            "Text",
            "-EncodedCommand",
            encoded.as_str(),
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(0x0800_0000); // CREATE_NO_WINDOW
        cmd
    }

    async fn execute(
        &self,
        script: &str,
        cancel: &CancellationToken,
        sink: Option<&mut LineSink<'_>>,
    ) -> HyperVResult<PsOutput> {
        if cancel.is_cancelled() {
            return Err(HyperVError::cancelled());
        }

        let mut child = self.build_command(script).spawn().map_err(|e| {
            HyperVError::process("Failed to spawn PowerShell process", e.to_string())
        })?;
        let pid = child.id();

        let outcome = tokio::select! {
            res = collect_output(&mut child, sink) => Some(res),
            _ = cancel.cancelled() => None,
        };

        match outcome {
            Some(Ok(output)) => {
                trace!(
                    "PS stdout ({} bytes): {}",
                    output.stdout.len(),
                    truncate(&output.stdout, 300)
                );
                if !output.stderr.trim().is_empty() {
                    debug!(
                        "PS stderr (exit {}): {}",
                        output.exit_code,
                        truncate(&output.stderr, 500)
                    );
                }
                Ok(output)
            }
            Some(Err(e)) => Err(HyperVError::process(
                "PowerShell process failed",
                e.to_string(),
            )),
            None => {
                debug!("Cancellation requested, terminating PowerShell (pid {:?})", pid);
                terminate_process_tree(&mut child, pid).await;
                Err(HyperVError::cancelled())
            }
        }
    }
}

#[async_trait]
impl PsRunner for PsExecutor {
    async fn run(&self, script: &str, cancel: &CancellationToken) -> HyperVResult<PsOutput> {
        self.execute(script, cancel, None).await
    }

    async fn run_streaming(
        &self,
        script: &str,
        cancel: &CancellationToken,
        on_line: &mut LineSink<'_>,
    ) -> HyperVResult<PsOutput> {
        self.execute(script, cancel, Some(on_line)).await
    }
}

/// `-EncodedCommand` expects base64 over UTF-16LE.
fn encode_command(script: &str) -> String {
    let bytes: Vec<u8> = script.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

async fn collect_output(
    child: &mut Child,
    mut sink: Option<&mut LineSink<'_>>,
) -> std::io::Result<PsOutput> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let read_stdout = async {
        let mut kept = String::new();
        if let Some(out) = stdout {
            let mut reader = BufReader::new(out);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                if reader.read_until(b'\n', &mut buf).await? == 0 {
                    break;
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                let consumed = match sink.as_mut() {
                    Some(on_line) => (*on_line)(line),
                    None => false,
                };
                if !consumed {
                    kept.push_str(line);
                    kept.push('\n');
                }
            }
        }
        Ok::<_, std::io::Error>(kept)
    };

    let read_stderr = async {
        let mut bytes = Vec::new();
        if let Some(mut err) = stderr {
            err.read_to_end(&mut bytes).await?;
        }
        Ok::<_, std::io::Error>(String::from_utf8_lossy(&bytes).into_owned())
    };

    let (stdout, stderr) = tokio::try_join!(read_stdout, read_stderr)?;
    let status = child.wait().await?;

    Ok(PsOutput {
        stdout,
        stderr,
        exit_code: status.code().unwrap_or(-1),
    })
}

/// Ask the process tree to exit, then force it.
async fn terminate_process_tree(child: &mut Child, pid: Option<u32>) {
    #[cfg(windows)]
    if let Some(pid) = pid {
        run_taskkill(pid, false).await;
        if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
            return;
        }
        run_taskkill(pid, true).await;
    }
    #[cfg(not(windows))]
    let _ = pid;

    if let Err(e) = child.start_kill() {
        debug!("start_kill after cancellation: {}", e);
    }
    let _ = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await;
}

#[cfg(windows)]
async fn run_taskkill(pid: u32, force: bool) {
    let pid = pid.to_string();
    let mut args = vec!["/PID", pid.as_str(), "/T"];
    if force {
        args.push("/F");
    }
    let result = Command::new("taskkill")
        .args(&args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(0x0800_0000)
        .status()
        .await;
    if let Err(e) = result {
        debug!("taskkill {:?} failed: {}", args, e);
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

// ─── Script Builders ─────────────────────────────────────────────────

/// Utility functions that build common PowerShell script fragments.
///
/// Every value interpolated into a script goes through [`PsScripts::quote`].
pub struct PsScripts;

impl PsScripts {
    /// Escape a string value for embedding inside single-quoted PS strings.
    pub fn escape(s: &str) -> String {
        s.replace('\'', "''")
    }

    /// Escape and wrap in single quotes.
    pub fn quote(s: &str) -> String {
        format!("'{}'", Self::escape(s))
    }

    /// Build a ConvertTo-Json suffix with appropriate depth.
    pub fn to_json(depth: u32) -> String {
        format!("| ConvertTo-Json -Depth {} -Compress", depth)
    }

    /// Wrap value in @() to ensure array output from PS.
    pub fn ensure_array(expr: &str) -> String {
        format!("@({})", expr)
    }
}
