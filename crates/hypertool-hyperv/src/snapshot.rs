//! Hyper-V checkpoint (snapshot) management: list, create with the
//! production-to-standard fallback, apply, remove, and the derived tree.

use crate::error::{require_name, HyperVError, HyperVErrorKind, HyperVResult};
use crate::powershell::{PsRunner, PsScripts};
use crate::rows::RowView;
use crate::types::*;
use chrono::Local;
use log::{error, info, warn};
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Lower-case fragments of a failed production (VSS-backed) checkpoint.
const PRODUCTION_FAILURE_SIGNATURES: &[&str] = &[
    "vss",
    "volume shadow",
    "production checkpoint",
    "produktionsprüfpunkt",
    "produktionsprufpunkt",
];

/// Manager for Hyper-V checkpoint (snapshot) operations.
pub struct SnapshotManager;

impl SnapshotManager {
    // ── List / Query ─────────────────────────────────────────────────

    /// List all checkpoints for a VM, flagging the one the VM runs from.
    pub async fn list_checkpoints(
        ps: &dyn PsRunner,
        vm_name: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<Vec<CheckpointInfo>> {
        require_name(vm_name, "VM name")?;
        let script = format!(
            r#"
$vm = Get-VM -Name {vm}
$current = if ($vm.ParentCheckpointId) {{ $vm.ParentCheckpointId.ToString() }} else {{ '' }}
@(Get-VMCheckpoint -VM $vm -ErrorAction SilentlyContinue | ForEach-Object {{
    [PSCustomObject]@{{
        Id                  = $_.Id.ToString()
        ParentCheckpointId  = if ($_.ParentSnapshotId) {{ $_.ParentSnapshotId.ToString() }} else {{ $null }}
        Name                = $_.Name
        CreationTime        = $_.CreationTime.ToUniversalTime().ToString('o')
        CheckpointType      = $_.SnapshotType.ToString()
        CurrentCheckpointId = $current
    }}
}}) {json}
"#,
            vm = PsScripts::quote(vm_name),
            json = PsScripts::to_json(3)
        );
        let rows = ps.run_rows(&script, cancel).await?;
        Ok(rows.iter().map(checkpoint_from_row).collect())
    }

    /// Checkpoints of a VM arranged as a forest.
    pub async fn checkpoint_tree(
        ps: &dyn PsRunner,
        vm_name: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<Vec<CheckpointTreeNode>> {
        let checkpoints = Self::list_checkpoints(ps, vm_name, cancel).await?;
        Ok(build_checkpoint_tree(&checkpoints))
    }

    // ── Create ───────────────────────────────────────────────────────

    /// Create a checkpoint, attempting a production checkpoint first. A VM
    /// configured for standard checkpoints is switched to production for the
    /// attempt. A production checkpoint that fails in VSS is retried once as
    /// a standard checkpoint. Whenever the type was changed the configured
    /// type is restored afterwards, even on failure or cancellation.
    pub async fn create_checkpoint(
        ps: &dyn PsRunner,
        vm_name: &str,
        checkpoint_name: &str,
        description: Option<&str>,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        require_name(vm_name, "VM name")?;
        require_name(checkpoint_name, "Checkpoint name")?;
        if let Some(d) = description.filter(|d| !d.trim().is_empty()) {
            info!(
                "Checkpoint description is informational only for VM '{}': {}",
                vm_name, d
            );
        }

        let configured = match Self::get_checkpoint_kind(ps, vm_name, cancel).await {
            Ok(kind) => Some(kind),
            Err(e) if e.kind == HyperVErrorKind::ParseError => {
                warn!("Checkpoint type of VM '{}' is unknown: {}", vm_name, e);
                None
            }
            Err(e) => return Err(e),
        };

        info!("Creating checkpoint '{}' on VM '{}'", checkpoint_name, vm_name);
        let mut restore_to = None;
        let created = Self::attempt_checkpoint(
            ps,
            vm_name,
            checkpoint_name,
            configured.as_ref(),
            &mut restore_to,
            cancel,
        )
        .await;

        let Some(original) = restore_to else {
            return created;
        };
        // Own token so a cancelled attempt can't leave the VM on another type.
        let restore =
            Self::set_checkpoint_kind(ps, vm_name, &original, &CancellationToken::new()).await;

        match (created, restore) {
            (Ok(()), Ok(())) => {
                info!(
                    "Checkpoint '{}' created on VM '{}', checkpoint type restored to {}",
                    checkpoint_name,
                    vm_name,
                    original.as_ps()
                );
                Ok(())
            }
            (Ok(()), Err(restore_err)) => Err(restore_err.with_context(format!(
                "Checkpoint created but restoring checkpoint type '{}' on VM '{}' failed",
                original.as_ps(),
                vm_name
            ))),
            (Err(create_err), Ok(())) => Err(create_err),
            (Err(create_err), Err(restore_err)) => {
                error!(
                    "Restoring checkpoint type '{}' on VM '{}' failed: {}",
                    original.as_ps(),
                    vm_name,
                    restore_err
                );
                Err(create_err)
            }
        }
    }

    /// Production attempt plus the standard retry. `restore_to` is filled
    /// before the first type change is requested.
    async fn attempt_checkpoint(
        ps: &dyn PsRunner,
        vm_name: &str,
        checkpoint_name: &str,
        configured: Option<&CheckpointKind>,
        restore_to: &mut Option<CheckpointKind>,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        if let Some(kind) = configured.filter(|k| needs_production_switch(k)) {
            *restore_to = Some(kind.clone());
            Self::set_checkpoint_kind(ps, vm_name, &CheckpointKind::Production, cancel).await?;
        }

        match Self::checkpoint_vm(ps, vm_name, checkpoint_name, cancel).await {
            Ok(()) => Ok(()),
            Err(e) if is_production_checkpoint_failure(&e) => {
                warn!(
                    "Production checkpoint of VM '{}' failed, retrying as standard checkpoint: {}",
                    vm_name, e
                );
                if restore_to.is_none() {
                    let original = match configured {
                        Some(kind) => kind.clone(),
                        None => Self::get_checkpoint_kind(ps, vm_name, cancel).await?,
                    };
                    *restore_to = Some(original);
                }
                Self::set_checkpoint_kind(ps, vm_name, &CheckpointKind::Standard, cancel).await?;
                Self::checkpoint_vm(ps, vm_name, checkpoint_name, cancel).await
            }
            Err(e) => Err(e),
        }
    }

    async fn checkpoint_vm(
        ps: &dyn PsRunner,
        vm_name: &str,
        checkpoint_name: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        ps.run_void(
            &format!(
                "Checkpoint-VM -Name {} -SnapshotName {} -Confirm:$false",
                PsScripts::quote(vm_name),
                PsScripts::quote(checkpoint_name)
            ),
            cancel,
        )
        .await
    }

    /// The VM's configured checkpoint type.
    pub async fn get_checkpoint_kind(
        ps: &dyn PsRunner,
        vm_name: &str,
        cancel: &CancellationToken,
    ) -> HyperVResult<CheckpointKind> {
        let script = format!(
            "Get-VM -Name {} | Select-Object @{{N='CheckpointType';E={{$_.CheckpointType.ToString()}}}} {}",
            PsScripts::quote(vm_name),
            PsScripts::to_json(2)
        );
        let rows = ps.run_rows(&script, cancel).await?;
        let text = rows
            .first()
            .map(|r| r.string("CheckpointType"))
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                HyperVError::parse(format!(
                    "Host did not report a checkpoint type for VM '{}'",
                    vm_name
                ))
            })?;
        Ok(CheckpointKind::from_ps_string(&text))
    }

    pub async fn set_checkpoint_kind(
        ps: &dyn PsRunner,
        vm_name: &str,
        kind: &CheckpointKind,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        info!(
            "Setting checkpoint type of VM '{}' to {}",
            vm_name,
            kind.as_ps()
        );
        ps.run_void(
            &format!(
                "Set-VM -Name {} -CheckpointType {}",
                PsScripts::quote(vm_name),
                PsScripts::quote(kind.as_ps())
            ),
            cancel,
        )
        .await
    }

    // ── Restore ──────────────────────────────────────────────────────

    /// Restore (apply) a checkpoint, addressed by id when known.
    pub async fn apply_checkpoint(
        ps: &dyn PsRunner,
        vm_name: &str,
        checkpoint_name: &str,
        checkpoint_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        let target =
            Self::resolve_fresh(ps, vm_name, checkpoint_name, checkpoint_id, cancel).await?;
        info!(
            "Restoring checkpoint '{}' ({}) on VM '{}'",
            target.name, target.id, vm_name
        );
        let script = if target.id.is_empty() {
            format!(
                "Restore-VMCheckpoint -VMName {} -Name {} -Confirm:$false",
                PsScripts::quote(vm_name),
                PsScripts::quote(&target.name)
            )
        } else {
            format!(
                "Get-VMCheckpoint -VMName {} | Where-Object {{ $_.Id.ToString() -eq {} }} | Restore-VMCheckpoint -Confirm:$false",
                PsScripts::quote(vm_name),
                PsScripts::quote(&target.id)
            )
        };
        ps.run_void(&script, cancel).await
    }

    // ── Remove ───────────────────────────────────────────────────────

    /// Remove a single checkpoint, addressed by id when known.
    pub async fn remove_checkpoint(
        ps: &dyn PsRunner,
        vm_name: &str,
        checkpoint_name: &str,
        checkpoint_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> HyperVResult<()> {
        let target =
            Self::resolve_fresh(ps, vm_name, checkpoint_name, checkpoint_id, cancel).await?;
        info!(
            "Removing checkpoint '{}' ({}) from VM '{}'",
            target.name, target.id, vm_name
        );
        let script = if target.id.is_empty() {
            format!(
                "Remove-VMCheckpoint -VMName {} -Name {} -Confirm:$false",
                PsScripts::quote(vm_name),
                PsScripts::quote(&target.name)
            )
        } else {
            format!(
                "Get-VMCheckpoint -VMName {} | Where-Object {{ $_.Id.ToString() -eq {} }} | Remove-VMCheckpoint -Confirm:$false",
                PsScripts::quote(vm_name),
                PsScripts::quote(&target.id)
            )
        };
        ps.run_void(&script, cancel).await
    }

    /// Re-query the host and resolve the reference against that list.
    async fn resolve_fresh(
        ps: &dyn PsRunner,
        vm_name: &str,
        checkpoint_name: &str,
        checkpoint_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> HyperVResult<CheckpointInfo> {
        require_name(vm_name, "VM name")?;
        let has_id = checkpoint_id.map(|id| !id.trim().is_empty()).unwrap_or(false);
        if !has_id {
            require_name(checkpoint_name, "Checkpoint name")?;
        }
        let checkpoints = Self::list_checkpoints(ps, vm_name, cancel).await?;
        resolve_checkpoint(&checkpoints, checkpoint_name, checkpoint_id)
            .cloned()
            .ok_or_else(|| {
                let reference = if checkpoint_name.trim().is_empty() {
                    checkpoint_id.unwrap_or_default()
                } else {
                    checkpoint_name
                };
                HyperVError::checkpoint_not_found(vm_name, reference)
            })
    }
}

fn checkpoint_from_row(row: &RowView) -> CheckpointInfo {
    let id = row.string("Id");
    let current_id = row.string("CurrentCheckpointId");
    let is_current =
        row.bool("IsCurrent") || (!id.is_empty() && id.eq_ignore_ascii_case(&current_id));
    CheckpointInfo {
        is_current,
        parent_id: row.opt_string("ParentCheckpointId"),
        name: row.string("Name"),
        created: row.datetime("CreationTime"),
        checkpoint_type: row.string("CheckpointType"),
        id,
    }
}

/// Whether a checkpoint failure looks like a VSS / production failure.
/// Known non-production types are switched for the first attempt; an
/// unrecognised host value is left alone.
fn needs_production_switch(kind: &CheckpointKind) -> bool {
    !kind.is_production() && !matches!(kind, CheckpointKind::Other(_))
}

pub fn is_production_checkpoint_failure(err: &HyperVError) -> bool {
    if err.kind != HyperVErrorKind::CommandFailed {
        return false;
    }
    let text = err.diagnostic_text().to_lowercase();
    PRODUCTION_FAILURE_SIGNATURES.iter().any(|s| text.contains(s))
}

/// Resolve a reference: exact id, then exact name, then name ignoring case.
pub fn resolve_checkpoint<'a>(
    checkpoints: &'a [CheckpointInfo],
    name: &str,
    id: Option<&str>,
) -> Option<&'a CheckpointInfo> {
    if let Some(id) = id.map(str::trim).filter(|id| !id.is_empty()) {
        if let Some(found) = checkpoints.iter().find(|c| c.id == id) {
            return Some(found);
        }
    }
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    checkpoints
        .iter()
        .find(|c| c.name == name)
        .or_else(|| checkpoints.iter().find(|c| c.name.to_lowercase() == name.to_lowercase()))
}

/// Name for a checkpoint created without one, e.g.
/// `checkpoint-20240301-101530`.
pub fn default_checkpoint_name() -> String {
    format!("checkpoint-{}", Local::now().format("%Y%m%d-%H%M%S"))
}

// ─── Tree ────────────────────────────────────────────────────────────

/// Arrange checkpoints into a forest linked by parent id.
///
/// Roots are checkpoints whose parent id is empty, unknown, or their own
/// id. Siblings are ordered by creation time, then name. Checkpoints only
/// reachable through a parent cycle become roots, so every input appears
/// exactly once. With duplicate ids the first occurrence is the one
/// children attach to.
pub fn build_checkpoint_tree(checkpoints: &[CheckpointInfo]) -> Vec<CheckpointTreeNode> {
    let mut by_id: HashMap<&str, usize> = HashMap::new();
    for (i, c) in checkpoints.iter().enumerate() {
        if !c.id.is_empty() {
            by_id.entry(c.id.as_str()).or_insert(i);
        }
    }

    let parent_of = |i: usize| -> Option<usize> {
        let pid = checkpoints[i].parent_id.as_deref()?.trim();
        let p = *by_id.get(pid)?;
        (p != i).then_some(p)
    };

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); checkpoints.len()];
    let mut roots = Vec::new();
    for i in 0..checkpoints.len() {
        match parent_of(i) {
            Some(p) => children[p].push(i),
            None => roots.push(i),
        }
    }

    let latest = checkpoints
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.created.cmp(&b.created))
        .map(|(i, _)| i);

    let order = |a: &usize, b: &usize| sibling_order(&checkpoints[*a], &checkpoints[*b]);
    let mut visited = vec![false; checkpoints.len()];
    let mut forest = Vec::new();

    roots.sort_by(order);
    for r in roots {
        forest.push(build_node(r, checkpoints, &children, &mut visited, latest));
    }

    // Anything left is part of a parent cycle.
    for i in 0..checkpoints.len() {
        if !visited[i] {
            forest.push(build_node(i, checkpoints, &children, &mut visited, latest));
        }
    }
    forest.sort_by(|a, b| sibling_order(&a.checkpoint, &b.checkpoint));
    forest
}

fn build_node(
    index: usize,
    checkpoints: &[CheckpointInfo],
    children: &[Vec<usize>],
    visited: &mut [bool],
    latest: Option<usize>,
) -> CheckpointTreeNode {
    visited[index] = true;
    let mut kids: Vec<usize> = children[index].clone();
    kids.sort_by(|a, b| sibling_order(&checkpoints[*a], &checkpoints[*b]));

    let mut nodes = Vec::with_capacity(kids.len());
    for k in kids {
        if !visited[k] {
            nodes.push(build_node(k, checkpoints, children, visited, latest));
        }
    }
    CheckpointTreeNode {
        checkpoint: checkpoints[index].clone(),
        children: nodes,
        is_latest: latest == Some(index),
    }
}

fn sibling_order(a: &CheckpointInfo, b: &CheckpointInfo) -> Ordering {
    a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name))
}
