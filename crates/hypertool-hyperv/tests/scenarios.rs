mod common;

use common::{Reply, ScriptedRunner};
use hypertool_hyperv::types::{NoProgress, VmState};
use hypertool_hyperv::{CancellationToken, HyperVErrorKind};
use std::fs;
use std::sync::Mutex;

const DISK_OK: &str =
    r#"{"VhdBytes":1000,"FileBytes":900,"AvailableBytes":5000000000,"TargetDrive":"D:\\"}"#;

fn token() -> CancellationToken {
    CancellationToken::new()
}

// ─── Executor classification ─────────────────────────────────────────

#[tokio::test]
async fn test_access_denied_surfaces_as_permission_denied() {
    let (_runner, service) = ScriptedRunner::new()
        .on("Get-VM", vec![Reply::fail("Access is denied")])
        .into_service();
    let err = service.list_vms(&token()).await.unwrap_err();
    assert_eq!(err.kind, HyperVErrorKind::PermissionDenied);
    assert!(err.message.contains("Hyper-V Administrators"));
}

#[tokio::test]
async fn test_list_vms_keeps_host_order() {
    let (_runner, service) = ScriptedRunner::new()
        .on(
            "Get-VM",
            vec![Reply::ok(
                r#"[{"Name":"c","State":"Off"},{"Name":"a","State":"Running"},{"Name":"b","State":"Saved"}]"#,
            )],
        )
        .into_service();
    let vms = service.list_vms(&token()).await.unwrap();
    let names: Vec<&str> = vms.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec!["c", "a", "b"]);
    assert_eq!(vms[2].state, VmState::Saved);
}

#[tokio::test]
async fn test_cancelled_token_short_circuits() {
    let (runner, service) = ScriptedRunner::new().into_service();
    let cancel = token();
    cancel.cancel();
    let err = service.start_vm("VM1", &cancel).await.unwrap_err();
    assert_eq!(err.kind, HyperVErrorKind::Cancelled);
    assert!(runner.scripts().is_empty());
}

// ─── Networking ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_single_quotes_are_doubled_in_commands() {
    let (runner, service) = ScriptedRunner::new().into_service();
    service
        .connect_adapter("O'Brien's VM", "Bob's Switch", None, &token())
        .await
        .unwrap();
    let scripts = runner.scripts();
    assert_eq!(
        scripts[0],
        "Connect-VMNetworkAdapter -VMName 'O''Brien''s VM' -SwitchName 'Bob''s Switch'"
    );
}

#[tokio::test]
async fn test_disconnect_twice_succeeds() {
    let (runner, service) = ScriptedRunner::new()
        .on("Disconnect-VMNetworkAdapter", vec![Reply::ok("")])
        .into_service();
    service
        .disconnect_adapter("VM1", Some("LAN"), &token())
        .await
        .unwrap();
    service
        .disconnect_adapter("VM1", Some("LAN"), &token())
        .await
        .unwrap();
    assert_eq!(runner.count("Disconnect-VMNetworkAdapter -VMName 'VM1' -Name 'LAN'"), 2);
}

#[tokio::test]
async fn test_rename_adapter_rejects_blank_names() {
    let (runner, service) = ScriptedRunner::new().into_service();
    let err = service
        .rename_adapter("VM1", "LAN", "  ", &token())
        .await
        .unwrap_err();
    assert_eq!(err.kind, HyperVErrorKind::InvalidArgument);
    assert!(runner.scripts().is_empty());
}

#[tokio::test]
async fn test_default_switch_adapter_is_appended() {
    let (runner, service) = ScriptedRunner::new()
        .on(
            "Get-NetIPConfiguration",
            vec![Reply::ok(
                r#"[{"AdapterName":"Ethernet","Status":"Up","IpAddresses":["192.168.1.20"],"PrefixLengths":[24],"Gateway":"192.168.1.1"},
                    {"AdapterName":"Bluetooth","Status":"Disconnected","Gateway":null}]"#,
            )],
        )
        .on(
            "Get-NetAdapter -Name 'vEthernet (Default Switch)'",
            vec![Reply::ok(
                r#"{"AdapterName":"vEthernet (Default Switch)","IpAddresses":"172.20.16.1","PrefixLengths":20}"#,
            )],
        )
        .into_service();
    let adapters = service
        .list_host_network_adapters_with_uplink(&token())
        .await
        .unwrap();
    assert_eq!(adapters.len(), 2);
    assert_eq!(adapters[0].subnets, "255.255.255.0");
    assert!(adapters[1].is_default_switch);
    assert_eq!(adapters[1].subnets, "255.255.240.0");
    assert_eq!(runner.count("vEthernet (Default Switch)"), 1);
}

// ─── Checkpoints ─────────────────────────────────────────────────────

fn vss_fallback_runner(retry: Reply) -> ScriptedRunner {
    ScriptedRunner::new()
        .on(
            "Checkpoint-VM -Name",
            vec![
                Reply::fail("Production checkpoint could not be created: VSS writer failed"),
                retry,
            ],
        )
        .on(
            "Select-Object @{N='CheckpointType'",
            vec![Reply::ok(r#"{"CheckpointType":"Production"}"#)],
        )
}

#[tokio::test]
async fn test_vss_failure_retries_once_as_standard() {
    let (runner, service) = vss_fallback_runner(Reply::ok("")).into_service();
    service
        .create_checkpoint("VM1", "cp1", None, &token())
        .await
        .unwrap();

    let scripts = runner.scripts();
    assert_eq!(runner.count("Checkpoint-VM -Name 'VM1' -SnapshotName 'cp1'"), 2);
    let set_standard = scripts
        .iter()
        .position(|s| s.contains("Set-VM -Name 'VM1' -CheckpointType 'Standard'"))
        .unwrap();
    let retry = scripts
        .iter()
        .rposition(|s| s.contains("Checkpoint-VM"))
        .unwrap();
    assert!(set_standard < retry);
    assert!(scripts
        .last()
        .unwrap()
        .contains("Set-VM -Name 'VM1' -CheckpointType 'Production'"));
}

#[tokio::test]
async fn test_failed_retry_still_restores_type() {
    let (runner, service) =
        vss_fallback_runner(Reply::fail("The disk is full")).into_service();
    let err = service
        .create_checkpoint("VM1", "cp1", None, &token())
        .await
        .unwrap_err();
    assert_eq!(err.kind, HyperVErrorKind::CommandFailed);
    assert_eq!(err.message, "The disk is full");
    assert_eq!(runner.count("Checkpoint-VM"), 2);
    assert!(runner
        .scripts()
        .last()
        .unwrap()
        .contains("-CheckpointType 'Production'"));
}

#[tokio::test]
async fn test_non_vss_failure_is_not_retried() {
    let (runner, service) = ScriptedRunner::new()
        .on("Checkpoint-VM", vec![Reply::fail("The VM is locked")])
        .into_service();
    let err = service
        .create_checkpoint("VM1", "cp1", Some("before update"), &token())
        .await
        .unwrap_err();
    assert_eq!(err.kind, HyperVErrorKind::CommandFailed);
    assert_eq!(runner.count("Checkpoint-VM"), 1);
    assert_eq!(runner.count("Set-VM"), 0);
}

#[tokio::test]
async fn test_cancelled_standard_switch_still_restores_type() {
    let (runner, service) = vss_fallback_runner(Reply::ok(""))
        .on("-CheckpointType 'Standard'", vec![Reply::Cancelled])
        .into_service();
    let err = service
        .create_checkpoint("VM1", "cp1", None, &token())
        .await
        .unwrap_err();
    assert_eq!(err.kind, HyperVErrorKind::Cancelled);
    assert_eq!(runner.count("Checkpoint-VM"), 1);
    assert!(runner
        .scripts()
        .last()
        .unwrap()
        .contains("Set-VM -Name 'VM1' -CheckpointType 'Production'"));
}

#[tokio::test]
async fn test_failed_standard_switch_returns_switch_error() {
    let (runner, service) = vss_fallback_runner(Reply::ok(""))
        .on(
            "-CheckpointType 'Standard'",
            vec![Reply::fail("The virtual machine is in an invalid state")],
        )
        .into_service();
    let err = service
        .create_checkpoint("VM1", "cp1", None, &token())
        .await
        .unwrap_err();
    assert_eq!(err.kind, HyperVErrorKind::CommandFailed);
    assert_eq!(err.message, "The virtual machine is in an invalid state");
    assert_eq!(runner.count("Checkpoint-VM"), 1);
    assert!(runner
        .scripts()
        .last()
        .unwrap()
        .contains("-CheckpointType 'Production'"));
}

fn standard_configured_runner(checkpoint: Vec<Reply>) -> ScriptedRunner {
    ScriptedRunner::new()
        .on("Checkpoint-VM -Name", checkpoint)
        .on(
            "Select-Object @{N='CheckpointType'",
            vec![Reply::ok(r#"{"CheckpointType":"Standard"}"#)],
        )
}

#[tokio::test]
async fn test_standard_configured_vm_tries_production_first() {
    let (runner, service) = standard_configured_runner(vec![Reply::ok("")]).into_service();
    service
        .create_checkpoint("VM1", "cp1", None, &token())
        .await
        .unwrap();

    let scripts = runner.scripts();
    let to_production = scripts
        .iter()
        .position(|s| s.contains("Set-VM -Name 'VM1' -CheckpointType 'Production'"))
        .unwrap();
    let attempt = scripts
        .iter()
        .position(|s| s.contains("Checkpoint-VM -Name 'VM1' -SnapshotName 'cp1'"))
        .unwrap();
    assert!(to_production < attempt);
    assert_eq!(runner.count("Checkpoint-VM"), 1);
    assert!(scripts
        .last()
        .unwrap()
        .contains("Set-VM -Name 'VM1' -CheckpointType 'Standard'"));
}

#[tokio::test]
async fn test_standard_configured_vm_falls_back_and_keeps_standard() {
    let (runner, service) = standard_configured_runner(vec![
        Reply::fail("Production checkpoint could not be created: VSS writer failed"),
        Reply::ok(""),
    ])
    .into_service();
    service
        .create_checkpoint("VM1", "cp1", None, &token())
        .await
        .unwrap();

    assert_eq!(runner.count("Checkpoint-VM"), 2);
    assert_eq!(runner.count("-CheckpointType 'Production'"), 1);
    // The standard retry plus the final restore.
    assert_eq!(runner.count("-CheckpointType 'Standard'"), 2);
    assert!(runner
        .scripts()
        .last()
        .unwrap()
        .contains("-CheckpointType 'Standard'"));
}

#[tokio::test]
async fn test_cancelled_production_switch_restores_standard() {
    let (runner, service) = standard_configured_runner(vec![Reply::ok("")])
        .on("-CheckpointType 'Production'", vec![Reply::Cancelled])
        .into_service();
    let err = service
        .create_checkpoint("VM1", "cp1", None, &token())
        .await
        .unwrap_err();
    assert_eq!(err.kind, HyperVErrorKind::Cancelled);
    assert_eq!(runner.count("Checkpoint-VM"), 0);
    assert!(runner
        .scripts()
        .last()
        .unwrap()
        .contains("Set-VM -Name 'VM1' -CheckpointType 'Standard'"));
}

const CHECKPOINTS: &str = r#"[
    {"Id":"id-1","ParentCheckpointId":null,"Name":"Base","CreationTime":"2024-03-01T10:00:00Z","CheckpointType":"Standard","CurrentCheckpointId":"id-2"},
    {"Id":"id-2","ParentCheckpointId":"id-1","Name":"Patched","CreationTime":"2024-03-02T10:00:00Z","CheckpointType":"Production","CurrentCheckpointId":"id-2"}
]"#;

#[tokio::test]
async fn test_apply_targets_resolved_id() {
    let (runner, service) = ScriptedRunner::new()
        .on("Get-VMCheckpoint -VM $vm", vec![Reply::ok(CHECKPOINTS)])
        .into_service();
    service
        .apply_checkpoint("VM1", "patched", None, &token())
        .await
        .unwrap();
    let scripts = runner.scripts();
    assert_eq!(scripts.len(), 2);
    assert!(scripts[1].contains("$_.Id.ToString() -eq 'id-2'"));
    assert!(scripts[1].contains("Restore-VMCheckpoint"));
}

#[tokio::test]
async fn test_remove_unknown_checkpoint_is_not_found() {
    let (runner, service) = ScriptedRunner::new()
        .on("Get-VMCheckpoint -VM $vm", vec![Reply::ok(CHECKPOINTS)])
        .into_service();
    let err = service
        .remove_checkpoint("VM1", "Gone", None, &token())
        .await
        .unwrap_err();
    assert_eq!(err.kind, HyperVErrorKind::NotFound);
    assert_eq!(err.message, "Checkpoint 'Gone' not found on VM 'VM1'");
    assert_eq!(runner.count("Remove-VMCheckpoint"), 0);
}

#[tokio::test]
async fn test_checkpoint_tree_from_host_list() {
    let (_runner, service) = ScriptedRunner::new()
        .on("Get-VMCheckpoint -VM $vm", vec![Reply::ok(CHECKPOINTS)])
        .into_service();
    let tree = service.checkpoint_tree("VM1", &token()).await.unwrap();
    assert_eq!(tree.len(), 1);
    assert_eq!(tree[0].checkpoint.name, "Base");
    let child = &tree[0].children[0];
    assert_eq!(child.checkpoint.name, "Patched");
    assert!(child.is_current());
    assert!(child.is_latest);
}

// ─── Export / Import ─────────────────────────────────────────────────

#[tokio::test]
async fn test_disk_space_shortfall_is_reported() {
    let (_runner, service) = ScriptedRunner::new()
        .on(
            "DriveInfo",
            vec![Reply::ok(
                r#"{"VhdBytes":5000000000,"FileBytes":4000000000,"AvailableBytes":1000000000,"TargetDrive":"D:\\"}"#,
            )],
        )
        .into_service();
    let result = service
        .check_disk_space("VM1", "D:\\backup", &token())
        .await
        .unwrap();
    assert!(!result.has_enough_space);
    assert_eq!(result.required_bytes, 5_000_000_000);
    assert_eq!(result.available_bytes, 1_000_000_000);
    assert_eq!(result.target_drive, "D:\\");
}

#[tokio::test]
async fn test_disk_space_falls_back_to_file_sizes_and_path_root() {
    let (_runner, service) = ScriptedRunner::new()
        .on(
            "DriveInfo",
            vec![Reply::ok(r#"{"VhdBytes":0,"FileBytes":0,"AvailableBytes":0}"#)],
        )
        .into_service();
    let result = service
        .check_disk_space("VM1", "e:\\exports", &token())
        .await
        .unwrap();
    assert_eq!(result.required_bytes, 1);
    assert!(!result.has_enough_space);
    assert_eq!(result.target_drive, "E:\\");
}

#[tokio::test]
async fn test_export_refuses_without_space() {
    let (runner, service) = ScriptedRunner::new()
        .on(
            "DriveInfo",
            vec![Reply::ok(
                r#"{"VhdBytes":5000000000,"AvailableBytes":1000000000,"TargetDrive":"D:\\"}"#,
            )],
        )
        .into_service();
    let err = service
        .export_vm("VM1", "D:\\backup", &NoProgress, &token())
        .await
        .unwrap_err();
    assert_eq!(err.kind, HyperVErrorKind::InsufficientDiskSpace);
    assert_eq!(runner.count("Export-VM"), 0);
}

#[tokio::test]
async fn test_export_progress_is_deduplicated() {
    let (runner, service) = ScriptedRunner::new()
        .on("DriveInfo", vec![Reply::ok(DISK_OK)])
        .on(
            "Export-VM",
            vec![Reply::ok(
                "##HT-STATE:Running\n##HT-PROGRESS:0\n##HT-PROGRESS:10\n##HT-STATE:Running\n##HT-PROGRESS:10\n##HT-PROGRESS:55\n##HT-PROGRESS:100\n##HT-STATE:Completed\n",
            )],
        )
        .into_service();
    let seen = Mutex::new(Vec::new());
    let observer = |p: u8| seen.lock().unwrap().push(p);
    service
        .export_vm("VM1", "D:\\backup", &observer, &token())
        .await
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![0, 10, 55, 100]);
    let export = runner
        .scripts()
        .into_iter()
        .find(|s| s.contains("Export-VM"))
        .unwrap();
    assert!(export.contains("Export-VM -Name 'VM1' -Path $dest -AsJob"));
    assert!(export.contains("Start-Sleep -Milliseconds 500"));
}

#[tokio::test]
async fn test_export_failure_carries_host_reason() {
    let (_runner, service) = ScriptedRunner::new()
        .on("DriveInfo", vec![Reply::ok(DISK_OK)])
        .on(
            "Export-VM",
            vec![Reply::Output(hypertool_hyperv::powershell::PsOutput {
                stdout: "##HT-STATE:Running\n##HT-PROGRESS:20\n##HT-STATE:Failed\n".into(),
                stderr: "The export destination is not accessible.".into(),
                exit_code: 1,
            })],
        )
        .into_service();
    let seen = Mutex::new(Vec::new());
    let observer = |p: u8| seen.lock().unwrap().push(p);
    let err = service
        .export_vm("VM1", "D:\\backup", &observer, &token())
        .await
        .unwrap_err();
    assert_eq!(err.kind, HyperVErrorKind::CommandFailed);
    assert_eq!(err.message, "The export destination is not accessible.");
    assert_eq!(*seen.lock().unwrap(), vec![20]);
}

#[tokio::test]
async fn test_cancelled_export_requests_job_termination() {
    let (runner, service) = ScriptedRunner::new()
        .on("DriveInfo", vec![Reply::ok(DISK_OK)])
        .on("Export-VM", vec![Reply::Cancelled])
        .into_service();
    let err = service
        .export_vm("VM1", "D:\\backup", &NoProgress, &token())
        .await
        .unwrap_err();
    assert_eq!(err.kind, HyperVErrorKind::Cancelled);
    assert_eq!(runner.count("Msvm_ConcreteJob"), 1);
    let cleanup = runner
        .scripts()
        .into_iter()
        .find(|s| s.contains("Msvm_ConcreteJob"))
        .unwrap();
    assert!(cleanup.contains("$target = 'VM1'"));
}

fn import_fixture() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let vms = dir.path().join("WebServer").join("Virtual Machines");
    fs::create_dir_all(&vms).unwrap();
    fs::write(vms.join("5D1E0C5A.vmcx"), "cfg").unwrap();
    dir
}

const IMPORT_STREAM: &str = "##HT-STATE:Running\n##HT-PROGRESS:50\n##HT-STATE:Completed\n##HT-RESULT:{\"Name\":\"WebServer\",\"Id\":\"1111-2222\"}\n";

#[tokio::test]
async fn test_import_conflict_renames_by_id() {
    let fixture = import_fixture();
    let (runner, service) = ScriptedRunner::new()
        .on(
            "Select-Object Name)",
            vec![
                Reply::ok(r#"[{"Name":"WebServer"},{"Name":"DB"}]"#),
                Reply::ok(r#"[{"Name":"WebServer"},{"Name":"WebServer"},{"Name":"DB"}]"#),
            ],
        )
        .on("Import-VM", vec![Reply::ok(IMPORT_STREAM)])
        .into_service();
    let seen = Mutex::new(Vec::new());
    let observer = |p: u8| seen.lock().unwrap().push(p);
    let result = service
        .import_vm(
            fixture.path().to_str().unwrap(),
            "D:\\Hyper-V",
            &observer,
            &token(),
        )
        .await
        .unwrap();

    assert!(result.renamed_due_to_conflict);
    assert_eq!(result.original_name, "WebServer");
    assert_eq!(result.vm_name, "WebServer-import");
    assert_eq!(*seen.lock().unwrap(), vec![50, 100]);
    assert_eq!(runner.count("Get-VM -Id '1111-2222' | Rename-VM -NewName 'WebServer-import'"), 1);
    let import = runner
        .scripts()
        .into_iter()
        .find(|s| s.contains("Import-VM"))
        .unwrap();
    assert!(import.contains("5D1E0C5A.vmcx"));
    assert!(import.contains("-Copy -GenerateNewId"));
}

#[tokio::test]
async fn test_import_picks_next_free_suffix() {
    let fixture = import_fixture();
    let (runner, service) = ScriptedRunner::new()
        .on(
            "Select-Object Name)",
            vec![Reply::ok(
                r#"[{"Name":"WebServer"},{"Name":"webserver-import"},{"Name":"WebServer"}]"#,
            )],
        )
        .on("Import-VM", vec![Reply::ok(IMPORT_STREAM)])
        .into_service();
    let result = service
        .import_vm(
            fixture.path().to_str().unwrap(),
            "D:\\Hyper-V",
            &NoProgress,
            &token(),
        )
        .await
        .unwrap();
    assert_eq!(result.vm_name, "WebServer-import-2");
    assert_eq!(runner.count("Rename-VM"), 1);
}

#[tokio::test]
async fn test_import_without_conflict_keeps_name() {
    let fixture = import_fixture();
    let (runner, service) = ScriptedRunner::new()
        .on("Select-Object Name)", vec![Reply::ok(r#"[{"Name":"DB"}]"#)])
        .on("Import-VM", vec![Reply::ok(IMPORT_STREAM)])
        .into_service();
    let result = service
        .import_vm(
            fixture.path().to_str().unwrap(),
            "D:\\Hyper-V",
            &NoProgress,
            &token(),
        )
        .await
        .unwrap();
    assert!(!result.renamed_due_to_conflict);
    assert_eq!(result.vm_name, "WebServer");
    assert_eq!(runner.count("Rename-VM"), 0);
}

#[tokio::test]
async fn test_cancelled_import_terminates_jobs_of_announced_vm() {
    let fixture = import_fixture();
    let (runner, service) = ScriptedRunner::new()
        .on("Select-Object Name)", vec![Reply::ok(r#"[{"Name":"DB"}]"#)])
        .on(
            "Import-VM",
            vec![Reply::CancelledAfter(
                "##HT-TARGET:WebServer\n##HT-STATE:Running\n##HT-PROGRESS:10\n".into(),
            )],
        )
        .into_service();
    let err = service
        .import_vm(
            fixture.path().to_str().unwrap(),
            "D:\\Hyper-V",
            &NoProgress,
            &token(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, HyperVErrorKind::Cancelled);
    assert_eq!(runner.count("Msvm_ConcreteJob"), 1);
    assert_eq!(runner.count("$target = 'WebServer'"), 1);
    assert_eq!(runner.count("Rename-VM"), 0);
}

#[tokio::test]
async fn test_import_cancelled_before_start_leaves_other_jobs_alone() {
    let fixture = import_fixture();
    let (runner, service) = ScriptedRunner::new()
        .on("Import-VM", vec![Reply::Cancelled])
        .into_service();
    let err = service
        .import_vm(
            fixture.path().to_str().unwrap(),
            "D:\\Hyper-V",
            &NoProgress,
            &token(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, HyperVErrorKind::Cancelled);
    assert_eq!(runner.count("Msvm_ConcreteJob"), 0);
}

// ─── Elevation ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_declined_uac_prompt_is_not_a_failure() {
    let (_runner, service) = ScriptedRunner::new()
        .on(
            "Start-Process",
            vec![Reply::fail("This command cannot be run due to the error: The operation was canceled by the user.")],
        )
        .into_service();
    let outcome = service
        .restart_hns_with(std::path::Path::new("C:\\HyperTool\\hypertool.exe"), &token())
        .await
        .unwrap();
    assert!(!outcome.success);
    assert!(outcome.message.contains("declined"));
}
