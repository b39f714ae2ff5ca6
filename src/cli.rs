use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "hypertool")]
#[command(about = "Control local Hyper-V VMs: lifecycle, networking, checkpoints, export/import", long_about = None)]
#[command(version)]
#[command(after_help = "Started with --restart-hns the program runs as the elevated helper and only restarts the Host Network Service.")]
pub struct Cli {
    /// Configuration file (default: HyperTool.config.json beside the executable, else the user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check that the Hyper-V PowerShell module is installed
    Check,

    /// List VMs on the host
    Vms,

    /// Start a VM
    Start {
        /// VM name (default: the configured default VM)
        vm: Option<String>,
    },

    /// Ask the guest OS to shut down
    Stop { vm: Option<String> },

    /// Cut power immediately
    TurnOff { vm: Option<String> },

    /// Restart a VM
    Restart { vm: Option<String> },

    /// List virtual switches
    Switches,

    /// List the network adapters of a VM
    Adapters { vm: Option<String> },

    /// Connect a VM adapter to a switch
    Connect {
        /// Switch name (default: the configured default switch)
        #[arg(long, short = 's')]
        switch: Option<String>,
        /// Adapter name (default: the VM's configured adapter, else all adapters)
        #[arg(long, short = 'a')]
        adapter: Option<String>,
        /// Skip the automatic HNS restart
        #[arg(long)]
        no_hns_restart: bool,
        vm: Option<String>,
    },

    /// Disconnect a VM adapter
    Disconnect {
        #[arg(long, short = 'a')]
        adapter: Option<String>,
        vm: Option<String>,
    },

    /// Rename a VM network adapter
    RenameAdapter {
        vm: String,
        old_name: String,
        new_name: String,
    },

    /// Show a VM's checkpoints as a tree
    Checkpoints { vm: Option<String> },

    /// Create, apply or remove checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Compare a VM's disk footprint with the free space at a destination
    DiskCheck { vm: String, destination: String },

    /// Export a VM
    Export { vm: String, destination: String },

    /// Import a VM as a copy with a new id
    Import {
        /// Exported VM folder or configuration file (.vmcx / .xml)
        path: String,
        /// Folder receiving the VM's files
        destination: String,
    },

    /// Open a console window
    Console {
        /// Host running the VM (default: the configured console host)
        #[arg(long)]
        host: Option<String>,
        /// Open in session-edit mode
        #[arg(long)]
        session_edit: bool,
        /// Close open consoles of the VM first, then reopen in session-edit mode
        #[arg(long, conflicts_with = "session_edit")]
        reopen: bool,
        vm: Option<String>,
    },

    /// List host adapters with an uplink
    HostNetwork,

    /// Restart the Host Network Service (prompts for elevation)
    RestartHns,
}

#[derive(Debug, Subcommand)]
pub enum CheckpointAction {
    /// Create a checkpoint
    Create {
        /// Checkpoint name (default: checkpoint-<timestamp>)
        #[arg(long, short = 'n')]
        name: Option<String>,
        #[arg(long, short = 'd')]
        description: Option<String>,
        vm: Option<String>,
    },
    /// Restore a checkpoint
    Apply {
        vm: String,
        name: String,
        /// Checkpoint id; preferred over the name when given
        #[arg(long)]
        id: Option<String>,
    },
    /// Delete a checkpoint
    Remove {
        vm: String,
        name: String,
        #[arg(long)]
        id: Option<String>,
    },
}
