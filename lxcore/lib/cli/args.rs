use std::path::PathBuf;

use crate::cli::styles;
use clap::{Parser, Subcommand};

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// `lxcore` manages LXC containers, their backups and their snapshots
#[derive(Debug, Parser)]
#[command(name = "lxcore", author, styles=styles::styles())]
pub struct LxcoreArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<LxcoreSubcommand>,

    /// Enable verbose logging
    #[arg(short = 'V', long, global = true)]
    pub verbose: bool,

    /// Settings file to use instead of the default one
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

/// Available subcommands for managing containers
#[derive(Debug, Subcommand)]
pub enum LxcoreSubcommand {
    /// List all containers
    #[command(name = "list", alias = "ls")]
    List,

    /// Show one container
    #[command(name = "info")]
    Info {
        /// Name of the container
        name: String,
    },

    /// Start a container
    #[command(name = "start")]
    Start {
        /// Name of the container
        name: String,
    },

    /// Stop a container gracefully
    #[command(name = "stop")]
    Stop {
        /// Name of the container
        name: String,
    },

    /// Stop and start a container
    #[command(name = "restart")]
    Restart {
        /// Name of the container
        name: String,
    },

    /// Stop a container forcibly
    #[command(name = "kill")]
    Kill {
        /// Name of the container
        name: String,
    },

    /// Freeze the processes of a container
    #[command(name = "freeze")]
    Freeze {
        /// Name of the container
        name: String,
    },

    /// Thaw a frozen container
    #[command(name = "unfreeze")]
    Unfreeze {
        /// Name of the container
        name: String,
    },

    /// Create a container from a downloaded image
    #[command(name = "create")]
    Create {
        /// Name of the new container
        name: String,

        /// Distribution, e.g. `ubuntu`
        #[arg(short, long)]
        dist: String,

        /// Release, e.g. `noble`
        #[arg(short, long)]
        release: String,

        /// Architecture, defaults to the host's
        #[arg(short, long)]
        arch: Option<String>,

        /// Start the container with the host
        #[arg(long)]
        autostart: bool,

        /// Description
        #[arg(long)]
        description: Option<String>,

        /// Start the container once it is created
        #[arg(short, long)]
        start: bool,

        /// Map the container's ids into the unprivileged range
        #[arg(short, long)]
        unprivileged: bool,
    },

    /// Destroy a container
    #[command(name = "destroy", alias = "rm")]
    Destroy {
        /// Name of the container
        name: String,

        /// Also destroy the container's snapshots
        #[arg(long)]
        remove_disks: bool,
    },

    /// Change the autostart flag, description or web UI hint of a container
    #[command(name = "set")]
    Set {
        /// Name of the container
        name: String,

        /// Start the container with the host
        #[arg(long)]
        autostart: Option<bool>,

        /// Description, empty to remove it
        #[arg(long)]
        description: Option<String>,

        /// Web UI hint, empty to remove it
        #[arg(long)]
        webui: Option<String>,
    },

    /// Back up a container and wait for the archive to be written
    #[command(name = "backup")]
    Backup {
        /// Name of the container
        name: String,

        /// Backup root to write below
        #[arg(long, value_name = "PATH")]
        path: Option<PathBuf>,

        /// xz compression level (0-9)
        #[arg(long)]
        compression: Option<u32>,

        /// Compressor threads, 0 for half of the host's CPUs
        #[arg(long)]
        threads: Option<usize>,

        /// Archive a temporary snapshot to keep downtime short (BTRFS only)
        #[arg(long)]
        snapshot: Option<bool>,

        /// How many backups to keep
        #[arg(long)]
        keep: Option<usize>,
    },

    /// List or delete the backups of a container
    #[command(name = "backups")]
    Backups {
        /// Name of the container
        name: String,

        /// Delete this backup file
        #[arg(long, value_name = "FILENAME")]
        delete: Option<String>,
    },

    /// Restore a backup and wait for the restore to finish
    #[command(name = "restore")]
    Restore {
        /// Name of the container the backup belongs to
        source: String,

        /// Backup file name
        filename: String,

        /// Restore under this name instead of the original one
        #[arg(long = "as", value_name = "NAME")]
        new_name: Option<String>,

        /// Backup root to read from
        #[arg(long, value_name = "PATH")]
        path: Option<PathBuf>,
    },

    /// Manage snapshots
    #[command(name = "snapshot")]
    Snapshot {
        /// The snapshot subcommand to run
        #[command(subcommand)]
        subcommand: SnapshotSubcommand,
    },

    /// Move a directory-backed container onto a BTRFS subvolume
    #[command(name = "convert")]
    Convert {
        /// Name of the container
        name: String,
    },

    /// Show CPU and memory usage
    #[command(name = "usage")]
    Usage {
        /// Name of the container, all running containers if omitted
        name: Option<String>,
    },

    /// List downloadable images
    #[command(name = "images")]
    Images,

    /// Read or change container order indices
    #[command(name = "index")]
    Index {
        /// The index subcommand to run
        #[command(subcommand)]
        subcommand: IndexSubcommand,
    },

    /// Print the raw config file of a container
    #[command(name = "config")]
    Config {
        /// Name of the container
        name: String,
    },
}

/// Subcommands of `lxcore snapshot`
#[derive(Debug, Subcommand)]
pub enum SnapshotSubcommand {
    /// List the snapshots of a container
    #[command(name = "list", alias = "ls")]
    List {
        /// Name of the container
        name: String,
    },

    /// Take a snapshot
    #[command(name = "create")]
    Create {
        /// Name of the container
        name: String,
    },

    /// Delete a snapshot
    #[command(name = "delete", alias = "rm")]
    Delete {
        /// Name of the container
        name: String,

        /// Name of the snapshot
        snapshot: String,
    },

    /// Roll a container back to a snapshot and wait for it to finish
    #[command(name = "restore")]
    Restore {
        /// Name of the container
        name: String,

        /// Name of the snapshot
        snapshot: String,
    },

    /// Create a new container from a snapshot and wait for it to finish
    #[command(name = "clone")]
    Clone {
        /// Name of the source container
        name: String,

        /// Name of the snapshot
        snapshot: String,

        /// Name of the new container
        new_name: String,
    },
}

/// Subcommands of `lxcore index`
#[derive(Debug, Subcommand)]
pub enum IndexSubcommand {
    /// Show the index of one container, or of all of them
    #[command(name = "get")]
    Get {
        /// Name of the container
        name: Option<String>,
    },

    /// Set the index of a container
    #[command(name = "set")]
    Set {
        /// Name of the container
        name: String,

        /// New index, starting at 1
        index: u32,
    },

    /// Renumber all containers to 1..N
    #[command(name = "compact")]
    Compact,
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------
