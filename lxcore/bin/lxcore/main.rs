mod handlers;

use std::sync::Arc;

use clap::{CommandFactory, Parser};
use lxcore::{
    cli::{IndexSubcommand, LxcoreArgs, LxcoreSubcommand, SnapshotSubcommand},
    config::{FileSettings, SettingsProvider},
    management::ContainerManager,
    LxcoreResult,
};
use tracing_subscriber::EnvFilter;

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> LxcoreResult<()> {
    let args = LxcoreArgs::parse();

    let default_filter = if args.verbose { "lxcore=debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(subcommand) = args.subcommand else {
        LxcoreArgs::command().print_help()?;
        return Ok(());
    };

    let settings: Arc<dyn SettingsProvider> = match args.config {
        Some(path) => Arc::new(FileSettings::new(path)),
        None => Arc::new(FileSettings::from_env()),
    };
    let manager = ContainerManager::from_host(settings).await?;
    let json = args.json;

    match subcommand {
        LxcoreSubcommand::List => handlers::list_subcommand(&manager, json).await?,
        LxcoreSubcommand::Info { name } => handlers::info_subcommand(&manager, &name, json).await?,
        LxcoreSubcommand::Start { name } => {
            manager.start_container(&name).await?;
            handlers::done("started", &name);
        }
        LxcoreSubcommand::Stop { name } => {
            manager.stop_container(&name).await?;
            handlers::done("stopped", &name);
        }
        LxcoreSubcommand::Restart { name } => {
            manager.restart_container(&name).await?;
            handlers::done("restarted", &name);
        }
        LxcoreSubcommand::Kill { name } => {
            manager.kill_container(&name).await?;
            handlers::done("killed", &name);
        }
        LxcoreSubcommand::Freeze { name } => {
            manager.freeze_container(&name).await?;
            handlers::done("frozen", &name);
        }
        LxcoreSubcommand::Unfreeze { name } => {
            manager.unfreeze_container(&name).await?;
            handlers::done("unfrozen", &name);
        }
        LxcoreSubcommand::Create {
            name,
            dist,
            release,
            arch,
            autostart,
            description,
            start,
            unprivileged,
        } => {
            handlers::create_subcommand(
                &manager,
                name,
                dist,
                release,
                arch,
                autostart,
                description,
                start,
                unprivileged,
                json,
            )
            .await?;
        }
        LxcoreSubcommand::Destroy { name, remove_disks } => {
            manager.destroy_container(&name, remove_disks).await?;
            handlers::done("destroyed", &name);
        }
        LxcoreSubcommand::Set {
            name,
            autostart,
            description,
            webui,
        } => {
            handlers::set_subcommand(&manager, &name, autostart, description, webui).await?;
        }
        LxcoreSubcommand::Backup {
            name,
            path,
            compression,
            threads,
            snapshot,
            keep,
        } => {
            handlers::backup_subcommand(
                &manager,
                &name,
                path,
                compression,
                threads,
                snapshot,
                keep,
                json,
            )
            .await?;
        }
        LxcoreSubcommand::Backups { name, delete } => {
            handlers::backups_subcommand(&manager, &name, delete, json).await?;
        }
        LxcoreSubcommand::Restore {
            source,
            filename,
            new_name,
            path,
        } => {
            handlers::restore_subcommand(&manager, &source, &filename, new_name, path, json)
                .await?;
        }
        LxcoreSubcommand::Snapshot { subcommand } => match subcommand {
            SnapshotSubcommand::List { name } => {
                handlers::snapshot_list_subcommand(&manager, &name, json).await?;
            }
            SnapshotSubcommand::Create { name } => {
                let snapshot = manager.create_snapshot(&name).await?;
                handlers::done(&format!("snapshotted as {}", snapshot), &name);
            }
            SnapshotSubcommand::Delete { name, snapshot } => {
                manager.delete_snapshot(&name, &snapshot).await?;
                handlers::done(&format!("snapshot {} deleted", snapshot), &name);
            }
            SnapshotSubcommand::Restore { name, snapshot } => {
                handlers::snapshot_restore_subcommand(&manager, &name, &snapshot).await?;
            }
            SnapshotSubcommand::Clone {
                name,
                snapshot,
                new_name,
            } => {
                handlers::snapshot_clone_subcommand(&manager, &name, &snapshot, &new_name).await?;
            }
        },
        LxcoreSubcommand::Convert { name } => {
            handlers::convert_subcommand(&manager, &name).await?;
        }
        LxcoreSubcommand::Usage { name } => {
            handlers::usage_subcommand(&manager, name.as_deref(), json).await?;
        }
        LxcoreSubcommand::Images => handlers::images_subcommand(&manager, json).await?,
        LxcoreSubcommand::Index { subcommand } => match subcommand {
            IndexSubcommand::Get { name } => {
                handlers::index_get_subcommand(&manager, name.as_deref(), json).await?;
            }
            IndexSubcommand::Set { name, index } => {
                manager.set_container_index(&name, index).await?;
                handlers::done(&format!("moved to index {}", index), &name);
            }
            IndexSubcommand::Compact => {
                manager.reindex_containers().await?;
                println!("indices renumbered");
            }
        },
        LxcoreSubcommand::Config { name } => {
            print!("{}", manager.get_config(&name).await?);
        }
    }

    Ok(())
}
