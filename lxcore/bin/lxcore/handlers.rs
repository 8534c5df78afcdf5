use std::path::PathBuf;

use lxcore::{
    cli::AnsiStyles,
    management::{BackupOptions, ContainerManager, CreateRequest, OperationKind},
    notify::{JobEvent, JobOutcome},
    utils::host_architecture,
    LxcoreError, LxcoreResult,
};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

pub async fn list_subcommand(manager: &ContainerManager, json: bool) -> LxcoreResult<()> {
    let containers = manager.list_containers().await?;
    if json {
        return print_json(&containers);
    }

    println!(
        "{}",
        format!(
            "{:<5} {:<24} {:<9} {:<10} {:<9} {}",
            "INDEX", "NAME", "STATE", "STORAGE", "AUTOSTART", "IPV4"
        )
        .header()
    );
    for container in containers {
        let mut line = format!(
            "{:<5} {:<24} {:<9} {:<10} {:<9} {}",
            container
                .index
                .map(|i| i.to_string())
                .unwrap_or_else(|| "-".to_string()),
            container.name,
            container.state.to_string(),
            container.backing_storage.to_string(),
            if container.autostart { "yes" } else { "no" },
            container.ipv4.join(", ")
        );
        if let Some(kind) = container.active_operation {
            line.push_str(&format!("  [{} in progress]", kind));
        }
        println!("{}", line);
    }

    Ok(())
}

pub async fn info_subcommand(
    manager: &ContainerManager,
    name: &str,
    json: bool,
) -> LxcoreResult<()> {
    let container = manager.get_container(name).await?;
    if json {
        return print_json(&container);
    }

    let field = |label: &str, value: String| println!("{:<14} {}", label.literal(), value);
    let optional = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());

    println!("{}", container.name.header());
    field("state", container.state.to_string());
    field(
        "index",
        container
            .index
            .map(|i| i.to_string())
            .unwrap_or_else(|| "-".to_string()),
    );
    field("autostart", container.autostart.to_string());
    field("description", optional(&container.description));
    field("webui", optional(&container.webui));
    field("distribution", optional(&container.distribution));
    field("architecture", optional(&container.architecture));
    field("storage", container.backing_storage.to_string());
    field("unprivileged", container.unprivileged.to_string());
    field("custom icon", container.custom_icon.to_string());
    field("ipv4", container.ipv4.join(", "));
    field("ipv6", container.ipv6.join(", "));
    field(
        "operation",
        container
            .active_operation
            .map(|kind| kind.to_string())
            .unwrap_or_else(|| "-".to_string()),
    );

    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn create_subcommand(
    manager: &ContainerManager,
    name: String,
    dist: String,
    release: String,
    arch: Option<String>,
    autostart: bool,
    description: Option<String>,
    start: bool,
    unprivileged: bool,
    json: bool,
) -> LxcoreResult<()> {
    let request = CreateRequest {
        name,
        distribution: dist,
        release,
        architecture: arch.unwrap_or_else(|| host_architecture().to_string()),
        autostart,
        description,
        start_after_creation: start,
        unprivileged,
    };

    let outcome = manager.create_container(&request).await?;
    if json {
        return print_json(&outcome);
    }

    done("created", &outcome.name);
    if let Some(index) = outcome.index {
        println!("  index {}", index);
    }
    if outcome.started {
        println!("  {}", "started".valid());
    }
    if let Some(error) = outcome.start_error {
        println!("  {} {}", "start failed:".error(), error);
    }

    Ok(())
}

pub async fn set_subcommand(
    manager: &ContainerManager,
    name: &str,
    autostart: Option<bool>,
    description: Option<String>,
    webui: Option<String>,
) -> LxcoreResult<()> {
    if let Some(autostart) = autostart {
        manager.set_autostart(name, autostart).await?;
    }
    if let Some(description) = description {
        manager
            .set_description(name, non_empty(&description))
            .await?;
    }
    if let Some(webui) = webui {
        manager.set_webui(name, non_empty(&webui)).await?;
    }

    done("updated", name);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn backup_subcommand(
    manager: &ContainerManager,
    name: &str,
    path: Option<PathBuf>,
    compression: Option<u32>,
    threads: Option<usize>,
    snapshot: Option<bool>,
    keep: Option<usize>,
    json: bool,
) -> LxcoreResult<()> {
    let options = BackupOptions {
        backup_path: path,
        compression,
        threads,
        use_snapshot: snapshot,
        backups_to_keep: keep,
    };

    let events = manager.subscribe();
    let started = manager.backup_container(name, &options).await?;
    if json {
        print_json(&started)?;
    } else {
        println!(
            "writing {} (level {}, {} threads{})",
            started.backup_file.literal(),
            started.compression,
            started.threads,
            if started.use_snapshot {
                ", from snapshot"
            } else {
                ""
            }
        );
    }

    wait_for_job(events, name, OperationKind::Backup).await
}

pub async fn backups_subcommand(
    manager: &ContainerManager,
    name: &str,
    delete: Option<String>,
    json: bool,
) -> LxcoreResult<()> {
    if let Some(filename) = delete {
        manager.delete_backup(name, &filename).await?;
        done(&format!("backup {} deleted", filename), name);
        return Ok(());
    }

    let backups = manager.list_backups(name).await?;
    if json {
        return print_json(&backups);
    }

    for backup in backups {
        println!(
            "{:<48} {:>12} {}",
            backup.filename,
            backup.size_formatted,
            backup.created.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

pub async fn restore_subcommand(
    manager: &ContainerManager,
    source: &str,
    filename: &str,
    new_name: Option<String>,
    path: Option<PathBuf>,
    json: bool,
) -> LxcoreResult<()> {
    let target = new_name.unwrap_or_else(|| source.to_string());

    let events = manager.subscribe();
    let started = manager
        .restore_container(source, &target, filename, path.as_deref())
        .await?;
    if json {
        print_json(&started)?;
    } else if started.target_exists {
        println!("replacing existing container {}", target.literal());
    }

    wait_for_job(events, &target, OperationKind::Restore).await
}

pub async fn snapshot_list_subcommand(
    manager: &ContainerManager,
    name: &str,
    json: bool,
) -> LxcoreResult<()> {
    let snapshots = manager.list_snapshots(name).await?;
    if json {
        return print_json(&snapshots);
    }

    for snapshot in snapshots {
        println!(
            "{:<10} {:<20} {:>12}",
            snapshot.name,
            snapshot.created.as_deref().unwrap_or("-"),
            snapshot.size_formatted
        );
    }

    Ok(())
}

pub async fn snapshot_restore_subcommand(
    manager: &ContainerManager,
    name: &str,
    snapshot: &str,
) -> LxcoreResult<()> {
    let events = manager.subscribe();
    manager.restore_snapshot(name, snapshot).await?;
    wait_for_job(events, name, OperationKind::Snapshot).await
}

pub async fn snapshot_clone_subcommand(
    manager: &ContainerManager,
    name: &str,
    snapshot: &str,
    new_name: &str,
) -> LxcoreResult<()> {
    let events = manager.subscribe();
    manager.clone_snapshot(name, snapshot, new_name).await?;

    // Clone jobs hold the slot of the source container.
    wait_for_job(events, name, OperationKind::Snapshot).await
}

pub async fn convert_subcommand(manager: &ContainerManager, name: &str) -> LxcoreResult<()> {
    let events = manager.subscribe();
    manager.convert_to_btrfs(name).await?;
    wait_for_job(events, name, OperationKind::ConvertBtrfs).await
}

pub async fn usage_subcommand(
    manager: &ContainerManager,
    name: Option<&str>,
    json: bool,
) -> LxcoreResult<()> {
    let usages = match name {
        Some(name) => vec![manager.usage(name).await?],
        None => manager.usage_all().await?,
    };
    if json {
        return print_json(&usages);
    }

    println!(
        "{}",
        format!("{:<24} {:>7} {:>12}", "NAME", "CPU", "MEMORY").header()
    );
    for usage in usages {
        println!(
            "{:<24} {:>6.1}% {:>12}",
            usage.name, usage.cpu_percent, usage.memory.formatted
        );
    }

    Ok(())
}

pub async fn images_subcommand(manager: &ContainerManager, json: bool) -> LxcoreResult<()> {
    let catalog = manager.get_images().await?;
    if json {
        return print_json(&catalog);
    }

    for (distribution, releases) in &catalog.distributions {
        println!("{}", distribution.header());
        for (release, images) in releases {
            println!(
                "  {:<16} {}  ({})",
                release,
                images.architectures.join(", "),
                images.variants.join(", ")
            );
        }
    }

    if !catalog.filtered.is_empty() {
        println!(
            "{}",
            format!(
                "{} images hidden because this host cannot run their architecture",
                catalog.filtered.len()
            )
            .placeholder()
        );
    }

    Ok(())
}

pub async fn index_get_subcommand(
    manager: &ContainerManager,
    name: Option<&str>,
    json: bool,
) -> LxcoreResult<()> {
    match name {
        Some(name) => {
            let index = manager.get_container_index(name).await?;
            if json {
                return print_json(&index);
            }
            println!(
                "{}",
                index
                    .map(|i| i.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        None => {
            let indices = manager.get_all_container_indices().await?;
            if json {
                return print_json(&indices);
            }
            for entry in indices {
                println!(
                    "{:<5} {}",
                    entry
                        .index
                        .map(|i| i.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    entry.name
                );
            }
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

pub fn done(what: &str, name: &str) {
    println!("{} {}", name.literal(), what.valid());
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value).filter(|value| !value.is_empty())
}

fn print_json(value: &impl Serialize) -> LxcoreResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn wait_for_job(
    mut events: broadcast::Receiver<JobEvent>,
    container: &str,
    kind: OperationKind,
) -> LxcoreResult<()> {
    loop {
        match events.recv().await {
            Ok(event) if event.container == container && event.kind == kind => {
                return match event.outcome {
                    JobOutcome::Completed(summary) => {
                        println!("{}", summary.valid());
                        Ok(())
                    }
                    JobOutcome::Failed(error) => Err(LxcoreError::custom(anyhow::anyhow!(
                        "{} failed: {}",
                        kind,
                        error
                    ))),
                };
            }
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => {
                return Err(LxcoreError::custom(anyhow::anyhow!(
                    "job event channel closed before {} finished",
                    kind
                )))
            }
        }
    }
}
