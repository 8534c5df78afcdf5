//! Container listing, per-container metadata and the order-index namespace.

use std::{collections::HashSet, path::Path};

use futures::future;
use tokio::fs;

use crate::{
    config::Settings,
    models::{Container, ContainerIndex, ContainerState},
    utils::{config_path, icon_path, validate_container_name, validate_index},
    LxcoreError, LxcoreResult,
};

use super::{edit_config, ContainerConfig, ContainerManager, TemplateMetadata};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The column headers of `lxc-ls -f` the listing parser looks for.
const LISTING_COLUMNS: [&str; 6] = ["STATE", "AUTOSTART", "GROUPS", "IPV4", "IPV6", "UNPRIVILEGED"];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One row of the container tool's listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRow {
    /// The container name.
    pub name: String,

    /// The run state.
    pub state: ContainerState,

    /// Container groups.
    pub groups: Vec<String>,

    /// IPv4 addresses.
    pub ipv4: Vec<String>,

    /// IPv6 addresses.
    pub ipv6: Vec<String>,

    /// Whether the tool reports the container as unprivileged.
    pub unprivileged: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContainerManager {
    /// Lists all containers with their metadata.
    ///
    /// Fails as a whole only if the listing itself fails. Metadata that cannot be read degrades
    /// to its default.
    pub async fn list_containers(&self) -> LxcoreResult<Vec<Container>> {
        let root = self.lxc_root().await?;
        let rows = self.list_rows().await?;
        let settings = self.settings().await?;

        Ok(future::join_all(
            rows.into_iter()
                .map(|row| self.augment(&root, &settings, row)),
        )
        .await)
    }

    /// Returns one container.
    pub async fn get_container(&self, name: &str) -> LxcoreResult<Container> {
        validate_container_name(name)?;
        self.list_containers()
            .await?
            .into_iter()
            .find(|container| container.name == name)
            .ok_or_else(|| LxcoreError::ContainerNotFound(name.to_string()))
    }

    /// Returns `true` if the container tool knows `name`.
    pub async fn container_exists(&self, name: &str) -> LxcoreResult<bool> {
        Ok(self.list_rows().await?.iter().any(|row| row.name == name))
    }

    /// Returns the template metadata of `name`, served from cache when possible.
    pub async fn container_metadata(&self, name: &str) -> TemplateMetadata {
        if let Some(metadata) = self.cached_metadata(name) {
            return metadata;
        }

        let metadata = match self.load_config(name).await {
            Ok(Some(config)) => config.template_metadata(),
            Ok(None) => TemplateMetadata::default(),
            Err(e) => {
                tracing::warn!(container = %name, error = %e, "could not read container metadata");
                TemplateMetadata::default()
            }
        };

        if metadata.is_empty() {
            tracing::debug!(container = %name, "no template parameters recorded");
        }

        self.cache_metadata(name, &metadata);
        metadata
    }

    /// Sets whether `name` starts with the host.
    pub async fn set_autostart(&self, name: &str, autostart: bool) -> LxcoreResult<()> {
        self.edit_existing(name, |config| {
            config.set_autostart(autostart);
            Ok(())
        })
        .await
    }

    /// Sets or, with `None` or an empty string, removes the description of `name`.
    pub async fn set_description(&self, name: &str, description: Option<&str>) -> LxcoreResult<()> {
        self.edit_existing(name, |config| config.set_description(description))
            .await
    }

    /// Sets or removes the web interface hint of `name`.
    pub async fn set_webui(&self, name: &str, webui: Option<&str>) -> LxcoreResult<()> {
        self.edit_existing(name, |config| config.set_webui(webui))
            .await
    }

    /// Returns the order index of `name`.
    pub async fn get_container_index(&self, name: &str) -> LxcoreResult<Option<u32>> {
        validate_container_name(name)?;
        match self.load_config(name).await? {
            Some(config) => Ok(config.index()),
            None => Err(LxcoreError::ContainerNotFound(name.to_string())),
        }
    }

    /// Returns the order index of every container, ascending, unindexed containers last and
    /// ties broken by name.
    pub async fn get_all_container_indices(&self) -> LxcoreResult<Vec<ContainerIndex>> {
        let names: Vec<String> = self
            .list_rows()
            .await?
            .into_iter()
            .map(|row| row.name)
            .collect();

        let indices = future::join_all(names.iter().map(|name| async move {
            let index = match self.load_config(name).await {
                Ok(config) => config.and_then(|c| c.index()),
                Err(e) => {
                    tracing::warn!(container = %name, error = %e, "could not read container index");
                    None
                }
            };

            ContainerIndex {
                name: name.clone(),
                index,
            }
        }))
        .await;

        Ok(sort_indices(indices))
    }

    /// Sets the order index of `name`, refusing an index another container already uses.
    pub async fn set_container_index(&self, name: &str, index: u32) -> LxcoreResult<()> {
        validate_container_name(name)?;
        validate_index(index)?;

        let taken = self
            .get_all_container_indices()
            .await?
            .into_iter()
            .any(|entry| entry.name != name && entry.index == Some(index));
        if taken {
            return Err(LxcoreError::DuplicateIndex(index));
        }

        self.edit_existing(name, |config| config.set_index(Some(index)))
            .await
    }

    /// Writes several order indices at once.
    ///
    /// All indices must be distinct positive integers, unused by containers outside the request,
    /// and every container must exist. Nothing is written unless the whole request is valid.
    pub async fn update_container_indices(&self, updates: &[ContainerIndex]) -> LxcoreResult<()> {
        let mut seen = HashSet::new();
        for update in updates {
            validate_container_name(&update.name)?;
            let index = update
                .index
                .ok_or_else(|| LxcoreError::InvalidIndex(format!("missing index for {}", update.name)))?;
            validate_index(index)?;
            if !seen.insert(index) {
                return Err(LxcoreError::DuplicateIndex(index));
            }
        }

        let root = self.lxc_root().await?;
        for update in updates {
            if !fs::try_exists(config_path(&root, &update.name)).await? {
                return Err(LxcoreError::ContainerNotFound(update.name.clone()));
            }
        }

        let named: HashSet<&str> = updates.iter().map(|u| u.name.as_str()).collect();
        for entry in self.get_all_container_indices().await? {
            if named.contains(entry.name.as_str()) {
                continue;
            }
            if let Some(index) = entry.index.filter(|i| seen.contains(i)) {
                return Err(LxcoreError::DuplicateIndex(index));
            }
        }

        for update in updates {
            edit_config(config_path(&root, &update.name), |config| {
                config.set_index(update.index)
            })
            .await?;
        }

        tracing::info!(count = updates.len(), "container indices updated");
        Ok(())
    }

    /// Returns one past the highest index in use, ignoring `exclude`.
    pub async fn next_available_index(&self, exclude: Option<&str>) -> LxcoreResult<u32> {
        let highest = self
            .get_all_container_indices()
            .await?
            .into_iter()
            .filter(|entry| Some(entry.name.as_str()) != exclude)
            .filter_map(|entry| entry.index)
            .max()
            .unwrap_or(0);

        Ok(highest + 1)
    }

    /// Renumbers all containers `1..=N`, keeping their current relative order.
    pub async fn reindex_containers(&self) -> LxcoreResult<()> {
        let root = self.lxc_root().await?;
        let ordered = self.get_all_container_indices().await?;

        for (position, entry) in ordered.into_iter().enumerate() {
            let index = position as u32 + 1;
            if entry.index == Some(index) {
                continue;
            }

            edit_config(config_path(&root, &entry.name), |config| {
                config.set_index(Some(index))
            })
            .await?;
        }

        tracing::debug!("containers reindexed");
        Ok(())
    }

    /// Parses the container tool's listing.
    pub(crate) async fn list_rows(&self) -> LxcoreResult<Vec<ListingRow>> {
        let root = self.lxc_root().await?;
        let listing = self.tool().list(&root).await?;
        Ok(parse_listing(&listing))
    }

    /// Fails with [`LxcoreError::ContainerNotFound`] unless the container tool knows `name`.
    pub(crate) async fn ensure_exists(&self, name: &str) -> LxcoreResult<()> {
        if !self.container_exists(name).await? {
            return Err(LxcoreError::ContainerNotFound(name.to_string()));
        }

        Ok(())
    }

    pub(crate) async fn load_config(&self, name: &str) -> LxcoreResult<Option<ContainerConfig>> {
        let root = self.lxc_root().await?;
        ContainerConfig::read(config_path(&root, name)).await
    }

    async fn edit_existing<F>(&self, name: &str, edit: F) -> LxcoreResult<()>
    where
        F: FnOnce(&mut ContainerConfig) -> LxcoreResult<()>,
    {
        validate_container_name(name)?;
        let root = self.lxc_root().await?;
        let path = config_path(&root, name);
        if !fs::try_exists(&path).await? {
            return Err(LxcoreError::ContainerNotFound(name.to_string()));
        }

        edit_config(path, edit).await
    }

    async fn augment(&self, root: &Path, settings: &Settings, row: ListingRow) -> Container {
        let config = match ContainerConfig::read(config_path(root, &row.name)).await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(container = %row.name, error = %e, "could not read container config");
                None
            }
        };

        let metadata = self.container_metadata(&row.name).await;
        let custom_icon = fs::try_exists(icon_path(&settings.icons_dir(), &row.name))
            .await
            .unwrap_or(false);

        Container {
            state: row.state,
            autostart: config.as_ref().is_some_and(|c| c.autostart()),
            index: config.as_ref().and_then(|c| c.index()),
            description: config
                .as_ref()
                .and_then(|c| c.description().map(str::to_string)),
            webui: config.as_ref().and_then(|c| c.webui().map(str::to_string)),
            distribution: metadata.distribution,
            architecture: metadata.architecture,
            unprivileged: row.unprivileged || config.as_ref().is_some_and(|c| c.has_idmap()),
            backing_storage: config
                .as_ref()
                .map(|c| c.backing_storage())
                .unwrap_or_default(),
            custom_icon,
            ipv4: row.ipv4,
            ipv6: row.ipv6,
            groups: row.groups,
            active_operation: self.tracker().peek(&row.name).map(|info| info.kind),
            name: row.name,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses the fixed-width table printed by `lxc-ls -f`.
///
/// Columns are located by the offsets of their header keywords. The name always spans from the
/// start of the line up to the `STATE` column.
pub fn parse_listing(listing: &str) -> Vec<ListingRow> {
    let mut lines = listing.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };

    let mut offsets: Vec<(&str, usize)> = LISTING_COLUMNS
        .iter()
        .filter_map(|column| header.find(column).map(|offset| (*column, offset)))
        .collect();
    offsets.sort_by_key(|(_, offset)| *offset);

    let Some(state_offset) = offsets
        .iter()
        .find(|(column, _)| *column == "STATE")
        .map(|(_, offset)| *offset)
    else {
        return Vec::new();
    };

    lines
        .filter_map(|line| {
            let field = |column: &str| column_value(line, &offsets, column);

            let name = line.get(..state_offset.min(line.len()))?.trim();
            if name.is_empty() {
                return None;
            }

            let state = field("STATE").parse().unwrap_or_else(|_| {
                tracing::debug!(container = %name, state = %field("STATE"), "unknown state, assuming stopped");
                ContainerState::Stopped
            });

            Some(ListingRow {
                name: name.to_string(),
                state,
                groups: split_list(field("GROUPS")),
                ipv4: split_list(field("IPV4")),
                ipv6: split_list(field("IPV6")),
                unprivileged: field("UNPRIVILEGED").eq_ignore_ascii_case("true"),
            })
        })
        .collect()
}

/// Sorts indices ascending with unindexed entries last and ties broken by name.
pub fn sort_indices(mut indices: Vec<ContainerIndex>) -> Vec<ContainerIndex> {
    indices.sort_by(|a, b| match (a.index, b.index) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.name.cmp(&b.name)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.name.cmp(&b.name),
    });
    indices
}

fn column_value<'a>(line: &'a str, offsets: &[(&str, usize)], column: &str) -> &'a str {
    let Some(position) = offsets.iter().position(|(c, _)| *c == column) else {
        return "";
    };

    let end = offsets
        .get(position + 1)
        .map(|(_, offset)| *offset)
        .unwrap_or(line.len())
        .min(line.len());
    let start = offsets[position].1.min(end);

    line.get(start..end).unwrap_or("").trim()
}

fn split_list(field: &str) -> Vec<String> {
    field
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty() && *item != "-")
        .map(str::to_string)
        .collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
