//! Line-oriented editing of a container's native config file.
//!
//! LXC config files are `key = value` lines by convention, not a structured format. Fields the
//! engine owns are stored as sentinel lines: either a native key (`lxc.start.auto = 1`) or a
//! comment the container tool ignores (`#container_order=3`). Every edit touches exactly one
//! sentinel and leaves all other lines, including their order and spacing, as they were.

use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use tokio::fs;

use crate::{
    models::BackingStorage,
    utils::{validate_description, validate_index, validate_webui},
    LxcoreError, LxcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

static TEMPLATE_PARAMS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*#\s*Parameters passed to the template:(.*)$").unwrap()
});

static HWADDR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*lxc\.net\.\d+\.hwaddr\s*=\s*)\S+(.*)$").unwrap()
});

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A logical field persisted as one sentinel line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    /// `lxc.start.auto = 0|1`
    Autostart,

    /// `#container_order=<n>`
    Order,

    /// `#container_description=<text>`
    Description,

    /// `#container_webui=<hint>`
    Webui,

    /// `lxc.rootfs.path = <prefix><path>`
    RootfsPath,

    /// `lxc.uts.name = <name>`
    UtsName,
}

/// The creation parameters recorded by the download template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateMetadata {
    /// The distribution, e.g. `ubuntu`.
    pub distribution: Option<String>,

    /// The release, e.g. `noble`.
    pub release: Option<String>,

    /// The architecture, e.g. `amd64`.
    pub architecture: Option<String>,
}

/// An in-memory copy of a container config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    path: PathBuf,
    content: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ConfigField {
    fn key(&self) -> &'static str {
        match self {
            ConfigField::Autostart => "lxc.start.auto",
            ConfigField::Order => "container_order",
            ConfigField::Description => "container_description",
            ConfigField::Webui => "container_webui",
            ConfigField::RootfsPath => "lxc.rootfs.path",
            ConfigField::UtsName => "lxc.uts.name",
        }
    }

    fn is_comment(&self) -> bool {
        matches!(
            self,
            ConfigField::Order | ConfigField::Description | ConfigField::Webui
        )
    }

    /// Returns the value of `line` if it is this field's sentinel.
    ///
    /// Comment sentinels are written without padding, so their value is returned verbatim.
    fn parse<'a>(&self, line: &'a str) -> Option<&'a str> {
        let mut rest = line.trim_start();
        if self.is_comment() {
            rest = rest.strip_prefix('#')?.trim_start();
        }

        let value = rest
            .strip_prefix(self.key())?
            .trim_start()
            .strip_prefix('=')?;

        if self.is_comment() {
            Some(value)
        } else {
            Some(value.trim())
        }
    }

    fn render(&self, value: &str) -> String {
        if self.is_comment() {
            format!("#{}={}", self.key(), value)
        } else {
            format!("{} = {}", self.key(), value)
        }
    }
}

impl ContainerConfig {
    /// Wraps config text that lives at `path`.
    pub fn new(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    /// Loads the config file at `path`.
    pub async fn load(path: impl AsRef<Path>) -> LxcoreResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await?;
        Ok(Self::new(path, content))
    }

    /// Loads the config file at `path`, or returns `None` if it does not exist.
    pub async fn read(path: impl AsRef<Path>) -> LxcoreResult<Option<Self>> {
        match fs::read_to_string(path.as_ref()).await {
            Ok(content) => Ok(Some(Self::new(path.as_ref(), content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the config back to where it was loaded from.
    pub async fn save(&self) -> LxcoreResult<()> {
        fs::write(&self.path, &self.content).await?;
        Ok(())
    }

    /// Returns the path of the config file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the raw config text.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Returns the value of the first sentinel line of `field`.
    pub fn get(&self, field: ConfigField) -> Option<&str> {
        self.content.lines().find_map(|line| field.parse(line))
    }

    /// Rewrites the sentinel line of `field`, or removes it when `value` is `None`.
    ///
    /// An existing sentinel is replaced in place. A new one goes right after the leading block of
    /// comment and blank lines so generated headers stay first.
    pub fn set(&mut self, field: ConfigField, value: Option<&str>) {
        let trailing_newline = self.content.is_empty() || self.content.ends_with('\n');
        let mut lines: Vec<String> = self.content.lines().map(str::to_string).collect();

        let existing = lines.iter().position(|line| field.parse(line).is_some());
        match (existing, value) {
            (Some(position), Some(value)) => {
                lines[position] = field.render(value);
                let mut index = 0;
                lines.retain(|line| {
                    let keep = index <= position || field.parse(line).is_none();
                    index += 1;
                    keep
                });
            }
            (None, Some(value)) => {
                let position = lines
                    .iter()
                    .position(|line| {
                        let trimmed = line.trim();
                        !trimmed.is_empty() && !trimmed.starts_with('#')
                    })
                    .unwrap_or(lines.len());
                lines.insert(position, field.render(value));
            }
            (_, None) => lines.retain(|line| field.parse(line).is_none()),
        }

        let mut content = lines.join("\n");
        if trailing_newline && !content.is_empty() {
            content.push('\n');
        }
        self.content = content;
    }

    /// Returns whether the container starts with the host. Absent means `false`.
    pub fn autostart(&self) -> bool {
        self.get(ConfigField::Autostart) == Some("1")
    }

    /// Sets the autostart flag.
    pub fn set_autostart(&mut self, autostart: bool) {
        self.set(ConfigField::Autostart, Some(if autostart { "1" } else { "0" }));
    }

    /// Returns the order index, ignoring malformed or non-positive values.
    pub fn index(&self) -> Option<u32> {
        self.get(ConfigField::Order)
            .and_then(|value| value.trim().parse().ok())
            .filter(|index| *index >= 1)
    }

    /// Sets the order index after validating it, or removes it.
    pub fn set_index(&mut self, index: Option<u32>) -> LxcoreResult<()> {
        match index {
            Some(index) => {
                validate_index(index)?;
                self.set(ConfigField::Order, Some(&index.to_string()));
            }
            None => self.set(ConfigField::Order, None),
        }
        Ok(())
    }

    /// Returns the description.
    pub fn description(&self) -> Option<&str> {
        self.get(ConfigField::Description)
            .filter(|value| !value.is_empty())
    }

    /// Sets the description after validating it. `None` or an empty string removes the line.
    pub fn set_description(&mut self, description: Option<&str>) -> LxcoreResult<()> {
        match description.filter(|d| !d.is_empty()) {
            Some(description) => {
                validate_description(description)?;
                self.set(ConfigField::Description, Some(description));
            }
            None => self.set(ConfigField::Description, None),
        }
        Ok(())
    }

    /// Returns the web interface hint.
    pub fn webui(&self) -> Option<&str> {
        self.get(ConfigField::Webui)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Sets the web interface hint after validating it. `None` or empty removes the line.
    pub fn set_webui(&mut self, webui: Option<&str>) -> LxcoreResult<()> {
        match webui.filter(|w| !w.is_empty()) {
            Some(webui) => {
                validate_webui(webui)?;
                self.set(ConfigField::Webui, Some(webui));
            }
            None => self.set(ConfigField::Webui, None),
        }
        Ok(())
    }

    /// Returns the rootfs path with its storage prefix stripped.
    pub fn rootfs_path(&self) -> Option<PathBuf> {
        let value = self.get(ConfigField::RootfsPath)?;
        let path = value
            .strip_prefix(BackingStorage::Btrfs.rootfs_prefix())
            .or_else(|| value.strip_prefix(BackingStorage::Directory.rootfs_prefix()))
            .unwrap_or(value);

        Some(PathBuf::from(path))
    }

    /// Returns the backing storage implied by the rootfs line.
    pub fn backing_storage(&self) -> BackingStorage {
        match self.get(ConfigField::RootfsPath) {
            Some(value) if value.starts_with(BackingStorage::Btrfs.rootfs_prefix()) => {
                BackingStorage::Btrfs
            }
            _ => BackingStorage::Directory,
        }
    }

    /// Points the rootfs line at `path` with the prefix of `storage`.
    pub fn set_rootfs(&mut self, storage: BackingStorage, path: &Path) {
        let value = format!("{}{}", storage.rootfs_prefix(), path.display());
        self.set(ConfigField::RootfsPath, Some(&value));
    }

    /// Sets the identity line.
    pub fn set_uts_name(&mut self, name: &str) {
        self.set(ConfigField::UtsName, Some(name));
    }

    /// Parses the creation parameters the download template recorded.
    pub fn template_metadata(&self) -> TemplateMetadata {
        let Some(params) = TEMPLATE_PARAMS_RE
            .captures(&self.content)
            .and_then(|captures| captures.get(1))
        else {
            return TemplateMetadata::default();
        };

        let mut metadata = TemplateMetadata::default();
        let mut tokens = params.as_str().split_whitespace();
        while let Some(token) = tokens.next() {
            let (flag, inline) = match token.split_once('=') {
                Some((flag, value)) => (flag, Some(value)),
                None => (token, None),
            };

            let slot = match flag {
                "--dist" | "-d" => &mut metadata.distribution,
                "--release" | "-r" => &mut metadata.release,
                "--arch" | "-a" => &mut metadata.architecture,
                _ => continue,
            };

            *slot = inline
                .map(str::to_string)
                .or_else(|| tokens.next().map(str::to_string));
        }

        metadata
    }

    /// Returns `true` if the config already carries an id map.
    pub fn has_idmap(&self) -> bool {
        self.content
            .lines()
            .any(|line| line.trim_start().starts_with("lxc.idmap"))
    }

    /// Appends uid and gid maps of `range` ids starting at host id `offset`.
    pub fn append_idmap(&mut self, offset: u32, range: u32) {
        if !self.content.is_empty() && !self.content.ends_with('\n') {
            self.content.push('\n');
        }

        for kind in ["u", "g"] {
            self.content
                .push_str(&format!("lxc.idmap = {} 0 {} {}\n", kind, offset, range));
        }
    }

    /// Replaces every `lxc.net.N.hwaddr` value with one produced by `generate`.
    pub fn regenerate_hwaddrs(&mut self, mut generate: impl FnMut() -> String) {
        let trailing_newline = self.content.ends_with('\n');
        let mut content = self
            .content
            .lines()
            .map(|line| match HWADDR_RE.captures(line) {
                Some(captures) => format!("{}{}{}", &captures[1], generate(), &captures[2]),
                None => line.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n");

        if trailing_newline {
            content.push('\n');
        }
        self.content = content;
    }
}

impl TemplateMetadata {
    /// Returns `true` if neither distribution nor architecture could be determined.
    pub fn is_empty(&self) -> bool {
        self.distribution.is_none() && self.architecture.is_none()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Loads `path`, applies `edit`, and writes the result back.
///
/// Nothing is written if `edit` fails.
pub async fn edit_config<F>(path: impl AsRef<Path>, edit: F) -> LxcoreResult<()>
where
    F: FnOnce(&mut ContainerConfig) -> LxcoreResult<()>,
{
    let path = path.as_ref();
    let mut config = ContainerConfig::read(path)
        .await?
        .ok_or_else(|| {
            LxcoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("config file not found: {}", path.display()),
            ))
        })?;

    edit(&mut config)?;
    config.save().await
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
