//! Host settings consumed by the container engine.
//!
//! Settings live in a TOML file (see [`DEFAULT_CONFIG_FILE`]) and are reached through the
//! [`SettingsProvider`] trait so the engine never reads global state directly. Every field has a
//! default, so a missing file simply means "use the defaults".

use std::{
    path::{Path, PathBuf},
    sync::RwLock,
};

use async_trait::async_trait;
use getset::{Getters, Setters};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{models::BackingStorage, LxcoreResult};

use super::{
    CONFIG_FILE_ENV_VAR, DEFAULT_BACKUPS_TO_KEEP, DEFAULT_CACHE_DIR, DEFAULT_CGROUP_ROOT,
    DEFAULT_COMPRESSION_LEVEL, DEFAULT_CONFIG_FILE, DEFAULT_LXC_PATH, DEFAULT_THREADS,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// All settings the engine reads from its settings collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TypedBuilder, Getters, Setters)]
#[getset(get = "pub with_prefix", set = "pub with_prefix")]
#[serde(default)]
pub struct Settings {
    /// Container tool and storage settings.
    #[builder(default)]
    lxc: LxcSettings,

    /// Backup defaults.
    #[builder(default)]
    backup: BackupSettings,

    /// Secondary architectures that can run under emulation.
    #[builder(default)]
    emulation: EmulationSettings,

    /// Where job notifications are delivered.
    #[builder(default)]
    notifications: NotificationSettings,

    /// Where downloaded data is cached.
    #[builder(default)]
    cache: CacheSettings,
}

/// The `[lxc]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters, Setters)]
#[getset(get = "pub with_prefix", set = "pub with_prefix")]
#[serde(default)]
pub struct LxcSettings {
    /// The root directory holding one subdirectory per container.
    #[builder(default = PathBuf::from(DEFAULT_LXC_PATH), setter(into))]
    path: PathBuf,

    /// The backing storage new containers are created with.
    #[builder(default)]
    backing_storage: BackingStorage,

    /// An optional mirror host for the image server.
    #[builder(default, setter(strip_option, into))]
    registry_mirror: Option<String>,

    /// The cgroup v2 mount point.
    #[builder(default = PathBuf::from(DEFAULT_CGROUP_ROOT), setter(into))]
    cgroup_root: PathBuf,

    /// Overrides `<lxc path>/custom_icons`.
    #[builder(default, setter(strip_option, into))]
    icons_dir: Option<PathBuf>,
}

/// The `[backup]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters, Setters)]
#[getset(get = "pub with_prefix", set = "pub with_prefix")]
#[serde(default)]
pub struct BackupSettings {
    /// The default backup root. Backups are refused while this is unset.
    #[builder(default, setter(strip_option, into))]
    path: Option<PathBuf>,

    /// The default xz compression level (0-9).
    #[builder(default = DEFAULT_COMPRESSION_LEVEL)]
    compression: u32,

    /// The default compressor thread count, `0` for automatic.
    #[builder(default = DEFAULT_THREADS)]
    threads: usize,

    /// Whether backups read from a temporary snapshot by default.
    #[builder(default)]
    use_snapshot: bool,

    /// How many backups to keep per container.
    #[builder(default = DEFAULT_BACKUPS_TO_KEEP)]
    backups_to_keep: usize,
}

/// The `[emulation]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TypedBuilder, Getters, Setters)]
#[getset(get = "pub with_prefix", set = "pub with_prefix")]
#[serde(default)]
pub struct EmulationSettings {
    /// Architectures (LXC naming, e.g. `arm64`) the host can run through binfmt emulation.
    #[builder(default)]
    architectures: Vec<String>,
}

/// The `[notifications]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TypedBuilder, Getters, Setters)]
#[getset(get = "pub with_prefix", set = "pub with_prefix")]
#[serde(default)]
pub struct NotificationSettings {
    /// The Unix socket of the notification sink.
    #[builder(default, setter(strip_option, into))]
    socket: Option<PathBuf>,
}

/// The `[cache]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters, Setters)]
#[getset(get = "pub with_prefix", set = "pub with_prefix")]
#[serde(default)]
pub struct CacheSettings {
    /// The cache directory.
    #[builder(default = DEFAULT_CACHE_DIR.clone(), setter(into))]
    dir: PathBuf,
}

/// Settings read from a TOML file on every call.
#[derive(Debug, Clone)]
pub struct FileSettings {
    path: PathBuf,
}

/// Settings held in memory.
#[derive(Debug, Default)]
pub struct StaticSettings {
    inner: RwLock<Settings>,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The settings collaborator of the container engine.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    /// Returns the current settings.
    async fn load(&self) -> LxcoreResult<Settings>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Settings {
    /// Parses settings from TOML text.
    pub fn from_toml(contents: &str) -> LxcoreResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Returns the directory custom icons are stored in.
    pub fn icons_dir(&self) -> PathBuf {
        self.lxc
            .icons_dir
            .clone()
            .unwrap_or_else(|| self.lxc.path.join(crate::utils::CUSTOM_ICONS_SUBDIR))
    }
}

impl FileSettings {
    /// Creates a provider reading the given file.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Creates a provider reading `$LXCORE_CONFIG`, or the default settings file.
    pub fn from_env() -> Self {
        let path = std::env::var_os(CONFIG_FILE_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        Self::new(path)
    }

    /// Returns the path of the settings file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StaticSettings {
    /// Creates a provider with fixed initial settings.
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    /// Applies `f` to the stored settings.
    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for LxcSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[async_trait]
impl SettingsProvider for FileSettings {
    async fn load(&self) -> LxcoreResult<Settings> {
        if !tokio::fs::try_exists(&self.path).await? {
            tracing::debug!(path = %self.path.display(), "settings file missing, using defaults");
            return Ok(Settings::default());
        }

        let contents = tokio::fs::read_to_string(&self.path).await?;
        Settings::from_toml(&contents)
    }
}

#[async_trait]
impl SettingsProvider for StaticSettings {
    async fn load(&self) -> LxcoreResult<Settings> {
        Ok(self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.get_lxc().get_path(), Path::new(DEFAULT_LXC_PATH));
        assert_eq!(*settings.get_backup().get_backups_to_keep(), 3);
        assert_eq!(*settings.get_backup().get_compression(), 6);
        assert!(settings.get_backup().get_path().is_none());
        assert_eq!(
            settings.icons_dir(),
            Path::new(DEFAULT_LXC_PATH).join("custom_icons")
        );
    }

    #[test]
    fn test_settings_from_toml() -> anyhow::Result<()> {
        let settings = Settings::from_toml(
            r#"
            [lxc]
            path = "/srv/lxc"
            backing_storage = "btrfs"
            registry_mirror = "mirror.example.com"

            [backup]
            path = "/mnt/backups"
            backups_to_keep = 5

            [emulation]
            architectures = ["arm64"]
            "#,
        )?;

        assert_eq!(settings.get_lxc().get_path(), Path::new("/srv/lxc"));
        assert_eq!(
            *settings.get_lxc().get_backing_storage(),
            BackingStorage::Btrfs
        );
        assert_eq!(
            settings.get_lxc().get_registry_mirror().as_deref(),
            Some("mirror.example.com")
        );
        assert_eq!(
            settings.get_backup().get_path().as_deref(),
            Some(Path::new("/mnt/backups"))
        );
        assert_eq!(*settings.get_backup().get_backups_to_keep(), 5);
        assert_eq!(*settings.get_backup().get_compression(), 6);
        assert_eq!(settings.get_emulation().get_architectures(), &["arm64"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_file_settings_missing_file_yields_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let provider = FileSettings::new(dir.path().join("absent.toml"));
        assert_eq!(provider.load().await?, Settings::default());
        Ok(())
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_file_settings_from_env() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("lxcore.toml");
        tokio::fs::write(&path, "[backup]\nbackups_to_keep = 9\n").await?;

        std::env::set_var(CONFIG_FILE_ENV_VAR, &path);
        let provider = FileSettings::from_env();
        std::env::remove_var(CONFIG_FILE_ENV_VAR);

        assert_eq!(provider.path(), path.as_path());
        assert_eq!(*provider.load().await?.get_backup().get_backups_to_keep(), 9);

        let provider = FileSettings::from_env();
        assert_eq!(provider.path(), Path::new(DEFAULT_CONFIG_FILE));
        Ok(())
    }

    #[tokio::test]
    async fn test_static_settings_update() -> anyhow::Result<()> {
        let provider = StaticSettings::default();
        provider.update(|s| {
            s.set_backup(BackupSettings::builder().backups_to_keep(1).build());
        });
        assert_eq!(*provider.load().await?.get_backup().get_backups_to_keep(), 1);
        Ok(())
    }
}
