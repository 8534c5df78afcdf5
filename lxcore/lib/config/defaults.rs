use std::{path::PathBuf, sync::LazyLock, time::Duration};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default root directory of LXC containers.
pub const DEFAULT_LXC_PATH: &str = "/var/lib/lxc";

/// The default cgroup v2 mount point.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// The cgroup directory prefix LXC uses for container payloads.
pub const DEFAULT_CGROUP_PREFIX: &str = "lxc.payload.";

/// The default settings file location.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/lxcore/lxcore.toml";

/// The environment variable that overrides the settings file location.
pub const CONFIG_FILE_ENV_VAR: &str = "LXCORE_CONFIG";

/// The number of backups kept per container when nothing else is configured.
pub const DEFAULT_BACKUPS_TO_KEEP: usize = 3;

/// The default xz compression level.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// The default compressor thread count. `0` means half of the host's logical CPUs.
pub const DEFAULT_THREADS: usize = 0;

/// The default image server.
pub const DEFAULT_IMAGE_SERVER: &str = "images.linuxcontainers.org";

/// The path of the simplestreams index on an image server.
pub const IMAGE_INDEX_PATH: &str = "/meta/simplestreams/v1/index.json";

/// How long a downloaded image index stays fresh.
pub const IMAGE_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// How long derived distribution/architecture metadata stays fresh.
pub const METADATA_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// The wall-clock window between the two CPU samples.
pub const CPU_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// The pause between stop and start during a restart.
pub const RESTART_PAUSE: Duration = Duration::from_secs(1);

/// How often a running backup checks its abort flag.
pub const ABORT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The upper bound on a single notification delivery.
pub const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(2);

/// The first host uid/gid of the unprivileged id map.
pub const UNPRIVILEGED_ID_OFFSET: u32 = 100000;

/// The size of the unprivileged id map.
pub const UNPRIVILEGED_ID_RANGE: u32 = 65536;

/// The MAC prefix LXC uses for generated interfaces.
pub const LXC_HWADDR_PREFIX: &str = "00:16:3e";

/// The directory where lxcore caches downloaded data.
pub static DEFAULT_CACHE_DIR: LazyLock<PathBuf> = LazyLock::new(|| {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/var/cache"))
        .join("lxcore")
});
