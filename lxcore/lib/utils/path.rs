use std::path::{Path, PathBuf};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The name of a container's native config file.
pub const CONFIG_FILENAME: &str = "config";

/// The directory holding a container's root filesystem.
pub const ROOTFS_SUBDIR: &str = "rootfs";

/// The directory holding a container's snapshots.
pub const SNAPS_SUBDIR: &str = "snaps";

/// The directory under the LXC root holding custom icons.
pub const CUSTOM_ICONS_SUBDIR: &str = "custom_icons";

/// The extension of custom icon files.
pub const ICON_EXTENSION: &str = "png";

/// The name a custom icon travels under inside a backup archive.
pub const BUNDLED_ICON_FILENAME: &str = ".lxcore_icon.png";

/// The file the container tool writes a snapshot's creation time to.
pub const SNAPSHOT_TIMESTAMP_FILENAME: &str = "ts";

/// The extension of backup archives.
pub const BACKUP_EXTENSION: &str = ".tar.xz";

/// The filename of the cached image index.
pub const IMAGE_INDEX_CACHE_FILENAME: &str = "lxc_images.json";

/// The temporary subvolume a directory-backed rootfs is copied into during conversion.
pub const CONVERT_SUBVOLUME_NAME: &str = "rootfs.btrfs";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns `<lxc root>/<name>`.
pub fn container_dir(lxc_root: &Path, name: &str) -> PathBuf {
    lxc_root.join(name)
}

/// Returns `<lxc root>/<name>/config`.
pub fn config_path(lxc_root: &Path, name: &str) -> PathBuf {
    container_dir(lxc_root, name).join(CONFIG_FILENAME)
}

/// Returns `<lxc root>/<name>/rootfs`.
pub fn rootfs_path(lxc_root: &Path, name: &str) -> PathBuf {
    container_dir(lxc_root, name).join(ROOTFS_SUBDIR)
}

/// Returns `<lxc root>/<name>/snaps`.
pub fn snapshots_dir(lxc_root: &Path, name: &str) -> PathBuf {
    container_dir(lxc_root, name).join(SNAPS_SUBDIR)
}

/// Returns `<lxc root>/<name>/snaps/<snapshot>`.
pub fn snapshot_dir(lxc_root: &Path, name: &str, snapshot: &str) -> PathBuf {
    snapshots_dir(lxc_root, name).join(snapshot)
}

/// Returns `<icons dir>/<name>.png`.
pub fn icon_path(icons_dir: &Path, name: &str) -> PathBuf {
    icons_dir.join(format!("{}.{}", name, ICON_EXTENSION))
}
