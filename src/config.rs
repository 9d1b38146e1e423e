//! Build-fixed constants and the mapped-file configuration.
//!
//! Backend choice is a compile-time decision made with cargo features (see
//! [`crate::backend`]). The only runtime knob is [`MmapConfig`], which controls
//! where the experimental mapped path puts its backing files. A process-wide
//! instance is fixed once, either explicitly through [`configure`] or lazily
//! from the environment on first use.

use std::{
    env,
    path::{Path, PathBuf},
    sync::OnceLock,
};

/// Elements per chunk used by [`crate::acquire_chunked`].
pub const SPMAT_CHUNKSIZE: usize = 256;

/// Minimum alignment, in bytes, of every non-empty buffer handed out by the
/// primary backends. Vectorised kernels rely on this.
pub const ALIGNMENT: usize = 16;

/// Size of a single zero-filling write when building a backing file.
pub const DEFAULT_BURST_BYTES: usize = 8 * 1024 * 1024;

/// Prefix of backing file names. The rest of the name is randomised.
pub const DEFAULT_FILE_PREFIX: &str = "armaMM.";

/// Environment variable overriding [`MmapConfig::directory`].
pub const ENV_MMAP_DIR: &str = "ARRAYMEM_MMAP_DIR";

/// Environment variable that turns on [`MmapConfig::remove_backing_file`]
/// when set to `1`, `true` or `yes`.
pub const ENV_MMAP_REMOVE: &str = "ARRAYMEM_MMAP_REMOVE";

/// Configuration of the file-backed mapping path.
///
/// Only consulted when the crate is built with the `mmap` feature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MmapConfig {
    /// Directory in which backing files are created. Should live on fast
    /// local storage.
    pub directory: PathBuf,
    /// File name prefix. A random suffix is appended to make names unique.
    pub file_prefix: String,
    /// Bytes written per zero-filling burst. Must be non-zero.
    pub burst_bytes: usize,
    /// Delete the backing file after its mapping has been released.
    ///
    /// Off by default: backing files are left on disk after unmapping.
    pub remove_backing_file: bool,
}

impl MmapConfig {
    /// Creates a configuration that puts backing files in `directory`, with
    /// default values for everything else.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            file_prefix: DEFAULT_FILE_PREFIX.to_owned(),
            burst_bytes: DEFAULT_BURST_BYTES,
            remove_backing_file: false,
        }
    }

    /// Builds a configuration from [`ENV_MMAP_DIR`] and [`ENV_MMAP_REMOVE`],
    /// falling back to the system temporary directory.
    pub fn from_env() -> Self {
        let directory = env::var_os(ENV_MMAP_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir);
        let remove_backing_file = env::var(ENV_MMAP_REMOVE)
            .map(|v| parse_flag(&v))
            .unwrap_or(false);

        Self {
            remove_backing_file,
            ..Self::new(directory)
        }
    }

    /// Sets whether backing files are deleted on release.
    pub fn with_remove_backing_file(mut self, remove: bool) -> Self {
        self.remove_backing_file = remove;
        self
    }

    /// Sets the zero-filling burst size.
    pub fn with_burst_bytes(mut self, burst_bytes: usize) -> Self {
        self.burst_bytes = burst_bytes;
        self
    }

    /// Checks the invariants the mapped path depends on.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.burst_bytes == 0 {
            return Err("burst_bytes must be non-zero");
        }
        if self.file_prefix.contains(std::path::MAIN_SEPARATOR) {
            return Err("file_prefix must not contain a path separator");
        }
        Ok(())
    }

    /// Directory backing files are created in.
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl Default for MmapConfig {
    fn default() -> Self {
        Self::new(env::temp_dir())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

static GLOBAL: OnceLock<MmapConfig> = OnceLock::new();

/// Installs the process-wide mapped-file configuration.
///
/// Succeeds only once. If a configuration is already in place (set earlier,
/// or created lazily by a previous [`global`] call) the rejected value is
/// handed back.
pub fn configure(config: MmapConfig) -> Result<(), MmapConfig> {
    GLOBAL.set(config)
}

/// Returns the process-wide mapped-file configuration, initialising it from
/// the environment if [`configure`] was never called.
pub fn global() -> &'static MmapConfig {
    GLOBAL.get_or_init(MmapConfig::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_backing_files() {
        let config = MmapConfig::new("/tmp");
        assert_eq!(config.file_prefix, DEFAULT_FILE_PREFIX);
        assert_eq!(config.burst_bytes, DEFAULT_BURST_BYTES);
        assert!(!config.remove_backing_file);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_overrides() {
        let config = MmapConfig::new("/tmp")
            .with_remove_backing_file(true)
            .with_burst_bytes(4096);
        assert!(config.remove_backing_file);
        assert_eq!(config.burst_bytes, 4096);
    }

    #[test]
    fn validate_rejects_zero_burst() {
        let config = MmapConfig::default().with_burst_bytes(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn flag_parsing() {
        assert!(parse_flag("1"));
        assert!(parse_flag(" TRUE "));
        assert!(parse_flag("yes"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn global_is_stable() {
        let first = global() as *const MmapConfig;
        let second = global() as *const MmapConfig;
        assert_eq!(first, second);
    }
}
