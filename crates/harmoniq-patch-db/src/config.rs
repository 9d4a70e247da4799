use std::path::{Path, PathBuf};

/// Files larger than this are not scanned for patches.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchDbConfig {
    /// Directory holding the index, local banks and their sidecars.
    pub settings_dir: PathBuf,
    pub index_file_name: String,
    pub max_file_size: u64,
    pub loader_thread_name: String,
}

impl PatchDbConfig {
    pub fn in_dir(settings_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings_dir: settings_dir.into(),
            ..Self::default()
        }
    }

    pub fn default_settings_dir() -> PathBuf {
        let mut dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        dir.push("HarmoniqStudio");
        dir.push("patches");
        dir
    }

    pub fn index_path(&self) -> PathBuf {
        self.settings_dir.join(&self.index_file_name)
    }

    /// Relative paths are taken as relative to the settings directory.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.settings_dir.join(path)
        }
    }
}

impl Default for PatchDbConfig {
    fn default() -> Self {
        Self {
            settings_dir: Self::default_settings_dir(),
            index_file_name: "patchdb.json".to_string(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            loader_thread_name: "harmoniq-patch-loader".to_string(),
        }
    }
}
