//! Collaborators the catalog calls out to: device specific decoding and the
//! file system.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::patch::{PatchHash, PatchInfo};
use crate::sysex::split_sysex;

/// Device specific knowledge about preset dumps.
pub trait SynthAdapter: Send + Sync {
    /// Preset `program` of ROM `bank`, `None` past the end of the bank.
    fn read_rom_patch(&self, _bank: u32, _program: u32) -> Option<Vec<u8>> {
        None
    }

    /// Name and intrinsic tags of a single preset, `None` if the bytes are
    /// not a preset of this device.
    fn decode(&self, sysex: &[u8]) -> Option<PatchInfo>;

    /// Individual presets contained in the bytes of a file.
    fn extract_patches(&self, data: &[u8]) -> Vec<Vec<u8>> {
        split_sysex(data)
    }
}

/// Accepts any sysex message and names it after its content hash.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawSysexAdapter;

impl SynthAdapter for RawSysexAdapter {
    fn decode(&self, sysex: &[u8]) -> Option<PatchInfo> {
        if sysex.len() < 2 {
            return None;
        }
        let hex = PatchHash::of(sysex).to_hex();
        Some(PatchInfo::named(format!("Patch {}", &hex[..8])))
    }
}

pub trait FileSystem: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn file_size(&self, path: &Path) -> io::Result<u64>;
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    fn copy(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove(&self, path: &Path) -> io::Result<()>;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    /// Direct children of `dir`, sorted by name.
    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;
    /// True if `path` can be written, or created if it does not exist yet.
    fn has_write_access(&self, path: &Path) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StdFileSystem;

impl FileSystem for StdFileSystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        fs::write(path, data)
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::copy(from, to).map(|_| ())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
            match entry {
                Ok(entry) => entries.push(entry.into_path()),
                Err(err) => tracing::debug!(dir = %dir.display(), "skipping entry: {err}"),
            }
        }
        Ok(entries)
    }

    fn has_write_access(&self, path: &Path) -> bool {
        match fs::metadata(path) {
            Ok(meta) => !meta.permissions().readonly(),
            Err(_) => path
                .parent()
                .map(|parent| if parent.as_os_str().is_empty() { Path::new(".") } else { parent })
                .and_then(|parent| fs::metadata(parent).ok())
                .map(|meta| meta.is_dir() && !meta.permissions().readonly())
                .unwrap_or(false),
        }
    }
}
