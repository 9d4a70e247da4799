use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::datasource::DataSource;
use crate::error::PatchDbError;
use crate::host::FileSystem;
use crate::key::PatchKey;
use crate::modifications::PatchModifications;
use crate::types::{Color, SourceType, Tag, TagType, INVALID_COLOR};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceEntry {
    #[serde(rename = "type")]
    pub source_type: String,
    pub name: String,
}

impl DataSourceEntry {
    pub fn from_source(source: &DataSource) -> Self {
        Self {
            source_type: source.source_type.to_string(),
            name: source.name.clone(),
        }
    }

    pub fn to_source(&self) -> DataSource {
        let source_type = self.source_type.parse::<SourceType>().unwrap_or_default();
        DataSource::new(source_type, self.name.clone())
    }
}

/// On-disk layout of the global index file.
#[derive(Debug, Default, Serialize)]
pub(crate) struct IndexFile {
    pub datasources: Vec<DataSourceEntry>,
    pub tags: BTreeMap<TagType, BTreeSet<Tag>>,
    #[serde(rename = "tagColors")]
    pub tag_colors: BTreeMap<TagType, BTreeMap<Tag, Color>>,
    pub patches: BTreeMap<String, PatchModifications>,
}

/// Overlays of a single source, keyed by the source relative patch key.
#[derive(Debug, Default, Serialize)]
pub(crate) struct SidecarFile {
    pub patches: BTreeMap<String, PatchModifications>,
}

/// Index file contents after validation. Entries that could not be
/// understood are counted in `skipped`.
#[derive(Debug, Default)]
pub(crate) struct IndexContents {
    pub datasources: Vec<DataSource>,
    pub tags: BTreeMap<TagType, BTreeSet<Tag>>,
    pub tag_colors: BTreeMap<TagType, BTreeMap<Tag, Color>>,
    pub patches: Vec<(PatchKey, PatchModifications)>,
    pub skipped: usize,
}

pub(crate) fn parse_index(data: &[u8]) -> Result<IndexContents, PatchDbError> {
    let root: Value = serde_json::from_slice(data)?;
    let mut contents = IndexContents::default();

    if let Some(datasources) = root.get("datasources").and_then(Value::as_array) {
        for entry in datasources {
            match serde_json::from_value::<DataSourceEntry>(entry.clone()) {
                Ok(entry) => {
                    let source = entry.to_source();
                    if source.is_valid() {
                        contents.datasources.push(source);
                        continue;
                    }
                    tracing::warn!(%source, "unexpected data source in patch index");
                }
                Err(err) => tracing::warn!("unreadable data source entry: {err}"),
            }
            contents.skipped += 1;
        }
    }

    if let Some(tags) = root.get("tags").and_then(Value::as_object) {
        for (ty, value) in tags {
            let (Some(ty), Some(list)) = (TagType::parse(ty), value.as_array()) else {
                tracing::warn!(tag_type = %ty, "unexpected tag list in patch index");
                contents.skipped += 1;
                continue;
            };
            let entry = contents.tags.entry(ty).or_default();
            entry.extend(list.iter().filter_map(Value::as_str).map(str::to_string));
        }
    }

    if let Some(colors) = root.get("tagColors").and_then(Value::as_object) {
        for (ty, value) in colors {
            let (Some(ty), Some(map)) = (TagType::parse(ty), value.as_object()) else {
                tracing::warn!(tag_type = %ty, "unexpected tag colors in patch index");
                contents.skipped += 1;
                continue;
            };
            let entry = contents.tag_colors.entry(ty).or_default();
            for (tag, color) in map {
                let color = color.as_u64().and_then(|c| Color::try_from(c).ok());
                match color {
                    Some(color) if !tag.is_empty() && color != INVALID_COLOR => {
                        entry.insert(tag.clone(), color);
                    }
                    _ => tracing::debug!(%tag, "ignoring invalid tag color"),
                }
            }
        }
    }

    if let Some(patches) = root.get("patches").and_then(Value::as_object) {
        contents.skipped += parse_modifications(patches, None, &mut contents.patches);
    }

    Ok(contents)
}

/// Overlays stored in a source's sidecar file.
pub(crate) fn parse_sidecar(
    data: &[u8],
    source: &DataSource,
) -> Result<(Vec<(PatchKey, PatchModifications)>, usize), PatchDbError> {
    let root: Value = serde_json::from_slice(data)?;
    let mut result = Vec::new();
    let skipped = match root.get("patches").and_then(Value::as_object) {
        Some(patches) => parse_modifications(patches, Some(source), &mut result),
        None => 0,
    };
    Ok((result, skipped))
}

fn parse_modifications(
    patches: &serde_json::Map<String, Value>,
    source: Option<&DataSource>,
    out: &mut Vec<(PatchKey, PatchModifications)>,
) -> usize {
    let mut skipped = 0;
    for (key, value) in patches {
        let parsed = match source {
            Some(source) => PatchKey::parse_relative(key, source),
            None => PatchKey::parse_full(key),
        };
        let Some(parsed) = parsed else {
            tracing::warn!(%key, "failed to parse patch key");
            skipped += 1;
            continue;
        };
        match serde_json::from_value::<PatchModifications>(value.clone()) {
            Ok(mods) if !mods.is_empty() => out.push((parsed, mods)),
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(%key, "failed to parse patch modifications: {err}");
                skipped += 1;
            }
        }
    }
    skipped
}

/// Sibling used while replacing `target`, `<target>_tmp.<ext>`.
pub(crate) fn temp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push("_tmp.");
    name.push(target.extension().unwrap_or_else(|| "tmp".as_ref()));
    target.with_file_name(name)
}

/// Writes `data` next to `target` first and copies it over afterwards, so a
/// failure never leaves a half written target behind.
pub(crate) fn write_atomic(
    fs: &dyn FileSystem,
    target: &Path,
    data: &[u8],
) -> Result<(), PatchDbError> {
    if !fs.has_write_access(target) {
        return Err(PatchDbError::NoWriteAccess(target.to_path_buf()));
    }
    let temp = temp_path(target);
    if !fs.has_write_access(&temp) {
        return Err(PatchDbError::NoWriteAccess(temp));
    }
    if let Err(err) = fs.write(&temp, data) {
        tracing::debug!(path = %temp.display(), "write failed: {err}");
        let _ = fs.remove(&temp);
        return Err(PatchDbError::WriteFailed(temp));
    }
    if let Err(err) = fs.copy(&temp, target) {
        tracing::debug!(path = %target.display(), "copy failed: {err}");
        let _ = fs.remove(&temp);
        return Err(PatchDbError::CopyFailed {
            from: temp,
            to: target.to_path_buf(),
        });
    }
    if let Err(err) = fs.remove(&temp) {
        tracing::debug!(path = %temp.display(), "failed to remove temp file: {err}");
    }
    Ok(())
}

pub(crate) fn write_json_atomic<T: Serialize>(
    fs: &dyn FileSystem,
    target: &Path,
    value: &T,
) -> Result<(), PatchDbError> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(fs, target, &json)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io;

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::host::StdFileSystem;
    use crate::key::PatchSlot;
    use crate::tags::TypedTags;

    struct NoCopy;

    impl FileSystem for NoCopy {
        fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
            StdFileSystem.read(path)
        }
        fn file_size(&self, path: &Path) -> io::Result<u64> {
            StdFileSystem.file_size(path)
        }
        fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
            StdFileSystem.write(path, data)
        }
        fn copy(&self, _from: &Path, _to: &Path) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
        fn remove(&self, path: &Path) -> io::Result<()> {
            StdFileSystem.remove(path)
        }
        fn create_dir_all(&self, path: &Path) -> io::Result<()> {
            StdFileSystem.create_dir_all(path)
        }
        fn exists(&self, path: &Path) -> bool {
            StdFileSystem.exists(path)
        }
        fn is_dir(&self, path: &Path) -> bool {
            StdFileSystem.is_dir(path)
        }
        fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
            StdFileSystem.list_dir(dir)
        }
        fn has_write_access(&self, path: &Path) -> bool {
            StdFileSystem.has_write_access(path)
        }
    }

    #[test]
    fn temp_name_keeps_extension() {
        assert_eq!(
            temp_path(Path::new("/x/patchdb.json")),
            PathBuf::from("/x/patchdb.json_tmp.json")
        );
        assert_eq!(
            temp_path(Path::new("/x/Bank.syx")),
            PathBuf::from("/x/Bank.syx_tmp.syx")
        );
    }

    #[test]
    fn atomic_write_replaces_target_and_cleans_up() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("patchdb.json");
        fs::write(&target, b"old").unwrap();
        write_atomic(&StdFileSystem, &target, b"new").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"new");
        assert!(!temp_path(&target).exists());
    }

    #[test]
    fn failed_copy_leaves_target_untouched() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("patchdb.json");
        fs::write(&target, b"old").unwrap();
        let err = write_atomic(&NoCopy, &target, b"new").unwrap_err();
        assert!(matches!(err, PatchDbError::CopyFailed { .. }));
        assert_eq!(fs::read(&target).unwrap(), b"old");
        assert!(!temp_path(&target).exists());
    }

    #[test]
    fn index_parsing_skips_malformed_entries() {
        let json = br#"{
            "datasources": [
                { "type": "folder", "name": "/presets" },
                { "type": "bogus", "name": "x" },
                { "name": "missing type" }
            ],
            "tags": { "Category": ["Bass", "Lead"], "Nope": ["x"] },
            "tagColors": { "Category": { "Bass": 16711680, "Lead": 0 } },
            "patches": {
                "p3|localstorage||Favourites": { "name": "Renamed" },
                "garbage": { "name": "x" }
            },
            "unknown": true
        }"#;
        let contents = parse_index(json).unwrap();
        assert_eq!(contents.datasources, vec![DataSource::folder("/presets")]);
        assert_eq!(contents.skipped, 4);
        assert_eq!(contents.tags[&TagType::Category].len(), 2);
        assert_eq!(contents.tag_colors[&TagType::Category].len(), 1);
        assert_eq!(contents.patches.len(), 1);
        assert_eq!(contents.patches[0].0.slot, PatchSlot::Program(3));
        assert_eq!(contents.patches[0].1.name(), Some("Renamed"));
    }

    #[test]
    fn index_file_serializes_with_expected_field_names() {
        let mut index = IndexFile::default();
        index
            .datasources
            .push(DataSourceEntry::from_source(&DataSource::local_storage("Favourites")));
        index
            .tag_colors
            .entry(TagType::Category)
            .or_default()
            .insert("Bass".into(), 0xff0000);
        index.patches.insert(
            "p0|localstorage||Favourites".into(),
            PatchModifications {
                name: None,
                tags: TypedTags::with_added(TagType::Tag, "Dark"),
            },
        );
        let value = serde_json::to_value(&index).unwrap();
        assert_eq!(value["datasources"][0]["type"], "localstorage");
        assert_eq!(value["tagColors"]["Category"]["Bass"], 0xff0000);
        assert_eq!(
            value["patches"]["p0|localstorage||Favourites"]["tags"]["Tag"]["added"][0],
            "Dark"
        );
    }
}
