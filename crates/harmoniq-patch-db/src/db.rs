use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::config::PatchDbConfig;
use crate::datasource::{sort_by_program, DataSource, DataSourceNode, NodeId, SourceTree};
use crate::dirty::{Dirty, UiChannel};
use crate::error::PatchDbError;
use crate::host::{FileSystem, StdFileSystem, SynthAdapter};
use crate::key::PatchKey;
use crate::loader::{Loader, LoaderQueue};
use crate::modifications::PatchModifications;
use crate::patch::{Patch, PatchId, PatchPtr};
use crate::search::{
    matches_content, Search, SearchCallback, SearchRegistry, SearchRequest, SearchResults,
    SearchState,
};
use crate::store_json::{
    parse_index, parse_sidecar, write_atomic, write_json_atomic, DataSourceEntry, IndexFile,
    SidecarFile,
};
use crate::sysex::{join_sysex, sanitize_file_name, split_sysex};
use crate::tags::TypedTags;
use crate::types::{
    Color, DataSourceOrigin, SearchHandle, SourceType, Tag, TagType, INVALID_COLOR,
    INVALID_SEARCH_HANDLE,
};

type LoadListener = Arc<dyn Fn() + Send + Sync>;

/// Tag registry, tag colors and overlays waiting for their patch to show up.
#[derive(Debug, Default)]
struct PatchTables {
    tags: BTreeMap<TagType, BTreeSet<Tag>>,
    tag_colors: BTreeMap<TagType, BTreeMap<Tag, Color>>,
    pending: HashMap<PatchKey, PatchModifications>,
}

impl PatchTables {
    fn add_tag(&mut self, ty: TagType, tag: &str) -> bool {
        self.tags.entry(ty).or_default().insert(tag.to_string())
    }

    fn remove_tag(&mut self, ty: TagType, tag: &str) -> bool {
        self.tags
            .get_mut(&ty)
            .map(|tags| tags.remove(tag))
            .unwrap_or(false)
    }

    fn tag_color(&self, ty: TagType, tag: &str) -> Color {
        self.tag_colors
            .get(&ty)
            .and_then(|colors| colors.get(tag))
            .copied()
            .unwrap_or(INVALID_COLOR)
    }
}

struct DbShared {
    config: PatchDbConfig,
    adapter: Arc<dyn SynthAdapter>,
    fs: Arc<dyn FileSystem>,
    queue: LoaderQueue,
    sources: RwLock<SourceTree>,
    patches: RwLock<PatchTables>,
    searches: RwLock<SearchRegistry>,
    ui: UiChannel,
    loading: AtomicBool,
    next_search: AtomicU32,
    load_listener: Mutex<Option<LoadListener>>,
}

/// Catalog of patches from ROM banks, files, folders and local banks.
///
/// Mutations are queued on a single loader thread and return immediately.
/// Callers learn about their effect by polling [`PatchDb::ui_process`].
pub struct PatchDb {
    shared: Arc<DbShared>,
    loader: Loader,
}

impl PatchDb {
    pub fn open(
        config: PatchDbConfig,
        adapter: Arc<dyn SynthAdapter>,
    ) -> Result<Self, PatchDbError> {
        Self::open_with(config, adapter, Arc::new(StdFileSystem))
    }

    pub fn open_with(
        config: PatchDbConfig,
        adapter: Arc<dyn SynthAdapter>,
        fs: Arc<dyn FileSystem>,
    ) -> Result<Self, PatchDbError> {
        fs.create_dir_all(&config.settings_dir)?;

        let mut loader = Loader::new();
        let shared = Arc::new(DbShared {
            queue: loader.queue(),
            config,
            adapter,
            fs,
            sources: RwLock::new(SourceTree::new()),
            patches: RwLock::new(PatchTables::default()),
            searches: RwLock::new(SearchRegistry::default()),
            ui: UiChannel::default(),
            loading: AtomicBool::new(true),
            next_search: AtomicU32::new(0),
            load_listener: Mutex::new(None),
        });

        let weak = Arc::downgrade(&shared);
        loader.start(&shared.config.loader_thread_name, move || {
            if let Some(shared) = weak.upgrade() {
                shared.on_loader_idle();
            }
        })?;

        tracing::info!(dir = %shared.config.settings_dir.display(), "opening patch database");
        shared.submit(|db| {
            if !db.load_json() {
                tracing::warn!("patch index loaded with errors");
            }
        });

        Ok(Self { shared, loader })
    }

    pub fn config(&self) -> &PatchDbConfig {
        &self.shared.config
    }

    /// Queues loading of `source`. Adding a source that already exists never
    /// duplicates it or its patches.
    pub fn add_data_source(&self, source: DataSource) -> bool {
        if !source.is_valid() {
            return false;
        }
        let needs_save = source.is_manual() && source.source_type != SourceType::Rom;
        self.shared.submit(move |db| {
            db.add_source(source, None);
            if needs_save {
                db.save_json();
            }
        })
    }

    pub fn remove_data_source(&self, source: DataSource) -> bool {
        self.shared.submit(move |db| {
            db.remove_source(&source, true);
            db.save_json();
        })
    }

    /// Renames a local bank. Empty names and names of other local banks are
    /// rejected.
    pub fn rename_data_source(&self, source: DataSource, new_name: impl Into<String>) -> bool {
        let new_name = new_name.into();
        if source.source_type != SourceType::LocalStorage || new_name.is_empty() {
            return false;
        }
        self.shared.submit(move |db| db.rename_source(&source, &new_name))
    }

    /// Drops and reloads `source` and everything that was discovered below it.
    pub fn refresh_data_source(&self, source: DataSource) -> bool {
        self.shared.submit(move |db| db.refresh_source(&source))
    }

    pub fn data_sources(&self) -> Vec<DataSource> {
        let tree = self.shared.sources.read();
        let mut sources: Vec<_> = tree.nodes().map(|node| node.source().clone()).collect();
        sources.sort();
        sources
    }

    /// Read access to the source tree. Keep `f` short, the loader waits for it.
    pub fn with_sources<R>(&self, f: impl FnOnce(&SourceTree) -> R) -> R {
        f(&*self.shared.sources.read())
    }

    /// Patches of `source` in program order.
    pub fn patches(&self, source: &DataSource) -> Vec<PatchPtr> {
        self.shared
            .sources
            .read()
            .node(source)
            .map(DataSourceNode::patches_by_program)
            .unwrap_or_default()
    }

    pub fn data_source_of(&self, patch: &Patch) -> Option<DataSource> {
        self.shared
            .sources
            .read()
            .source_of(patch)
            .map(|node| node.source().clone())
    }

    pub fn search(&self, request: SearchRequest) -> SearchHandle {
        self.start_search(request, None)
    }

    /// Like [`PatchDb::search`]; `callback` runs inside [`PatchDb::ui_process`]
    /// once the search completed.
    pub fn search_with_callback(
        &self,
        request: SearchRequest,
        callback: impl Fn(&Search) + Send + Sync + 'static,
    ) -> SearchHandle {
        self.start_search(request, Some(Arc::new(callback)))
    }

    /// Searches every source for patches with the same content as `patch`.
    pub fn find_data_source_for_patch(
        &self,
        patch: PatchPtr,
        callback: impl Fn(&Search) + Send + Sync + 'static,
    ) -> SearchHandle {
        self.search_with_callback(SearchRequest::for_patch(patch), callback)
    }

    fn start_search(&self, request: SearchRequest, callback: Option<SearchCallback>) -> SearchHandle {
        let handle = self.shared.allocate_search_handle();
        let search = Arc::new(Search::new(handle, request, callback));
        self.shared
            .searches
            .write()
            .active
            .insert(handle, Arc::clone(&search));
        self.shared.submit(move |db| db.execute_search(&search));
        handle
    }

    pub fn cancel_search(&self, handle: SearchHandle) {
        let mut searches = self.shared.searches.write();
        if let Some(search) = searches.active.remove(&handle) {
            if search.cancel() {
                searches.cancelled.insert(handle);
            }
        }
    }

    pub fn get_search(&self, handle: SearchHandle) -> Option<Arc<Search>> {
        self.shared.searches.read().active.get(&handle).cloned()
    }

    /// Active search restricted to exactly `source`, if there is one.
    pub fn get_search_for_source(&self, source: &DataSource) -> Option<Arc<Search>> {
        self.shared
            .searches
            .read()
            .live()
            .find(|search| search.request().source.as_ref() == Some(source))
            .cloned()
    }

    /// Applies a tag diff to the overlays of `patches`.
    pub fn modify_tags(&self, patches: &[PatchPtr], diff: &TypedTags) -> bool {
        if diff.is_empty() || patches.is_empty() {
            return false;
        }
        let patches = patches.to_vec();
        let diff = diff.clone();
        self.shared.submit(move |db| db.modify_tags(&patches, &diff))
    }

    pub fn rename_patch(&self, patch: &PatchPtr, name: impl Into<String>) -> bool {
        let name = name.into();
        if name.is_empty() || patch.name() == name {
            return false;
        }
        let patch = Arc::clone(patch);
        self.shared.submit(move |db| db.rename_patch(&patch, name))
    }

    /// Overwrites the content of a patch in a local bank with that of `new`.
    pub fn replace_patch(&self, existing: &PatchPtr, new: &PatchPtr) -> bool {
        if existing.id() == new.id() || !new.is_valid() {
            return false;
        }
        if self.local_bank_of(existing).is_none() {
            return false;
        }
        let existing = Arc::clone(existing);
        let new = Arc::clone(new);
        self.shared.submit(move |db| db.replace_patch(&existing, &new))
    }

    /// Copies `patches` into the local bank `target`, inserting them at
    /// `insert_at` or appending them.
    pub fn copy_patches_to(
        &self,
        target: &DataSource,
        patches: &[PatchPtr],
        insert_at: Option<u32>,
    ) -> bool {
        if target.source_type != SourceType::LocalStorage || patches.is_empty() {
            return false;
        }
        let target = target.clone();
        let patches = patches.to_vec();
        self.shared
            .submit(move |db| db.copy_patches_to(&target, &patches, insert_at))
    }

    /// Deletes patches from a local bank. Their overlays are dropped.
    pub fn remove_patches(&self, source: &DataSource, patches: &[PatchPtr]) -> bool {
        if source.source_type != SourceType::LocalStorage || patches.is_empty() {
            return false;
        }
        let source = source.clone();
        let patches = patches.to_vec();
        self.shared
            .submit(move |db| db.remove_patches(&source, &patches))
    }

    /// Reorders patches of a local bank so they start at `position`.
    pub fn move_patches_to(&self, position: u32, patches: &[PatchPtr]) -> bool {
        let Some(first) = patches.first() else {
            return false;
        };
        if self.local_bank_of(first).is_none() {
            return false;
        }
        let patches = patches.to_vec();
        self.shared
            .submit(move |db| db.move_patches_to(position, &patches))
    }

    fn local_bank_of(&self, patch: &Patch) -> Option<DataSource> {
        self.data_source_of(patch)
            .filter(|source| source.source_type == SourceType::LocalStorage)
    }

    pub fn add_tag(&self, ty: TagType, tag: impl Into<Tag>) -> bool {
        let tag = tag.into();
        if tag.is_empty() || !self.shared.patches.write().add_tag(ty, &tag) {
            return false;
        }
        self.shared.ui.tag_changed(ty);
        self.save();
        true
    }

    pub fn remove_tag(&self, ty: TagType, tag: &str) -> bool {
        if !self.shared.patches.write().remove_tag(ty, tag) {
            return false;
        }
        self.shared.ui.tag_changed(ty);
        self.save();
        true
    }

    pub fn tags(&self, ty: TagType) -> BTreeSet<Tag> {
        self.shared
            .patches
            .read()
            .tags
            .get(&ty)
            .cloned()
            .unwrap_or_default()
    }

    pub fn tag_color(&self, ty: TagType, tag: &str) -> Color {
        self.shared.patches.read().tag_color(ty, tag)
    }

    /// Sets the color of a tag, [`INVALID_COLOR`] removes it.
    pub fn set_tag_color(&self, ty: TagType, tag: &str, color: Color) -> bool {
        {
            let mut tables = self.shared.patches.write();
            if color == INVALID_COLOR {
                let removed = tables
                    .tag_colors
                    .get_mut(&ty)
                    .map(|colors| colors.remove(tag).is_some())
                    .unwrap_or(false);
                if !removed {
                    return false;
                }
            } else {
                let colors = tables.tag_colors.entry(ty).or_default();
                if colors.get(tag) == Some(&color) {
                    return false;
                }
                colors.insert(tag.to_string(), color);
            }
        }
        self.shared.ui.tag_changed(ty);
        self.save();
        true
    }

    /// Color of the first colored tag of `patch` that is not in `ignore`.
    pub fn patch_color(&self, patch: &Patch, ignore: &TypedTags) -> Color {
        let tags = patch.tags();
        let tables = self.shared.patches.read();
        for (ty, tags) in tags.iter() {
            for tag in tags.added() {
                if ignore.contains_added(ty, tag) {
                    continue;
                }
                let color = tables.tag_color(ty, tag);
                if color != INVALID_COLOR {
                    return color;
                }
            }
        }
        INVALID_COLOR
    }

    /// Writes the payloads of `patches` in the given order to `path`.
    pub fn export_patches(&self, path: &Path, patches: &[PatchPtr]) -> Result<(), PatchDbError> {
        let sysex: Vec<Vec<u8>> = patches.iter().map(|patch| patch.sysex()).collect();
        let data = join_sysex(sysex.iter().map(Vec::as_slice));
        write_atomic(self.shared.fs.as_ref(), path, &data)
    }

    /// Queues writing the index, sidecars and local banks.
    pub fn save(&self) -> bool {
        self.shared.submit(|db| {
            db.save_json();
        })
    }

    /// Everything that changed since the last call. Runs queued UI callbacks.
    pub fn ui_process(&self) -> Dirty {
        self.shared.ui.drain()
    }

    /// True until the loader ran dry for the first time after opening and
    /// [`PatchDb::ui_process`] picked that up.
    pub fn is_loading(&self) -> bool {
        self.shared.loading.load(Ordering::SeqCst)
    }

    /// Called from [`PatchDb::ui_process`] once loading finished.
    pub fn set_load_listener(&self, listener: impl Fn() + Send + Sync + 'static) {
        *self.shared.load_listener.lock() = Some(Arc::new(listener));
    }

    /// Blocks until all queued work ran.
    pub fn wait_for_loader(&self) -> Result<(), PatchDbError> {
        self.loader.wait_idle()
    }
}

impl DbShared {
    fn submit(self: &Arc<Self>, job: impl FnOnce(&Arc<DbShared>) + Send + 'static) -> bool {
        let db = Arc::clone(self);
        self.queue.submit(move || job(&db))
    }

    fn allocate_search_handle(&self) -> SearchHandle {
        loop {
            let handle = self.next_search.fetch_add(1, Ordering::Relaxed);
            if handle != INVALID_SEARCH_HANDLE {
                return handle;
            }
        }
    }

    fn on_loader_idle(self: &Arc<Self>) {
        if !self.loading.load(Ordering::SeqCst) {
            return;
        }
        let weak: Weak<DbShared> = Arc::downgrade(self);
        self.ui.run_on_ui(move || {
            let Some(db) = weak.upgrade() else {
                return;
            };
            if db.loading.swap(false, Ordering::SeqCst) {
                tracing::debug!("patch database finished loading");
                let listener = db.load_listener.lock().clone();
                if let Some(listener) = listener {
                    listener();
                }
            }
        });
    }

    fn add_source(self: &Arc<Self>, source: DataSource, parent: Option<NodeId>) {
        if self.merge_existing(&source, parent) {
            return;
        }

        if source.source_type == SourceType::Folder {
            let id = self.sources.write().insert(source.clone(), parent);
            self.ui.data_sources_changed();
            self.scan_folder(id, &source);
            return;
        }

        let patches = self.load_patches(&source);
        if patches.is_empty() && !source.is_manual() {
            return;
        }
        let sidecar = if patches.is_empty() {
            Vec::new()
        } else {
            self.read_sidecar(&source)
        };

        let mut tree = self.sources.write();
        let id = tree.insert(source.clone(), parent);
        if let Some(node) = tree.get_mut(id) {
            for patch in &patches {
                node.insert_patch(Arc::clone(patch));
            }
        }
        self.ui.data_sources_changed();
        tracing::debug!(%source, patches = patches.len(), "data source added");

        if patches.is_empty() {
            return;
        }
        self.attach_sidecar(&source, &patches, sidecar);
        self.add_patches(&tree, &patches, true);
    }

    /// Reconciles `source` with an equal node that already exists. Returns
    /// true if nothing is left to load.
    fn merge_existing(&self, source: &DataSource, parent: Option<NodeId>) -> bool {
        let mut tree = self.sources.write();
        if let Some(parent) = parent {
            if !tree.contains(parent) {
                tracing::debug!(%source, "parent data source is gone, skipping");
                return true;
            }
        }
        let Some(existing) = tree.find(source) else {
            return false;
        };
        let changed = if source.is_manual() {
            tree.set_origin(existing, DataSourceOrigin::Manual)
        } else {
            match parent {
                Some(parent) if !tree.has_parent(existing) && !tree.is_within(parent, existing) => {
                    tree.set_parent(existing, parent)
                }
                _ => false,
            }
        };
        if changed {
            self.ui.data_sources_changed();
        }
        true
    }

    fn scan_folder(self: &Arc<Self>, id: NodeId, folder: &DataSource) {
        let dir = self.config.resolve(&folder.name);
        let entries = match self.fs.list_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::debug!(dir = %dir.display(), "failed to list folder: {err}");
                return;
            }
        };
        for path in entries {
            let source_type = if self.fs.is_dir(&path) {
                SourceType::Folder
            } else {
                SourceType::File
            };
            let child = DataSource::new(source_type, path.to_string_lossy()).autogenerated();
            self.submit(move |db| db.add_source(child, Some(id)));
        }
    }

    fn load_patches(&self, source: &DataSource) -> Vec<PatchPtr> {
        self.load_data(source)
            .into_iter()
            .enumerate()
            .filter_map(|(program, sysex)| {
                let info = self.adapter.decode(&sysex)?;
                let patch = Patch::new(sysex, info);
                if !patch.is_valid() {
                    return None;
                }
                patch.set_program(program as u32);
                Some(Arc::new(patch))
            })
            .collect()
    }

    fn load_data(&self, source: &DataSource) -> Vec<Vec<u8>> {
        match source.source_type {
            SourceType::Rom => {
                let bank = source.bank.unwrap_or(0);
                let mut data = Vec::new();
                while let Some(sysex) = self.adapter.read_rom_patch(bank, data.len() as u32) {
                    data.push(sysex);
                }
                data
            }
            SourceType::File => {
                let path = self.config.resolve(&source.name);
                match self.fs.file_size(&path) {
                    Ok(size) if size > 0 && size < self.config.max_file_size => {}
                    Ok(size) => {
                        tracing::debug!(path = %path.display(), size, "skipping file");
                        return Vec::new();
                    }
                    Err(err) => {
                        tracing::debug!(path = %path.display(), "skipping file: {err}");
                        return Vec::new();
                    }
                }
                match self.fs.read(&path) {
                    Ok(data) if !data.is_empty() => self.adapter.extract_patches(&data),
                    Ok(_) => Vec::new(),
                    Err(err) => {
                        tracing::debug!(path = %path.display(), "failed to read file: {err}");
                        Vec::new()
                    }
                }
            }
            SourceType::LocalStorage => {
                let path = self.local_storage_path(source);
                if !self.fs.exists(&path) {
                    return Vec::new();
                }
                match self.fs.read(&path) {
                    Ok(data) => split_sysex(&data),
                    Err(err) => {
                        tracing::warn!(path = %path.display(), "failed to read local bank: {err}");
                        Vec::new()
                    }
                }
            }
            SourceType::Folder | SourceType::Invalid => Vec::new(),
        }
    }

    fn read_sidecar(&self, source: &DataSource) -> Vec<(PatchKey, PatchModifications)> {
        let Some(path) = self.sidecar_path(source) else {
            return Vec::new();
        };
        if !self.fs.exists(&path) {
            return Vec::new();
        }
        let parsed = self
            .fs
            .read(&path)
            .map_err(PatchDbError::from)
            .and_then(|data| parse_sidecar(&data, source));
        match parsed {
            Ok((mods, skipped)) => {
                if skipped > 0 {
                    tracing::warn!(path = %path.display(), skipped, "skipped malformed patch modifications");
                }
                mods
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), "failed to load patch modifications: {err}");
                Vec::new()
            }
        }
    }

    /// Attaches sidecar overlays. Overlays without a matching patch are kept
    /// as pending so they survive the next save.
    fn attach_sidecar(
        &self,
        source: &DataSource,
        patches: &[PatchPtr],
        mods: Vec<(PatchKey, PatchModifications)>,
    ) {
        if mods.is_empty() {
            return;
        }
        let mut mods: HashMap<PatchKey, PatchModifications> = mods.into_iter().collect();
        let mut tables = self.patches.write();
        for patch in patches {
            if let Some(m) = mods.remove(&PatchKey::for_patch(source, patch)) {
                patch.attach_modifications(m);
            }
        }
        tables.pending.extend(mods);
    }

    /// Registers freshly attached patches: pending overlays, known tags and
    /// live searches.
    fn add_patches(&self, tree: &SourceTree, patches: &[PatchPtr], reattach: bool) {
        let mut tables = self.patches.write();
        for patch in patches {
            if reattach {
                if let Some(mods) = tree.key_for(patch).and_then(|key| tables.pending.remove(&key)) {
                    patch.attach_modifications(mods);
                }
            }
            let tags = patch.tags();
            for (ty, tags) in tags.iter() {
                for tag in tags.added() {
                    if tables.add_tag(ty, tag) {
                        self.ui.tag_changed(ty);
                    }
                }
            }
        }
        self.update_searches(tree, patches);
    }

    fn update_searches(&self, tree: &SourceTree, patches: &[PatchPtr]) {
        let searches = self.searches.read();
        let dirty: Vec<SearchHandle> = searches
            .live()
            .filter(|search| search.update(patches, tree))
            .map(|search| search.handle())
            .collect();
        if !dirty.is_empty() {
            self.ui.searches_changed(dirty);
        }
    }

    fn remove_from_searches(&self, patches: &[PatchPtr]) -> bool {
        let searches = self.searches.read();
        let dirty: Vec<SearchHandle> = searches
            .live()
            .filter(|search| search.remove_results(patches))
            .map(|search| search.handle())
            .collect();
        let changed = !dirty.is_empty();
        if changed {
            self.ui.searches_changed(dirty);
        }
        changed
    }

    fn remove_source(&self, source: &DataSource, demote: bool) {
        let mut tree = self.sources.write();
        let Some(id) = tree.find(source) else {
            return;
        };

        let manual = tree.get(id).map(|node| node.source().is_manual()).unwrap_or(false);
        if demote && manual && tree.has_parent(id) {
            tree.set_origin(id, DataSourceOrigin::Autogenerated);
            self.ui.data_sources_changed();
            return;
        }

        let ids = tree.collect_removal(id);
        let removed = tree.remove_nodes(&ids);
        let sources = removed.len();

        let mut patches = Vec::new();
        {
            let mut tables = self.patches.write();
            for mut node in removed {
                for patch in node.take_patches() {
                    let key = PatchKey::for_patch(node.source(), &patch);
                    if let Some(mods) = patch.detach_modifications() {
                        tables.pending.insert(key, mods);
                    }
                    patch.set_source(None);
                    patches.push(patch);
                }
            }
        }

        self.remove_from_searches(&patches);
        self.ui.data_sources_changed();
        if !patches.is_empty() {
            self.ui.patches_changed();
        }
        tracing::debug!(%source, sources, patches = patches.len(), "data source removed");
    }

    fn refresh_source(self: &Arc<Self>, source: &DataSource) {
        let (source, parent) = {
            let tree = self.sources.read();
            let Some(node) = tree.node(source) else {
                return;
            };
            (node.source().clone(), tree.parent_of(node.id()).map(DataSourceNode::id))
        };
        self.remove_source(&source, false);
        self.add_source(source, parent);
    }

    fn rename_source(&self, source: &DataSource, new_name: &str) {
        {
            let mut tree = self.sources.write();
            let Some(id) = tree.find(source) else {
                return;
            };
            if source.name == new_name {
                return;
            }
            let taken = tree.nodes().any(|node| {
                node.source().source_type == SourceType::LocalStorage && node.source().name == new_name
            });
            if taken {
                return;
            }
            tree.rename(id, new_name);
        }
        self.ui.data_sources_changed();

        if !self.save_json() {
            return;
        }
        let renamed = DataSource::local_storage(new_name);
        let stale = [
            (self.local_storage_path(source), self.local_storage_path(&renamed)),
            (self.local_sidecar_path(source), self.local_sidecar_path(&renamed)),
        ];
        for (old, new) in stale {
            if old != new {
                if let Err(err) = self.fs.remove(&old) {
                    tracing::warn!(path = %old.display(), "failed to remove old local bank file: {err}");
                }
            }
        }
    }

    fn execute_search(&self, search: &Arc<Search>) {
        let handle = search.handle();
        search.set_state(SearchState::Running);

        let tree = self.sources.read();

        if let Some(target) = &search.request().patch {
            let results: SearchResults = tree
                .nodes()
                .flat_map(|node| node.patches().iter())
                .filter(|patch| matches_content(patch, target))
                .cloned()
                .collect();
            search.replace_results(results);
            self.finish_search(search);
            return;
        }

        let request = search.request();
        let candidates: Vec<NodeId> = match (&request.source, request.source_type) {
            (Some(source), _) => match tree.find(source) {
                Some(id) if source.source_type == SourceType::Folder => tree.subtree(id),
                Some(id) => vec![id],
                None => Vec::new(),
            },
            (None, Some(source_type)) => tree
                .nodes()
                .filter(|node| node.source().source_type == source_type)
                .map(DataSourceNode::id)
                .collect(),
            (None, None) => tree.nodes().map(DataSourceNode::id).collect(),
        };

        if self.searches.write().take_cancelled(handle) {
            self.cancelled_search(search);
            return;
        }
        for id in candidates {
            if self.searches.write().take_cancelled(handle) {
                self.cancelled_search(search);
                return;
            }
            let Some(node) = tree.get(id) else {
                continue;
            };
            for patch in node.patches() {
                if request.matches(patch, &tree) {
                    search.insert_result(Arc::clone(patch));
                }
            }
        }
        self.finish_search(search);
    }

    fn cancelled_search(&self, search: &Search) {
        search.set_state(SearchState::Cancelled);
        self.ui.search_changed(search.handle());
    }

    fn finish_search(&self, search: &Arc<Search>) {
        let state = search.finish();
        self.searches.write().cancelled.remove(&search.handle());
        self.ui.search_changed(search.handle());
        if state != SearchState::Completed {
            return;
        }
        if let Some(callback) = search.callback() {
            let search = Arc::clone(search);
            self.ui.run_on_ui(move || callback(&search));
        }
    }

    fn modify_tags(&self, patches: &[PatchPtr], diff: &TypedTags) {
        let changed = {
            let tree = self.sources.read();
            let mut tables = self.patches.write();
            let changed: Vec<PatchPtr> = patches
                .iter()
                .filter(|patch| tree.source_of(patch).is_some())
                .filter(|patch| patch.modify(|mods| mods.modify_tags(diff)))
                .cloned()
                .collect();
            for (ty, tags) in diff.iter() {
                for tag in tags.added() {
                    if tables.add_tag(ty, tag) {
                        self.ui.tag_changed(ty);
                    }
                }
            }
            if !changed.is_empty() {
                self.update_searches(&tree, &changed);
            }
            !changed.is_empty()
        };
        if changed {
            self.save_json();
        }
    }

    fn rename_patch(&self, patch: &PatchPtr, name: String) {
        {
            let tree = self.sources.read();
            if tree.source_of(patch).is_none() {
                return;
            }
            let _tables = self.patches.write();
            if !patch.modify(|mods| mods.set_name(name)) {
                return;
            }
            self.update_searches(&tree, std::slice::from_ref(patch));
        }
        self.ui.patches_changed();
        self.save_json();
    }

    fn replace_patch(&self, existing: &PatchPtr, new: &Patch) {
        {
            let tree = self.sources.read();
            let local = tree
                .source_of(existing)
                .map(|node| node.source().source_type == SourceType::LocalStorage)
                .unwrap_or(false);
            if !local {
                return;
            }
            let _tables = self.patches.write();
            existing.replace_data(new);
            self.update_searches(&tree, std::slice::from_ref(existing));
        }
        self.ui.patches_changed();
        self.save_json();
    }

    fn copy_patches_to(&self, target: &DataSource, patches: &[PatchPtr], insert_at: Option<u32>) {
        {
            let mut tree = self.sources.write();
            let Some(id) = tree.find(target) else {
                return;
            };
            let Some(node) = tree.get(id) else {
                return;
            };

            let mut seen: HashSet<PatchId> = HashSet::new();
            let to_add: Vec<&PatchPtr> = patches
                .iter()
                .filter(|patch| !node.contains(patch) && seen.insert(patch.id()))
                .collect();
            if to_add.is_empty() {
                return;
            }

            let next = node.next_program();
            let mut program = insert_at.map(|row| row.min(next)).unwrap_or(next);
            node.make_space_for_new_patches(program, to_add.len() as u32);

            let copies: Vec<PatchPtr> = to_add
                .into_iter()
                .map(|patch| {
                    let copy = Arc::new(patch.create_copy());
                    copy.set_program(program);
                    program += 1;
                    copy
                })
                .collect();

            if let Some(node) = tree.get_mut(id) {
                for copy in &copies {
                    node.insert_patch(Arc::clone(copy));
                }
                node.create_consecutive_program_numbers();
            }

            self.add_patches(&tree, &copies, false);
        }
        self.ui.patches_changed();
        self.save_json();
    }

    fn remove_patches(&self, source: &DataSource, patches: &[PatchPtr]) {
        let removed: Vec<PatchPtr> = {
            let mut tree = self.sources.write();
            let Some(node) = tree.find(source).and_then(|id| tree.get_mut(id)) else {
                return;
            };
            let _tables = self.patches.write();
            let removed: Vec<PatchPtr> = patches
                .iter()
                .filter(|patch| node.remove_patch(patch))
                .cloned()
                .collect();
            // Overlays are keyed by program, which must match the slot in the saved blob.
            node.create_consecutive_program_numbers();
            removed
        };
        if removed.is_empty() {
            return;
        }
        for patch in &removed {
            patch.set_source(None);
        }
        self.remove_from_searches(&removed);
        self.ui.patches_changed();
        self.save_json();
    }

    fn move_patches_to(&self, position: u32, patches: &[PatchPtr]) {
        {
            let tree = self.sources.read();
            let Some(node) = patches.first().and_then(|first| tree.source_of(first)) else {
                return;
            };
            if node.source().source_type != SourceType::LocalStorage {
                return;
            }
            let _tables = self.patches.write();
            if !node.move_patches_to(position, patches) {
                return;
            }
        }
        self.ui.data_sources_changed();
        self.save_json();
    }

    fn load_json(self: &Arc<Self>) -> bool {
        let path = self.config.index_path();
        if !self.fs.exists(&path) {
            return true;
        }
        let contents = match self
            .fs
            .read(&path)
            .map_err(PatchDbError::from)
            .and_then(|data| parse_index(&data))
        {
            Ok(contents) => contents,
            Err(err) => {
                tracing::warn!(path = %path.display(), "failed to load patch index: {err}");
                return false;
            }
        };

        {
            let mut tables = self.patches.write();
            for (ty, tags) in contents.tags {
                tables.tags.entry(ty).or_default().extend(tags);
                self.ui.tag_changed(ty);
            }
            for (ty, colors) in contents.tag_colors {
                tables.tag_colors.insert(ty, colors);
                self.ui.tag_changed(ty);
            }
            tables.pending.extend(contents.patches);
        }

        for source in contents.datasources {
            self.add_source(source, None);
        }

        contents.skipped == 0
    }

    /// Writes local banks, sidecars and the index. Failures end up in the
    /// dirty error list.
    fn save_json(&self) -> bool {
        let index = {
            let tree = self.sources.read();
            let tables = self.patches.read();

            let mut patches: BTreeMap<String, PatchModifications> = tables
                .pending
                .iter()
                .map(|(key, mods)| (key.to_full_string(), mods.clone()))
                .collect();

            let mut nodes: Vec<&DataSourceNode> = tree.nodes().collect();
            nodes.sort_by(|a, b| a.source().cmp(b.source()));

            let mut datasources = Vec::new();
            for node in nodes {
                if !self.save_sidecar(node) {
                    for patch in node.patches() {
                        if let Some(mods) = patch.modifications().filter(|m| !m.is_empty()) {
                            let key = PatchKey::for_patch(node.source(), patch);
                            patches.insert(key.to_full_string(), mods);
                        }
                    }
                }
                let source = node.source();
                if source.is_manual() && source.source_type != SourceType::Rom {
                    datasources.push(DataSourceEntry::from_source(source));
                }
            }

            self.save_local_storage(&tree);

            IndexFile {
                datasources,
                tags: tables
                    .tags
                    .iter()
                    .filter(|(_, tags)| !tags.is_empty())
                    .map(|(ty, tags)| (*ty, tags.clone()))
                    .collect(),
                tag_colors: tables
                    .tag_colors
                    .iter()
                    .filter(|(_, colors)| !colors.is_empty())
                    .map(|(ty, colors)| (*ty, colors.clone()))
                    .collect(),
                patches,
            }
        };

        match write_json_atomic(self.fs.as_ref(), &self.config.index_path(), &index) {
            Ok(()) => true,
            Err(err) => {
                self.ui.push_error(err.to_string());
                false
            }
        }
    }

    /// Writes the overlays of `node` next to its data. Returns false if they
    /// have to go into the index instead.
    fn save_sidecar(&self, node: &DataSourceNode) -> bool {
        let Some(path) = self.sidecar_path(node.source()) else {
            return node.patches().is_empty();
        };
        if !self.fs.has_write_access(&path) {
            tracing::debug!(path = %path.display(), "sidecar not writable, using index");
            return false;
        }

        let patches: BTreeMap<String, PatchModifications> = node
            .patches()
            .iter()
            .filter_map(|patch| {
                let mods = patch.modifications().filter(|m| !m.is_empty())?;
                let key = PatchKey::for_patch(node.source(), patch);
                Some((key.to_relative_string(), mods))
            })
            .collect();

        if patches.is_empty() {
            if let Err(err) = self.fs.remove(&path) {
                tracing::warn!(path = %path.display(), "failed to remove sidecar: {err}");
            }
            return true;
        }

        match write_json_atomic(self.fs.as_ref(), &path, &SidecarFile { patches }) {
            Ok(()) => true,
            Err(err) => {
                self.ui.push_error(err.to_string());
                false
            }
        }
    }

    fn save_local_storage(&self, tree: &SourceTree) -> bool {
        let mut ok = true;
        for node in tree.nodes() {
            if node.source().source_type != SourceType::LocalStorage {
                continue;
            }
            let path = self.local_storage_path(node.source());
            if node.patches().is_empty() {
                if let Err(err) = self.fs.remove(&path) {
                    tracing::warn!(path = %path.display(), "failed to remove empty local bank: {err}");
                }
                continue;
            }
            let mut patches: Vec<PatchPtr> = node.patches().iter().cloned().collect();
            sort_by_program(&mut patches);
            let sysex: Vec<Vec<u8>> = patches.iter().map(|patch| patch.sysex()).collect();
            let data = join_sysex(sysex.iter().map(Vec::as_slice));
            if let Err(err) = write_atomic(self.fs.as_ref(), &path, &data) {
                self.ui.push_error(err.to_string());
                ok = false;
            }
        }
        ok
    }

    fn local_storage_path(&self, source: &DataSource) -> PathBuf {
        self.config
            .settings_dir
            .join(format!("{}.syx", sanitize_file_name(&source.name)))
    }

    fn local_sidecar_path(&self, source: &DataSource) -> PathBuf {
        self.config
            .settings_dir
            .join(format!("{}.syx.json", sanitize_file_name(&source.name)))
    }

    fn sidecar_path(&self, source: &DataSource) -> Option<PathBuf> {
        match source.source_type {
            SourceType::LocalStorage => Some(self.local_sidecar_path(source)),
            SourceType::File => Some(self.config.resolve(format!("{}.json", source.name))),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use crossbeam_channel::bounded;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::host::RawSysexAdapter;

    fn open(dir: &Path) -> PatchDb {
        PatchDb::open(PatchDbConfig::in_dir(dir), Arc::new(RawSysexAdapter)).unwrap()
    }

    #[test]
    fn cancelled_search_never_completes() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        db.add_data_source(DataSource::local_storage("Bank"));

        let (release, blocked) = bounded::<()>(0);
        db.shared.queue.submit(move || {
            let _ = blocked.recv();
        });

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = db.search_with_callback(SearchRequest::default(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let search = db.get_search(handle).unwrap();
        assert_eq!(search.state(), SearchState::Pending);

        db.cancel_search(handle);
        assert!(db.get_search(handle).is_none());
        release.send(()).unwrap();
        db.wait_for_loader().unwrap();

        let dirty = db.ui_process();
        assert_eq!(search.state(), SearchState::Cancelled);
        assert!(dirty.searches.contains(&handle));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(db.shared.searches.read().cancelled.is_empty());
    }

    #[test]
    fn completion_callback_runs_once_on_ui_poll() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = db.search_with_callback(SearchRequest::default(), move |search| {
            assert!(search.is_completed());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        db.wait_for_loader().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let dirty = db.ui_process();
        assert!(dirty.searches.contains(&handle));
        db.ui_process();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn load_listener_fires_after_initial_load() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        db.set_load_listener(move || flag.store(true, Ordering::SeqCst));

        db.wait_for_loader().unwrap();
        assert!(db.is_loading());
        db.ui_process();
        assert!(!db.is_loading());
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn tag_registry_and_colors() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        assert!(db.add_tag(TagType::Category, "Bass"));
        assert!(!db.add_tag(TagType::Category, "Bass"));
        assert!(db.set_tag_color(TagType::Category, "Bass", 0xff0000));
        assert!(!db.set_tag_color(TagType::Category, "Bass", 0xff0000));
        assert_eq!(db.tag_color(TagType::Category, "Bass"), 0xff0000);

        let patch = Patch::new(
            vec![0xf0, 1, 0xf7],
            crate::patch::PatchInfo {
                name: "Sub".into(),
                tags: TypedTags::with_added(TagType::Category, "Bass"),
            },
        );
        assert_eq!(db.patch_color(&patch, &TypedTags::new()), 0xff0000);
        assert_eq!(
            db.patch_color(&patch, &TypedTags::with_added(TagType::Category, "Bass")),
            INVALID_COLOR
        );

        assert!(db.set_tag_color(TagType::Category, "Bass", INVALID_COLOR));
        assert!(db.remove_tag(TagType::Category, "Bass"));
        assert!(db.tags(TagType::Category).is_empty());
        let dirty = db.ui_process();
        assert!(dirty.tags.contains(&TagType::Category));
    }

    #[test]
    fn contract_violations_are_rejected_up_front() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        let file = DataSource::file("x.syx");
        assert!(!db.rename_data_source(file.clone(), "y"));
        assert!(!db.rename_data_source(DataSource::local_storage("A"), ""));
        assert!(!db.copy_patches_to(&file, &[], None));
        assert!(!db.remove_patches(&file, &[]));
        assert!(!db.move_patches_to(0, &[]));
        assert!(!db.modify_tags(&[], &TypedTags::with_added(TagType::Tag, "x")));
        assert!(!db.add_data_source(DataSource::default()));
    }
}
