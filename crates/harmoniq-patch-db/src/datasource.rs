use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::key::PatchKey;
use crate::patch::{Patch, PatchId, PatchPtr};
use crate::types::{DataSourceOrigin, SourceType};

/// Identity of a place patches come from.
///
/// Equality, hashing and ordering only look at type, name and bank. The
/// origin is bookkeeping and may change over the lifetime of a node.
#[derive(Debug, Clone, Default)]
pub struct DataSource {
    pub source_type: SourceType,
    pub name: String,
    pub origin: DataSourceOrigin,
    pub bank: Option<u32>,
}

impl DataSource {
    pub fn new(source_type: SourceType, name: impl Into<String>) -> Self {
        Self {
            source_type,
            name: name.into(),
            origin: DataSourceOrigin::Manual,
            bank: None,
        }
    }

    pub fn rom(bank: u32, name: impl Into<String>) -> Self {
        Self {
            bank: Some(bank),
            ..Self::new(SourceType::Rom, name)
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self::new(SourceType::File, path)
    }

    pub fn folder(path: impl Into<String>) -> Self {
        Self::new(SourceType::Folder, path)
    }

    pub fn local_storage(name: impl Into<String>) -> Self {
        Self::new(SourceType::LocalStorage, name)
    }

    pub fn autogenerated(mut self) -> Self {
        self.origin = DataSourceOrigin::Autogenerated;
        self
    }

    pub fn is_manual(&self) -> bool {
        self.origin == DataSourceOrigin::Manual
    }

    pub fn is_valid(&self) -> bool {
        self.source_type != SourceType::Invalid && !self.name.is_empty()
    }
}

impl PartialEq for DataSource {
    fn eq(&self, other: &Self) -> bool {
        self.source_type == other.source_type
            && self.name == other.name
            && self.bank == other.bank
    }
}

impl Eq for DataSource {}

impl Hash for DataSource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source_type.hash(state);
        self.name.hash(state);
        self.bank.hash(state);
    }
}

impl PartialOrd for DataSource {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DataSource {
    fn cmp(&self, other: &Self) -> Ordering {
        self.source_type
            .cmp(&other.source_type)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.bank.cmp(&other.bank))
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bank {
            Some(bank) => write!(f, "{} '{}' (bank {bank})", self.source_type, self.name),
            None => write!(f, "{} '{}'", self.source_type, self.name),
        }
    }
}

/// Stable handle of a node in the [`SourceTree`]. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

#[derive(Debug)]
pub struct DataSourceNode {
    id: NodeId,
    source: DataSource,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    patches: HashSet<PatchPtr>,
}

impl DataSourceNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn source(&self) -> &DataSource {
        &self.source
    }

    /// Parent handle. It may refer to a node that no longer exists; use
    /// [`SourceTree::parent_of`] to resolve it.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn patches(&self) -> &HashSet<PatchPtr> {
        &self.patches
    }

    pub fn contains(&self, patch: &Patch) -> bool {
        self.patches.iter().any(|p| p.id() == patch.id())
    }

    /// Adds a patch and points it at this node.
    pub(crate) fn insert_patch(&mut self, patch: PatchPtr) -> bool {
        patch.set_source(Some(self.id));
        self.patches.insert(patch)
    }

    pub(crate) fn remove_patch(&mut self, patch: &PatchPtr) -> bool {
        self.patches.remove(patch)
    }

    pub(crate) fn take_patches(&mut self) -> Vec<PatchPtr> {
        self.patches.drain().collect()
    }

    pub fn max_program(&self) -> Option<u32> {
        self.patches.iter().map(|p| p.program()).max()
    }

    pub fn next_program(&self) -> u32 {
        self.max_program().map(|max| max + 1).unwrap_or(0)
    }

    pub fn patches_by_program(&self) -> Vec<PatchPtr> {
        let mut patches: Vec<_> = self.patches.iter().cloned().collect();
        sort_by_program(&mut patches);
        patches
    }

    /// Shifts every patch at or after `start` up by `count` slots.
    pub(crate) fn make_space_for_new_patches(&self, start: u32, count: u32) {
        for patch in &self.patches {
            let program = patch.program();
            if program >= start {
                patch.set_program(program + count);
            }
        }
    }

    /// Renumbers patches `0..n` keeping their order. Returns true if any
    /// program changed.
    pub(crate) fn create_consecutive_program_numbers(&self) -> bool {
        let mut changed = false;
        for (index, patch) in self.patches_by_program().iter().enumerate() {
            let program = index as u32;
            if patch.program() != program {
                patch.set_program(program);
                changed = true;
            }
        }
        changed
    }

    /// Moves `patches` so that they start at slot `position`, in the given
    /// order. Fails if any of them is not part of this node.
    pub(crate) fn move_patches_to(&self, position: u32, patches: &[PatchPtr]) -> bool {
        if patches.is_empty() || patches.iter().any(|p| !self.patches.contains(p)) {
            return false;
        }

        let moving: HashSet<PatchId> = patches.iter().map(|p| p.id()).collect();
        let mut ordered = self.patches_by_program();
        let insert_at = ordered
            .iter()
            .filter(|p| p.program() < position && !moving.contains(&p.id()))
            .count();
        ordered.retain(|p| !moving.contains(&p.id()));

        let mut seen = HashSet::new();
        let moved: Vec<PatchPtr> = patches
            .iter()
            .filter(|p| seen.insert(p.id()))
            .cloned()
            .collect();
        ordered.splice(insert_at..insert_at, moved);

        for (index, patch) in ordered.iter().enumerate() {
            patch.set_program(index as u32);
        }
        true
    }
}

pub fn sort_by_program(patches: &mut [PatchPtr]) {
    patches.sort_by(|a, b| {
        a.program()
            .cmp(&b.program())
            .then_with(|| a.id().cmp(&b.id()))
    });
}

/// Arena of data source nodes.
///
/// Parents own their children through the child list; a child only keeps a
/// navigational handle to its parent.
#[derive(Debug, Default)]
pub struct SourceTree {
    nodes: HashMap<NodeId, DataSourceNode>,
    index: HashMap<DataSource, NodeId>,
    next_id: u64,
}

impl SourceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find(&self, source: &DataSource) -> Option<NodeId> {
        self.index.get(source).copied()
    }

    pub fn get(&self, id: NodeId) -> Option<&DataSourceNode> {
        self.nodes.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut DataSourceNode> {
        self.nodes.get_mut(&id)
    }

    pub fn node(&self, source: &DataSource) -> Option<&DataSourceNode> {
        self.find(source).and_then(|id| self.get(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &DataSourceNode> {
        self.nodes.values()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Resolved parent, if it is still alive.
    pub fn parent_of(&self, id: NodeId) -> Option<&DataSourceNode> {
        self.get(id)
            .and_then(|node| node.parent)
            .and_then(|parent| self.get(parent))
    }

    pub fn has_parent(&self, id: NodeId) -> bool {
        self.parent_of(id).is_some()
    }

    pub(crate) fn insert(&mut self, source: DataSource, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        let parent = parent.filter(|parent| self.nodes.contains_key(parent));
        self.index.insert(source.clone(), id);
        self.nodes.insert(
            id,
            DataSourceNode {
                id,
                source,
                parent: None,
                children: Vec::new(),
                patches: HashSet::new(),
            },
        );
        if let Some(parent) = parent {
            self.set_parent(id, parent);
        }
        id
    }

    pub(crate) fn set_parent(&mut self, id: NodeId, parent: NodeId) -> bool {
        if id == parent || !self.nodes.contains_key(&id) || !self.nodes.contains_key(&parent) {
            return false;
        }
        if let Some(old) = self.nodes.get(&id).and_then(|node| node.parent) {
            if let Some(old_parent) = self.nodes.get_mut(&old) {
                old_parent.children.retain(|child| *child != id);
            }
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = Some(parent);
        }
        if let Some(parent) = self.nodes.get_mut(&parent) {
            if !parent.children.contains(&id) {
                parent.children.push(id);
            }
        }
        true
    }

    pub(crate) fn set_origin(&mut self, id: NodeId, origin: DataSourceOrigin) -> bool {
        match self.nodes.get_mut(&id) {
            Some(node) if node.source.origin != origin => {
                node.source.origin = origin;
                true
            }
            _ => false,
        }
    }

    /// Changes the name and thereby the identity of a node.
    pub(crate) fn rename(&mut self, id: NodeId, name: &str) -> bool {
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };
        self.index.remove(&node.source);
        node.source.name = name.to_string();
        self.index.insert(node.source.clone(), id);
        true
    }

    /// The node plus every autogenerated descendant, not descending into
    /// manually added children.
    pub fn collect_removal(&self, id: NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        if !self.nodes.contains_key(&id) {
            return result;
        }
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            result.push(current);
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            for child in &node.children {
                match self.nodes.get(child) {
                    Some(c) if !c.source.is_manual() && !result.contains(child) => {
                        stack.push(*child)
                    }
                    _ => {}
                }
            }
        }
        result
    }

    /// Erases the given nodes and severs every link touching them.
    pub(crate) fn remove_nodes(&mut self, ids: &[NodeId]) -> Vec<DataSourceNode> {
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = self.nodes.remove(id) {
                self.index.remove(&node.source);
                removed.push(node);
            }
        }
        for node in &removed {
            if let Some(parent) = node.parent.and_then(|p| self.nodes.get_mut(&p)) {
                parent.children.retain(|child| *child != node.id);
            }
            for child in &node.children {
                if let Some(child) = self.nodes.get_mut(child) {
                    child.parent = None;
                }
            }
        }
        for node in &mut removed {
            node.parent = None;
            node.children.clear();
        }
        removed
    }

    /// True if `id` is `ancestor` or lives somewhere below it.
    pub fn is_within(&self, id: NodeId, ancestor: NodeId) -> bool {
        let mut current = Some(id);
        let mut hops = 0;
        while let Some(node_id) = current {
            if node_id == ancestor {
                return true;
            }
            hops += 1;
            if hops > self.nodes.len() {
                return false;
            }
            current = self.nodes.get(&node_id).and_then(|node| node.parent);
        }
        false
    }

    /// `id` and all of its descendants.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            if result.contains(&current) {
                continue;
            }
            result.push(current);
            stack.extend(node.children.iter().copied());
        }
        result
    }

    /// Source of a patch, if the patch is still attached to a live node.
    pub fn source_of(&self, patch: &Patch) -> Option<&DataSourceNode> {
        let node = self.get(patch.source()?)?;
        node.contains(patch).then_some(node)
    }

    pub fn key_for(&self, patch: &Patch) -> Option<PatchKey> {
        let node = self.get(patch.source()?)?;
        Some(PatchKey::for_patch(&node.source, patch))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::patch::PatchInfo;

    fn hash_of(source: &DataSource) -> u64 {
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        hasher.finish()
    }

    fn patch(program: u32) -> PatchPtr {
        let p = Arc::new(Patch::new(vec![0xf0, program as u8, 0xf7], PatchInfo::named("P")));
        p.set_program(program);
        p
    }

    #[test]
    fn equality_ignores_origin() {
        let manual = DataSource::file("/tmp/a.syx");
        let auto = DataSource::file("/tmp/a.syx").autogenerated();
        assert_eq!(manual, auto);
        assert_eq!(hash_of(&manual), hash_of(&auto));
        assert_ne!(DataSource::rom(0, "ROM"), DataSource::rom(1, "ROM"));
        assert_ne!(DataSource::file("x"), DataSource::folder("x"));
    }

    #[test]
    fn removal_stops_at_manual_children() {
        let mut tree = SourceTree::new();
        let root = tree.insert(DataSource::folder("/presets"), None);
        let auto_child = tree.insert(DataSource::folder("/presets/a").autogenerated(), Some(root));
        let grandchild = tree.insert(DataSource::file("/presets/a/x.syx").autogenerated(), Some(auto_child));
        let manual_child = tree.insert(DataSource::file("/presets/b.syx"), Some(root));
        let below_manual = tree.insert(DataSource::file("/presets/b/c.syx").autogenerated(), Some(manual_child));

        let mut ids = tree.collect_removal(root);
        ids.sort();
        assert_eq!(ids, vec![root, auto_child, grandchild]);

        tree.remove_nodes(&ids);
        assert_eq!(tree.len(), 2);
        assert!(!tree.has_parent(manual_child));
        assert!(tree.has_parent(below_manual));
        assert!(tree.find(&DataSource::folder("/presets")).is_none());
    }

    #[test]
    fn rename_reindexes_node() {
        let mut tree = SourceTree::new();
        let id = tree.insert(DataSource::local_storage("User"), None);
        assert!(tree.rename(id, "Favourites"));
        assert_eq!(tree.find(&DataSource::local_storage("Favourites")), Some(id));
        assert!(tree.find(&DataSource::local_storage("User")).is_none());
    }

    #[test]
    fn is_within_follows_parent_chain() {
        let mut tree = SourceTree::new();
        let root = tree.insert(DataSource::folder("/r"), None);
        let child = tree.insert(DataSource::folder("/r/c").autogenerated(), Some(root));
        let leaf = tree.insert(DataSource::file("/r/c/l.syx").autogenerated(), Some(child));
        let other = tree.insert(DataSource::file("/o.syx"), None);
        assert!(tree.is_within(leaf, root));
        assert!(!tree.is_within(other, root));
        assert_eq!(tree.subtree(root).len(), 3);
    }

    #[test]
    fn program_bookkeeping() {
        let mut tree = SourceTree::new();
        let id = tree.insert(DataSource::local_storage("Bank"), None);
        let patches: Vec<_> = (0..4).map(patch).collect();
        let node = tree.get_mut(id).unwrap();
        for p in &patches {
            node.insert_patch(Arc::clone(p));
        }
        assert_eq!(node.next_program(), 4);

        node.make_space_for_new_patches(1, 2);
        let programs: Vec<_> = node.patches_by_program().iter().map(|p| p.program()).collect();
        assert_eq!(programs, vec![0, 3, 4, 5]);
        assert!(node.create_consecutive_program_numbers());
        assert_eq!(patches[3].program(), 3);

        assert!(node.move_patches_to(0, &[Arc::clone(&patches[3])]));
        let order: Vec<_> = node.patches_by_program().iter().map(|p| p.id()).collect();
        assert_eq!(
            order,
            vec![patches[3].id(), patches[0].id(), patches[1].id(), patches[2].id()]
        );

        let stranger = patch(9);
        assert!(!node.move_patches_to(0, &[stranger]));
    }
}
