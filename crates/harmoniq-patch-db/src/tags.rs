use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{Tag, TagType};

/// Tag diff for a single tag type.
///
/// A tag is never part of `added` and `removed` at the same time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tags {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    added: BTreeSet<Tag>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    removed: BTreeSet<Tag>,
}

impl Tags {
    pub fn add(&mut self, tag: impl Into<Tag>) -> bool {
        let tag = tag.into();
        let was_removed = self.removed.remove(&tag);
        self.added.insert(tag) || was_removed
    }

    pub fn add_removed(&mut self, tag: impl Into<Tag>) -> bool {
        let tag = tag.into();
        let was_added = self.added.remove(&tag);
        self.removed.insert(tag) || was_added
    }

    pub fn contains_added(&self, tag: &str) -> bool {
        self.added.contains(tag)
    }

    pub fn contains_removed(&self, tag: &str) -> bool {
        self.removed.contains(tag)
    }

    pub fn added(&self) -> &BTreeSet<Tag> {
        &self.added
    }

    pub fn removed(&self) -> &BTreeSet<Tag> {
        &self.removed
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Applies `diff` on top of this diff. Returns true if anything changed.
    pub fn apply(&mut self, diff: &Tags) -> bool {
        let mut changed = false;
        for tag in &diff.added {
            if !self.added.contains(tag) || self.removed.contains(tag) {
                self.add(tag.clone());
                changed = true;
            }
        }
        for tag in &diff.removed {
            if !self.removed.contains(tag) || self.added.contains(tag) {
                self.add_removed(tag.clone());
                changed = true;
            }
        }
        changed
    }
}

/// Tag diffs keyed by tag type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypedTags {
    tags: BTreeMap<TagType, Tags>,
}

impl TypedTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_added(ty: TagType, tag: impl Into<Tag>) -> Self {
        let mut tags = Self::new();
        tags.add(ty, tag);
        tags
    }

    pub fn with_removed(ty: TagType, tag: impl Into<Tag>) -> Self {
        let mut tags = Self::new();
        tags.add_removed(ty, tag);
        tags
    }

    pub fn add(&mut self, ty: TagType, tag: impl Into<Tag>) -> bool {
        self.tags.entry(ty).or_default().add(tag)
    }

    pub fn add_removed(&mut self, ty: TagType, tag: impl Into<Tag>) -> bool {
        self.tags.entry(ty).or_default().add_removed(tag)
    }

    pub fn get(&self, ty: TagType) -> Option<&Tags> {
        self.tags.get(&ty)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TagType, &Tags)> {
        self.tags.iter().map(|(ty, tags)| (*ty, tags))
    }

    pub fn contains_added(&self, ty: TagType, tag: &str) -> bool {
        self.tags
            .get(&ty)
            .map(|tags| tags.contains_added(tag))
            .unwrap_or(false)
    }

    pub fn contains_removed(&self, ty: TagType, tag: &str) -> bool {
        self.tags
            .get(&ty)
            .map(|tags| tags.contains_removed(tag))
            .unwrap_or(false)
    }

    pub fn has_added(&self) -> bool {
        self.tags.values().any(|tags| !tags.added.is_empty())
    }

    pub fn added(&self, ty: TagType) -> impl Iterator<Item = &Tag> {
        self.tags.get(&ty).into_iter().flat_map(|tags| tags.added.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.tags.values().all(Tags::is_empty)
    }

    /// Applies a tag diff. Returns true if anything changed.
    pub fn apply(&mut self, diff: &TypedTags) -> bool {
        let mut changed = false;
        for (ty, tags) in &diff.tags {
            if tags.is_empty() {
                continue;
            }
            if self.tags.entry(*ty).or_default().apply(tags) {
                changed = true;
            }
        }
        self.tags.retain(|_, tags| !tags.is_empty());
        changed
    }

    /// Turns every added tag into a removal, e.g. to take patches out of a
    /// tag filter they currently match.
    pub fn to_removed(&self) -> TypedTags {
        let mut result = TypedTags::new();
        for (ty, tags) in &self.tags {
            for tag in &tags.added {
                result.add_removed(*ty, tag.clone());
            }
        }
        result
    }

    /// Effective tags of something carrying `intrinsic` tags with this diff
    /// applied. The result only has added tags.
    pub fn resolve(&self, intrinsic: &TypedTags) -> TypedTags {
        let mut result = TypedTags::new();
        for (ty, tags) in &intrinsic.tags {
            for tag in &tags.added {
                if !self.contains_removed(*ty, tag) {
                    result.add(*ty, tag.clone());
                }
            }
        }
        for (ty, tags) in &self.tags {
            for tag in &tags.added {
                result.add(*ty, tag.clone());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn assert_disjoint(tags: &TypedTags) {
        for (_, t) in tags.iter() {
            assert!(t.added().is_disjoint(t.removed()));
        }
    }

    #[test]
    fn add_and_remove_stay_disjoint() {
        let mut tags = TypedTags::new();
        assert!(tags.add(TagType::Category, "Bass"));
        assert!(tags.add_removed(TagType::Category, "Bass"));
        assert!(!tags.contains_added(TagType::Category, "Bass"));
        assert!(tags.contains_removed(TagType::Category, "Bass"));
        assert!(!tags.add_removed(TagType::Category, "Bass"));
        assert_disjoint(&tags);
    }

    #[test]
    fn apply_reports_changes() {
        let mut tags = TypedTags::with_added(TagType::Tag, "Warm");
        assert!(!tags.apply(&TypedTags::with_added(TagType::Tag, "Warm")));
        assert!(tags.apply(&TypedTags::with_removed(TagType::Tag, "Warm")));
        assert!(tags.apply(&TypedTags::with_added(TagType::Favourites, "Live")));
        assert_disjoint(&tags);
        assert!(tags.contains_removed(TagType::Tag, "Warm"));
        assert!(tags.contains_added(TagType::Favourites, "Live"));
    }

    #[test]
    fn to_removed_converts_filters_into_removals() {
        let mut filter = TypedTags::with_added(TagType::Category, "Lead");
        filter.add(TagType::Tag, "Mono");
        let removal = filter.to_removed();
        assert!(!removal.has_added());
        assert!(removal.contains_removed(TagType::Category, "Lead"));
        assert!(removal.contains_removed(TagType::Tag, "Mono"));

        let mut overlay = TypedTags::with_added(TagType::Category, "Lead");
        overlay.apply(&removal);
        assert_disjoint(&overlay);
        assert!(!overlay.contains_added(TagType::Category, "Lead"));
    }

    #[test]
    fn resolve_applies_diff_to_intrinsic_tags() {
        let mut intrinsic = TypedTags::with_added(TagType::Category, "Pad");
        intrinsic.add(TagType::Category, "Strings");
        let mut diff = TypedTags::with_removed(TagType::Category, "Strings");
        diff.add(TagType::Favourites, "Set 1");
        let resolved = diff.resolve(&intrinsic);
        let categories: Vec<_> = resolved.added(TagType::Category).cloned().collect();
        assert_eq!(categories, vec!["Pad".to_string()]);
        assert!(resolved.contains_added(TagType::Favourites, "Set 1"));
    }

    #[test]
    fn serializes_by_tag_type_name() {
        let tags = TypedTags::with_added(TagType::Category, "Bass");
        let json = serde_json::to_value(&tags).unwrap();
        assert_eq!(json, serde_json::json!({ "Category": { "added": ["Bass"] } }));
        let back: TypedTags = serde_json::from_value(json).unwrap();
        assert_eq!(back, tags);
    }
}
