use serde::{Deserialize, Serialize};

use crate::tags::TypedTags;

/// User edits layered over a patch: a name override and a tag diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchModifications {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "TypedTags::is_empty")]
    pub tags: TypedTags,
}

impl PatchModifications {
    /// Nothing worth persisting.
    pub fn is_empty(&self) -> bool {
        self.name().is_none() && self.tags.is_empty()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.is_empty())
    }

    pub fn set_name(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        if self.name.as_deref() == Some(name.as_str()) {
            return false;
        }
        self.name = Some(name);
        true
    }

    pub fn clear_name(&mut self) -> bool {
        self.name.take().is_some()
    }

    pub fn modify_tags(&mut self, diff: &TypedTags) -> bool {
        self.tags.apply(diff)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::TagType;

    #[test]
    fn empty_name_counts_as_no_override() {
        let mut mods = PatchModifications::default();
        assert!(mods.is_empty());
        mods.name = Some(String::new());
        assert!(mods.is_empty());
        assert!(mods.set_name("Lead 2"));
        assert!(!mods.set_name("Lead 2"));
        assert_eq!(mods.name(), Some("Lead 2"));
        assert!(mods.clear_name());
        assert!(mods.is_empty());
    }

    #[test]
    fn serialized_form_omits_empty_fields() {
        let mut mods = PatchModifications::default();
        mods.modify_tags(&TypedTags::with_added(TagType::Category, "Keys"));
        let json = serde_json::to_value(&mods).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "tags": { "Category": { "added": ["Keys"] } } })
        );
    }

    #[test]
    fn tolerates_unknown_fields() {
        let mods: PatchModifications =
            serde_json::from_str(r#"{ "name": "Pad", "rating": 5 }"#).unwrap();
        assert_eq!(mods.name(), Some("Pad"));
    }
}
