use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::datasource::NodeId;
use crate::modifications::PatchModifications;
use crate::tags::TypedTags;
use crate::types::{SYSEX_END, SYSEX_START};

pub type PatchPtr = Arc<Patch>;

static NEXT_PATCH_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PatchId(u64);

impl PatchId {
    fn next() -> Self {
        Self(NEXT_PATCH_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// SHA-256 digest of a patch payload.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PatchHash([u8; 32]);

impl PatchHash {
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PatchHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PatchHash({})", self.to_hex())
    }
}

impl fmt::Display for PatchHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for PatchHash {
    type Err = hex::FromHexError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(value, &mut bytes)?;
        Ok(Self(bytes))
    }
}

/// What a synth adapter decodes out of a raw payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchInfo {
    pub name: String,
    pub tags: TypedTags,
}

impl PatchInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: TypedTags::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct PatchState {
    sysex: Vec<u8>,
    hash: PatchHash,
    name: String,
    tags: TypedTags,
    program: u32,
    source: Option<NodeId>,
    modifications: Option<PatchModifications>,
}

/// A single preset.
///
/// Identity (`==`, `Hash`) is the object identity assigned at creation, so
/// two patches with identical content are still distinct set members. Use
/// [`equals`] for content comparison.
#[derive(Debug)]
pub struct Patch {
    id: PatchId,
    state: RwLock<PatchState>,
}

impl Patch {
    pub fn new(sysex: Vec<u8>, info: PatchInfo) -> Self {
        let hash = PatchHash::of(&sysex);
        Self {
            id: PatchId::next(),
            state: RwLock::new(PatchState {
                sysex,
                hash,
                name: info.name,
                tags: info.tags,
                program: 0,
                source: None,
                modifications: None,
            }),
        }
    }

    pub fn id(&self) -> PatchId {
        self.id
    }

    /// Display name: the user override if set, the decoded name otherwise.
    pub fn name(&self) -> String {
        let state = self.state.read();
        state
            .modifications
            .as_ref()
            .and_then(|mods| mods.name())
            .unwrap_or(&state.name)
            .to_string()
    }

    pub fn decoded_name(&self) -> String {
        self.state.read().name.clone()
    }

    /// Effective tags, intrinsic tags with the user overlay applied.
    pub fn tags(&self) -> TypedTags {
        let state = self.state.read();
        match &state.modifications {
            Some(mods) => mods.tags.resolve(&state.tags),
            None => state.tags.clone(),
        }
    }

    pub fn sysex(&self) -> Vec<u8> {
        self.state.read().sysex.clone()
    }

    pub fn with_sysex<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.state.read().sysex)
    }

    pub fn len(&self) -> usize {
        self.state.read().sysex.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hash(&self) -> PatchHash {
        self.state.read().hash
    }

    pub fn program(&self) -> u32 {
        self.state.read().program
    }

    pub fn source(&self) -> Option<NodeId> {
        self.state.read().source
    }

    pub fn modifications(&self) -> Option<PatchModifications> {
        self.state.read().modifications.clone()
    }

    pub fn has_modifications(&self) -> bool {
        self.state
            .read()
            .modifications
            .as_ref()
            .map(|mods| !mods.is_empty())
            .unwrap_or(false)
    }

    pub fn is_valid(&self) -> bool {
        let state = self.state.read();
        let name = state
            .modifications
            .as_ref()
            .and_then(|mods| mods.name())
            .unwrap_or(&state.name);
        !name.is_empty()
            && state.sysex.first() == Some(&SYSEX_START)
            && state.sysex.last() == Some(&SYSEX_END)
    }

    /// New patch with the same content and an independent copy of the
    /// overlay. It has no source; the caller assigns the program.
    pub fn create_copy(&self) -> Patch {
        let state = self.state.read();
        Patch {
            id: PatchId::next(),
            state: RwLock::new(PatchState {
                sysex: state.sysex.clone(),
                hash: state.hash,
                name: state.name.clone(),
                tags: state.tags.clone(),
                program: 0,
                source: None,
                modifications: state.modifications.clone(),
            }),
        }
    }

    pub(crate) fn set_program(&self, program: u32) {
        self.state.write().program = program;
    }

    pub(crate) fn set_source(&self, source: Option<NodeId>) {
        self.state.write().source = source;
    }

    /// Replaces payload and decoded data with those of `other`, keeping
    /// identity, slot and tag overlay. The name override is dropped since the
    /// new content carries its own name.
    pub(crate) fn replace_data(&self, other: &Patch) {
        let incoming = other.state.read().clone();
        let mut state = self.state.write();
        state.sysex = incoming.sysex;
        state.hash = incoming.hash;
        state.name = incoming.name;
        state.tags = incoming.tags;
        if let Some(mods) = state.modifications.as_mut() {
            mods.clear_name();
        }
        prune(&mut state.modifications);
    }

    /// Runs `f` on the overlay, creating it on demand and dropping it again
    /// if it ends up empty.
    pub(crate) fn modify<R>(&self, f: impl FnOnce(&mut PatchModifications) -> R) -> R {
        let mut state = self.state.write();
        let result = f(state.modifications.get_or_insert_with(Default::default));
        prune(&mut state.modifications);
        result
    }

    pub(crate) fn attach_modifications(&self, mods: PatchModifications) {
        let mut state = self.state.write();
        state.modifications = Some(mods);
        prune(&mut state.modifications);
    }

    /// The overlay if it has something worth keeping.
    pub(crate) fn detach_modifications(&self) -> Option<PatchModifications> {
        self.state
            .write()
            .modifications
            .take()
            .filter(|mods| !mods.is_empty())
    }
}

fn prune(mods: &mut Option<PatchModifications>) {
    if mods.as_ref().map(PatchModifications::is_empty).unwrap_or(false) {
        *mods = None;
    }
}

impl PartialEq for Patch {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Patch {}

impl Hash for Patch {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Content comparison used for de-duplication.
///
/// Same length and same name are required; the bytes decide.
pub fn equals(a: &Patch, b: &Patch) -> bool {
    if a.id == b.id {
        return true;
    }
    if a.len() != b.len() || a.name() != b.name() {
        return false;
    }
    let bytes = a.sysex();
    b.with_sysex(|other| other == bytes.as_slice())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::TagType;

    fn patch(name: &str, body: &[u8]) -> Patch {
        let mut sysex = vec![0xf0];
        sysex.extend_from_slice(body);
        sysex.push(0xf7);
        Patch::new(sysex, PatchInfo::named(name))
    }

    #[test]
    fn validity_requires_name_and_framing() {
        assert!(patch("Bass", &[1, 2]).is_valid());
        assert!(!patch("", &[1, 2]).is_valid());
        assert!(!Patch::new(vec![], PatchInfo::named("A")).is_valid());
        assert!(!Patch::new(vec![0xf0, 1], PatchInfo::named("A")).is_valid());
        assert!(!Patch::new(vec![1, 0xf7], PatchInfo::named("A")).is_valid());
    }

    #[test]
    fn name_override_wins_over_decoded_name() {
        let p = patch("Init", &[0]);
        assert!(!p.has_modifications());
        p.modify(|mods| mods.set_name("Growl"));
        assert!(p.has_modifications());
        assert_eq!(p.name(), "Growl");
        assert_eq!(p.decoded_name(), "Init");
        p.modify(|mods| mods.clear_name());
        assert_eq!(p.name(), "Init");
        assert!(p.modifications().is_none());
    }

    #[test]
    fn copies_have_new_identity_and_independent_overlay() {
        let original = patch("Pad", &[4, 5]);
        original.modify(|mods| mods.modify_tags(&TypedTags::with_added(TagType::Tag, "Dark")));
        let copy = original.create_copy();
        assert_ne!(copy.id(), original.id());
        assert_eq!(copy.hash(), original.hash());
        assert!(copy.tags().contains_added(TagType::Tag, "Dark"));

        copy.modify(|mods| mods.set_name("Pad Copy"));
        assert_eq!(original.name(), "Pad");
        assert_eq!(copy.name(), "Pad Copy");
    }

    #[test]
    fn replace_data_drops_name_override_but_keeps_tags() {
        let target = patch("Old", &[1]);
        target.modify(|mods| {
            mods.set_name("Renamed");
            mods.modify_tags(&TypedTags::with_added(TagType::Category, "Lead"))
        });
        let incoming = patch("New", &[2, 3]);
        target.replace_data(&incoming);
        assert_eq!(target.name(), "New");
        assert_eq!(target.hash(), incoming.hash());
        assert!(target.tags().contains_added(TagType::Category, "Lead"));
    }

    #[test]
    fn equals_requires_identical_bytes() {
        let a = patch("Same", &[1, 2, 3]);
        let b = patch("Same", &[1, 2, 3]);
        let c = patch("Same", &[1, 2, 4]);
        let d = patch("Other", &[1, 2, 3]);
        assert!(equals(&a, &b));
        assert!(!equals(&a, &c));
        assert!(!equals(&a, &d));
        assert_ne!(a, b);
    }

    #[test]
    fn hash_hex_roundtrip() {
        let hash = PatchHash::of(&[0xf0, 0xf7]);
        let parsed: PatchHash = hash.to_hex().parse().unwrap();
        assert_eq!(parsed, hash);
    }
}
