use std::fmt;

use crate::datasource::DataSource;
use crate::patch::{Patch, PatchHash};
use crate::types::SourceType;

/// Where inside its source a patch lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PatchSlot {
    Program(u32),
    Hash(PatchHash),
}

impl fmt::Display for PatchSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchSlot::Program(program) => write!(f, "p{program}"),
            PatchSlot::Hash(hash) => write!(f, "h{hash}"),
        }
    }
}

impl PatchSlot {
    fn parse(value: &str) -> Option<Self> {
        if let Some(program) = value.strip_prefix('p') {
            return program.parse().ok().map(PatchSlot::Program);
        }
        if let Some(hash) = value.strip_prefix('h') {
            return hash.parse().ok().map(PatchSlot::Hash);
        }
        None
    }
}

/// Identity of a patch that survives reloads.
///
/// ROM banks are addressed by content, files and local banks by program slot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PatchKey {
    pub source: DataSource,
    pub slot: PatchSlot,
}

impl PatchKey {
    pub fn for_patch(source: &DataSource, patch: &Patch) -> Self {
        let slot = match source.source_type {
            SourceType::Rom => PatchSlot::Hash(patch.hash()),
            _ => PatchSlot::Program(patch.program()),
        };
        Self {
            source: source.clone(),
            slot,
        }
    }

    /// Full form, `<slot>|<type>|<bank>|<name>`.
    pub fn to_full_string(&self) -> String {
        let bank = self
            .source
            .bank
            .map(|bank| bank.to_string())
            .unwrap_or_default();
        format!(
            "{}|{}|{}|{}",
            self.slot, self.source.source_type, bank, self.source.name
        )
    }

    /// Form used inside a source's sidecar file.
    pub fn to_relative_string(&self) -> String {
        self.slot.to_string()
    }

    pub fn parse_full(value: &str) -> Option<Self> {
        let mut parts = value.splitn(4, '|');
        let slot = PatchSlot::parse(parts.next()?)?;
        let source_type: SourceType = parts.next()?.parse().ok()?;
        let bank = match parts.next()? {
            "" => None,
            bank => Some(bank.parse().ok()?),
        };
        let name = parts.next()?;
        let source = DataSource {
            bank,
            ..DataSource::new(source_type, name)
        };
        if !source.is_valid() {
            return None;
        }
        Some(Self { source, slot })
    }

    pub fn parse_relative(value: &str, source: &DataSource) -> Option<Self> {
        Some(Self {
            source: source.clone(),
            slot: PatchSlot::parse(value)?,
        })
    }
}
