#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use harmoniq_patch_db::{
    Dirty, PatchDb, PatchDbConfig, PatchInfo, SynthAdapter, TagType, TypedTags,
};

const MANUFACTURER: u8 = 0x7d;

/// Presets look like `F0 7D <name> 00 <category> F7`.
#[derive(Debug, Default)]
pub struct TestSynth {
    pub rom: Vec<Vec<u8>>,
}

impl SynthAdapter for TestSynth {
    fn read_rom_patch(&self, bank: u32, program: u32) -> Option<Vec<u8>> {
        if bank != 0 {
            return None;
        }
        self.rom.get(program as usize).cloned()
    }

    fn decode(&self, sysex: &[u8]) -> Option<PatchInfo> {
        let body = sysex.get(2..sysex.len().checked_sub(1)?)?;
        if sysex.get(1) != Some(&MANUFACTURER) {
            return None;
        }
        let mut parts = body.splitn(2, |b| *b == 0);
        let name = String::from_utf8(parts.next()?.to_vec()).ok()?;
        let category = parts
            .next()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .unwrap_or_default();
        let tags = if category.is_empty() {
            TypedTags::new()
        } else {
            TypedTags::with_added(TagType::Category, category)
        };
        Some(PatchInfo { name, tags })
    }
}

pub fn preset(name: &str, category: &str) -> Vec<u8> {
    let mut sysex = vec![0xf0, MANUFACTURER];
    sysex.extend_from_slice(name.as_bytes());
    sysex.push(0);
    sysex.extend_from_slice(category.as_bytes());
    sysex.push(0xf7);
    sysex
}

pub fn write_bank(path: &Path, presets: &[Vec<u8>]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, presets.concat()).unwrap();
}

pub fn open(settings: &Path) -> PatchDb {
    PatchDb::open(PatchDbConfig::in_dir(settings), Arc::new(TestSynth::default())).unwrap()
}

/// Waits for the loader and collects everything it reported.
pub fn settle(db: &PatchDb) -> Dirty {
    db.wait_for_loader().unwrap();
    db.ui_process()
}

pub fn names(db: &PatchDb, source: &harmoniq_patch_db::DataSource) -> Vec<String> {
    db.patches(source).iter().map(|p| p.name()).collect()
}
