use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type Tag = String;
pub type Color = u32;
pub type SearchHandle = u32;

/// Color value meaning "no color assigned".
pub const INVALID_COLOR: Color = 0;
pub const INVALID_SEARCH_HANDLE: SearchHandle = SearchHandle::MAX;

pub const SYSEX_START: u8 = 0xf0;
pub const SYSEX_END: u8 = 0xf7;

/// Where a data source comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SourceType {
    #[default]
    Invalid,
    Rom,
    File,
    Folder,
    LocalStorage,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Invalid => "invalid",
            SourceType::Rom => "rom",
            SourceType::File => "file",
            SourceType::Folder => "folder",
            SourceType::LocalStorage => "localstorage",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value.to_ascii_lowercase().as_str() {
            "rom" => SourceType::Rom,
            "file" => SourceType::File,
            "folder" => SourceType::Folder,
            "localstorage" => SourceType::LocalStorage,
            _ => SourceType::Invalid,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataSourceOrigin {
    /// Added by the user, persisted in the index.
    #[default]
    Manual,
    /// Discovered while scanning a parent folder.
    Autogenerated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TagType {
    Category,
    Tag,
    Favourites,
    CustomA,
    CustomB,
    CustomC,
}

impl TagType {
    pub const ALL: [TagType; 6] = [
        TagType::Category,
        TagType::Tag,
        TagType::Favourites,
        TagType::CustomA,
        TagType::CustomB,
        TagType::CustomC,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TagType::Category => "Category",
            TagType::Tag => "Tag",
            TagType::Favourites => "Favourites",
            TagType::CustomA => "CustomA",
            TagType::CustomB => "CustomB",
            TagType::CustomC => "CustomC",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        TagType::ALL
            .into_iter()
            .find(|ty| ty.as_str().eq_ignore_ascii_case(value))
    }
}

impl fmt::Display for TagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
