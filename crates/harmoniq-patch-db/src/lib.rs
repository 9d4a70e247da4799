//! Patch catalog used by Harmoniq Studio: sources, tags, searches and the
//! files that persist user edits.

mod config;
mod datasource;
mod db;
mod dirty;
mod error;
mod host;
mod key;
mod loader;
mod modifications;
mod patch;
mod search;
mod store_json;
mod sysex;
mod tags;
mod types;

pub use config::*;
pub use datasource::*;
pub use db::*;
pub use dirty::Dirty;
pub use error::*;
pub use host::*;
pub use key::*;
pub use modifications::*;
pub use patch::*;
pub use search::{
    matches_content, Search, SearchCallback, SearchRequest, SearchResults, SearchState,
};
pub use store_json::DataSourceEntry;
pub use sysex::*;
pub use tags::*;
pub use types::*;
