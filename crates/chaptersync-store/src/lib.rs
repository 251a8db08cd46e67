//! Persistent collaborators for the chaptersync engine.
//!
//! [`Database`] owns one SQLite connection (WAL mode) shared by the
//! [`SqliteJobStore`] and the [`SqliteCatalog`]; [`FsAssetStore`] keeps page
//! images on disk.

mod catalog;
mod db;
mod fs;
mod jobs;

pub use catalog::SqliteCatalog;
pub use db::{Database, StoreDbError};
pub use fs::FsAssetStore;
pub use jobs::SqliteJobStore;
