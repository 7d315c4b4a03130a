pub mod layout;
pub mod types;
pub mod utils;

pub use layout::{ConflictReason, LayoutConflict, LayoutDiff, StorageEntry, StorageLayout};
pub use types::*;
