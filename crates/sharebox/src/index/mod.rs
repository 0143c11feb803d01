pub mod browse;
pub mod scheduler;
pub mod search;

pub use browse::{Browser, FileEntry, FolderEntry, Listing};
pub use scheduler::IndexScheduler;
pub use search::{shard_key, IndexStats, SearchHit, SearchIndex};
