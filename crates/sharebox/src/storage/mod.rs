pub mod filesystem;

pub use filesystem::{move_file, FileStorage};
