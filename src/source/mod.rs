use crate::store::LoadError;
use std::io::Read;

/// Where the CSV bytes of a log store come from.
pub trait LogSource: Send + Sync {
    /// Opens a fresh reader positioned at the header row.
    fn open(&self) -> Result<Box<dyn Read + Send>, LoadError>;

    /// Short label used in log lines.
    fn describe(&self) -> String;
}

pub mod file;
pub mod mock;

pub use file::FileSource;
pub use mock::MockSource;
