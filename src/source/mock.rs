use super::LogSource;
use crate::store::LoadError;
use std::io::{Cursor, Read};

/// In-memory CSV bytes. Every `open` replays the same content.
#[derive(Debug, Clone, Default)]
pub struct MockSource {
    data: Vec<u8>,
}

impl MockSource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    /// Appends one line, adding the trailing newline.
    pub fn push(&mut self, line: &str) {
        self.data.extend_from_slice(line.as_bytes());
        self.data.push(b'\n');
    }
}

impl LogSource for MockSource {
    fn open(&self) -> Result<Box<dyn Read + Send>, LoadError> {
        Ok(Box::new(Cursor::new(self.data.clone())))
    }

    fn describe(&self) -> String {
        format!("<memory: {} bytes>", self.data.len())
    }
}
