use super::LogSource;
use crate::store::LoadError;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

/// CSV file on disk.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl LogSource for FileSource {
    fn open(&self) -> Result<Box<dyn Read + Send>, LoadError> {
        match File::open(&self.path) {
            Ok(file) => Ok(Box::new(BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(LoadError::MissingFile {
                path: self.path.clone(),
            }),
            Err(e) => Err(LoadError::Io(e)),
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
