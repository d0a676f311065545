//! Per-request scratch files. Each file is deleted when its handle drops.

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom};
use std::path::PathBuf;
use tempfile::NamedTempFile;

const PREFIX: &str = "sqlbridge_";

#[derive(Clone, Debug, Default)]
pub struct ScratchStore {
    dir: Option<PathBuf>,
}

impl ScratchStore {
    /// Files go to `dir`, or to the system temp directory when `None`.
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn create(&self) -> io::Result<ScratchFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(PREFIX);
        let file = match &self.dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        Ok(ScratchFile { file })
    }
}

#[derive(Debug)]
pub struct ScratchFile {
    file: NamedTempFile,
}

impl ScratchFile {
    /// Buffered writer over the file; flush it before reading back.
    pub fn writer(&mut self) -> BufWriter<&mut File> {
        BufWriter::new(self.file.as_file_mut())
    }

    /// A fresh read handle positioned at the start of the file.
    pub fn open_for_read(&self) -> io::Result<File> {
        let mut reader = self.file.reopen()?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(reader)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> io::Result<u64> {
        Ok(self.file.as_file().metadata()?.len())
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &std::path::Path {
        self.file.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn write_then_read_back() {
        let store = ScratchStore::default();
        let mut scratch = store.create().expect("create");
        {
            let mut writer = scratch.writer();
            writer.write_all(b"hello scratch").expect("write");
            writer.flush().expect("flush");
        }
        assert_eq!(scratch.len().expect("len"), 13);
        let mut contents = String::new();
        scratch
            .open_for_read()
            .expect("open")
            .read_to_string(&mut contents)
            .expect("read");
        assert_eq!(contents, "hello scratch");
    }

    #[test]
    fn files_are_removed_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ScratchStore::new(Some(dir.path().to_path_buf()));
        let scratch = store.create().expect("create");
        let path = scratch.path().to_path_buf();
        assert!(path.starts_with(dir.path()));
        assert!(path.exists());
        drop(scratch);
        assert!(!path.exists());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ScratchStore::new(Some(dir.path().join("nope")));
        assert!(store.create().is_err());
    }
}
