//! Files opened on a host.
//!
//! [`FileStream`] wraps the raw byte stream of a local or an SFTP file. In text mode it adds UTF-8
//! decoding and encoding on top of the bytes, and all failures carry the path and the host.

use crate::error::{Error, Result};
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// How a file is opened, parsed from `fopen()`-style strings like "r", "w+" or "ab".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    read: bool,
    write: bool,
    append: bool,
    create: bool,
    truncate: bool,
    binary: bool,
}

impl OpenMode {
    /// Parses `mode`: one of "r", "w" or "a", optionally followed by "+" and by "b" or "t".
    pub fn parse(mode: &str) -> Result<Self> {
        let invalid = || Error::Command(format!("invalid file open mode '{}'", mode));

        let mut chars = mode.chars();
        let mut result = match chars.next() {
            Some('r') => Self::with_access(true, false, false),
            Some('w') => Self::with_access(false, true, false),
            Some('a') => Self::with_access(false, true, true),
            _ => return Err(invalid()),
        };

        let mut seen_plus = false;
        let mut seen_kind = false;
        for c in chars {
            match c {
                '+' if !seen_plus => {
                    seen_plus = true;
                    result.read = true;
                    result.write = true;
                }
                'b' | 't' if !seen_kind => {
                    seen_kind = true;
                    result.binary = c == 'b';
                }
                _ => return Err(invalid()),
            }
        }
        Ok(result)
    }

    fn with_access(read: bool, write: bool, append: bool) -> Self {
        Self {
            read,
            write,
            append,
            // Writing modes create the file, "w" also truncates it.
            create: write,
            truncate: write && !append,
            binary: false,
        }
    }

    pub fn is_read(&self) -> bool {
        self.read
    }

    pub fn is_write(&self) -> bool {
        self.write
    }

    pub fn is_append(&self) -> bool {
        self.append
    }

    pub fn is_create(&self) -> bool {
        self.create
    }

    pub fn is_truncate(&self) -> bool {
        self.truncate
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    pub fn to_open_options(&self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options
            .read(self.read)
            .write(self.write && !self.append)
            .append(self.append)
            .create(self.create)
            .truncate(self.truncate);
        options
    }
}

impl std::str::FromStr for OpenMode {
    type Err = Error;

    fn from_str(mode: &str) -> Result<Self> {
        Self::parse(mode)
    }
}

/// Byte-level access to an open file.
pub(crate) trait RawFile: Read + Write + Send {}

impl<T: Read + Write + Send> RawFile for T {}

/// A file opened on a host.
pub struct FileStream {
    inner: Box<dyn RawFile>,
    path: PathBuf,
    mode: OpenMode,
    hostmsg: String,
}

impl FileStream {
    pub(crate) fn new(inner: Box<dyn RawFile>, path: &Path, mode: OpenMode, hostmsg: &str) -> Self {
        Self {
            inner,
            path: path.to_path_buf(),
            mode,
            hostmsg: hostmsg.to_string(),
        }
    }

    /// Opens a local file.
    pub fn open_local(path: &Path, mode: OpenMode) -> Result<Self> {
        let file = mode.to_open_options().open(path).map_err(|e| {
            Error::from_io(&e, &format!("failed to open file '{}'", path.display()))
        })?;
        Ok(Self::new(Box::new(file), path, mode, ""))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    fn io_error(&self, e: &std::io::Error, what: &str) -> Error {
        Error::from_io(
            e,
            &format!(
                "failed to {} file '{}'{}",
                what,
                self.path.display(),
                self.hostmsg
            ),
        )
    }

    fn check_text_mode(&self) -> Result<()> {
        if self.mode.is_binary() {
            return Err(Error::Command(format!(
                "file '{}'{} is opened in binary mode, text access is not possible",
                self.path.display(),
                self.hostmsg
            )));
        }
        Ok(())
    }

    /// Reads the rest of the file as bytes.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.inner
            .read_to_end(&mut data)
            .map_err(|e| self.io_error(&e, "read"))?;
        Ok(data)
    }

    /// Writes all of `data`.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.inner
            .write_all(data)
            .and_then(|_| self.inner.flush())
            .map_err(|e| self.io_error(&e, "write"))
    }

    /// Reads the rest of the file as UTF-8 text.
    pub fn read_text(&mut self) -> Result<String> {
        self.check_text_mode()?;
        let data = self.read_bytes()?;
        String::from_utf8(data).map_err(|e| {
            Error::Command(format!(
                "file '{}'{} is not valid UTF-8 text: {}",
                self.path.display(),
                self.hostmsg,
                e
            ))
        })
    }

    /// Reads the rest of the file as lines, without the newline characters.
    pub fn read_lines(&mut self) -> Result<Vec<String>> {
        Ok(self.read_text()?.lines().map(str::to_string).collect())
    }

    /// Writes `text` encoded as UTF-8.
    pub fn write_text(&mut self, text: &str) -> Result<()> {
        self.check_text_mode()?;
        self.write_bytes(text.as_bytes())
    }
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for FileStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStream")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("hostmsg", &self.hostmsg)
            .finish()
    }
}
