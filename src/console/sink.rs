//! Log sink receiving a copy of everything read from the console.
//!
//! The device identity, and therefore the log file name, is only known once
//! the device connects to the TFTP responder. Until a destination is set, the
//! sink keeps the bytes in memory. Setting the destination flushes the
//! buffered bytes first, so the resulting log is a single ordered record.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

enum Destination {
    Buffer(Vec<u8>),
    Writer {
        path: PathBuf,
        writer: Box<dyn Write + Send>,
    },
    Closed,
}

/// A cloneable handle to the shared console log.
///
/// One side (the console reader) writes continuously; the other (the transfer
/// coordinator) assigns the destination once.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<Mutex<Destination>>,
}
impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}
impl LogSink {
    /// A new sink, buffering until a destination is assigned.
    pub fn new() -> Self {
        LogSink {
            inner: Arc::new(Mutex::new(Destination::Buffer(Vec::new()))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Destination> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append console bytes to the log.
    pub fn write(&self, bytes: &[u8]) -> io::Result<()> {
        match &mut *self.lock() {
            Destination::Buffer(buffer) => {
                buffer.extend_from_slice(bytes);
                Ok(())
            }
            Destination::Writer { writer, .. } => writer.write_all(bytes),
            Destination::Closed => Ok(()),
        }
    }

    /// Create (or truncate) the file at `path` and make it the destination.
    ///
    /// Returns `Ok(false)` without touching the file system when a destination
    /// has already been assigned.
    pub fn redirect_to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<bool> {
        let path = path.as_ref();
        let mut destination = self.lock();
        if !matches!(&*destination, Destination::Buffer(_)) {
            debug!("log already redirected, keeping it over {}", path.display());
            return Ok(false);
        }
        let file = File::create(path)?;
        Self::switch(&mut destination, path.to_path_buf(), Box::new(file))?;
        Ok(true)
    }

    fn switch(
        destination: &mut Destination,
        path: PathBuf,
        mut writer: Box<dyn Write + Send>,
    ) -> io::Result<()> {
        if let Destination::Buffer(buffer) = destination {
            writer.write_all(buffer)?;
            writer.flush()?;
        }
        *destination = Destination::Writer { path, writer };
        Ok(())
    }

    /// The file the log goes to, if it has been redirected to one.
    pub fn path(&self) -> Option<PathBuf> {
        match &*self.lock() {
            Destination::Writer { path, .. } => Some(path.clone()),
            _ => None,
        }
    }

    pub fn is_redirected(&self) -> bool {
        matches!(&*self.lock(), Destination::Writer { .. })
    }

    /// Number of bytes waiting for a destination.
    pub fn buffered(&self) -> usize {
        match &*self.lock() {
            Destination::Buffer(buffer) => buffer.len(),
            _ => 0,
        }
    }

    pub fn flush(&self) -> io::Result<()> {
        match &mut *self.lock() {
            Destination::Writer { writer, .. } => writer.flush(),
            _ => Ok(()),
        }
    }

    /// Flush and release the destination. Bytes still buffered at this point
    /// are dropped. Further writes are ignored.
    pub fn close(&self) {
        let mut destination = self.lock();
        match &mut *destination {
            Destination::Writer { writer, .. } => {
                if let Err(e) = writer.flush() {
                    warn!("failed to flush the console log: {}", e);
                }
            }
            Destination::Buffer(buffer) if !buffer.is_empty() => {
                debug!("{} console bytes were never logged", buffer.len());
            }
            _ => {}
        }
        *destination = Destination::Closed;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    #[test]
    fn buffers_until_redirected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("001122334455.log");

        let sink = LogSink::new();
        sink.write(b"U-Boot ").unwrap();
        sink.write(b"2010.06\n").unwrap();
        assert_eq!(sink.buffered(), 15);
        assert!(!path.exists());

        assert!(sink.redirect_to_file(&path).unwrap());
        sink.write(b"Loading: ###\n").unwrap();
        sink.flush().unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "U-Boot 2010.06\nLoading: ###\n"
        );
        assert_eq!(sink.buffered(), 0);
        assert_eq!(sink.path(), Some(path));
    }

    #[test]
    fn second_redirect_keeps_first_destination() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.log");
        let second = dir.path().join("second.log");

        let sink = LogSink::new();
        sink.write(b"a").unwrap();
        assert!(sink.redirect_to_file(&first).unwrap());
        assert!(!sink.redirect_to_file(&second).unwrap());
        sink.write(b"b").unwrap();
        sink.close();

        assert_eq!(fs::read_to_string(&first).unwrap(), "ab");
        assert!(!second.exists());
    }

    #[test]
    fn writes_from_clones_share_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.log");

        let reader_side = LogSink::new();
        let transfer_side = reader_side.clone();
        reader_side.write(b"before ").unwrap();
        transfer_side.redirect_to_file(&path).unwrap();
        reader_side.write(b"after").unwrap();
        reader_side.close();

        assert_eq!(fs::read_to_string(&path).unwrap(), "before after");
        // closed through either handle
        assert!(!transfer_side.is_redirected());
    }

    #[test]
    fn writes_after_close_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.log");
        let sink = LogSink::new();
        sink.close();
        sink.write(b"late").unwrap();
        assert_eq!(sink.buffered(), 0);
        assert!(!sink.redirect_to_file(&path).unwrap());
        assert!(!path.exists());
    }
}
