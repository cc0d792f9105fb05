//! Test utilities for console sessions.
//!
//! [`ScriptedConsole`] stands in for the device: tests decide what the console
//! prints and when, and inspect what the session sent back.

use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use super::{Error, Session, SessionOptions};

/// An in-memory console transport.
pub struct ScriptedConsole {
    tx: Mutex<Option<Sender<Vec<u8>>>>,
    rx: Mutex<Option<Receiver<Vec<u8>>>>,
    sent: Arc<Mutex<Vec<u8>>>,
}
impl Default for ScriptedConsole {
    fn default() -> Self {
        Self::new()
    }
}
impl ScriptedConsole {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        ScriptedConsole {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Open a session on this console. Only one session can be opened.
    pub fn session(&self, options: SessionOptions) -> Result<Session, Error> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::SessionClosed)?;
        let reader = ScriptedReader {
            rx,
            pending: Vec::new(),
        };
        let writer = CaptureWriter(Arc::clone(&self.sent));
        Session::from_transport("scripted", reader, writer, options)
    }

    fn sender(&self) -> Option<Sender<Vec<u8>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Make the console print `text` now.
    pub fn emit(&self, text: &str) {
        if let Some(tx) = self.sender() {
            let _ = tx.send(text.as_bytes().to_vec());
        }
    }

    /// Make the console print `text` after `delay`, without blocking.
    pub fn emit_after(&self, delay: Duration, text: &str) {
        self.play(vec![(delay, text.to_owned())]);
    }

    /// Print each text after its delay, in order, from a background thread.
    pub fn play(&self, script: Vec<(Duration, String)>) {
        if let Some(tx) = self.sender() {
            thread::spawn(move || {
                for (delay, text) in script {
                    thread::sleep(delay);
                    if tx.send(text.into_bytes()).is_err() {
                        break;
                    }
                }
            });
        }
    }

    /// End the console input once everything emitted so far has been read.
    pub fn hang_up(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Everything the session sent, lossily decoded.
    pub fn sent(&self) -> String {
        let sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&sent).into_owned()
    }
}

struct ScriptedReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}
impl Read for ScriptedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                // All senders are gone: end of input
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct CaptureWriter(Arc<Mutex<Vec<u8>>>);
impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
