//! Line oriented conversation with the device's serial console.
//!
//! A [`Session`] reads the console in a background thread and accumulates the
//! received bytes. Callers wait for regular expressions to show up in the
//! accumulated input ([`Session::expect`], [`Session::expect_cases`]), send raw
//! text ([`Session::send`]) or run fixed dialogs ([`Session::batch`]).
//!
//! **Example** - Answering a bootloader prompt:
//! ```
//! use std::time::Duration;
//! use bootflash::console::{testing::ScriptedConsole, Session, SessionOptions};
//!
//! let console = ScriptedConsole::new();
//! let mut session = console.session(SessionOptions::default()).unwrap();
//! console.emit("Are you sure? ");
//! session.expect(r"Are you sure\?", Duration::from_secs(1)).unwrap();
//! session.send("y").unwrap();
//! assert_eq!(console.sent(), "y");
//! ```

mod pattern;
mod session;
mod sink;
pub mod testing;

use std::io;
use std::time::Duration;

use thiserror::Error;

pub use pattern::{Case, Matched, Outcome, Status, Step};
pub use session::{Interrupter, Session, SessionOptions};
pub use sink::LogSink;

/// Errors of the console session.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("timed out after {timeout:?} waiting for `{pattern}`")]
    Timeout { pattern: String, timeout: Duration },
    #[error("console closed while waiting for `{pattern}`")]
    Closed { pattern: String },
    #[error("the console session is closed")]
    SessionClosed,
    #[error("step {index} failed: {source}")]
    Step {
        index: usize,
        #[source]
        source: Box<Error>,
    },
    #[error("console I/O error: {0}")]
    Io(#[from] io::Error),
}
impl Error {
    /// Unwraps batch step errors down to the failure that caused them.
    pub fn root(&self) -> &Error {
        match self {
            Error::Step { source, .. } => source.root(),
            other => other,
        }
    }
}
