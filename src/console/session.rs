//! The console session and its background reader.

use std::ffi::OsStr;
use std::io::{self, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use hexplay::HexViewBuilder;
use log::{debug, info, log_enabled, trace, warn, Level::Trace};
use regex::bytes::Regex;

use super::pattern::{describe, Case, Matched, Outcome, Step};
use super::{Error, LogSink};
use crate::settings::Settings;
use crate::utils::open_and_setup_port;

/// How long a serial read blocks before the reader re-checks for shutdown.
const SERIAL_POLL: Duration = Duration::from_millis(100);

/// Unmatched input kept for the next match attempt. Older input is dropped.
const PENDING_WINDOW: usize = 64 * 1024;

/// Options shared by all the ways of opening a session.
#[derive(Clone)]
pub struct SessionOptions {
    /// Timeout used by [`Session::expect_default`].
    pub default_timeout: Duration,
    /// Receives a copy of every byte read from the console.
    pub sink: Option<LogSink>,
    /// Echo every byte read from the console to stdout.
    pub echo: bool,
}
impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            default_timeout: Duration::from_secs(1),
            sink: None,
            echo: false,
        }
    }
}

/// A conversation with the device console.
///
/// Input is accumulated by a reader thread. Every successful wait consumes the
/// accumulated input up to and including the match, so the same bytes are
/// never matched twice.
pub struct Session {
    name: String,
    writer: Option<Box<dyn Write + Send>>,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    child: Option<Child>,
    sink: Option<LogSink>,
    default_timeout: Duration,
}

impl Session {
    /// Start `program` and talk to the console through its stdin and stdout,
    /// e.g. `picocom -b 57600 /dev/ttyUSB0`.
    pub fn spawn<S: AsRef<OsStr>>(
        program: &str,
        args: &[S],
        options: SessionOptions,
    ) -> Result<Self, Error> {
        let spawn_error = |source| Error::Spawn {
            program: program.to_owned(),
            source,
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(spawn_error)?;

        let pipes = child.stdin.take().zip(child.stdout.take());
        let (stdin, stdout) = match pipes {
            Some(pipes) => pipes,
            None => {
                let _ = child.kill();
                return Err(spawn_error(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "standard streams are not available",
                )));
            }
        };

        info!("Console attached to `{}` (pid {})", program, child.id());
        let mut session = Self::from_transport(program, stdout, stdin, options)?;
        session.child = Some(child);
        Ok(session)
    }

    /// Open the serial port described in `settings` and talk to it directly.
    pub fn open_serial(settings: &Settings, options: SessionOptions) -> Result<Self, Error> {
        let mut port = open_and_setup_port(settings)?;
        port.set_timeout(SERIAL_POLL)?;
        let reader = port.try_clone()?;
        Self::from_transport(&settings.tty, reader, port, options)
    }

    /// Build a session over any pair of byte streams.
    pub fn from_transport<R, W>(
        name: &str,
        reader: R,
        writer: W,
        options: SessionOptions,
    ) -> Result<Self, Error>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let shared = Arc::clone(&shared);
            let stop = Arc::clone(&stop);
            let sink = options.sink.clone();
            let echo = options.echo;
            thread::Builder::new()
                .name("console-reader".into())
                .spawn(move || pump(reader, &shared, &stop, sink.as_ref(), echo))?
        };

        Ok(Session {
            name: name.to_owned(),
            writer: Some(Box::new(writer)),
            shared,
            stop,
            reader: Some(handle),
            child: None,
            sink: options.sink,
            default_timeout: options.default_timeout,
        })
    }

    /// Wait until `pattern` matches the accumulated input and return the
    /// matched text.
    pub fn expect(&mut self, pattern: &str, timeout: Duration) -> Result<String, Error> {
        let pattern = Regex::new(pattern)?;
        self.expect_regex(&pattern, timeout)
    }

    /// [`expect`](Session::expect) with the session's default timeout.
    pub fn expect_default(&mut self, pattern: &str) -> Result<String, Error> {
        self.expect(pattern, self.default_timeout)
    }

    pub fn expect_regex(&mut self, pattern: &Regex, timeout: Duration) -> Result<String, Error> {
        let cases = [Case {
            pattern: pattern.clone(),
            outcome: Outcome::Success,
        }];
        self.expect_cases(&cases, timeout).map(|matched| matched.text)
    }

    /// Wait until one of `cases` matches. Cases are tried in order each time
    /// new input arrives and the first one matching wins, wherever its match
    /// is located in the input.
    pub fn expect_cases(&mut self, cases: &[Case], timeout: Duration) -> Result<Matched, Error> {
        let deadline = Instant::now() + timeout;
        let mut inbox = self.shared.lock();
        loop {
            if let Some(matched) = inbox.take_match(cases) {
                debug!("matched {:?} (case {})", matched.text, matched.case);
                return Ok(matched);
            }
            if inbox.closed {
                return Err(Error::Closed {
                    pattern: describe(cases),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout {
                    pattern: describe(cases),
                    timeout,
                });
            }
            inbox = match self.shared.arrived.wait_timeout(inbox, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Write `text` as is. No line terminator is added.
    pub fn send(&mut self, text: &str) -> Result<(), Error> {
        let writer = self.writer.as_mut().ok_or(Error::SessionClosed)?;
        writer.write_all(text.as_bytes())?;
        writer.flush()?;
        debug!("sent {:?}", text);
        Ok(())
    }

    /// Run a fixed dialog. Every expectation uses `timeout`. Stops at the
    /// first failing step and returns the texts matched so far otherwise.
    pub fn batch(&mut self, steps: &[Step], timeout: Duration) -> Result<Vec<String>, Error> {
        let mut matched = Vec::new();
        for (index, step) in steps.iter().enumerate() {
            let result = match step {
                Step::Expect(pattern) => self
                    .expect_regex(pattern, timeout)
                    .map(|text| matched.push(text)),
                Step::Send(text) => self.send(text),
            };
            result.map_err(|source| Error::Step {
                index,
                source: Box::new(source),
            })?;
        }
        Ok(matched)
    }

    pub fn is_closed(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// A handle other threads can use to end the wait in progress.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Release the console. Calling it more than once is harmless.
    pub fn close(&mut self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing console session on {}", self.name);
        self.writer.take();
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("`{}` already exited: {}", self.name, e);
            }
            let _ = child.wait();
        }
        self.shared.close();
        // The reader exits on its next read timeout or end of input.
        self.reader.take();
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.flush() {
                warn!("failed to flush the console log: {}", e);
            }
        }
    }
}
impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Ends the waits of a [`Session`] from another thread. Input already
/// accumulated can still match; once it is used up every wait fails as if the
/// console had gone away.
#[derive(Clone)]
pub struct Interrupter {
    shared: Arc<Shared>,
}
impl Interrupter {
    pub fn interrupt(&self) {
        self.shared.close();
    }
}

// =============================================================================
// Private stuff
// =============================================================================

#[derive(Default)]
struct Inbox {
    pending: Vec<u8>,
    closed: bool,
}
impl Inbox {
    fn take_match(&mut self, cases: &[Case]) -> Option<Matched> {
        for (index, case) in cases.iter().enumerate() {
            if let Some(found) = case.pattern.find(&self.pending) {
                let text = String::from_utf8_lossy(found.as_bytes()).into_owned();
                let end = found.end();
                self.pending.drain(..end);
                return Some(Matched {
                    case: index,
                    outcome: case.outcome,
                    text,
                });
            }
        }
        if self.pending.len() > PENDING_WINDOW {
            let excess = self.pending.len() - PENDING_WINDOW;
            self.pending.drain(..excess);
        }
        None
    }
}

#[derive(Default)]
struct Shared {
    inbox: Mutex<Inbox>,
    arrived: Condvar,
}
impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inbox> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, data: &[u8]) {
        self.lock().pending.extend_from_slice(data);
        self.arrived.notify_all();
    }

    fn close(&self) {
        self.lock().closed = true;
        self.arrived.notify_all();
    }
}

fn pump<R: Read>(
    mut reader: R,
    shared: &Shared,
    stop: &AtomicBool,
    sink: Option<&LogSink>,
    echo: bool,
) {
    let mut chunk = vec![0; 4096];
    while !stop.load(Ordering::Acquire) {
        match reader.read(&mut chunk) {
            Ok(0) => {
                debug!("end of console input");
                break;
            }
            Ok(n) => {
                let data = &chunk[..n];
                trace!("{} bytes read from the console", n);
                // Dump the received data in a hex table for debugging
                if log_enabled!(Trace) {
                    let view = HexViewBuilder::new(data)
                        .address_offset(0)
                        .row_width(16)
                        .finish();
                    trace!("\n{}", view);
                }
                if echo {
                    let mut stdout = io::stdout();
                    let _ = stdout.write_all(data).and_then(|_| stdout.flush());
                }
                if let Some(sink) = sink {
                    if let Err(e) = sink.write(data) {
                        warn!("failed to write the console log: {}", e);
                    }
                }
                shared.push(data);
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                warn!("console read failed: {}", e);
                break;
            }
        }
    }
    shared.close();
}

// =============================================================================
// Unit Tests
// =============================================================================
