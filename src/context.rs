//! The state of a single flashing run.

use std::fs;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};

use crate::boot_sequencer::{BootAttempt, BootSequencer, SequenceReport};
use crate::console::{Interrupter, LogSink, Session, SessionOptions};
use crate::error::FlashFailure;
use crate::settings::Settings;
use crate::transfer::{TransferCoordinator, TransferServer};
use crate::utils::{interface_with_address, NeighborTable};

/// Everything one invocation works with: the settings, the attempt derived
/// from them, the console log shared by the console reader and the transfer
/// side, and the TFTP responder once started.
///
/// The responder is shut down when the run finishes or the context is
/// dropped, whichever comes first. A fatal responder failure ends the console
/// wait in progress and becomes the outcome of the run.
pub struct RunContext {
    settings: Settings,
    attempt: BootAttempt,
    sink: LogSink,
    server: Option<TransferServer>,
    abort: Abort,
}

impl RunContext {
    /// Size the image, find the interface owning the local address and
    /// prepare the log directory.
    ///
    /// Clients are resolved on that interface unless another one is set.
    pub fn new(mut settings: Settings) -> Result<Self, FlashFailure> {
        let attempt = BootAttempt::for_image(&settings)?;
        let interface = interface_with_address(settings.local_ip)?.ok_or(
            FlashFailure::NoLocalInterface {
                ip: settings.local_ip,
            },
        )?;
        info!(
            "using local interface {} with address {}",
            interface, settings.local_ip
        );
        settings.interface.get_or_insert(interface);
        fs::create_dir_all(&settings.log_dir)?;
        info!(
            "flashing {} ({} bytes) to {}",
            attempt.image_path.display(),
            attempt.image_size,
            attempt.device_ip
        );
        Ok(RunContext {
            settings,
            attempt,
            sink: LogSink::new(),
            server: None,
            abort: Abort::default(),
        })
    }

    pub fn attempt(&self) -> &BootAttempt {
        &self.attempt
    }

    /// The console log. Buffered in memory until a transfer names its file.
    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    pub fn transfer_server(&self) -> Option<&TransferServer> {
        self.server.as_ref()
    }

    /// Start the TFTP responder on the local address and the configured port.
    /// Starting it twice keeps the first one.
    ///
    /// `on_fatal` is told about a fatal responder failure from the responder's
    /// thread, before the run is aborted with it.
    pub fn start_transfer_server<F>(
        &mut self,
        neighbors: Box<dyn NeighborTable>,
        on_fatal: F,
    ) -> Result<SocketAddr, FlashFailure>
    where
        F: Fn(&FlashFailure) + Send + 'static,
    {
        if let Some(server) = &self.server {
            warn!("TFTP server already running on {}", server.local_addr());
            return Ok(server.local_addr());
        }
        let coordinator = TransferCoordinator::new(
            &self.settings,
            self.attempt.image_path.clone(),
            self.attempt.image_size,
            self.sink.clone(),
            neighbors,
        );
        let address = SocketAddr::new(self.settings.local_ip.into(), self.settings.tftp_port);
        let abort = self.abort.clone();
        let server = TransferServer::start(address, coordinator, move |failure| {
            on_fatal(&failure);
            abort.raise(failure);
        })?;
        let local_addr = server.local_addr();
        self.server = Some(server);
        Ok(local_addr)
    }

    /// How console sessions of this run are set up.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            default_timeout: self.settings.timeouts.shell_prompt,
            sink: Some(self.sink.clone()),
            echo: self.settings.verbose,
        }
    }

    /// Open the device console: through the configured terminal program when
    /// there is one, on the serial port otherwise.
    pub fn open_console(&self) -> Result<Session, FlashFailure> {
        let options = self.session_options();
        let session = match self.settings.console_command.as_deref() {
            Some([program, args @ ..]) => {
                debug!("console through `{}` {:?}", program, args);
                Session::spawn(program, args, options)?
            }
            _ => Session::open_serial(&self.settings, options)?,
        };
        Ok(session)
    }

    /// Drive `console` through the flashing run, then close it and stop the
    /// responder. A fatal responder failure replaces whatever the sequencer
    /// ended with.
    pub fn run(&mut self, console: &mut Session) -> SequenceReport {
        self.abort.watch(console.interrupter());
        let mut report = BootSequencer::new(self.attempt.clone()).run(console);
        console.close();
        self.finish();
        if let Some(failure) = self.abort.take() {
            debug!("sequencer ended with {:?}", report.outcome);
            report.outcome = Err(failure);
        }
        report
    }

    /// Stop the responder and flush the console log.
    pub fn finish(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.shutdown();
            debug!("{} transfer(s) served", server.transfers().len());
        }
        if let Err(e) = self.sink.flush() {
            warn!("failed to flush the console log: {}", e);
        }
    }
}

impl Drop for RunContext {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Where the responder leaves a fatal failure for the run to pick up.
#[derive(Clone, Default)]
struct Abort {
    inner: Arc<Mutex<AbortState>>,
}

#[derive(Default)]
struct AbortState {
    failure: Option<FlashFailure>,
    console: Option<Interrupter>,
}

impl Abort {
    fn lock(&self) -> MutexGuard<'_, AbortState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keep the first failure and interrupt the watched console.
    fn raise(&self, failure: FlashFailure) {
        let mut state = self.lock();
        if let Some(console) = &state.console {
            console.interrupt();
        }
        state.failure.get_or_insert(failure);
    }

    /// Interrupt `console` on the next failure, or right away if one was
    /// raised before the console was opened.
    fn watch(&self, console: Interrupter) {
        let mut state = self.lock();
        if state.failure.is_some() {
            console.interrupt();
        }
        state.console = Some(console);
    }

    fn take(&self) -> Option<FlashFailure> {
        let mut state = self.lock();
        state.console = None;
        state.failure.take()
    }
}
