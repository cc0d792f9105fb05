//! Bootflash drives a U-Boot based board through a firmware update over its
//! serial console and hands it the firmware image over TFTP.
//!
//! A run goes like this:
//!
//! * wait for the power-on banner and the bootloader version,
//! * walk the bootloader menu to request a TFTP download, giving it the board
//!   and host addresses and the file name to ask for,
//! * serve the image to the board from a built-in TFTP responder, which
//!   also names the console log file after the board's hardware address,
//! * confirm the transfer size and the flash write,
//! * reboot into the new image and watch the boot for flash corruption.
//!
//! Everything the board prints is kept in a log, buffered in memory until the
//! transfer tells which board it is talking to.
//!
//! The sequencer is implemented as a state machine in terms of **states** and
//! **transitions** between them:
//!
//! * Can only be in one state at any time.
//! * Each state can have its own associated data if needed.
//! * The boot attempt is shared by **all** states.
//! * Transitions between states are triggered via typed **events** and follow
//!   defined semantics.
//! * Only explicitly defined transitions are permitted; the others are
//!   detected at **compile-time**.
//! * Transitioning from one state to another consumes the original state.
//!
//! Transitions leverage `rust`'s `From` and `Into` pattern: only transitions
//! for which the `From` trait is implemented from an event to a state are
//! authorized.

pub mod boot_sequencer;
pub mod console;
mod context;
mod error;
mod settings;
pub mod transfer;
pub mod utils;

pub use context::RunContext;
pub use error::{exit_code, FlashFailure};
pub use settings::{Settings, SettingsBuilder, Timeouts, DEFAULT_FILENAME};

/// Run a complete flashing session as described by `settings`.
///
/// The TFTP responder resolves clients with `neighbors`. A fatal responder
/// failure is shown to `on_fatal` from the responder's thread, then ends the
/// run and is returned. The console is closed and the responder stopped
/// before returning, whatever the outcome.
pub fn flash<F>(
    settings: Settings,
    neighbors: Box<dyn utils::NeighborTable>,
    on_fatal: F,
) -> Result<(), FlashFailure>
where
    F: Fn(&FlashFailure) + Send + 'static,
{
    let mut context = RunContext::new(settings)?;
    context.start_transfer_server(neighbors, on_fatal)?;
    let mut console = context.open_console()?;
    let report = context.run(&mut console);
    log::debug!("stages: {:?}", report.history);
    report.outcome
}
