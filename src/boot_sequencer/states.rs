//! States for the `bootflash` boot sequencer state machine.
//!
//! This module is private and restricted to the
//! [`boot_sequencer`](crate::boot_sequencer) scope. The public interface of the
//! state machine is provided by [`boot_sequencer`](crate::boot_sequencer).
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use std::time::{Duration, Instant};

use ::console::style;
use log::{debug, info, warn};

use super::events::*;
use super::{BootAttempt, Stage};
use crate::console::{self, Case, Matched, Outcome, Session, Status, Step};
use crate::error::FlashFailure;

// Console markers =============================================================

const BOOT_BANNER: &str = "==============================================";
const UBOOT_VERSION: &str = "UBoot Version";
const TRANSFER_ESTABLISHED: &str = "Got it";
const TRANSFER_RETRY: &str = "Retry count exceeded; starting again";
const FLASH_DONE: &str = "Done!";
const KERNEL_START: &str = r"Starting kernel \.\.\.";
const ACTIVATE_CONSOLE: &str = "Please press Enter to activate this console";
const SHELL_PROMPT: &str = "root@(.+):/#";
const BOOTING_IMAGE: &str = "Booting image at";
const BAD_MAGIC_NUMBER: &str = "Bad Magic Number";

const STATUS_RETRY_EXCEEDED: Status = Status::new(0, "retry count exceeded");
const STATUS_FLASH_CORRUPT: Status = Status::new(0, "flash corrupt");

/// The exact byte count confirmation for an image of `size` bytes. The word
/// boundary keeps longer numbers with the same leading digits out.
pub(crate) fn transfer_confirmation(size: u64) -> String {
    format!(r"Bytes transferred = {}\b", size)
}

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Trait adding the ability for a state to be `run` after a transition into it.
pub(crate) trait Runnable {
    /// The externally visible stage this state represents.
    fn stage(&self) -> Stage;

    /// A state implements this method so it can be `run` after the state
    /// machine transitions into it.
    ///
    /// During this call, the state drives the console as far as it needs to
    /// and requests a transition to a `new state` by returning the appropriate
    /// `event`. The `event` is consumed to create the `new state` using the
    /// corresponding [`From`] trait implementation.
    fn run(&mut self, attempt: &BootAttempt, console: &mut Session) -> Event;
}

// Idle State ==================================================================

/// The initial state. Nothing has been read from the console yet.
///
///  * **[`StartEvent`] => [`AwaitingBannerState`]** unconditionally.
#[derive(Debug)]
pub(crate) struct IdleState {}
impl Runnable for IdleState {
    fn stage(&self) -> Stage {
        Stage::Idle
    }

    fn run(&mut self, attempt: &BootAttempt, _console: &mut Session) -> Event {
        info!("=> Idle");
        debug!(
            "flashing {} ({} bytes) as `{}`",
            attempt.image_path.display(),
            attempt.image_size,
            attempt.filename
        );
        Event::Start(StartEvent {
            attempt: attempt.clone(),
        })
    }
}

// AwaitingBanner State ========================================================

/// Waits for the start-of-boot banner, i.e. the device being powered on or
/// reset.
///
///  * **[`BannerSeenEvent`] => [`AwaitingUBootState`]** when the banner shows,
///  * **[`DoneEvent`] => [`DoneState`]** on timeout.
#[derive(Debug)]
pub(crate) struct AwaitingBannerState {}
impl Runnable for AwaitingBannerState {
    fn stage(&self) -> Stage {
        Stage::AwaitingBanner
    }

    fn run(&mut self, attempt: &BootAttempt, console: &mut Session) -> Event {
        info!("=> Awaiting Banner");
        progress("Waiting to start boot process");
        match wait(console, self.stage(), BOOT_BANNER, attempt.timeouts.banner) {
            Ok(_) => Event::BannerSeen(BannerSeenEvent {
                attempt: attempt.clone(),
            }),
            Err(failure) => done(attempt, Err(failure)),
        }
    }
}

// AwaitingUBoot State =========================================================

/// Waits for the bootloader version marker that follows the banner.
///
///  * **[`UBootReadyEvent`] => [`MenuNavigationState`]** when the marker shows,
///  * **[`DoneEvent`] => [`DoneState`]** on timeout.
#[derive(Debug)]
pub(crate) struct AwaitingUBootState {}
impl Runnable for AwaitingUBootState {
    fn stage(&self) -> Stage {
        Stage::AwaitingUBoot
    }

    fn run(&mut self, attempt: &BootAttempt, console: &mut Session) -> Event {
        info!("=> Awaiting UBoot");
        progress("Waiting for UBoot");
        match wait(console, self.stage(), UBOOT_VERSION, attempt.timeouts.uboot) {
            Ok(_) => Event::UBootReady(UBootReadyEvent {
                attempt: attempt.clone(),
            }),
            Err(failure) => done(attempt, Err(failure)),
        }
    }
}

// MenuNavigation State ========================================================

/// Walks the bootloader menu: choose "write to Flash via TFTP", confirm, then
/// give the device address, the server address and the file name.
///
///  * **[`MenuCompletedEvent`] => [`AwaitingTransferStartState`]** once the
///    bootloader starts loading,
///  * **[`DoneEvent`] => [`DoneState`]** on any deviation from the dialog.
#[derive(Debug)]
pub(crate) struct MenuNavigationState {}
impl MenuNavigationState {
    fn steps(attempt: &BootAttempt) -> Result<Vec<Step>, console::Error> {
        Ok(vec![
            Step::expect("Please choose the operation:")?,
            Step::expect("2: Load system code then write to Flash via TFTP")?,
            Step::expect("default: ")?,
            Step::send("2"),
            Step::expect(r"Are you sure\?")?,
            Step::send("y"),
            Step::expect("Input device IP.* ==:")?,
            Step::send(format!("{}\n", attempt.device_ip)),
            Step::expect("Input server IP.* ==:")?,
            Step::send(format!("{}\n", attempt.local_ip)),
            Step::expect("Input Linux Kernel filename .* ==:")?,
            Step::send(format!("{}\n", attempt.filename)),
            Step::expect("ETH_STATE_ACTIVE")?,
            Step::expect("Loading:")?,
        ])
    }
}
impl Runnable for MenuNavigationState {
    fn stage(&self) -> Stage {
        Stage::MenuNavigation
    }

    fn run(&mut self, attempt: &BootAttempt, console: &mut Session) -> Event {
        info!("=> Menu Navigation");
        progress(r#"Choose operation "write to Flash via TFTP""#);
        let result = Self::steps(attempt)
            .and_then(|steps| console.batch(&steps, attempt.timeouts.menu))
            .map_err(|e| FlashFailure::from_console(self.stage(), e));
        match result {
            Ok(_) => Event::MenuCompleted(MenuCompletedEvent {
                attempt: attempt.clone(),
            }),
            Err(failure) => done(attempt, Err(failure)),
        }
    }
}

// AwaitingTransferStart State =================================================

/// Waits for the device's TFTP client to reach the responder.
///
/// The bootloader restarts its TFTP client after too many unanswered packets
/// and says so. Such restarts are absorbed until `max_transfer_retries` of
/// them were seen. The whole wait, restarts included, is bounded by the
/// `transfer_start` timeout.
///
///  * **[`TransferStartedEvent`] => [`AwaitingTransferCompleteState`]** when
///    the connection is established,
///  * **[`DoneEvent`] => [`DoneState`]** on timeout or too many restarts.
#[derive(Debug)]
pub(crate) struct AwaitingTransferStartState {}
impl AwaitingTransferStartState {
    fn wait_for_connection(
        &self,
        attempt: &mut BootAttempt,
        console: &mut Session,
    ) -> Result<(), FlashFailure> {
        // Restart notices already received are counted before the connection
        let cases = [
            Case::continue_with(TRANSFER_RETRY, STATUS_RETRY_EXCEEDED)?,
            Case::success(TRANSFER_ESTABLISHED)?,
        ];
        let limit = attempt.timeouts.transfer_start;
        let deadline = Instant::now() + limit;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match console.expect_cases(&cases, remaining) {
                Ok(Matched {
                    outcome: Outcome::Success,
                    ..
                }) => return Ok(()),
                Ok(Matched {
                    outcome: Outcome::Continue(status),
                    ..
                }) => {
                    attempt.transfer_retries += 1;
                    warn!(
                        "{} ({} of {})",
                        status.message, attempt.transfer_retries, attempt.max_transfer_retries
                    );
                    if attempt.transfer_retries >= attempt.max_transfer_retries {
                        return Err(FlashFailure::RetryExceeded {
                            count: attempt.transfer_retries,
                            limit: attempt.max_transfer_retries,
                        });
                    }
                }
                // Report the overall budget rather than what was left of it
                Err(console::Error::Timeout { pattern, .. }) => {
                    return Err(FlashFailure::Timeout {
                        stage: self.stage(),
                        pattern,
                        timeout: limit,
                    })
                }
                Err(e) => return Err(FlashFailure::from_console(self.stage(), e)),
            }
        }
    }
}
impl Runnable for AwaitingTransferStartState {
    fn stage(&self) -> Stage {
        Stage::AwaitingTransferStart
    }

    fn run(&mut self, attempt: &BootAttempt, console: &mut Session) -> Event {
        info!("=> Awaiting Transfer Start");
        progress("Waiting for TFTP connection");
        let mut attempt = attempt.clone();
        match self.wait_for_connection(&mut attempt, console) {
            Ok(()) => Event::TransferStarted(TransferStartedEvent { attempt }),
            Err(failure) => done(&attempt, Err(failure)),
        }
    }
}

// AwaitingTransferComplete State ==============================================

/// Waits for the bootloader to confirm it received exactly the image size.
/// Any other count never matches and the wait times out.
///
///  * **[`TransferCompletedEvent`] => [`FlashingState`]** on confirmation,
///  * **[`DoneEvent`] => [`DoneState`]** on timeout.
#[derive(Debug)]
pub(crate) struct AwaitingTransferCompleteState {}
impl Runnable for AwaitingTransferCompleteState {
    fn stage(&self) -> Stage {
        Stage::AwaitingTransferComplete
    }

    fn run(&mut self, attempt: &BootAttempt, console: &mut Session) -> Event {
        info!("=> Awaiting Transfer Complete");
        let confirmation = transfer_confirmation(attempt.image_size);
        match wait(
            console,
            self.stage(),
            &confirmation,
            attempt.timeouts.transfer_complete,
        ) {
            Ok(_) => Event::TransferCompleted(TransferCompletedEvent {
                attempt: attempt.clone(),
                bytes: attempt.image_size,
            }),
            Err(failure) => done(attempt, Err(failure)),
        }
    }
}

// Flashing State ==============================================================

/// Waits for the bootloader to finish writing the flash.
///
///  * **[`FlashWrittenEvent`] => [`RebootingState`]** when done,
///  * **[`DoneEvent`] => [`DoneState`]** on timeout.
#[derive(Debug)]
pub(crate) struct FlashingState {
    pub bytes: u64,
}
impl Runnable for FlashingState {
    fn stage(&self) -> Stage {
        Stage::Flashing
    }

    fn run(&mut self, attempt: &BootAttempt, console: &mut Session) -> Event {
        info!("=> Flashing {} bytes", self.bytes);
        progress("Flashing");
        match wait(console, self.stage(), FLASH_DONE, attempt.timeouts.flash) {
            Ok(_) => Event::FlashWritten(FlashWrittenEvent {
                attempt: attempt.clone(),
            }),
            Err(failure) => done(attempt, Err(failure)),
        }
    }
}

// Rebooting State =============================================================

/// Follows the first boot of the new image up to the shell and reboots it.
///
///  * **[`RebootIssuedEvent`] => [`AwaitingPostFlashUBootState`]** once the
///    reboot command is sent,
///  * **[`DoneEvent`] => [`DoneState`]** on timeout.
#[derive(Debug)]
pub(crate) struct RebootingState {}
impl RebootingState {
    fn reboot(&self, attempt: &BootAttempt, console: &mut Session) -> Result<(), console::Error> {
        let steps = [Step::expect(KERNEL_START)?, Step::expect(ACTIVATE_CONSOLE)?];
        console.batch(&steps, attempt.timeouts.reboot)?;

        progress("Activating console");
        console.send("\n")?;
        console.expect_default(SHELL_PROMPT)?;
        console.send("reboot\n")
    }
}
impl Runnable for RebootingState {
    fn stage(&self) -> Stage {
        Stage::Rebooting
    }

    fn run(&mut self, attempt: &BootAttempt, console: &mut Session) -> Event {
        info!("=> Rebooting");
        progress("Rebooting");
        match self.reboot(attempt, console) {
            Ok(()) => Event::RebootIssued(RebootIssuedEvent {
                attempt: attempt.clone(),
            }),
            Err(e) => done(attempt, Err(FlashFailure::from_console(self.stage(), e))),
        }
    }
}

// AwaitingPostFlashUBoot State ================================================

/// The banner and bootloader version wait, once more, after the reboot.
///
///  * **[`UBootReadyEvent`] => [`VerifyingBootState`]** when both showed,
///  * **[`DoneEvent`] => [`DoneState`]** on timeout.
#[derive(Debug)]
pub(crate) struct AwaitingPostFlashUBootState {}
impl Runnable for AwaitingPostFlashUBootState {
    fn stage(&self) -> Stage {
        Stage::AwaitingPostFlashUBoot
    }

    fn run(&mut self, attempt: &BootAttempt, console: &mut Session) -> Event {
        info!("=> Awaiting Post-Flash UBoot");
        progress("Waiting to start boot process");
        let result = wait(console, self.stage(), BOOT_BANNER, attempt.timeouts.banner)
            .and_then(|_| {
                progress("Waiting for UBoot");
                wait(console, self.stage(), UBOOT_VERSION, attempt.timeouts.uboot)
            });
        match result {
            Ok(_) => Event::UBootReady(UBootReadyEvent {
                attempt: attempt.clone(),
            }),
            Err(failure) => done(attempt, Err(failure)),
        }
    }
}

// VerifyingBoot State =========================================================

/// Decides whether the flashed image boots.
///
/// After the "booting image" marker, either the console activation prompt
/// shows (healthy) or the bootloader reports bad magic numbers (corrupt). The
/// corruption signatures are counted until none follows within the
/// `bad_magic_gap` timeout.
///
///  * **[`DoneEvent`] => [`DoneState`]** with the verdict.
#[derive(Debug)]
pub(crate) struct VerifyingBootState {}
impl VerifyingBootState {
    fn verify(&self, attempt: &BootAttempt, console: &mut Session) -> Result<(), FlashFailure> {
        progress("Waiting for booting image");
        wait(
            console,
            self.stage(),
            BOOTING_IMAGE,
            attempt.timeouts.booting_image,
        )?;
        progress("Booting image");

        let cases = [
            Case::success(ACTIVATE_CONSOLE)?,
            Case::continue_with(BAD_MAGIC_NUMBER, STATUS_FLASH_CORRUPT)?,
        ];
        let verdict = console
            .expect_cases(&cases, attempt.timeouts.boot_verdict)
            .map_err(|e| FlashFailure::from_console(self.stage(), e))?;

        match verdict.outcome {
            Outcome::Success => Ok(()),
            Outcome::Continue(status) => {
                warn!("{}", status.message);
                let gap = attempt.timeouts.bad_magic_gap;
                let count = 1 + count_repeats(console, BAD_MAGIC_NUMBER, gap);
                Err(FlashFailure::BadMagicNumber { count })
            }
        }
    }
}
impl Runnable for VerifyingBootState {
    fn stage(&self) -> Stage {
        Stage::VerifyingBoot
    }

    fn run(&mut self, attempt: &BootAttempt, console: &mut Session) -> Event {
        info!("=> Verifying Boot");
        let outcome = self.verify(attempt, console);
        done(attempt, outcome)
    }
}

// Done State ==================================================================

/// Reached when the run is over, successfully or not.
///
/// This state goes into a 2-phase execution. During the initial phase, it runs
/// like any other state to report the outcome. It then triggers the
/// [`ExitEvent`] to cause the sequencer to hand the outcome to its caller.
#[derive(Debug)]
pub(crate) struct DoneState {
    /// Taken once per phase: by `run`, then by the event loop once
    /// `should_exit` is set.
    pub outcome: Option<Result<(), FlashFailure>>,
    /// When `true` instructs the sequencer to exit its event loop.
    pub should_exit: bool,
}
impl Runnable for DoneState {
    fn stage(&self) -> Stage {
        Stage::Done
    }

    fn run(&mut self, attempt: &BootAttempt, _console: &mut Session) -> Event {
        let outcome = match self.outcome.take() {
            Some(outcome) => outcome,
            None => unreachable!("Done state run twice in the same phase"),
        };
        match &outcome {
            Ok(()) => info!("=> Done with no errors"),
            Err(failure) => info!("=> Done with errors: {}", failure),
        }
        Event::Exit(ExitEvent {
            attempt: attempt.clone(),
            outcome,
        })
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn progress(message: &str) {
    println!("{}", style(format!("[BF] {}", message)).green());
}

fn done(attempt: &BootAttempt, outcome: Result<(), FlashFailure>) -> Event {
    Event::Done(DoneEvent {
        attempt: attempt.clone(),
        outcome,
    })
}

fn wait(
    console: &mut Session,
    stage: Stage,
    pattern: &str,
    timeout: Duration,
) -> Result<String, FlashFailure> {
    console
        .expect(pattern, timeout)
        .map_err(|e| FlashFailure::from_console(stage, e))
}

/// Count further occurrences of `pattern`, each within `gap` of the previous.
fn count_repeats(console: &mut Session, pattern: &str, gap: Duration) -> usize {
    let mut count = 0;
    while console.expect(pattern, gap).is_ok() {
        count += 1;
    }
    count
}
