//! Outcomes of a flashing run that are not a success.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use thiserror::Error;

use crate::boot_sequencer::Stage;
use crate::console;

/// Why a flashing run failed.
#[derive(Debug, Error)]
pub enum FlashFailure {
    /// An expected console output never showed up in time.
    #[error("timed out in {stage} after {timeout:?} waiting for `{pattern}`")]
    Timeout {
        stage: Stage,
        pattern: String,
        timeout: Duration,
    },
    /// The console did not follow the scripted dialog.
    #[error("unexpected console output in {stage}: {detail}")]
    ProtocolMismatch { stage: Stage, detail: String },
    /// The bootloader gave up on the TFTP transfer too many times.
    #[error("TFTP retry count exceeded {count} times (limit {limit})")]
    RetryExceeded { count: usize, limit: usize },
    /// The post-flash boot reported corrupt flash.
    #[error("bad magic number ({count} counted)")]
    BadMagicNumber { count: usize },
    /// A TFTP read request asked for another file. Not fatal.
    #[error("TFTP request for `{requested}` rejected, only `{expected}` is served")]
    TransferRejected { requested: String, expected: String },
    /// The TFTP client could not be identified.
    #[error("unable to get the MAC address of {ip}")]
    ResolutionFailure { ip: IpAddr },
    #[error("no firmware image was given")]
    MissingImage,
    /// No host interface carries the address the responder should use.
    #[error("unable to find local interface with IP address {ip}")]
    NoLocalInterface { ip: Ipv4Addr },
    #[error(transparent)]
    Console(#[from] console::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
impl FlashFailure {
    /// Everything but a rejected transfer request ends the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FlashFailure::TransferRejected { .. })
    }

    /// Classify a console failure happening while in `stage`.
    ///
    /// Timeouts during the scripted menu dialog mean the bootloader went off
    /// script; elsewhere they are plain timeouts. A console that goes away is
    /// a mismatch wherever it happens.
    pub(crate) fn from_console(stage: Stage, error: console::Error) -> Self {
        let scripted = stage == Stage::MenuNavigation;
        match error.root() {
            console::Error::Timeout { .. } if scripted => FlashFailure::ProtocolMismatch {
                stage,
                detail: error.to_string(),
            },
            console::Error::Timeout { pattern, timeout } => FlashFailure::Timeout {
                stage,
                pattern: pattern.clone(),
                timeout: *timeout,
            },
            console::Error::Closed { .. } => FlashFailure::ProtocolMismatch {
                stage,
                detail: error.to_string(),
            },
            _ => FlashFailure::Console(error),
        }
    }
}

/// The process exit status for the outcome of a run.
pub fn exit_code(outcome: &Result<(), FlashFailure>) -> i32 {
    match outcome {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> console::Error {
        console::Error::Timeout {
            pattern: "default: ".into(),
            timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn menu_timeouts_are_mismatches() {
        let error = console::Error::Step {
            index: 2,
            source: Box::new(timeout()),
        };
        match FlashFailure::from_console(Stage::MenuNavigation, error) {
            FlashFailure::ProtocolMismatch { stage, detail } => {
                assert_eq!(stage, Stage::MenuNavigation);
                assert!(detail.contains("default: "));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn other_timeouts_stay_timeouts() {
        match FlashFailure::from_console(Stage::AwaitingBanner, timeout()) {
            FlashFailure::Timeout { stage, pattern, .. } => {
                assert_eq!(stage, Stage::AwaitingBanner);
                assert_eq!(pattern, "default: ");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn closed_console_is_a_mismatch() {
        let error = console::Error::Closed {
            pattern: "Done!".into(),
        };
        assert!(matches!(
            FlashFailure::from_console(Stage::Flashing, error),
            FlashFailure::ProtocolMismatch { .. }
        ));
    }

    #[test]
    fn only_rejections_are_recoverable() {
        let rejected = FlashFailure::TransferRejected {
            requested: "wrong.bin".into(),
            expected: "vme50".into(),
        };
        let unresolved = FlashFailure::ResolutionFailure {
            ip: Ipv4Addr::new(172, 16, 3, 212).into(),
        };
        assert!(!rejected.is_fatal());
        assert!(unresolved.is_fatal());
        assert!(FlashFailure::BadMagicNumber { count: 3 }.is_fatal());
        assert!(FlashFailure::NoLocalInterface {
            ip: Ipv4Addr::new(172, 16, 3, 210)
        }
        .is_fatal());
    }

    #[test]
    fn bad_magic_number_reports_count() {
        let outcome = Err(FlashFailure::BadMagicNumber { count: 3 });
        assert_eq!(exit_code(&outcome), 1);
        assert_eq!(
            outcome.unwrap_err().to_string(),
            "bad magic number (3 counted)"
        );
        assert_eq!(exit_code(&Ok(())), 0);
    }
}
