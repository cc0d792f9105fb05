//! `bootflash` boot sequencer state machine.
//!
//! A flashing run walks the bootloader through the "write to Flash via TFTP"
//! operation, lets the device pull the image from the TFTP responder, follows
//! the first boot of the new image, reboots it and checks that the second boot
//! is healthy.
//!
//! The following state diagram summarizes the states and transitions of a
//! run. Every state can also go straight to `Done` with a failure.
//!
//! ```text
//!       START
//!         |
//!         v
//!     .-------.    .----------------.    .---------------.
//!     | Idle  |--->| AwaitingBanner |--->| AwaitingUBoot |
//!     '-------'    '----------------'    '---------------'
//!                                                |
//!                                                v
//!  .-----------------------.    .----------------.
//!  | AwaitingTransferStart |<---| MenuNavigation |
//!  '-----------------------'    '----------------'
//!       |    ^
//!       |    | retry count exceeded (bounded)
//!       |----'
//!       v
//!  .--------------------------.    .----------.    .-----------.
//!  | AwaitingTransferComplete |--->| Flashing |--->| Rebooting |
//!  '--------------------------'    '----------'    '-----------'
//!                                                        |
//!                                                        v
//!            .---------------.    .------------------------.
//!            | VerifyingBoot |<---| AwaitingPostFlashUBoot |
//!            '---------------'    '------------------------'
//!                    |
//!                    v
//!                .------.
//!                | Done |---> END (success or failure)
//!                '------'
//! ```

use super::events::*;
use super::states::*;
use super::{BootAttempt, Stage};
use crate::console::Session;
use crate::error::FlashFailure;

// =============================================================================
// Public Interface
// =============================================================================

/// What a finished run leaves behind.
#[derive(Debug)]
pub struct SequenceReport {
    pub outcome: Result<(), FlashFailure>,
    /// Every stage the run went through, in order.
    pub history: Vec<Stage>,
    /// Bootloader TFTP retry overflows absorbed during the run.
    pub transfer_retries: usize,
}

/// Drives the bootloader console through a flashing run. Create it with
/// [`BootSequencer::new`] and consume it with [`BootSequencer::run`].
pub struct BootSequencer {
    sm: SequencerStates,
    history: Vec<Stage>,
}
impl BootSequencer {
    /// A sequencer in the `Idle` state.
    pub fn new(attempt: BootAttempt) -> Self {
        BootSequencer {
            sm: SequencerStates::Idle(SequencerSM::new(attempt)),
            history: vec![Stage::Idle],
        }
    }

    /// The sequencer event loop runs until the `Done` state is reached and its
    /// `should_exit` flag is set. Any failure ends the run right away.
    pub fn run(mut self, console: &mut Session) -> SequenceReport {
        loop {
            self.sm = self.sm.step(console);
            let stage = self.sm.stage();
            if self.history.last() != Some(&stage) {
                self.history.push(stage);
            }
            if let SequencerStates::Done(sm) = &mut self.sm {
                if sm.state.should_exit {
                    let outcome = match sm.state.outcome.take() {
                        Some(outcome) => outcome,
                        None => unreachable!("Exit reached without an outcome"),
                    };
                    return SequenceReport {
                        outcome,
                        history: self.history,
                        transfer_retries: sm.attempt.transfer_retries,
                    };
                }
            }
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// The raw state machine. The attempt is the data shared by all states; each
/// state only holds what it needs for itself.
#[derive(Debug)]
struct SequencerSM<S: Runnable> {
    attempt: BootAttempt,
    state: S,
}
impl<S: Runnable> SequencerSM<S> {
    fn run(&mut self, console: &mut Session) -> Event {
        self.state.run(&self.attempt, console)
    }
}

/// The state machine starts in the `IdleState`.
impl SequencerSM<IdleState> {
    fn new(attempt: BootAttempt) -> Self {
        SequencerSM {
            attempt,
            state: IdleState {},
        }
    }
}

/// An enum wrapper around the states of the sequencer, used for pattern
/// matching during state transitions.
enum SequencerStates {
    Idle(SequencerSM<IdleState>),
    AwaitingBanner(SequencerSM<AwaitingBannerState>),
    AwaitingUBoot(SequencerSM<AwaitingUBootState>),
    MenuNavigation(SequencerSM<MenuNavigationState>),
    AwaitingTransferStart(SequencerSM<AwaitingTransferStartState>),
    AwaitingTransferComplete(SequencerSM<AwaitingTransferCompleteState>),
    Flashing(SequencerSM<FlashingState>),
    Rebooting(SequencerSM<RebootingState>),
    AwaitingPostFlashUBoot(SequencerSM<AwaitingPostFlashUBootState>),
    VerifyingBoot(SequencerSM<VerifyingBootState>),
    Done(SequencerSM<DoneState>),
}
impl SequencerStates {
    fn stage(&self) -> Stage {
        match self {
            SequencerStates::Idle(sm) => sm.state.stage(),
            SequencerStates::AwaitingBanner(sm) => sm.state.stage(),
            SequencerStates::AwaitingUBoot(sm) => sm.state.stage(),
            SequencerStates::MenuNavigation(sm) => sm.state.stage(),
            SequencerStates::AwaitingTransferStart(sm) => sm.state.stage(),
            SequencerStates::AwaitingTransferComplete(sm) => sm.state.stage(),
            SequencerStates::Flashing(sm) => sm.state.stage(),
            SequencerStates::Rebooting(sm) => sm.state.stage(),
            SequencerStates::AwaitingPostFlashUBoot(sm) => sm.state.stage(),
            SequencerStates::VerifyingBoot(sm) => sm.state.stage(),
            SequencerStates::Done(sm) => sm.state.stage(),
        }
    }

    /// The unit of work in the sequencer event loop. It runs the current state
    /// and decides the next transition from the returned event. State
    /// transitions from events are implemented using the rust `From`/`Into`
    /// pattern, so most state/event mismatches are caught at compile time.
    fn step(&mut self, console: &mut Session) -> Self {
        match self {
            SequencerStates::Idle(sm) => {
                let event = sm.run(console);
                match event {
                    Event::Start(ev) => SequencerStates::AwaitingBanner(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            SequencerStates::AwaitingBanner(sm) => {
                let event = sm.run(console);
                match event {
                    Event::BannerSeen(ev) => SequencerStates::AwaitingUBoot(ev.into()),
                    Event::Done(ev) => SequencerStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            SequencerStates::AwaitingUBoot(sm) => {
                let event = sm.run(console);
                match event {
                    Event::UBootReady(ev) => SequencerStates::MenuNavigation(ev.into()),
                    Event::Done(ev) => SequencerStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            SequencerStates::MenuNavigation(sm) => {
                let event = sm.run(console);
                match event {
                    Event::MenuCompleted(ev) => SequencerStates::AwaitingTransferStart(ev.into()),
                    Event::Done(ev) => SequencerStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            SequencerStates::AwaitingTransferStart(sm) => {
                let event = sm.run(console);
                match event {
                    Event::TransferStarted(ev) => {
                        SequencerStates::AwaitingTransferComplete(ev.into())
                    }
                    Event::Done(ev) => SequencerStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            SequencerStates::AwaitingTransferComplete(sm) => {
                let event = sm.run(console);
                match event {
                    Event::TransferCompleted(ev) => SequencerStates::Flashing(ev.into()),
                    Event::Done(ev) => SequencerStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            SequencerStates::Flashing(sm) => {
                let event = sm.run(console);
                match event {
                    Event::FlashWritten(ev) => SequencerStates::Rebooting(ev.into()),
                    Event::Done(ev) => SequencerStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            SequencerStates::Rebooting(sm) => {
                let event = sm.run(console);
                match event {
                    Event::RebootIssued(ev) => SequencerStates::AwaitingPostFlashUBoot(ev.into()),
                    Event::Done(ev) => SequencerStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            SequencerStates::AwaitingPostFlashUBoot(sm) => {
                let event = sm.run(console);
                match event {
                    Event::UBootReady(ev) => SequencerStates::VerifyingBoot(ev.into()),
                    Event::Done(ev) => SequencerStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            SequencerStates::VerifyingBoot(sm) => {
                let event = sm.run(console);
                match event {
                    Event::Done(ev) => SequencerStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            SequencerStates::Done(sm) => {
                let event = sm.run(console);
                match event {
                    Event::Exit(ev) => SequencerStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
        }
    }
}

// -----------------------------------------------------------------------------
// State from Event transitions
// -----------------------------------------------------------------------------

impl From<StartEvent> for SequencerSM<AwaitingBannerState> {
    fn from(event: StartEvent) -> SequencerSM<AwaitingBannerState> {
        SequencerSM {
            attempt: event.attempt,
            state: AwaitingBannerState {},
        }
    }
}

impl From<BannerSeenEvent> for SequencerSM<AwaitingUBootState> {
    fn from(event: BannerSeenEvent) -> SequencerSM<AwaitingUBootState> {
        SequencerSM {
            attempt: event.attempt,
            state: AwaitingUBootState {},
        }
    }
}

impl From<UBootReadyEvent> for SequencerSM<MenuNavigationState> {
    fn from(event: UBootReadyEvent) -> SequencerSM<MenuNavigationState> {
        SequencerSM {
            attempt: event.attempt,
            state: MenuNavigationState {},
        }
    }
}
impl From<UBootReadyEvent> for SequencerSM<VerifyingBootState> {
    fn from(event: UBootReadyEvent) -> SequencerSM<VerifyingBootState> {
        SequencerSM {
            attempt: event.attempt,
            state: VerifyingBootState {},
        }
    }
}

impl From<MenuCompletedEvent> for SequencerSM<AwaitingTransferStartState> {
    fn from(event: MenuCompletedEvent) -> SequencerSM<AwaitingTransferStartState> {
        SequencerSM {
            attempt: event.attempt,
            state: AwaitingTransferStartState {},
        }
    }
}

impl From<TransferStartedEvent> for SequencerSM<AwaitingTransferCompleteState> {
    fn from(event: TransferStartedEvent) -> SequencerSM<AwaitingTransferCompleteState> {
        SequencerSM {
            attempt: event.attempt,
            state: AwaitingTransferCompleteState {},
        }
    }
}

impl From<TransferCompletedEvent> for SequencerSM<FlashingState> {
    fn from(event: TransferCompletedEvent) -> SequencerSM<FlashingState> {
        SequencerSM {
            attempt: event.attempt,
            state: FlashingState { bytes: event.bytes },
        }
    }
}

impl From<FlashWrittenEvent> for SequencerSM<RebootingState> {
    fn from(event: FlashWrittenEvent) -> SequencerSM<RebootingState> {
        SequencerSM {
            attempt: event.attempt,
            state: RebootingState {},
        }
    }
}

impl From<RebootIssuedEvent> for SequencerSM<AwaitingPostFlashUBootState> {
    fn from(event: RebootIssuedEvent) -> SequencerSM<AwaitingPostFlashUBootState> {
        SequencerSM {
            attempt: event.attempt,
            state: AwaitingPostFlashUBootState {},
        }
    }
}

impl From<DoneEvent> for SequencerSM<DoneState> {
    fn from(event: DoneEvent) -> SequencerSM<DoneState> {
        SequencerSM {
            attempt: event.attempt,
            state: DoneState {
                outcome: Some(event.outcome),
                should_exit: false,
            },
        }
    }
}
impl From<ExitEvent> for SequencerSM<DoneState> {
    fn from(event: ExitEvent) -> SequencerSM<DoneState> {
        SequencerSM {
            attempt: event.attempt,
            state: DoneState {
                outcome: Some(event.outcome),
                should_exit: true,
            },
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::console::testing::ScriptedConsole;
    use crate::console::SessionOptions;
    use crate::settings::{SettingsBuilder, Timeouts};

    const MENU: &str = "Please choose the operation:\n\
        1: Load system code to SDRAM via TFTP.\n\
        2: Load system code then write to Flash via TFTP.\n\
        default: 2\n\
        Are you sure? (Y/N)\n\
        Input device IP (172.16.3.212) ==:\n\
        Input server IP (172.16.3.210) ==:\n\
        Input Linux Kernel filename (vme50) ==:\n\
        ETH_STATE_ACTIVE!!\n\
        Loading: ";

    const BOOT: &str = "==============================================\nUBoot Version 5.2\n";

    fn attempt(image_size: u64) -> BootAttempt {
        let settings = SettingsBuilder::new()
            .timeouts(Timeouts::uniform(Duration::from_millis(300)))
            .finalize();
        BootAttempt::new(&settings, PathBuf::from("vme50.bin"), image_size)
    }

    fn run(attempt: BootAttempt, output: &[&str]) -> (SequenceReport, String) {
        let console = ScriptedConsole::new();
        let mut session = console.session(SessionOptions::default()).unwrap();
        for text in output {
            console.emit(text);
        }
        let report = BootSequencer::new(attempt).run(&mut session);
        (report, console.sent())
    }

    fn up_to_transfer() -> Vec<&'static str> {
        vec![BOOT, MENU, "Got it\n"]
    }

    #[test]
    fn full_run_succeeds() {
        let (report, sent) = run(
            attempt(1_048_576),
            &[
                BOOT,
                MENU,
                "Got it\n",
                "Bytes transferred = 1048576 (100000 hex)\n",
                "Erasing... Writing... Done!\n",
                "Starting kernel ...\n",
                "Please press Enter to activate this console.\n",
                "root@vme50:/# ",
                BOOT,
                "## Booting image at 80800000 ...\n",
                "Please press Enter to activate this console.\n",
            ],
        );

        assert!(report.outcome.is_ok(), "{:?}", report.outcome);
        assert_eq!(
            report.history,
            vec![
                Stage::Idle,
                Stage::AwaitingBanner,
                Stage::AwaitingUBoot,
                Stage::MenuNavigation,
                Stage::AwaitingTransferStart,
                Stage::AwaitingTransferComplete,
                Stage::Flashing,
                Stage::Rebooting,
                Stage::AwaitingPostFlashUBoot,
                Stage::VerifyingBoot,
                Stage::Done,
            ]
        );
        assert_eq!(sent, "2y172.16.3.212\n172.16.3.210\nvme50\n\nreboot\n");
    }

    #[test]
    fn exact_size_confirmation_reaches_flashing() {
        let mut output = up_to_transfer();
        output.push("Bytes transferred = 1048576 (100000 hex)\n");
        let (report, _) = run(attempt(1_048_576), &output);

        assert!(report.history.contains(&Stage::Flashing));
        match report.outcome {
            Err(FlashFailure::Timeout { stage, pattern, .. }) => {
                assert_eq!(stage, Stage::Flashing);
                assert_eq!(pattern, "Done!");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn neighbouring_sizes_never_confirm() {
        for size in &[1_048_575u64, 1_048_577] {
            let mut output = up_to_transfer();
            output.push("Bytes transferred = 1048576 (100000 hex)\n");
            let (report, _) = run(attempt(*size), &output);

            assert!(!report.history.contains(&Stage::Flashing));
            match report.outcome {
                Err(FlashFailure::Timeout { stage, .. }) => {
                    assert_eq!(stage, Stage::AwaitingTransferComplete)
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn confirmation_requires_the_whole_number() {
        let mut output = up_to_transfer();
        output.push("Bytes transferred = 10485760 (a00000 hex)\n");
        let (report, _) = run(attempt(1_048_576), &output);
        assert!(!report.history.contains(&Stage::Flashing));
    }

    #[test]
    fn retries_below_the_bound_are_absorbed() {
        let retries = "Retry count exceeded; starting again\n".repeat(9);
        let (report, _) = run(
            attempt(512),
            &[BOOT, MENU, &retries, "Got it\n", "Bytes transferred = 512\n"],
        );

        assert_eq!(report.transfer_retries, 9);
        assert!(report.history.contains(&Stage::Flashing));
    }

    #[test]
    fn retries_reaching_the_bound_fail() {
        let retries = "Retry count exceeded; starting again\n".repeat(10);
        let (report, _) = run(attempt(512), &[BOOT, MENU, &retries, "Got it\n"]);

        match report.outcome {
            Err(FlashFailure::RetryExceeded { count, limit }) => {
                assert_eq!(count, 10);
                assert_eq!(limit, 10);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!report.history.contains(&Stage::AwaitingTransferComplete));
    }

    #[test]
    fn missing_banner_is_a_timeout() {
        let (report, sent) = run(attempt(512), &["garbage\n"]);
        match report.outcome {
            Err(FlashFailure::Timeout { stage, .. }) => assert_eq!(stage, Stage::AwaitingBanner),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(report.history.last(), Some(&Stage::Done));
        assert_eq!(sent, "");
    }

    #[test]
    fn unexpected_menu_is_a_protocol_mismatch() {
        let (report, sent) = run(
            attempt(512),
            &[BOOT, "Please choose the operation:\n1: Boot from NAND\n"],
        );
        match report.outcome {
            Err(FlashFailure::ProtocolMismatch { stage, .. }) => {
                assert_eq!(stage, Stage::MenuNavigation)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sent, "");
    }

    fn verify(corrupt: usize) -> SequenceReport {
        let bad = "Bad Magic Number\n".repeat(corrupt);
        let (report, _) = run(
            attempt(512),
            &[
                BOOT,
                MENU,
                "Got it\n",
                "Bytes transferred = 512\n",
                "Done!\n",
                "Starting kernel ...\n",
                "Please press Enter to activate this console\n",
                "root@vme50:/# ",
                BOOT,
                "Booting image at 80800000\n",
                &bad,
                "=> ",
            ],
        );
        report
    }

    #[test]
    fn single_bad_magic_number_is_counted() {
        match verify(1).outcome {
            Err(FlashFailure::BadMagicNumber { count }) => assert_eq!(count, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn repeated_bad_magic_numbers_are_counted() {
        let report = verify(3);
        assert_eq!(report.history.last(), Some(&Stage::Done));
        match report.outcome {
            Err(failure) => {
                assert!(matches!(failure, FlashFailure::BadMagicNumber { count: 3 }));
                assert!(failure.to_string().contains('3'));
            }
            Ok(()) => panic!("a corrupt boot passed"),
        }
    }

    #[test]
    fn done_hands_its_failure_over_to_exit() {
        let console = ScriptedConsole::new();
        let mut session = console.session(SessionOptions::default()).unwrap();
        let mut done = DoneState {
            outcome: Some(Err(FlashFailure::BadMagicNumber { count: 2 })),
            should_exit: false,
        };

        match done.run(&attempt(512), &mut session) {
            Event::Exit(ExitEvent { outcome, .. }) => {
                assert!(matches!(outcome, Err(FlashFailure::BadMagicNumber { count: 2 })))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(done.outcome.is_none());
    }

    #[test]
    #[should_panic]
    fn done_without_an_outcome_is_a_bug() {
        let console = ScriptedConsole::new();
        let mut session = console.session(SessionOptions::default()).unwrap();
        let mut done = DoneState {
            outcome: None,
            should_exit: false,
        };
        done.run(&attempt(512), &mut session);
    }
}
