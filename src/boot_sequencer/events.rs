//! Events for the `bootflash` boot sequencer state machine.
//!
//! This module is private and restricted to the
//! [`boot_sequencer`](crate::boot_sequencer) scope. The public interface of the
//! state machine is provided by [`boot_sequencer`](crate::boot_sequencer).
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use super::BootAttempt;
use crate::error::FlashFailure;

// =============================================================================
// Crate-Public Interface
// =============================================================================

// StartEvent ==================================================================

/// Event fired by the `Idle` state to start waiting for the device to boot.
#[derive(Debug)]
pub(crate) struct StartEvent {
    pub attempt: BootAttempt,
}

// BannerSeenEvent =============================================================

/// Event fired when the start-of-boot banner showed up on the console.
#[derive(Debug)]
pub(crate) struct BannerSeenEvent {
    pub attempt: BootAttempt,
}

// UBootReadyEvent =============================================================

/// Event fired when the bootloader identified itself.
///
/// This event can happen under one of the following circumstances:
///
///  1. While at the `AwaitingUBoot` state, before flashing. The next state is
///     the menu navigation.
///  2. While at the `AwaitingPostFlashUBoot` state, after the reboot into the
///     new image. The next state is the boot verification.
#[derive(Debug)]
pub(crate) struct UBootReadyEvent {
    pub attempt: BootAttempt,
}

// MenuCompletedEvent ==========================================================

/// Event fired when the bootloader accepted the flash-via-TFTP dialog and
/// started its TFTP client.
#[derive(Debug)]
pub(crate) struct MenuCompletedEvent {
    pub attempt: BootAttempt,
}

// TransferStartedEvent ========================================================

/// Event fired when the bootloader reports its TFTP client got a reply. The
/// attempt carries the number of retry overflows absorbed on the way.
#[derive(Debug)]
pub(crate) struct TransferStartedEvent {
    pub attempt: BootAttempt,
}

// TransferCompletedEvent ======================================================

/// Event fired when the bootloader confirmed the exact image size.
#[derive(Debug)]
pub(crate) struct TransferCompletedEvent {
    pub attempt: BootAttempt,
    pub bytes: u64,
}

// FlashWrittenEvent ===========================================================

/// Event fired when the bootloader finished writing the flash.
#[derive(Debug)]
pub(crate) struct FlashWrittenEvent {
    pub attempt: BootAttempt,
}

// RebootIssuedEvent ===========================================================

/// Event fired once the reboot command was sent to the freshly flashed system.
#[derive(Debug)]
pub(crate) struct RebootIssuedEvent {
    pub attempt: BootAttempt,
}

// DoneEvent ===================================================================

/// Event fired when the run is over, successfully or not. It can be fired from
/// any state and triggers a transition to the `Done` state.
#[derive(Debug)]
pub(crate) struct DoneEvent {
    pub attempt: BootAttempt,
    pub outcome: Result<(), FlashFailure>,
}

// ExitEvent ===================================================================

/// The last event of the sequencer. It hands the outcome back to the caller
/// that started the event loop.
#[derive(Debug)]
pub(crate) struct ExitEvent {
    pub attempt: BootAttempt,
    pub outcome: Result<(), FlashFailure>,
}

// Events enum =================================================================

/// Events that can be triggered within the boot sequencer state machine.
///
/// Each possible value holds an `event`, which in turn holds the data passed
/// by the origin state to the target state.
#[derive(Debug)]
pub(crate) enum Event {
    Start(StartEvent),
    BannerSeen(BannerSeenEvent),
    UBootReady(UBootReadyEvent),
    MenuCompleted(MenuCompletedEvent),
    TransferStarted(TransferStartedEvent),
    TransferCompleted(TransferCompletedEvent),
    FlashWritten(FlashWrittenEvent),
    RebootIssued(RebootIssuedEvent),
    Done(DoneEvent),
    Exit(ExitEvent),
}
