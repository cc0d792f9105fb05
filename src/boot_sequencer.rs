//! The boot sequencer driving the bootloader console through a flashing run.
//!
//! **Example** - Running the sequence against a console session:
//! ```no_run
//! use bootflash::boot_sequencer::{BootAttempt, BootSequencer};
//! use bootflash::console::{Session, SessionOptions};
//! use bootflash::SettingsBuilder;
//!
//! let settings = SettingsBuilder::new().image("vme50.bin").finalize();
//! let attempt = BootAttempt::for_image(&settings).unwrap();
//! let mut console = Session::open_serial(&settings, SessionOptions::default()).unwrap();
//! let report = BootSequencer::new(attempt).run(&mut console);
//! println!("{:?} after {:?}", report.outcome, report.history);
//! ```

mod events;
mod state_machine;
mod states;

use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::error::FlashFailure;
use crate::settings::{Settings, Timeouts};

pub use state_machine::{BootSequencer, SequenceReport};

/// The states of a flashing run, as observed from outside the sequencer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Stage {
    Idle,
    AwaitingBanner,
    AwaitingUBoot,
    MenuNavigation,
    AwaitingTransferStart,
    AwaitingTransferComplete,
    Flashing,
    Rebooting,
    AwaitingPostFlashUBoot,
    VerifyingBoot,
    Done,
}
impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Everything the sequencer needs to know about the run it drives.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BootAttempt {
    pub image_path: PathBuf,
    /// Fixed once, from the image file, before the run starts.
    pub image_size: u64,
    pub device_ip: Ipv4Addr,
    pub local_ip: Ipv4Addr,
    /// The file name the device asks the TFTP responder for.
    pub filename: String,
    pub max_transfer_retries: usize,
    /// Retry overflows reported by the bootloader so far.
    pub transfer_retries: usize,
    pub timeouts: Timeouts,
}
impl BootAttempt {
    /// An attempt for an image of the given size.
    pub fn new(settings: &Settings, image_path: PathBuf, image_size: u64) -> Self {
        BootAttempt {
            image_path,
            image_size,
            device_ip: settings.device_ip,
            local_ip: settings.local_ip,
            filename: settings.filename.clone(),
            max_transfer_retries: settings.max_transfer_retries,
            transfer_retries: 0,
            timeouts: settings.timeouts,
        }
    }

    /// An attempt for the image in `settings`, sized from the file itself.
    pub fn for_image(settings: &Settings) -> Result<Self, FlashFailure> {
        let image_path = settings.image.clone().ok_or(FlashFailure::MissingImage)?;
        let image_size = fs::metadata(&image_path)?.len();
        Ok(Self::new(settings, image_path, image_size))
    }
}
