//! The TFTP responder handing the firmware image to the device.
//!
//! The [`TransferServer`] listens for read requests on a background thread.
//! Each request is put through the [`TransferCoordinator`], which only admits
//! the configured file name, identifies the client by its hardware address
//! and moves the console log to a file named after it. Admitted requests are
//! served from a fresh socket, so every transfer gets its own transfer ID.
//!
//! **Example** - Serving an image on an ephemeral port:
//! ```no_run
//! use bootflash::console::LogSink;
//! use bootflash::transfer::{TransferCoordinator, TransferServer};
//! use bootflash::utils::ProcNeighborTable;
//! use bootflash::SettingsBuilder;
//!
//! let settings = SettingsBuilder::new().image("vme50.bin").finalize();
//! let coordinator = TransferCoordinator::new(
//!     &settings,
//!     "vme50.bin".into(),
//!     1_048_576,
//!     LogSink::new(),
//!     Box::new(ProcNeighborTable::default()),
//! );
//! let mut server = TransferServer::start(
//!     "0.0.0.0:6969".parse().unwrap(),
//!     coordinator,
//!     |failure| eprintln!("{}", failure),
//! )
//! .unwrap();
//! // ...
//! server.shutdown();
//! println!("{:?}", server.transfers());
//! ```

mod coordinator;
mod server;
pub mod tftp;

pub use coordinator::{TransferCoordinator, TransferRecord, DEFAULT_PACKET_TIMEOUT};
pub use server::TransferServer;
