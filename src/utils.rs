//! Helper functions to deal with serial ports and the host network stack.

mod neighbors;
mod ports;

pub use neighbors::{interface_with_address, MacAddr, NeighborTable, ProcNeighborTable};
pub(crate) use ports::open_and_setup_port;
