//! Serial port device manipulation.

use log::{debug, info};
use serialport::SerialPort;

use crate::Settings;

//==============================================================================
// Public Interface
//==============================================================================

/// Open the console port described in `settings`, retrying for a few seconds
/// in case the USB serial adapter is still settling.
pub(crate) fn open_and_setup_port(
    settings: &Settings,
) -> Result<Box<dyn SerialPort>, serialport::Error> {
    use retry::{delay, retry_with_index};

    let result = retry_with_index(
        delay::Fixed::from_millis(1000).take(4),
        |index| -> Result<Box<dyn SerialPort>, serialport::Error> {
            debug!("Trying to connect {}", index);
            serialport::new(&settings.tty, settings.baud_rate)
                .data_bits(settings.data_bits)
                .stop_bits(settings.stop_bits)
                .parity(settings.parity)
                .flow_control(settings.flow_control)
                .open()
        },
    );
    match result {
        Ok(port) => {
            info!(
                "Connected to {} at {} baud",
                settings.tty, settings.baud_rate
            );
            debug!("data_bits    : {:#?}", settings.data_bits);
            debug!("stop_bits    : {:#?}", settings.stop_bits);
            debug!("parity       : {:#?}", settings.parity);
            debug!("flow control : {:#?}", settings.flow_control);
            Ok(port)
        }
        Err(err) => match err {
            retry::Error::Operation {
                error,
                total_delay,
                tries,
            } => {
                info!(
                    "Failed to open the port after {:?} and {} tries: {}",
                    total_delay, tries, error,
                );
                Err(error)
            }
            retry::Error::Internal(_) => {
                info!("Internal retry error while opening port");
                Err(serialport::Error::new(
                    serialport::ErrorKind::Unknown,
                    "internal error while retrying to open the port",
                ))
            }
        },
    }
}
