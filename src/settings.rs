//! Settings for the serial console, the TFTP responder and the flashing run.
//!
//! Use the [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
//! pattern to set the configurable values.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

pub use serialport::{DataBits, FlowControl, Parity, StopBits};

/// The file name the bootloader asks for when loading the system code.
pub const DEFAULT_FILENAME: &str = "vme50";

// =============================================================================
// Public Interface
// =============================================================================

/// Groups all settings used by `bootflash` for a single flashing run and acts
/// as a [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
/// for the settings.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Settings {
    /// The serial console device path.
    pub tty: String,
    /// The baud rate in symbols-per-second.
    pub baud_rate: u32,
    /// Number of bits used to represent a character sent on the line.
    pub data_bits: DataBits,
    /// The type of signalling to use for controlling data transfer.
    pub flow_control: FlowControl,
    /// The type of parity to use for error checking.
    pub parity: Parity,
    /// Number of bits to use to signal the end of a character.
    pub stop_bits: StopBits,

    /// An external terminal program (first element) and its arguments. When
    /// set, the console session talks to the program's stdin/stdout instead of
    /// opening `tty` directly.
    pub console_command: Option<Vec<String>>,

    /// Address the device is told to use for its TFTP client. Needs to be in
    /// the same /24 as `local_ip`.
    pub device_ip: Ipv4Addr,
    /// Local address the TFTP responder binds to.
    pub local_ip: Ipv4Addr,
    /// UDP port of the TFTP responder.
    pub tftp_port: u16,
    /// Network interface the device is resolved on. Defaults to the one
    /// carrying `local_ip`.
    pub interface: Option<String>,

    /// Path to the firmware image to be flashed.
    pub image: Option<PathBuf>,
    /// The only file name the TFTP responder serves.
    pub filename: String,
    /// Directory receiving one log file per flashed device.
    pub log_dir: PathBuf,
    /// Echo everything received on the console to stdout.
    pub verbose: bool,

    /// How many times the bootloader may report a TFTP retry overflow before
    /// the run is considered failed.
    pub max_transfer_retries: usize,
    /// Timeouts of the individual console waits.
    pub timeouts: Timeouts,

    /// Restrict creation of `Settings` instances unless through the
    /// `SettingsBuilder`.
    #[doc(hidden)]
    _private_use_builder: (),
}

/// Timeouts for each wait of the boot sequence.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Timeouts {
    /// Start-of-boot banner.
    pub banner: Duration,
    /// U-Boot version marker, right after the banner.
    pub uboot: Duration,
    /// Each step of the bootloader menu dialog.
    pub menu: Duration,
    /// The device connecting to the TFTP responder. The transfer duration is
    /// not bounded, hence the generous default.
    pub transfer_start: Duration,
    /// Byte count confirmation after the transfer.
    pub transfer_complete: Duration,
    /// Flash write completion.
    pub flash: Duration,
    /// Kernel start and console activation after flashing.
    pub reboot: Duration,
    /// Shell prompt after activating the console. Also the default timeout
    /// of the console session.
    pub shell_prompt: Duration,
    /// "Booting image" marker of the post-flash boot.
    pub booting_image: Duration,
    /// Healthy or corrupt verdict of the post-flash boot.
    pub boot_verdict: Duration,
    /// Maximum gap between two consecutive corruption signatures.
    pub bad_magic_gap: Duration,
}
impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            banner: Duration::from_secs(60),
            uboot: Duration::from_secs(10),
            menu: Duration::from_secs(30),
            transfer_start: Duration::from_secs(10 * 60),
            transfer_complete: Duration::from_secs(60),
            flash: Duration::from_secs(60),
            reboot: Duration::from_secs(60),
            shell_prompt: Duration::from_secs(1),
            booting_image: Duration::from_secs(5),
            boot_verdict: Duration::from_secs(5),
            bad_magic_gap: Duration::from_secs(1),
        }
    }
}
impl Timeouts {
    /// Use the same timeout for every wait. Mostly useful in tests.
    pub fn uniform(timeout: Duration) -> Self {
        Timeouts {
            banner: timeout,
            uboot: timeout,
            menu: timeout,
            transfer_start: timeout,
            transfer_complete: timeout,
            flash: timeout,
            reboot: timeout,
            shell_prompt: timeout,
            booting_image: timeout,
            boot_verdict: timeout,
            bad_magic_gap: timeout,
        }
    }
}

/// The builder for the `Settings` values.
///
/// All values are optional and have default values that will be used if not
/// explicitly set.
///
/// **Example**
///
/// ```
/// use bootflash::SettingsBuilder;
///
/// let settings = SettingsBuilder::new()
///     .tty("/dev/ttyUSB1")
///     .image("firmware.bin")
///     .finalize();
/// assert_eq!(settings.tty, "/dev/ttyUSB1");
/// ```
pub struct SettingsBuilder {
    settings: Settings,
}
impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
impl SettingsBuilder {
    /// Start building the settings using default values.
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings {
                tty: "/dev/ttyUSB0".into(),
                baud_rate: 57_600,
                data_bits: DataBits::Eight,
                flow_control: FlowControl::None,
                parity: Parity::None,
                stop_bits: StopBits::One,
                console_command: None,
                device_ip: Ipv4Addr::new(172, 16, 3, 212),
                local_ip: Ipv4Addr::new(172, 16, 3, 210),
                tftp_port: 69,
                interface: None,
                image: None,
                filename: DEFAULT_FILENAME.into(),
                log_dir: PathBuf::from("./logs"),
                verbose: true,
                max_transfer_retries: 10,
                timeouts: Timeouts::default(),
                _private_use_builder: (),
            },
        }
    }

    /// Set the path to the serial console
    pub fn tty<'a>(mut self, tty: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.tty = tty.into().into_owned();
        self
    }

    /// Set the baud rate in symbols-per-second
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.settings.baud_rate = baud_rate;
        self
    }

    /// Set the number of bits used to represent a character sent on the line
    pub fn data_bits(mut self, data_bits: DataBits) -> Self {
        self.settings.data_bits = data_bits;
        self
    }

    /// Set the type of signalling to use for controlling data transfer
    pub fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.settings.flow_control = flow_control;
        self
    }

    /// Set the type of parity to use for error checking
    pub fn parity(mut self, parity: Parity) -> Self {
        self.settings.parity = parity;
        self
    }

    /// Set the number of bits to use to signal the end of a character
    pub fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.settings.stop_bits = stop_bits;
        self
    }

    /// Talk to the console through an external program instead of the tty
    pub fn console_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command: Vec<String> = command.into_iter().map(Into::into).collect();
        self.settings.console_command = if command.is_empty() {
            None
        } else {
            Some(command)
        };
        self
    }

    /// Set the address the device should use for its TFTP client
    pub fn device_ip(mut self, device_ip: Ipv4Addr) -> Self {
        self.settings.device_ip = device_ip;
        self
    }

    /// Set the local address of the TFTP responder
    pub fn local_ip(mut self, local_ip: Ipv4Addr) -> Self {
        self.settings.local_ip = local_ip;
        self
    }

    /// Set the UDP port of the TFTP responder
    pub fn tftp_port(mut self, tftp_port: u16) -> Self {
        self.settings.tftp_port = tftp_port;
        self
    }

    /// Restrict neighbor table lookups to the given interface
    pub fn interface<'a>(mut self, interface: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.interface = Some(interface.into().into_owned());
        self
    }

    /// Set the path to the firmware image
    pub fn image(mut self, image: impl Into<PathBuf>) -> Self {
        self.settings.image = Some(image.into());
        self
    }

    /// Set the file name served by the TFTP responder
    pub fn filename<'a>(mut self, filename: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.filename = filename.into().into_owned();
        self
    }

    /// Set the directory for per-device log files
    pub fn log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.settings.log_dir = log_dir.into();
        self
    }

    /// Echo the console to stdout or not
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.settings.verbose = verbose;
        self
    }

    /// Set the bound on bootloader TFTP retry overflows
    pub fn max_transfer_retries(mut self, max_transfer_retries: usize) -> Self {
        self.settings.max_transfer_retries = max_transfer_retries;
        self
    }

    /// Set the console wait timeouts
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.settings.timeouts = timeouts;
        self
    }

    pub fn finalize(self) -> Settings {
        self.settings
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn all_default() {
    let settings = SettingsBuilder::new().finalize();
    assert_eq!(
        settings,
        Settings {
            tty: "/dev/ttyUSB0".into(),
            baud_rate: 57_600,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            parity: Parity::None,
            stop_bits: StopBits::One,
            console_command: None,
            device_ip: Ipv4Addr::new(172, 16, 3, 212),
            local_ip: Ipv4Addr::new(172, 16, 3, 210),
            tftp_port: 69,
            interface: None,
            image: None,
            filename: "vme50".into(),
            log_dir: PathBuf::from("./logs"),
            verbose: true,
            max_transfer_retries: 10,
            timeouts: Timeouts::default(),
            _private_use_builder: (),
        }
    )
}

#[test]
fn tty() {
    let settings = SettingsBuilder::new().tty("/dev/ttyUSB3").finalize();
    assert_eq!(settings.tty, "/dev/ttyUSB3");
}

#[test]
fn baud_rate() {
    let baud_rate = 115_200;
    let settings = SettingsBuilder::new().baud_rate(baud_rate).finalize();
    assert_eq!(settings.baud_rate, baud_rate);
}

#[test]
fn console_command() {
    let settings = SettingsBuilder::new()
        .console_command(vec!["picocom", "-b", "57600", "/dev/ttyUSB0"])
        .finalize();
    assert_eq!(
        settings.console_command.unwrap(),
        vec!["picocom", "-b", "57600", "/dev/ttyUSB0"]
    );
}

#[test]
fn empty_console_command_is_ignored() {
    let settings = SettingsBuilder::new()
        .console_command(Vec::<String>::new())
        .finalize();
    assert_eq!(settings.console_command, None);
}

#[test]
fn addresses() {
    let settings = SettingsBuilder::new()
        .device_ip(Ipv4Addr::new(10, 0, 0, 2))
        .local_ip(Ipv4Addr::new(10, 0, 0, 1))
        .tftp_port(6969)
        .finalize();
    assert_eq!(settings.device_ip, Ipv4Addr::new(10, 0, 0, 2));
    assert_eq!(settings.local_ip, Ipv4Addr::new(10, 0, 0, 1));
    assert_eq!(settings.tftp_port, 6969);
}

#[test]
fn image() {
    let settings = SettingsBuilder::new().image("test_vme50.bin").finalize();
    assert_eq!(settings.image.unwrap(), PathBuf::from("test_vme50.bin"));
}

#[test]
fn uniform_timeouts() {
    let timeouts = Timeouts::uniform(Duration::from_millis(250));
    assert_eq!(timeouts.transfer_start, Duration::from_millis(250));
    assert_eq!(timeouts.bad_magic_gap, Duration::from_millis(250));
}
