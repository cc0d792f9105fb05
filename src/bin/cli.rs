//! Bootflash command line interface.

use std::net::Ipv4Addr;
use std::process;
use std::str::FromStr;

use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_t, App, AppSettings::*, Arg,
    ArgMatches,
};
use console::style;
use log::{debug, trace, LevelFilter};
use simplelog::*;

use bootflash::{self as bf, utils::ProcNeighborTable, FlashFailure};

fn main() {
    println!("[BF] bootflash v{}", crate_version!());

    ctrlc::set_handler(move || {
        println!("🛑 received Ctrl+C!");
        process::exit(130);
    })
    .expect("Failed to install my Ctrl-C handler!");

    let matches = App::new(crate_name!())
        .version(format!("v{}", crate_version!()).as_str())
        .author(crate_authors!())
        .about(crate_description!())
        .long_about(
            "\n\
            Bootflash updates the firmware of a U-Boot based board over its \
            serial console and a TFTP download: \n\
               \t* waits for the board to power on and enter U-Boot \n\
               \t* selects `write to Flash via TFTP` in the boot menu \n\
               \t* serves the image from its own TFTP server \n\
               \t* waits for the flash write and reboots the board \n\
               \t* watches the new image boot for flash corruption \n\
            \n\
            The console output is saved in the log directory, in a file named \
            after the hardware address of the board.\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .arg(
            Arg::with_name("IMAGE")
                .help("path to the firmware image to be flashed")
                .short("-i")
                .long("--image")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("DEVICE_TTY")
                .help("the serial console of the board")
                .short("-t")
                .long("--tty")
                .takes_value(true)
                .default_value("/dev/ttyUSB0"),
        )
        .arg(
            Arg::with_name("BAUD_RATE")
                .help("serial port baud rate")
                .short("-b")
                .long("--baud-rate")
                .takes_value(true)
                .default_value("57600"),
        )
        .arg(
            Arg::with_name("DEVICE_IP")
                .help("address given to the board for the download")
                .long_help(
                    "address given to the board for the download; needs to \
                     be in the same /24 as the local address",
                )
                .long("--device-ip")
                .takes_value(true)
                .default_value("172.16.3.212"),
        )
        .arg(
            Arg::with_name("LOCAL_IP")
                .help("local address of the TFTP server")
                .long("--local-ip")
                .takes_value(true)
                .default_value("172.16.3.210"),
        )
        .arg(
            Arg::with_name("TFTP_PORT")
                .help("UDP port of the TFTP server")
                .long("--tftp-port")
                .takes_value(true)
                .default_value("69"),
        )
        .arg(
            Arg::with_name("INTERFACE")
                .help("only resolve boards seen on this network interface")
                .long("--interface")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("LOG_DIR")
                .help("directory for the console log files")
                .short("-l")
                .long("--log")
                .takes_value(true)
                .default_value("./logs"),
        )
        .arg(
            Arg::with_name("CONSOLE_CMD")
                .help("terminal program to reach the console with")
                .long_help(
                    "terminal program to reach the console with, e.g. \
                     `picocom -b 57600 /dev/ttyUSB0`; the serial port is \
                     opened directly when not set",
                )
                .long("--console-cmd")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("QUIET")
                .help("do not echo the console to stdout")
                .short("-q")
                .long("--quiet"),
        )
        .arg(Arg::with_name("v").short("v").multiple(true).help(
            "Sets the logging level of verbosity, repeat several times for \
                higher verbosity",
        ))
        .get_matches();

    // Vary the output based on how many times the user used the "verbose" flag
    // (i.e. 'bootflash -v -v -v' or 'bootflash -vvv' vs 'bootflash -v'
    let log_level = match matches.occurrences_of("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    TermLogger::init(
        log_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .unwrap();

    trace!("{:#?}", matches);

    // Arguments with default values ===========================================

    // It's safe to call unwrap on all command line arguments with default
    // values, because the value with either be what the user input at runtime
    // or the default value

    let baud_rate = value_t!(matches.value_of("BAUD_RATE"), u32)
        .unwrap_or_else(|_| invalid_value(&matches, "BAUD_RATE", "baud-rate", "a numeric value"));
    let tftp_port = value_t!(matches.value_of("TFTP_PORT"), u16)
        .unwrap_or_else(|_| invalid_value(&matches, "TFTP_PORT", "tftp-port", "a port number"));
    let device_ip = parse_or_exit::<Ipv4Addr>(&matches, "DEVICE_IP", "device-ip", "an IPv4 address");
    let local_ip = parse_or_exit::<Ipv4Addr>(&matches, "LOCAL_IP", "local-ip", "an IPv4 address");

    let mut builder = bf::SettingsBuilder::default()
        .image(matches.value_of("IMAGE").unwrap())
        .tty(matches.value_of("DEVICE_TTY").unwrap())
        .baud_rate(baud_rate)
        .device_ip(device_ip)
        .local_ip(local_ip)
        .tftp_port(tftp_port)
        .log_dir(matches.value_of("LOG_DIR").unwrap())
        .verbose(!matches.is_present("QUIET"));

    // START - Arguments with NO default values ================================

    if let Some(interface) = matches.value_of("INTERFACE") {
        builder = builder.interface(interface);
    }

    if let Some(command) = matches.value_of("CONSOLE_CMD") {
        builder = builder.console_command(command.split_whitespace());
    }

    // END - Arguments =========================================================

    let settings = builder.finalize();
    debug!("{:#?}", settings);

    // Run the flashing session ================================================

    let outcome = bf::flash(
        settings,
        Box::new(ProcNeighborTable::default()),
        |_: &FlashFailure| {
            println!("{}", style("[BF] TFTP server failed, aborting the run").red());
        },
    );

    match &outcome {
        Ok(()) => println!("{}", style("[BF] Boot successful").green()),
        Err(failure) => println!("{}", style(format!("[BF] {}", failure)).red()),
    }
    let exit_code = bf::exit_code(&outcome);
    debug!("exit code: {}", exit_code);
    process::exit(exit_code);
}

fn invalid_value(matches: &ArgMatches, name: &str, flag: &str, expected: &str) -> ! {
    println!(
        "{}: `{}` needs to be {}",
        style("error").red(),
        style(flag).cyan(),
        expected
    );
    println!(
        "   {} `{}` is not a valid value",
        style("-->").cyan(),
        style(matches.value_of(name).unwrap_or_default()).on_red()
    );
    process::exit(-1);
}

fn parse_or_exit<T: FromStr>(matches: &ArgMatches, name: &str, flag: &str, expected: &str) -> T {
    matches
        .value_of(name)
        .and_then(|value| value.parse().ok())
        .unwrap_or_else(|| invalid_value(matches, name, flag, expected))
}
