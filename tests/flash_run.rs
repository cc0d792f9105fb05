//! End to end flashing runs against a scripted console and a loopback TFTP
//! client.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use bootflash::console::testing::ScriptedConsole;
use bootflash::transfer::tftp::{ErrorCode, Mode, Packet, Request, DEFAULT_BLOCK_SIZE};
use bootflash::utils::{MacAddr, NeighborTable};
use bootflash::{exit_code, FlashFailure, RunContext, Settings, SettingsBuilder, Timeouts};

const MAC: MacAddr = MacAddr([0x00, 0xa0, 0xc9, 0x14, 0x2b, 0x3e]);

const BOOT: &str = "==============================================\nUBoot Version 5.2\n";

const MENU: &str = "Please choose the operation:\n\
    2: Load system code then write to Flash via TFTP.\n\
    default: 2\n\
    Are you sure? (Y/N)\n\
    Input device IP (172.16.3.212) ==:\n\
    Input server IP (172.16.3.210) ==:\n\
    Input Linux Kernel filename (vme50) ==:\n\
    ETH_STATE_ACTIVE!!\n\
    Loading: ";

struct FixedTable;
impl NeighborTable for FixedTable {
    fn lookup(&self, _: Option<&str>, _: IpAddr) -> io::Result<Option<MacAddr>> {
        Ok(Some(MAC))
    }
}

struct EmptyTable;
impl NeighborTable for EmptyTable {
    fn lookup(&self, _: Option<&str>, _: IpAddr) -> io::Result<Option<MacAddr>> {
        Ok(None)
    }
}

fn settings(dir: &Path, image: &[u8]) -> Settings {
    let path = dir.join("vme50.bin");
    fs::write(&path, image).unwrap();
    SettingsBuilder::new()
        .image(path)
        .log_dir(dir.join("logs"))
        .local_ip(Ipv4Addr::LOCALHOST)
        .tftp_port(0)
        .verbose(false)
        .timeouts(Timeouts {
            transfer_start: Duration::from_secs(10),
            ..Timeouts::uniform(Duration::from_millis(500))
        })
        .finalize()
}

fn tftp_client() -> UdpSocket {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    socket
}

fn read_request(socket: &UdpSocket, server: SocketAddr, filename: &str) {
    let request = Packet::ReadRequest(Request {
        filename: filename.into(),
        mode: Mode::Octet,
        options: Vec::new(),
    });
    socket.send_to(&request.encode(), server).unwrap();
}

fn receive(socket: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buf = [0u8; 1024];
    let (len, from) = socket.recv_from(&mut buf).unwrap();
    (Packet::parse(&buf[..len]).unwrap(), from)
}

fn download(socket: &UdpSocket, server: SocketAddr, filename: &str) -> Vec<u8> {
    read_request(socket, server, filename);
    let mut received = Vec::new();
    loop {
        match receive(socket) {
            (Packet::Data { block, payload }, from) => {
                received.extend_from_slice(&payload);
                socket.send_to(&Packet::Ack { block }.encode(), from).unwrap();
                if payload.len() < DEFAULT_BLOCK_SIZE {
                    return received;
                }
            }
            (other, _) => panic!("unexpected {:?}", other),
        }
    }
}

fn log_files(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect()
}

#[test]
fn wrong_file_is_refused_while_the_run_goes_on() {
    let dir = tempfile::tempdir().unwrap();
    let image: Vec<u8> = (0..1300u32).map(|i| (i % 253) as u8).collect();
    let mut context = RunContext::new(settings(dir.path(), &image)).unwrap();

    let (tx, fatal) = mpsc::channel();
    let local = context
        .start_transfer_server(Box::new(FixedTable), move |failure: &FlashFailure| {
            let _ = tx.send(failure.to_string());
        })
        .unwrap();
    let server = SocketAddr::from((Ipv4Addr::LOCALHOST, local.port()));

    let console = ScriptedConsole::new();
    let mut session = console.session(context.session_options()).unwrap();
    console.emit(BOOT);
    console.emit(MENU);
    let sequencer = thread::spawn(move || context.run(&mut session));

    let client = tftp_client();
    read_request(&client, server, "wrong.bin");
    match receive(&client).0 {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::FileNotFound as u16),
        other => panic!("unexpected {:?}", other),
    }
    assert!(log_files(&dir.path().join("logs")).is_empty());

    assert_eq!(download(&client, server, "vme50"), image);
    let log_path = dir.path().join("logs").join("00a0c9142b3e.log");
    assert_eq!(log_files(&dir.path().join("logs")), vec![log_path.clone()]);

    console.emit("Got it\n");
    console.emit("Bytes transferred = 1300 (514 hex)\n");
    console.emit("Erasing... Writing... Done!\n");
    console.emit("Starting kernel ...\n");
    console.emit("Please press Enter to activate this console.\n");
    console.emit("root@vme50:/# ");
    console.emit(BOOT);
    console.emit("## Booting image at 80800000 ...\n");
    console.emit("Please press Enter to activate this console.\n");

    let report = sequencer.join().unwrap();
    assert!(report.outcome.is_ok(), "{:?}", report.outcome);
    assert_eq!(exit_code(&report.outcome), 0);
    assert!(fatal.try_recv().is_err());

    let log = fs::read_to_string(&log_path).unwrap();
    assert!(log.starts_with("=============================================="));
    assert!(log.contains("Input Linux Kernel filename (vme50)"));
    assert!(log.contains("Booting image at 80800000"));
}

#[test]
fn unresolved_client_aborts_the_run_at_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut context = RunContext::new(settings(dir.path(), &[1; 700])).unwrap();

    let (tx, fatal) = mpsc::channel();
    let local = context
        .start_transfer_server(Box::new(EmptyTable), move |failure: &FlashFailure| {
            let _ = tx.send(failure.to_string());
        })
        .unwrap();
    let server = SocketAddr::from((Ipv4Addr::LOCALHOST, local.port()));

    let console = ScriptedConsole::new();
    let mut session = console.session(context.session_options()).unwrap();
    console.emit(BOOT);
    console.emit(MENU);
    let started = Instant::now();
    let sequencer = thread::spawn(move || {
        let report = context.run(&mut session);
        (report, session.is_closed())
    });

    let client = tftp_client();
    read_request(&client, server, "vme50");
    match receive(&client).0 {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::AccessViolation as u16),
        other => panic!("unexpected {:?}", other),
    }

    let (report, closed) = sequencer.join().unwrap();
    // Well within the 10 s the sequencer would wait for the transfer
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(closed);
    assert!(
        matches!(report.outcome, Err(FlashFailure::ResolutionFailure { .. })),
        "{:?}",
        report.outcome
    );
    assert_eq!(exit_code(&report.outcome), 1);
    assert!(fatal.try_recv().unwrap().contains("127.0.0.1"));
    assert!(log_files(&dir.path().join("logs")).is_empty());
}

#[test]
fn corrupt_flash_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut context = RunContext::new(settings(dir.path(), &[0x5a; 2048])).unwrap();

    let console = ScriptedConsole::new();
    let mut session = console.session(context.session_options()).unwrap();
    for text in &[
        BOOT,
        MENU,
        "Got it\n",
        "Bytes transferred = 2048 (800 hex)\n",
        "Done!\n",
        "Starting kernel ...\n",
        "Please press Enter to activate this console.\n",
        "root@vme50:/# ",
        BOOT,
        "## Booting image at 80800000 ...\n",
        "Bad Magic Number\n",
        "Bad Magic Number\n",
        "Bad Magic Number\n",
        "Hit any key to stop autoboot\n",
    ] {
        console.emit(text);
    }

    let report = context.run(&mut session);
    assert!(session.is_closed());
    assert_eq!(exit_code(&report.outcome), 1);
    match report.outcome {
        Err(failure @ FlashFailure::BadMagicNumber { .. }) => {
            assert!(failure.to_string().contains('3'))
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn retries_are_absorbed_below_the_limit() {
    let dir = tempfile::tempdir().unwrap();
    let mut context = RunContext::new(settings(dir.path(), &[0; 512])).unwrap();

    let console = ScriptedConsole::new();
    let mut session = console.session(context.session_options()).unwrap();
    console.emit(BOOT);
    console.emit(MENU);
    for _ in 0..3 {
        console.emit("Retry count exceeded; starting again\n");
    }
    console.emit("Got it\n");
    console.hang_up();

    let report = context.run(&mut session);
    assert_eq!(report.transfer_retries, 3);
    assert!(matches!(
        report.outcome,
        Err(FlashFailure::ProtocolMismatch { .. })
    ));
}

#[test]
fn flashing_without_an_image_fails_early() {
    let outcome = bootflash::flash(
        SettingsBuilder::new().finalize(),
        Box::new(FixedTable),
        |_| {},
    );
    assert!(matches!(outcome, Err(FlashFailure::MissingImage)));
    assert_eq!(exit_code(&outcome), 1);
}
