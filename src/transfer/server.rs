use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use super::coordinator::{TransferCoordinator, TransferRecord};
use super::tftp::{self, ErrorCode, Packet, MAX_PACKET_SIZE};
use crate::error::FlashFailure;

/// How often the listening thread checks whether it has to stop.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// A TFTP responder serving read requests on a background thread until it is
/// shut down or hits a fatal failure.
pub struct TransferServer {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    records: Arc<Mutex<Vec<TransferRecord>>>,
    handle: Option<JoinHandle<()>>,
}

impl TransferServer {
    /// Bind `address` and start serving. Fatal failures are handed to
    /// `on_fatal` on the serving thread, after which the server stops.
    /// Rejected requests are answered with an error and serving goes on.
    pub fn start<F>(
        address: SocketAddr,
        coordinator: TransferCoordinator,
        on_fatal: F,
    ) -> io::Result<Self>
    where
        F: Fn(FlashFailure) + Send + 'static,
    {
        let socket = UdpSocket::bind(address)?;
        socket.set_read_timeout(Some(ACCEPT_POLL))?;
        let local_addr = socket.local_addr()?;
        info!("TFTP server listening on {}", local_addr);

        let stop = Arc::new(AtomicBool::new(false));
        let records = Arc::new(Mutex::new(Vec::new()));
        let handle = {
            let stop = stop.clone();
            let records = records.clone();
            thread::Builder::new()
                .name("tftp-server".into())
                .spawn(move || serve(socket, coordinator, stop, records, on_fatal))?
        };

        Ok(TransferServer {
            local_addr,
            stop,
            records,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The transfers served so far.
    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the serving thread is still accepting requests.
    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::Acquire)
    }

    /// Stop serving and wait for the serving thread. A transfer in flight is
    /// allowed to finish first.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("TFTP server thread panicked");
            }
            debug!("TFTP server on {} stopped", self.local_addr);
        }
    }
}

impl Drop for TransferServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

fn serve<F>(
    socket: UdpSocket,
    coordinator: TransferCoordinator,
    stop: Arc<AtomicBool>,
    records: Arc<Mutex<Vec<TransferRecord>>>,
    on_fatal: F,
) where
    F: Fn(FlashFailure),
{
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    while !stop.load(Ordering::Acquire) {
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if is_timeout(&e) => continue,
            Err(e) => {
                error!("TFTP server failed: {}", e);
                stop.store(true, Ordering::Release);
                on_fatal(e.into());
                return;
            }
        };

        let request = match Packet::parse(&buf[..len]) {
            Ok(Packet::ReadRequest(request)) => request,
            Ok(other) => {
                debug!("{} sent {:?}", peer, other);
                tftp::send_error(
                    &socket,
                    peer,
                    ErrorCode::IllegalOperation,
                    "only read requests are served",
                );
                continue;
            }
            Err(e) => {
                debug!("malformed request from {}: {}", peer, e);
                tftp::send_error(&socket, peer, ErrorCode::IllegalOperation, &e.to_string());
                continue;
            }
        };
        info!("read request for {} from {}", request.filename, peer);

        match coordinator.serve(&request, peer) {
            Ok(record) => records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(record),
            Err(failure) if !failure.is_fatal() => warn!("{}", failure),
            Err(failure) => {
                error!("{}", failure);
                stop.store(true, Ordering::Release);
                on_fatal(failure);
                return;
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::LogSink;
    use crate::settings::SettingsBuilder;
    use crate::transfer::tftp::{Mode, Request};
    use crate::utils::{MacAddr, NeighborTable};
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::Path;
    use std::sync::mpsc;

    struct FixedTable(Option<MacAddr>);
    impl NeighborTable for FixedTable {
        fn lookup(&self, _: Option<&str>, _: IpAddr) -> io::Result<Option<MacAddr>> {
            Ok(self.0)
        }
    }

    const MAC: MacAddr = MacAddr([0x00, 0xa0, 0xc9, 0x14, 0x2b, 0x3e]);

    fn loopback() -> SocketAddr {
        (Ipv4Addr::LOCALHOST, 0).into()
    }

    fn start(
        dir: &Path,
        image: &[u8],
        mac: Option<MacAddr>,
    ) -> (TransferServer, LogSink, mpsc::Receiver<FlashFailure>) {
        std::fs::write(dir.join("image.bin"), image).unwrap();
        let settings = SettingsBuilder::new()
            .log_dir(dir)
            .local_ip(Ipv4Addr::LOCALHOST)
            .finalize();
        let sink = LogSink::new();
        let coordinator = TransferCoordinator::new(
            &settings,
            dir.join("image.bin"),
            image.len() as u64,
            sink.clone(),
            Box::new(FixedTable(mac)),
        )
        .with_packet_timeout(Duration::from_millis(500));
        let (tx, rx) = mpsc::channel();
        let on_fatal = move |failure: FlashFailure| {
            let _ = tx.send(failure);
        };
        let server = TransferServer::start(loopback(), coordinator, on_fatal).unwrap();
        (server, sink, rx)
    }

    fn read_request(filename: &str) -> Vec<u8> {
        Packet::ReadRequest(Request {
            filename: filename.into(),
            mode: Mode::Octet,
            options: Vec::new(),
        })
        .encode()
    }

    fn client() -> UdpSocket {
        let socket = UdpSocket::bind(loopback()).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    fn receive(socket: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, from) = socket.recv_from(&mut buf).unwrap();
        (Packet::parse(&buf[..len]).unwrap(), from)
    }

    #[test]
    fn wrong_file_is_rejected_and_serving_goes_on() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, sink, fatal) = start(dir.path(), b"firmware", Some(MAC));
        let client = client();

        client
            .send_to(&read_request("wrong.bin"), server.local_addr())
            .unwrap();
        match receive(&client).0 {
            Packet::Error { code, .. } => assert_eq!(code, ErrorCode::FileNotFound as u16),
            other => panic!("unexpected {:?}", other),
        }
        assert!(server.is_running());
        assert!(server.transfers().is_empty());
        assert!(!sink.is_redirected());
        assert!(!dir.path().join("00a0c9142b3e.log").exists());

        server.shutdown();
        assert!(fatal.try_recv().is_err());
    }

    #[test]
    fn image_is_served_from_a_fresh_transfer_id() {
        let dir = tempfile::tempdir().unwrap();
        let image: Vec<u8> = (0..1300u32).map(|i| (i % 251) as u8).collect();
        let (mut server, sink, _fatal) = start(dir.path(), &image, Some(MAC));
        let client = client();

        client
            .send_to(&read_request("vme50"), server.local_addr())
            .unwrap();
        let mut received = Vec::new();
        loop {
            let (packet, from) = receive(&client);
            assert_ne!(from, server.local_addr());
            match packet {
                Packet::Data { block, payload } => {
                    received.extend_from_slice(&payload);
                    client.send_to(&Packet::Ack { block }.encode(), from).unwrap();
                    if payload.len() < tftp::DEFAULT_BLOCK_SIZE {
                        break;
                    }
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(received, image);

        server.shutdown();
        let transfers = server.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].bytes_sent, 1300);
        assert_eq!(transfers[0].mac, MAC);
        assert!(sink.is_redirected());
        assert!(dir.path().join("00a0c9142b3e.log").exists());
    }

    #[test]
    fn announced_size_is_fixed_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, _sink, _fatal) = start(dir.path(), &[7u8; 100], Some(MAC));
        std::fs::write(dir.path().join("image.bin"), [7u8; 300]).unwrap();
        let client = client();

        let request = Packet::ReadRequest(Request {
            filename: "vme50".into(),
            mode: Mode::Octet,
            options: vec![("tsize".into(), "0".into())],
        });
        client.send_to(&request.encode(), server.local_addr()).unwrap();
        let (oack, from) = receive(&client);
        assert_eq!(
            oack,
            Packet::OptionAck {
                options: vec![("tsize".into(), "100".into())]
            }
        );

        client.send_to(&Packet::Ack { block: 0 }.encode(), from).unwrap();
        loop {
            match receive(&client) {
                (Packet::Data { block, payload }, from) => {
                    client.send_to(&Packet::Ack { block }.encode(), from).unwrap();
                    if payload.len() < tftp::DEFAULT_BLOCK_SIZE {
                        break;
                    }
                }
                (other, _) => panic!("unexpected {:?}", other),
            }
        }
        server.shutdown();
    }

    #[test]
    fn write_requests_are_illegal() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, _sink, _fatal) = start(dir.path(), b"firmware", Some(MAC));
        let client = client();

        let write = Packet::WriteRequest(Request {
            filename: "vme50".into(),
            mode: Mode::Octet,
            options: Vec::new(),
        });
        client.send_to(&write.encode(), server.local_addr()).unwrap();
        match receive(&client).0 {
            Packet::Error { code, .. } => {
                assert_eq!(code, ErrorCode::IllegalOperation as u16)
            }
            other => panic!("unexpected {:?}", other),
        }
        server.shutdown();
    }

    #[test]
    fn unresolved_client_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, sink, fatal) = start(dir.path(), b"firmware", None);
        let client = client();

        client
            .send_to(&read_request("vme50"), server.local_addr())
            .unwrap();
        let failure = fatal.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(failure, FlashFailure::ResolutionFailure { .. }));
        assert!(!sink.is_redirected());

        server.shutdown();
        assert!(!server.is_running());
    }
}
