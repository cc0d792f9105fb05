use std::fs::File;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::time::Duration;

use ::console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};

use super::tftp::{self, ErrorCode, Request, TransferOptions};
use crate::console::LogSink;
use crate::error::FlashFailure;
use crate::settings::Settings;
use crate::utils::{MacAddr, NeighborTable};

/// Per-packet timeout used when the client does not negotiate one.
pub const DEFAULT_PACKET_TIMEOUT: Duration = Duration::from_secs(5);

/// A read request that was accepted and served.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransferRecord {
    pub client: IpAddr,
    pub mac: MacAddr,
    /// Where the console log goes since this transfer.
    pub log_path: PathBuf,
    pub bytes_sent: u64,
}

/// Decides which read requests get the firmware image and ties the console
/// log to the device that asked for it.
pub struct TransferCoordinator {
    filename: String,
    image_path: PathBuf,
    /// Fixed when the run starts. Announced as `tsize` and on the progress bar.
    image_size: u64,
    log_dir: PathBuf,
    interface: Option<String>,
    local_ip: IpAddr,
    packet_timeout: Duration,
    sink: LogSink,
    neighbors: Box<dyn NeighborTable>,
}

impl TransferCoordinator {
    pub fn new(
        settings: &Settings,
        image_path: PathBuf,
        image_size: u64,
        sink: LogSink,
        neighbors: Box<dyn NeighborTable>,
    ) -> Self {
        TransferCoordinator {
            filename: settings.filename.clone(),
            image_path,
            image_size,
            log_dir: settings.log_dir.clone(),
            interface: settings.interface.clone(),
            local_ip: settings.local_ip.into(),
            packet_timeout: DEFAULT_PACKET_TIMEOUT,
            sink,
            neighbors,
        }
    }

    /// Per-packet timeout for clients that do not negotiate one.
    pub fn with_packet_timeout(mut self, timeout: Duration) -> Self {
        self.packet_timeout = timeout;
        self
    }

    /// Admit a read request for `filename` from `client`.
    ///
    /// Only the configured file name is served. The client must have a
    /// complete neighbor table entry; its hardware address names the log file
    /// the console output is redirected to. Only the first accepted request
    /// moves the log.
    pub fn accept(&self, filename: &str, client: IpAddr) -> Result<TransferRecord, FlashFailure> {
        if filename != self.filename {
            warn!(
                "filename mismatch, requested={} expected={}",
                filename, self.filename
            );
            return Err(FlashFailure::TransferRejected {
                requested: filename.to_owned(),
                expected: self.filename.clone(),
            });
        }

        let mac = match self.neighbors.lookup(self.interface.as_deref(), client) {
            Ok(Some(mac)) => mac,
            Ok(None) => return Err(FlashFailure::ResolutionFailure { ip: client }),
            Err(e) => {
                warn!("unable to read the neighbor table: {}", e);
                return Err(FlashFailure::ResolutionFailure { ip: client });
            }
        };
        info!("{} resolved to {}", client, mac);

        let log_path = self.log_dir.join(format!("{}.log", mac.to_hex()));
        if self.sink.redirect_to_file(&log_path)? {
            info!("console log redirected to {}", log_path.display());
        } else {
            debug!("console log already goes to {:?}", self.sink.path());
        }

        Ok(TransferRecord {
            client,
            mac,
            log_path,
            bytes_sent: 0,
        })
    }

    /// Serve one read request from `peer` on a fresh transfer socket.
    pub(crate) fn serve(
        &self,
        request: &Request,
        peer: SocketAddr,
    ) -> Result<TransferRecord, FlashFailure> {
        let socket = UdpSocket::bind((self.local_ip, 0))?;
        debug!(
            "transfer socket {} for {}",
            socket.local_addr()?,
            peer
        );

        let mut record = match self.accept(&request.filename, peer.ip()) {
            Ok(record) => record,
            Err(failure) => {
                let code = match failure {
                    FlashFailure::TransferRejected { .. } => ErrorCode::FileNotFound,
                    _ => ErrorCode::AccessViolation,
                };
                tftp::send_error(&socket, peer, code, &failure.to_string());
                return Err(failure);
            }
        };

        let mut image = match File::open(&self.image_path) {
            Ok(image) => image,
            Err(e) => {
                tftp::send_error(&socket, peer, ErrorCode::NotDefined, "image unavailable");
                return Err(e.into());
            }
        };
        let options =
            TransferOptions::negotiate(&request.options, self.image_size, self.packet_timeout);
        socket.set_read_timeout(Some(options.timeout))?;
        debug!(
            "{} mode, block size {}, timeout {:?}",
            request.mode, options.block_size, options.timeout
        );

        println!(
            "{}",
            style(format!(
                "[BF] Download of {} started from {} ({})",
                request.filename, peer, record.mac
            ))
            .green()
        );
        let pb = ProgressBar::new(self.image_size);
        pb.set_style(ProgressStyle::default_bar()
            .template("[BF] ⏩ Serving [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .progress_chars("=>-"));

        match tftp::send_file(&socket, peer, &mut image, &options, |sent| {
            pb.set_position(sent)
        }) {
            Ok(sent) => {
                pb.finish_with_message("[BF] Image served");
                record.bytes_sent = sent;
                println!(
                    "{}",
                    style(format!("[BF] Download by {} finished, {} bytes", peer, sent)).green()
                );
                Ok(record)
            }
            Err(e) => {
                pb.abandon();
                println!(
                    "{}",
                    style(format!("[BF] Download by {} failed: {}", peer, e)).red()
                );
                Err(e.into())
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
