//! TFTP wire format (RFC 1350) with option negotiation (RFC 2347, 2348, 2349)
//! and the sending side of a read transfer.
//!
//! - [`Packet`] - every packet kind, with [`Packet::parse`] and
//!   [`Packet::encode`]
//! - [`ErrorCode`] - the standard error codes
//! - [`TransferOptions`] - negotiated block size, timeout and transfer size
//! - [`send_file`] - lock-step DATA/ACK streaming with retransmissions

use std::fmt;
use std::io::{self, Read};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use log::{debug, trace};
use retry::{delay, retry, OperationResult};
use thiserror::Error;

/// Block size used unless the client negotiates another one.
pub const DEFAULT_BLOCK_SIZE: usize = 512;
/// Bounds of the `blksize` option.
pub const MIN_BLOCK_SIZE: usize = 8;
pub const MAX_BLOCK_SIZE: usize = 65464;
/// Room for the largest DATA packet.
pub const MAX_PACKET_SIZE: usize = MAX_BLOCK_SIZE + 4;
/// Retransmissions of an unacknowledged packet before giving up.
pub const MAX_RETRANSMITS: usize = 5;

/// Standard TFTP error codes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileExists = 6,
    NoSuchUser = 7,
    OptionRefused = 8,
}

/// Transfer modes. The file is sent as is in every mode.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Mode {
    NetAscii,
    Octet,
    Mail,
}
impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::NetAscii => "netascii",
            Mode::Octet => "octet",
            Mode::Mail => "mail",
        })
    }
}

/// A read or write request.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Request {
    pub filename: String,
    pub mode: Mode,
    /// Option names and values, in request order.
    pub options: Vec<(String, String)>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Packet {
    ReadRequest(Request),
    WriteRequest(Request),
    Data { block: u16, payload: Vec<u8> },
    Ack { block: u16 },
    Error { code: u16, message: String },
    OptionAck { options: Vec<(String, String)> },
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum PacketError {
    #[error("packet is truncated")]
    Truncated,
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("string field is not terminated")]
    Unterminated,
    #[error("string field is not valid text")]
    InvalidText,
    #[error("unknown transfer mode `{0}`")]
    UnknownMode(String),
    #[error("option `{0}` has no value")]
    MissingOptionValue(String),
}

impl Packet {
    pub fn error(code: ErrorCode, message: &str) -> Self {
        Packet::Error {
            code: code as u16,
            message: message.to_owned(),
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < 2 {
            return Err(PacketError::Truncated);
        }
        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        let body = &buf[2..];
        match opcode {
            1 => Ok(Packet::ReadRequest(parse_request(body)?)),
            2 => Ok(Packet::WriteRequest(parse_request(body)?)),
            3 => {
                let block = be_u16(body)?;
                Ok(Packet::Data {
                    block,
                    payload: body[2..].to_vec(),
                })
            }
            4 => Ok(Packet::Ack {
                block: be_u16(body)?,
            }),
            5 => {
                let code = be_u16(body)?;
                // Some clients omit the message terminator
                let message = strings(&body[2..])
                    .ok()
                    .and_then(|fields| fields.into_iter().next())
                    .unwrap_or_default();
                Ok(Packet::Error { code, message })
            }
            6 => Ok(Packet::OptionAck {
                options: pairs(strings(body)?)?,
            }),
            other => Err(PacketError::UnknownOpcode(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Packet::ReadRequest(request) | Packet::WriteRequest(request) => {
                let opcode: u16 = if matches!(self, Packet::ReadRequest(_)) {
                    1
                } else {
                    2
                };
                out.extend_from_slice(&opcode.to_be_bytes());
                push_str(&mut out, &request.filename);
                push_str(&mut out, &request.mode.to_string());
                for (name, value) in &request.options {
                    push_str(&mut out, name);
                    push_str(&mut out, value);
                }
            }
            Packet::Data { block, payload } => {
                out.extend_from_slice(&3u16.to_be_bytes());
                out.extend_from_slice(&block.to_be_bytes());
                out.extend_from_slice(payload);
            }
            Packet::Ack { block } => {
                out.extend_from_slice(&4u16.to_be_bytes());
                out.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                out.extend_from_slice(&5u16.to_be_bytes());
                out.extend_from_slice(&code.to_be_bytes());
                push_str(&mut out, message);
            }
            Packet::OptionAck { options } => {
                out.extend_from_slice(&6u16.to_be_bytes());
                for (name, value) in options {
                    push_str(&mut out, name);
                    push_str(&mut out, value);
                }
            }
        }
        out
    }
}

/// The outcome of option negotiation for one transfer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TransferOptions {
    pub block_size: usize,
    pub timeout: Duration,
    /// Options to confirm with an OACK. Empty when nothing was negotiated, in
    /// which case the transfer starts with the first DATA packet.
    pub acknowledged: Vec<(String, String)>,
}
impl TransferOptions {
    /// Accept the supported options among `requested`. Invalid values and
    /// unknown options are left out of the acknowledgement.
    pub fn negotiate(requested: &[(String, String)], file_size: u64, timeout: Duration) -> Self {
        let mut options = TransferOptions {
            block_size: DEFAULT_BLOCK_SIZE,
            timeout,
            acknowledged: Vec::new(),
        };
        for (name, value) in requested {
            match name.to_ascii_lowercase().as_str() {
                "blksize" => {
                    if let Ok(size) = value.parse::<usize>() {
                        let size = size.min(MAX_BLOCK_SIZE);
                        if size >= MIN_BLOCK_SIZE {
                            options.block_size = size;
                            options.acknowledged.push((name.clone(), size.to_string()));
                        }
                    }
                }
                "tsize" => {
                    options.acknowledged.push((name.clone(), file_size.to_string()));
                }
                "timeout" => {
                    if let Ok(seconds @ 1..=255) = value.parse::<u64>() {
                        options.timeout = Duration::from_secs(seconds);
                        options.acknowledged.push((name.clone(), seconds.to_string()));
                    }
                }
                _ => debug!("ignoring TFTP option {}={}", name, value),
            }
        }
        options
    }
}

/// Send an error packet, ignoring failures: the peer may already be gone.
pub fn send_error(socket: &UdpSocket, peer: SocketAddr, code: ErrorCode, message: &str) {
    let packet = Packet::error(code, message).encode();
    if let Err(e) = socket.send_to(&packet, peer) {
        debug!("failed to send TFTP error to {}: {}", peer, e);
    }
}

/// Stream `source` to `peer` in lock-step. The socket must have a read
/// timeout set, it paces the retransmissions. `progress` is called with the
/// number of bytes acknowledged so far. Returns the number of bytes sent.
pub fn send_file<R, F>(
    socket: &UdpSocket,
    peer: SocketAddr,
    source: &mut R,
    options: &TransferOptions,
    mut progress: F,
) -> io::Result<u64>
where
    R: Read,
    F: FnMut(u64),
{
    if !options.acknowledged.is_empty() {
        let oack = Packet::OptionAck {
            options: options.acknowledged.clone(),
        };
        transmit(socket, peer, &oack.encode(), 0)?;
    }

    let mut chunk = vec![0; options.block_size];
    let mut block: u16 = 1;
    let mut sent: u64 = 0;
    loop {
        let len = read_block(source, &mut chunk)?;
        let data = Packet::Data {
            block,
            payload: chunk[..len].to_vec(),
        };
        transmit(socket, peer, &data.encode(), block)?;
        sent += len as u64;
        progress(sent);
        // A short block ends the transfer
        if len < options.block_size {
            return Ok(sent);
        }
        block = block.wrapping_add(1);
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn be_u16(body: &[u8]) -> Result<u16, PacketError> {
    match body {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(PacketError::Truncated),
    }
}

fn strings(body: &[u8]) -> Result<Vec<String>, PacketError> {
    match body.split_last() {
        None => Ok(Vec::new()),
        Some((0, fields)) => fields
            .split(|b| *b == 0)
            .map(|field| String::from_utf8(field.to_vec()).map_err(|_| PacketError::InvalidText))
            .collect(),
        Some(_) => Err(PacketError::Unterminated),
    }
}

fn pairs(fields: Vec<String>) -> Result<Vec<(String, String)>, PacketError> {
    let mut fields = fields.into_iter();
    let mut options = Vec::new();
    while let Some(name) = fields.next() {
        match fields.next() {
            Some(value) => options.push((name, value)),
            None => return Err(PacketError::MissingOptionValue(name)),
        }
    }
    Ok(options)
}

fn parse_request(body: &[u8]) -> Result<Request, PacketError> {
    let mut fields = strings(body)?.into_iter();
    let filename = fields.next().ok_or(PacketError::Truncated)?;
    let mode = fields.next().ok_or(PacketError::Truncated)?;
    let mode = match mode.to_ascii_lowercase().as_str() {
        "netascii" => Mode::NetAscii,
        "octet" => Mode::Octet,
        "mail" => Mode::Mail,
        _ => return Err(PacketError::UnknownMode(mode)),
    };
    Ok(Request {
        filename,
        mode,
        options: pairs(fields.collect())?,
    })
}

fn push_str(out: &mut Vec<u8>, field: &str) {
    out.extend_from_slice(field.as_bytes());
    out.push(0);
}

/// Fill `chunk` as much as the source allows. Less than a full chunk means
/// the end of the source was reached.
fn read_block<R: Read>(source: &mut R, chunk: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < chunk.len() {
        match source.read(&mut chunk[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Send `packet` until `peer` acknowledges `block`.
fn transmit(socket: &UdpSocket, peer: SocketAddr, packet: &[u8], block: u16) -> io::Result<()> {
    let result = retry(delay::NoDelay.take(MAX_RETRANSMITS), || {
        let exchange = socket
            .send_to(packet, peer)
            .and_then(|_| await_ack(socket, peer, block));
        match exchange {
            Ok(()) => OperationResult::Ok(()),
            Err(e) if is_timeout(&e) => {
                trace!("no ACK for block {} from {}, resending", block, peer);
                OperationResult::Retry(e)
            }
            Err(e) => OperationResult::Err(e),
        }
    });
    match result {
        Ok(()) => Ok(()),
        Err(retry::Error::Operation { error, tries, .. }) => {
            debug!("block {} to {} failed after {} tries", block, peer, tries);
            Err(error)
        }
        Err(retry::Error::Internal(message)) => Err(io::Error::new(io::ErrorKind::Other, message)),
    }
}

fn await_ack(socket: &UdpSocket, peer: SocketAddr, block: u16) -> io::Result<()> {
    let mut buf = [0u8; 516];
    loop {
        let (n, from) = socket.recv_from(&mut buf)?;
        if from != peer {
            send_error(socket, from, ErrorCode::UnknownTransferId, "unknown transfer ID");
            continue;
        }
        match Packet::parse(&buf[..n]) {
            Ok(Packet::Ack { block: acked }) if acked == block => return Ok(()),
            // Duplicate of an earlier ACK
            Ok(Packet::Ack { .. }) => {}
            Ok(Packet::Error { code, message }) => {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    format!("client aborted the transfer: {} ({})", message, code),
                ))
            }
            Ok(other) => debug!("unexpected packet from {}: {:?}", peer, other),
            Err(e) => debug!("malformed packet from {}: {}", peer, e),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
