//! Hardware address resolution through the host neighbor (ARP) table.

use std::fmt;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;

use log::trace;

/// A link-layer hardware address.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct MacAddr(pub [u8; 6]);
impl MacAddr {
    /// Lowercase hex without separators, e.g. `00a0c9142b3e`.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    fn is_unset(&self) -> bool {
        self.0 == [0; 6]
    }
}
impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}
impl FromStr for MacAddr {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || io::Error::new(io::ErrorKind::InvalidData, format!("bad MAC `{}`", s));
        let mut bytes = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(MacAddr(bytes))
    }
}

/// The name of the host interface that carries `ip`, if any.
#[cfg(unix)]
pub fn interface_with_address(ip: Ipv4Addr) -> io::Result<Option<String>> {
    use std::net::SocketAddrV4;

    for entry in nix::ifaddrs::getifaddrs()? {
        let address = entry
            .address
            .as_ref()
            .and_then(|address| address.as_sockaddr_in())
            .map(|address| *SocketAddrV4::from(*address).ip());
        trace!("interface {} has {:?}", entry.interface_name, address);
        if address == Some(ip) {
            return Ok(Some(entry.interface_name));
        }
    }
    Ok(None)
}

#[cfg(not(unix))]
pub fn interface_with_address(_ip: Ipv4Addr) -> io::Result<Option<String>> {
    Err(io::Error::new(
        io::ErrorKind::Other,
        "interface addresses are only available on unix hosts",
    ))
}

/// Maps network addresses to hardware addresses.
pub trait NeighborTable: Send + Sync {
    /// The hardware address of `ip` as seen on `interface` (any interface when
    /// `None`), or `Ok(None)` when the table has no complete entry for it.
    fn lookup(&self, interface: Option<&str>, ip: IpAddr) -> io::Result<Option<MacAddr>>;
}

/// The Linux neighbor table as exposed in `/proc/net/arp`. Read on every
/// lookup.
#[derive(Debug, Clone)]
pub struct ProcNeighborTable {
    path: PathBuf,
}
impl Default for ProcNeighborTable {
    fn default() -> Self {
        ProcNeighborTable {
            path: PathBuf::from("/proc/net/arp"),
        }
    }
}
impl ProcNeighborTable {
    /// A table read from another file with the same format.
    pub fn at<P: Into<PathBuf>>(path: P) -> Self {
        ProcNeighborTable { path: path.into() }
    }
}
impl NeighborTable for ProcNeighborTable {
    fn lookup(&self, interface: Option<&str>, ip: IpAddr) -> io::Result<Option<MacAddr>> {
        let table = fs::read_to_string(&self.path)?;
        Ok(find_in_arp_table(&table, interface, ip))
    }
}

/// Columns: IP address, HW type, Flags, HW address, Mask, Device. The first
/// line is a header.
fn find_in_arp_table(table: &str, interface: Option<&str>, ip: IpAddr) -> Option<MacAddr> {
    const ATF_COM: u32 = 0x2;

    for line in table.lines().skip(1) {
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() < 6 {
            continue;
        }
        trace!("neighbor entry {:?}", columns);
        if columns[0].parse::<IpAddr>().ok() != Some(ip) {
            continue;
        }
        if interface.map_or(false, |name| name != columns[5]) {
            continue;
        }
        let flags = u32::from_str_radix(columns[2].trim_start_matches("0x"), 16).unwrap_or(0);
        if flags & ATF_COM == 0 {
            continue;
        }
        match columns[3].parse::<MacAddr>() {
            Ok(mac) if !mac.is_unset() => return Some(mac),
            _ => continue,
        }
    }
    None
}
