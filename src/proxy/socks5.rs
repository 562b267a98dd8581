//! SOCKS5 wire format (RFC 1928 subset: no-auth, CONNECT)

use super::{Address, ProxyError};

/// SOCKS5 version
pub const SOCKS_VERSION: u8 = 0x05;

/// Reserved byte
const RESERVED: u8 = 0x00;

/// Method selection reply: version 5, no authentication required
pub const GREETING_REPLY: [u8; 2] = [SOCKS_VERSION, AuthMethod::NoAuth as u8];

/// Every request reply is version, code, reserved, IPv4 type, 0.0.0.0, port
pub const REPLY_LEN: usize = 10;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(ProxyError::UnsupportedAddressType(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Consume the client greeting from the first chunk
///
/// The method list is ignored: the server always selects no-auth. Returns
/// how many bytes belong to the greeting; anything after that is the start
/// of the request. A short chunk is consumed whole.
pub fn parse_greeting(buf: &[u8]) -> usize {
    match buf {
        [_version, nmethods, ..] => (2 + *nmethods as usize).min(buf.len()),
        _ => buf.len(),
    }
}

/// Parse a CONNECT request from the bytes received so far
///
/// Returns `Ok(None)` until the whole request (address and port) has
/// arrived, then the destination together with the number of bytes it
/// occupied. The version byte is assumed to be 5.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Address, usize)>, ProxyError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    Command::try_from(buf[1])?;

    if buf.len() < 4 {
        return Ok(None);
    }
    // buf[2] is reserved
    let addr_type = AddressType::try_from(buf[3])?;

    let (host_start, host_len) = match addr_type {
        AddressType::Ipv4 => (4, 4),
        AddressType::Ipv6 => (4, 16),
        AddressType::Domain => {
            let Some(&len) = buf.get(4) else {
                return Ok(None);
            };
            if len == 0 {
                return Err(ProxyError::InvalidAddress("empty domain".to_string()));
            }
            (5, len as usize)
        }
    };

    let port_start = host_start + host_len;
    let total = port_start + 2;
    if buf.len() < total {
        return Ok(None);
    }

    let host = &buf[host_start..port_start];
    let port = u16::from_be_bytes([buf[port_start], buf[port_start + 1]]);

    let address = match addr_type {
        AddressType::Ipv4 => {
            let mut ip = [0u8; 4];
            ip.copy_from_slice(host);
            Address::Ipv4(ip, port)
        }
        AddressType::Ipv6 => {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(host);
            Address::Ipv6(ip, port)
        }
        AddressType::Domain => {
            let domain = String::from_utf8_lossy(host).to_string();
            Address::Domain(domain, port)
        }
    };

    Ok(Some((address, total)))
}

/// Build a request reply with a zero IPv4 bound address and the given port
pub fn reply(code: Reply, port: u16) -> [u8; REPLY_LEN] {
    let [hi, lo] = port.to_be_bytes();
    [
        SOCKS_VERSION,
        code as u8,
        RESERVED,
        AddressType::Ipv4 as u8,
        0,
        0,
        0,
        0,
        hi,
        lo,
    ]
}
