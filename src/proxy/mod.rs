//! SOCKS5 front-end
//!
//! Only the pieces the tunnel needs: the no-auth greeting, the CONNECT
//! request, and the fixed-size replies. Parsing works on whatever bytes have
//! arrived so far, so the session can feed it socket chunks directly.

mod socks5;

pub use socks5::{
    parse_greeting, parse_request, reply, AddressType, Command, Reply, SOCKS_VERSION,
    GREETING_REPLY, REPLY_LEN,
};

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

impl ProxyError {
    /// SOCKS5 reply code sent back before closing the local connection
    pub fn reply_code(&self) -> Reply {
        match self {
            ProxyError::UnsupportedCommand(_) => Reply::CommandNotSupported,
            ProxyError::UnsupportedAddressType(_) => Reply::AddressTypeNotSupported,
            ProxyError::InvalidAddress(_) => Reply::GeneralFailure,
        }
    }
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Host part as it travels in the first tunnel frame
    ///
    /// IPv4 is dotted decimal, IPv6 is the canonical colon-hex text form,
    /// domains are passed through unchanged.
    pub fn host(&self) -> String {
        match self {
            Address::Ipv4(ip, _) => Ipv4Addr::from(*ip).to_string(),
            Address::Ipv6(ip, _) => Ipv6Addr::from(*ip).to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv6(..) => write!(f, "[{}]:{}", self.host(), self.port()),
            _ => write!(f, "{}:{}", self.host(), self.port()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        assert_eq!(Address::Ipv4([1, 2, 3, 4], 80).to_string(), "1.2.3.4:80");
        assert_eq!(
            Address::Domain("example.com".into(), 443).to_string(),
            "example.com:443"
        );

        let mut ip = [0u8; 16];
        ip[15] = 1;
        assert_eq!(Address::Ipv6(ip, 8080).to_string(), "[::1]:8080");
        assert_eq!(Address::Ipv6(ip, 8080).host(), "::1");
    }

    #[test]
    fn test_reply_codes() {
        assert_eq!(
            ProxyError::UnsupportedCommand(2).reply_code() as u8,
            0x07
        );
        assert_eq!(
            ProxyError::UnsupportedAddressType(2).reply_code() as u8,
            0x08
        );
    }
}
