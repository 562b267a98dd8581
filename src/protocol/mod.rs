//! Tunnel wire protocol constants

use std::time::Duration;

/// Length of the per-session nonce carried in cleartext after the first frame
pub const NONCE_LEN: usize = 16;

/// Length of the AEAD authentication tag appended to every ciphertext
pub const TAG_LEN: usize = 16;

/// Length of the big-endian port trailing the destination host in the first frame
pub const PORT_LEN: usize = 2;

/// Keepalive ping interval while a session is piping
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default inactivity timeout on the local socket (seconds)
pub const DEFAULT_IDLE_TIMEOUT: u64 = 60;

/// Default timeout for dialing the tunnel or the outbound destination (seconds)
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 30;

/// Default bound on the egress handshake: TLS, HTTP upgrade and the first
/// tunnel frame must all complete within it (seconds)
pub const DEFAULT_HANDSHAKE_TIMEOUT: u64 = 10;

/// Read buffer size for socket legs
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Body served to anything that is not a tunnel upgrade
pub const DECOY_BODY: &str = "<html><head><title>404 Not Found</title></head><body bgcolor=\"white\"><center><h1>404 Not Found</h1></center><hr><center>nginx</center></body></html>";

/// Encode the first-frame plaintext: `host ‖ port(BE)`
pub fn encode_destination(host: &str, port: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(host.len() + PORT_LEN);
    buf.extend_from_slice(host.as_bytes());
    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

/// Decode the first-frame plaintext produced by [`encode_destination`]
///
/// Returns `None` when the payload is too short or the host is not UTF-8.
pub fn decode_destination(buf: &[u8]) -> Option<(String, u16)> {
    if buf.len() < PORT_LEN {
        return None;
    }
    let (host, port) = buf.split_at(buf.len() - PORT_LEN);
    let host = std::str::from_utf8(host).ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), u16::from_be_bytes([port[0], port[1]])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_encoding() {
        let buf = encode_destination("example.com", 443);
        assert_eq!(&buf[..11], b"example.com");
        assert_eq!(&buf[11..], &[0x01, 0xBB]);

        let (host, port) = decode_destination(&buf).unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_destination_rejects_short_payload() {
        assert!(decode_destination(&[]).is_none());
        assert!(decode_destination(&[0x00]).is_none());
        // port only, no host
        assert!(decode_destination(&[0x00, 0x50]).is_none());
    }

    #[test]
    fn test_destination_rejects_invalid_utf8() {
        assert!(decode_destination(&[0xFF, 0xFE, 0x00, 0x50]).is_none());
    }
}
