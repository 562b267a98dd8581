//! Just enough HTTP/1.1 to tell tunnel upgrades from everything else

use crate::protocol::DECOY_BODY;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest request head accepted before answering with the decoy page
pub const MAX_HEAD_LEN: usize = 8 * 1024;

const HEAD_END: &[u8] = b"\r\n\r\n";

/// Request line and the headers that matter for routing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target without the query string
    pub path: String,
    upgrade_websocket: bool,
}

impl RequestHead {
    /// Parse a complete head (request line up to the blank line)
    pub fn parse(head: &[u8]) -> Option<Self> {
        let head = std::str::from_utf8(head).ok()?;
        let mut lines = head.split("\r\n");

        let mut request_line = lines.next()?.split_whitespace();
        let method = request_line.next()?.to_string();
        let target = request_line.next()?;
        if !request_line.next()?.starts_with("HTTP/") {
            return None;
        }
        let path = target.split('?').next().unwrap_or(target).to_string();

        let mut upgrade_websocket = false;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
            {
                upgrade_websocket = true;
            }
        }

        Some(Self {
            method,
            path,
            upgrade_websocket,
        })
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.upgrade_websocket
    }

    /// Whether this is a tunnel upgrade for the given path
    pub fn is_tunnel(&self, path: &str) -> bool {
        self.upgrade_websocket && self.method.eq_ignore_ascii_case("GET") && self.path == path
    }
}

/// Read until the end of the request head
///
/// Returns everything read so far (the head plus any bytes that followed it
/// in the same segment) and the head length. `None` means the peer went away
/// or the head outgrew [`MAX_HEAD_LEN`].
pub async fn read_head<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> io::Result<Option<(Vec<u8>, usize)>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        // the terminator may straddle two reads
        let search_from = buf.len().saturating_sub(HEAD_END.len() - 1);
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find(&buf[search_from..], HEAD_END) {
            let end = search_from + pos + HEAD_END.len();
            return Ok(Some((buf, end)));
        }
        if buf.len() > MAX_HEAD_LEN {
            return Ok(None);
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// The fixed 404 page served to anything that is not a tunnel upgrade
pub fn decoy_response() -> Vec<u8> {
    format!(
        "HTTP/1.1 404 Not Found\r\n\
         Server: nginx\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        DECOY_BODY.len(),
        DECOY_BODY
    )
    .into_bytes()
}
