//! Frame layer shared bit-exactly by client and server.
//!
//! Every message on the wire is a fixed header followed by a MessagePack
//! body:
//!
//! ```text
//! ┌─────────────────┬────────────────┬──────────────────┬───────────────┐
//! │ request_id: u64 │ body_len: u32  │ function_id: u32 │  body bytes   │
//! │ (little-endian) │ (little-endian)│ (little-endian)  │  (body_len)   │
//! └─────────────────┴────────────────┴──────────────────┴───────────────┘
//! ```
//!
//! A header with `body_len == 0` is a heartbeat. The server accepts it and
//! simply re-arms its read; the client treats it as a protocol violation
//! (a conforming server never sends zero-length replies).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, RpcError};

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 16;

/// Inbound frames larger than this are rejected before allocating, and the
/// connection is closed.
pub const MAX_BODY_LEN: u32 = 64 * 1024 * 1024;

/// The fixed 16-byte frame header.
///
/// `request_id` and `function_id` are echoed verbatim in the reply to the
/// request that carried them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcHeader {
    pub request_id: u64,
    pub body_len: u32,
    pub function_id: u32,
}

impl RpcHeader {
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..8].copy_from_slice(&self.request_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.body_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.function_id.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            request_id: u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
            body_len: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            function_id: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }
}

/// One frame: header plus its owned body of exactly `body_len` bytes.
#[derive(Debug, Clone)]
pub struct RpcMsg {
    pub header: RpcHeader,
    pub body: Vec<u8>,
}

impl RpcMsg {
    pub fn new(request_id: u64, function_id: u32, body: Vec<u8>) -> Self {
        Self {
            header: RpcHeader {
                request_id,
                body_len: body.len() as u32,
                function_id,
            },
            body,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.header.body_len == 0
    }
}

/// Read a single frame from `reader`.
///
/// A clean EOF on the header boundary maps to [`RpcError::ConnectionClosed`];
/// EOF in the middle of a frame is an I/O error. A heartbeat comes back as a
/// bodyless message.
pub async fn read_msg<R: AsyncRead + Unpin>(reader: &mut R) -> Result<RpcMsg> {
    let mut head = [0u8; HEADER_LEN];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(RpcError::ConnectionClosed);
        }
        Err(e) => return Err(RpcError::Io(e)),
    }
    let header = RpcHeader::from_bytes(&head);

    if header.body_len > MAX_BODY_LEN {
        return Err(RpcError::Protocol(format!(
            "body too large: {} bytes (max {MAX_BODY_LEN})",
            header.body_len
        )));
    }

    let mut body = vec![0u8; header.body_len as usize];
    if header.body_len > 0 {
        reader.read_exact(&mut body).await?;
    }

    Ok(RpcMsg { header, body })
}

/// Write a single frame: header, then body, one flush.
pub async fn write_msg<W: AsyncWrite + Unpin>(writer: &mut W, msg: &RpcMsg) -> Result<()> {
    writer.write_all(&msg.header.to_bytes()).await?;
    writer.write_all(&msg.body).await?;
    writer.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_byte_layout_is_little_endian() {
        let header = RpcHeader {
            request_id: 0x0102030405060708,
            body_len: 0x11223344,
            function_id: 0xAABBCCDD,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..8], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&bytes[8..12], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&bytes[12..16], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(RpcHeader::from_bytes(&bytes), header);
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let msg = RpcMsg::new(42, 0xDEADBEEF, b"payload".to_vec());

        let mut buf = Vec::new();
        write_msg(&mut buf, &msg).await.unwrap();
        assert_eq!(buf.len(), HEADER_LEN + 7);

        let mut cursor = std::io::Cursor::new(buf);
        let parsed = read_msg(&mut cursor).await.unwrap();
        assert_eq!(parsed.header, msg.header);
        assert_eq!(parsed.body, msg.body);
    }

    #[tokio::test]
    async fn heartbeat_round_trip() {
        let msg = RpcMsg::new(0, 0, Vec::new());
        assert!(msg.is_heartbeat());

        let mut buf = Vec::new();
        write_msg(&mut buf, &msg).await.unwrap();
        assert_eq!(buf.len(), HEADER_LEN);

        let mut cursor = std::io::Cursor::new(buf);
        let parsed = read_msg(&mut cursor).await.unwrap();
        assert!(parsed.is_heartbeat());
        assert!(parsed.body.is_empty());
    }

    #[tokio::test]
    async fn eof_on_header_is_connection_closed() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_msg(&mut cursor).await;
        assert!(matches!(result, Err(RpcError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn eof_inside_body_is_io_error() {
        let msg = RpcMsg::new(1, 2, b"four bytes and more".to_vec());
        let mut buf = Vec::new();
        write_msg(&mut buf, &msg).await.unwrap();
        buf.truncate(HEADER_LEN + 4);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_msg(&mut cursor).await;
        assert!(matches!(result, Err(RpcError::Io(_))));
    }

    #[tokio::test]
    async fn oversized_body_rejected() {
        let header = RpcHeader {
            request_id: 1,
            body_len: MAX_BODY_LEN + 1,
            function_id: 2,
        };
        let mut cursor = std::io::Cursor::new(header.to_bytes().to_vec());
        let result = read_msg(&mut cursor).await;
        assert!(matches!(result, Err(RpcError::Protocol(_))));
    }
}
