//! Git packet-line framing.
//!
//! Each packet line is prefixed with a 4-character hex length that includes
//! itself:
//!
//! - `0000` -- flush packet (end of section)
//! - `0001` -- delimiter packet
//! - `0002` -- response-end packet
//! - `0004`+ -- data packet (length includes the 4 prefix bytes)
//!
//! Advertisements are assembled in memory with [`encode_pkt_line`]; the async
//! functions drive the client side of a pack connection.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Largest payload a single data packet can carry.
pub const MAX_PKT_PAYLOAD: usize = 0xFFF0 - 4;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A single Git packet line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// A data packet containing arbitrary bytes.
    Data(Vec<u8>),
    /// Flush packet (`0000`) -- marks end of a message / section.
    Flush,
    /// Delimiter packet (`0001`) -- separates sections within a single
    /// message.
    Delimiter,
    /// Response-end packet (`0002`).
    ResponseEnd,
}

impl PktLine {
    /// The payload as text with one trailing newline removed.
    pub fn as_text(&self) -> Option<String> {
        match self {
            PktLine::Data(data) => {
                let data = data.strip_suffix(b"\n").unwrap_or(data);
                Some(String::from_utf8_lossy(data).into_owned())
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a byte slice as a Git packet-line (4-hex-digit length prefix + data).
///
/// The length includes the 4 prefix bytes themselves.  Callers are responsible
/// for including any trailing newline in `data` if the protocol requires it.
pub fn encode_pkt_line(data: &[u8]) -> Vec<u8> {
    let total_len = data.len() + 4;
    assert!(
        data.len() <= MAX_PKT_PAYLOAD,
        "packet-line data too large ({total_len} bytes)"
    );
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(format!("{total_len:04x}").as_bytes());
    buf.extend_from_slice(data);
    buf
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn parse_len(prefix: &[u8; 4]) -> io::Result<usize> {
    std::str::from_utf8(prefix)
        .ok()
        .and_then(|s| usize::from_str_radix(s, 16).ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "invalid packet-line length {:?}",
                    String::from_utf8_lossy(prefix)
                ),
            )
        })
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Read one packet line.
///
/// Returns `Ok(None)` when the stream ends cleanly before a new packet
/// starts; a stream ending inside a packet is an `UnexpectedEof` error.
pub async fn read_pkt<R>(reader: &mut R) -> io::Result<Option<PktLine>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }

    let pkt = match parse_len(&prefix)? {
        0 => PktLine::Flush,
        1 => PktLine::Delimiter,
        2 => PktLine::ResponseEnd,
        3 => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid packet-line length 0003",
            ))
        }
        n => {
            let mut payload = vec![0u8; n - 4];
            reader.read_exact(&mut payload).await?;
            PktLine::Data(payload)
        }
    };
    trace!(?pkt, "read packet");
    Ok(Some(pkt))
}

/// Write one data packet.
pub async fn write_pkt_line<W>(writer: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&encode_pkt_line(data)).await
}

/// Write a flush packet.
pub async fn write_flush<W>(writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(b"0000").await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_pkt_line() {
        let encoded = encode_pkt_line(b"hello\n");
        assert_eq!(&encoded, b"000ahello\n");
    }

    #[test]
    fn test_encode_pkt_line_empty() {
        let encoded = encode_pkt_line(b"");
        assert_eq!(&encoded, b"0004");
    }

    #[tokio::test]
    async fn test_read_special_packets() {
        let mut reader: &[u8] = b"000000010002";
        assert_eq!(read_pkt(&mut reader).await.unwrap(), Some(PktLine::Flush));
        assert_eq!(read_pkt(&mut reader).await.unwrap(), Some(PktLine::Delimiter));
        assert_eq!(read_pkt(&mut reader).await.unwrap(), Some(PktLine::ResponseEnd));
    }

    #[tokio::test]
    async fn test_read_rejects_bad_lengths() {
        let mut reader: &[u8] = b"zzzz";
        let err = read_pkt(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let mut reader: &[u8] = b"0003";
        assert!(read_pkt(&mut reader).await.is_err());
    }

    #[test]
    fn test_as_text_strips_newline() {
        let pkt = PktLine::Data(b"unpack ok\n".to_vec());
        assert_eq!(pkt.as_text().as_deref(), Some("unpack ok"));
        assert_eq!(PktLine::Flush.as_text(), None);
    }

    #[tokio::test]
    async fn test_read_pkt_sequence() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_pkt_line(b"# service=git-upload-pack\n"));
        wire.extend_from_slice(b"0000");
        let mut reader = wire.as_slice();

        let first = read_pkt(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.as_text().as_deref(), Some("# service=git-upload-pack"));
        assert_eq!(read_pkt(&mut reader).await.unwrap(), Some(PktLine::Flush));
        assert_eq!(read_pkt(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_pkt_eof_inside_packet() {
        let mut reader: &[u8] = b"00";
        let err = read_pkt(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_write_helpers() {
        let mut out = Vec::new();
        write_pkt_line(&mut out, b"done\n").await.unwrap();
        write_flush(&mut out).await.unwrap();
        assert_eq!(out, b"0009done\n0000");
    }
}
