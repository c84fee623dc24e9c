//! Frame encoding and the broadcast envelope.
//!
//! Stream transports don't preserve write boundaries, so every frame carries
//! a 4-byte big-endian length prefix:
//!
//! ```text
//! [u32 BE: len][UTF-8 bytes of len]
//! ```
//!
//! Payloads are bounded by the caller-supplied maximum; oversized frames are
//! rejected, never split or reassembled.

use crate::{RelayError, Result};
use bytes::Bytes;
use std::fmt::Display;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const ENVELOPE_PREFIX: &str = "Broadcast from ";
const ENVELOPE_SEPARATOR: &str = ": ";

/// One frame as seen by a reader that tolerates oversized frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Payload(Bytes),
    /// The frame exceeded the limit; its bytes were consumed and discarded.
    Skipped { size: usize },
}

/// Read one frame.
///
/// Returns `None` on clean EOF (peer closed the connection). A zero-length
/// frame is returned as an empty payload; callers decide what it means.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let Some(len) = read_len(reader).await? else {
        return Ok(None);
    };
    if len > max_len {
        return Err(RelayError::FrameTooLarge {
            size: len,
            max: max_len,
        });
    }
    read_payload(reader, len).await.map(Some)
}

/// Like [`read_frame`], but a frame over `max_len` is drained from the
/// stream and reported as [`InboundFrame::Skipped`] so the stream stays
/// usable.
pub async fn read_frame_or_skip<R>(reader: &mut R, max_len: usize) -> Result<Option<InboundFrame>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let Some(len) = read_len(reader).await? else {
        return Ok(None);
    };
    if len <= max_len {
        return read_payload(reader, len)
            .await
            .map(|payload| Some(InboundFrame::Payload(payload)));
    }

    let mut rest = (&mut *reader).take(len as u64);
    let discarded = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await?;
    if discarded < len as u64 {
        return Err(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            format!("stream ended {} bytes into a {} byte frame", discarded, len),
        )
        .into());
    }
    Ok(Some(InboundFrame::Skipped { size: len }))
}

/// Read the length prefix. EOF before the first byte is a clean close; EOF
/// inside the prefix is an error.
async fn read_len<R>(reader: &mut R) -> Result<Option<usize>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("stream ended after {} of 4 length bytes", filled),
            )
            .into());
        }
        filled += n;
    }
    Ok(Some(u32::from_be_bytes(len_buf) as usize))
}

async fn read_payload<R>(reader: &mut R, len: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = u32::try_from(payload.len()).map_err(|_| RelayError::FrameTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Annotate a relayed payload with its sender:
/// `"Broadcast from <sender>: <payload>"`.
pub fn broadcast_envelope(sender: impl Display, payload: &[u8]) -> Bytes {
    Bytes::from(format!(
        "{ENVELOPE_PREFIX}{sender}{ENVELOPE_SEPARATOR}{}",
        String::from_utf8_lossy(payload)
    ))
}

/// Split an envelope back into `(sender, payload)`. Plain string matching;
/// returns `None` for text that isn't an envelope.
pub fn parse_envelope(text: &str) -> Option<(&str, &str)> {
    text.strip_prefix(ENVELOPE_PREFIX)?
        .split_once(ENVELOPE_SEPARATOR)
}
