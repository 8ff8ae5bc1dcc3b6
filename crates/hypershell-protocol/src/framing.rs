use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::Message;

/// Frames larger than this are treated as a transport error rather than an
/// unbounded allocation — a corrupt or malicious length prefix cannot make
/// the reader buffer gigabytes.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    FrameTooLarge(u32),

    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::Error),
}

/// Write one length-prefixed frame: a 4 byte little-endian length followed
/// by the bincode-encoded message (spec section 4.4 / design note: "a
/// framed, length-prefixed binary protocol with explicit versioning").
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let payload = bincode::serialize(message)?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. Returns `Ok(None)` on a clean EOF before
/// any bytes of the next frame arrive (the peer closed the connection).
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    let message = bincode::deserialize(&payload)?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_a_message() {
        let (mut a, mut b) = duplex(4096);
        let msg = Message::Request { max_batch: 4 };
        write_message(&mut a, &msg).await.unwrap();
        let received = read_message(&mut b).await.unwrap().unwrap();
        assert!(matches!(received, Message::Request { max_batch: 4 }));
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let (a, mut b) = duplex(4096);
        drop(a);
        assert!(read_message(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = duplex(4096);
        let huge_len = (MAX_FRAME_BYTES + 1).to_le_bytes();
        a.write_all(&huge_len).await.unwrap();
        let err = read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge(_)));
    }
}
