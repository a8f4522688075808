//! Length-prefixed framing for stream transports.
//!
//! Each message travels as a big-endian `u32` payload length followed by that
//! many payload bytes. A length of zero never appears on a healthy stream and
//! reading one means the peers have lost framing, so it is treated as fatal
//! for the connection. Datagram transports need none of this: one datagram
//! carries exactly one payload.

use crate::error::{NetError, NetResult};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes occupied by the length prefix on stream transports.
pub(crate) const LENGTH_PREFIX_LEN: usize = 4;

/// Largest payload a single UDP datagram can carry.
pub(crate) const MAX_DATAGRAM_PAYLOAD: usize = 65_507;

/// Write one frame and flush it so the message leaves promptly.
pub(crate) async fn write_frame<W>(writer: &mut W, payload: &[u8], max_len: u32) -> NetResult<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() {
        return Err(NetError::ZeroLengthFrame);
    }
    if payload.len() as u64 > u64::from(max_len) {
        return Err(NetError::FrameTooLarge {
            length: payload.len() as u64,
            max: max_len,
        });
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame into `buf`, replacing its contents.
///
/// Distinguishes the clean close between frames ([`NetError::EndOfStream`])
/// from a close in the middle of one ([`NetError::TruncatedFrame`]).
pub(crate) async fn read_frame<R>(reader: &mut R, max_len: u32, buf: &mut Vec<u8>) -> NetResult<()>
where
    R: AsyncRead + Unpin,
{
    let length = match reader.read_u32().await {
        Ok(length) => length,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(NetError::EndOfStream),
        Err(e) => return Err(NetError::Transport(e)),
    };
    if length == 0 {
        return Err(NetError::ZeroLengthFrame);
    }
    if length > max_len {
        return Err(NetError::FrameTooLarge {
            length: u64::from(length),
            max: max_len,
        });
    }
    buf.clear();
    buf.resize(length as usize, 0);
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(NetError::TruncatedFrame(e)),
        Err(e) => Err(NetError::Transport(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MAX: u32 = 1024;

    #[tokio::test]
    async fn roundtrip_preserves_payload_boundaries() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_frame(&mut a, b"hello", TEST_MAX).await.unwrap();
        write_frame(&mut a, b"world!", TEST_MAX).await.unwrap();

        let mut buf = Vec::new();
        read_frame(&mut b, TEST_MAX, &mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
        read_frame(&mut b, TEST_MAX, &mut buf).await.unwrap();
        assert_eq!(buf, b"world!");
    }

    #[tokio::test]
    async fn prefix_is_big_endian() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, &[0xAB], TEST_MAX).await.unwrap();
        drop(a);

        let mut raw = Vec::new();
        b.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw, [0, 0, 0, 1, 0xAB]);
    }

    #[tokio::test]
    async fn zero_length_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0, 0, 0]).await.unwrap();

        let mut buf = Vec::new();
        let err = read_frame(&mut b, TEST_MAX, &mut buf).await.unwrap_err();
        assert!(matches!(err, NetError::ZeroLengthFrame));
    }

    #[tokio::test]
    async fn empty_payload_is_rejected_on_write() {
        let (mut a, _b) = tokio::io::duplex(64);
        let err = write_frame(&mut a, b"", TEST_MAX).await.unwrap_err();
        assert!(matches!(err, NetError::ZeroLengthFrame));
    }

    #[tokio::test]
    async fn oversized_prefix_is_rejected_before_reading_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(TEST_MAX + 1).to_be_bytes()).await.unwrap();

        let mut buf = Vec::new();
        let err = read_frame(&mut b, TEST_MAX, &mut buf).await.unwrap_err();
        match err {
            NetError::FrameTooLarge { length, max } => {
                assert_eq!(length, u64::from(TEST_MAX) + 1);
                assert_eq!(max, TEST_MAX);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_on_write() {
        let (mut a, _b) = tokio::io::duplex(64);
        let payload = vec![0u8; TEST_MAX as usize + 1];
        let err = write_frame(&mut a, &payload, TEST_MAX).await.unwrap_err();
        assert!(matches!(err, NetError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn eof_between_frames_is_a_clean_close() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);

        let mut buf = Vec::new();
        let err = read_frame(&mut b, TEST_MAX, &mut buf).await.unwrap_err();
        assert!(err.is_clean_close());
    }

    #[tokio::test]
    async fn eof_inside_a_frame_is_truncation() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0, 0, 10]).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);

        let mut buf = Vec::new();
        let err = read_frame(&mut b, TEST_MAX, &mut buf).await.unwrap_err();
        assert!(matches!(err, NetError::TruncatedFrame(_)));
    }
}
