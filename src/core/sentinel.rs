// Chunked payload copy that drops a single leading sentinel byte.
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::cancel::CancelToken;
use crate::core::error::{Error, ErrorKind};

/// Marker byte the storage layer may prefix to a stored document.
pub const SENTINEL: u8 = 0x01;
/// Bytes requested per read when copying a payload.
pub const DEFAULT_CHUNK_SIZE: usize = 81920;

/// Copies `source` into `destination`, skipping a leading [`SENTINEL`].
///
/// Memory use is bounded by `chunk_size`. A zero-length read is end of
/// stream, so the first non-empty chunk always starts at payload byte 0.
/// Returns the number of bytes written. On failure, bytes already written
/// stay in `destination`.
pub async fn copy_payload<R, W>(
    source: &mut R,
    destination: &mut W,
    chunk_size: usize,
    cancel: &CancelToken,
) -> Result<u64, Error>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut read_total = 0u64;
    let mut written = 0u64;
    let mut first = true;

    loop {
        let read = cancel
            .guard(async {
                source.read(&mut buf).await.map_err(|err| {
                    Error::new(ErrorKind::Transfer)
                        .with_message("failed to read payload")
                        .with_offset(read_total)
                        .with_source(err)
                })
            })
            .await?;
        if read == 0 {
            break;
        }
        read_total += read as u64;

        let mut chunk = &buf[..read];
        if first {
            first = false;
            if chunk[0] == SENTINEL {
                chunk = &chunk[1..];
            }
        }
        if chunk.is_empty() {
            continue;
        }

        cancel
            .guard(async {
                destination.write_all(chunk).await.map_err(|err| {
                    Error::new(ErrorKind::Transfer)
                        .with_message("failed to write destination")
                        .with_offset(written)
                        .with_source(err)
                })
            })
            .await?;
        written += chunk.len() as u64;
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::{SENTINEL, copy_payload};
    use crate::core::cancel::CancelToken;
    use crate::core::error::ErrorKind;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::AsyncWrite;

    async fn copy(input: &[u8], chunk_size: usize) -> Vec<u8> {
        let mut source = input;
        let mut out = Vec::new();
        let written = copy_payload(&mut source, &mut out, chunk_size, &CancelToken::new())
            .await
            .expect("copy");
        assert_eq!(written, out.len() as u64);
        out
    }

    #[tokio::test]
    async fn leading_sentinel_is_removed() {
        let mut input = vec![SENTINEL];
        input.extend_from_slice(br#"{"x":true}"#);
        assert_eq!(copy(&input, 4).await, br#"{"x":true}"#);
        assert_eq!(copy(&input, 1024).await, br#"{"x":true}"#);
    }

    #[tokio::test]
    async fn payload_without_sentinel_is_unchanged() {
        let input = br#"{"name":"a\u0001b","n":[1,2,3]}"#;
        assert_eq!(copy(input, 5).await, input);
    }

    #[tokio::test]
    async fn only_the_first_byte_is_inspected() {
        let input = [SENTINEL, SENTINEL, b'{', b'}'];
        assert_eq!(copy(&input, 1).await, [SENTINEL, b'{', b'}']);
        let input = [b'{', SENTINEL, b'}'];
        assert_eq!(copy(&input, 1).await, input);
    }

    #[tokio::test]
    async fn empty_and_sentinel_only_payloads_write_nothing() {
        assert!(copy(b"", 8).await.is_empty());
        assert!(copy(&[SENTINEL], 8).await.is_empty());
        assert!(copy(&[SENTINEL], 1).await.is_empty());
    }

    struct FailingWriter;

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn write_failure_is_transfer_error() {
        let mut source: &[u8] = b"{}";
        let err = copy_payload(&mut source, &mut FailingWriter, 8, &CancelToken::new())
            .await
            .expect_err("write fails");
        assert_eq!(err.kind(), ErrorKind::Transfer);
        assert_eq!(err.offset(), Some(0));
    }

    #[tokio::test]
    async fn cancelled_copy_writes_nothing() {
        let token = CancelToken::new();
        token.cancel();
        let mut source: &[u8] = b"{}";
        let mut out = Vec::new();
        let err = copy_payload(&mut source, &mut out, 8, &token)
            .await
            .expect_err("cancelled");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(out.is_empty());
    }
}
