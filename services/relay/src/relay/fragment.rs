//! First-segment fragmentation.
//!
//! The first client read is split into fixed-size chunks that are written to
//! the backend one at a time, with a pause after every chunk. The pause keeps
//! the kernel from coalescing chunks, so each one leaves as its own TCP
//! segment and a classifier never sees the whole ClientHello in one packet.

use std::num::NonZeroUsize;
use std::slice::Chunks;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::RelayError;

/// Default chunk size in bytes.
pub const DEFAULT_FRAGMENT_SIZE: NonZeroUsize = non_zero(77);

/// Default pause after each chunk.
pub const DEFAULT_FRAGMENT_DELAY: Duration = Duration::from_millis(200);

pub(crate) const fn non_zero(n: usize) -> NonZeroUsize {
    match NonZeroUsize::new(n) {
        Some(n) => n,
        None => panic!("value must be non-zero"),
    }
}

/// Chunking parameters for the first segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentConfig {
    /// Maximum bytes per chunk.
    pub size: NonZeroUsize,
    /// Pause after every chunk, the last one included.
    pub delay: Duration,
}

impl FragmentConfig {
    pub fn new(size: NonZeroUsize, delay: Duration) -> Self {
        Self { size, delay }
    }
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_FRAGMENT_SIZE,
            delay: DEFAULT_FRAGMENT_DELAY,
        }
    }
}

/// What a completed fragmented write put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentReport {
    pub chunks: usize,
    pub bytes: usize,
}

/// Split `buf` into consecutive chunks of at most `size` bytes.
pub fn fragments(buf: &[u8], size: NonZeroUsize) -> Chunks<'_, u8> {
    buf.chunks(size.get())
}

/// Number of chunks `fragments` yields for a buffer of `len` bytes.
pub fn fragment_count(len: usize, size: NonZeroUsize) -> usize {
    len.div_ceil(size.get())
}

/// Write `buf` to `dst` in chunks, sleeping `config.delay` after each one.
///
/// A failed write aborts the remaining chunks. Chunks already written stay
/// written; the error reports how many made it out.
pub async fn send_fragmented<W>(
    buf: &[u8],
    dst: &mut W,
    config: &FragmentConfig,
) -> Result<FragmentReport, RelayError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let total = fragment_count(buf.len(), config.size);
    let mut sent = 0;

    for chunk in fragments(buf, config.size) {
        let written = async {
            dst.write_all(chunk).await?;
            dst.flush().await
        }
        .await;

        if let Err(source) = written {
            return Err(RelayError::Fragment {
                sent,
                total,
                source,
            });
        }

        sent += 1;
        trace!(chunk = sent, total, len = chunk.len(), "Fragment written");

        if !config.delay.is_zero() {
            tokio::time::sleep(config.delay).await;
        }
    }

    Ok(FragmentReport {
        chunks: sent,
        bytes: buf.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io;
    use std::time::Instant;

    fn config(size: usize, delay_ms: u64) -> FragmentConfig {
        FragmentConfig::new(non_zero(size), Duration::from_millis(delay_ms))
    }

    #[test]
    fn test_fragment_config_default() {
        let config = FragmentConfig::default();
        assert_eq!(config.size.get(), 77);
        assert_eq!(config.delay, Duration::from_millis(200));
    }

    #[test]
    fn test_fragment_count() {
        assert_eq!(fragment_count(0, non_zero(50)), 0);
        assert_eq!(fragment_count(200, non_zero(50)), 4);
        assert_eq!(fragment_count(201, non_zero(50)), 5);
        assert_eq!(fragment_count(3, non_zero(1024)), 1);
    }

    proptest! {
        #[test]
        fn fragments_cover_buffer_in_order(
            buf in proptest::collection::vec(any::<u8>(), 0..4096),
            size in 1usize..600,
        ) {
            let size = non_zero(size);
            let chunks: Vec<&[u8]> = fragments(&buf, size).collect();

            prop_assert_eq!(chunks.len(), fragment_count(buf.len(), size));

            if let Some((last, rest)) = chunks.split_last() {
                prop_assert!(rest.iter().all(|c| c.len() == size.get()));
                prop_assert!(!last.is_empty() && last.len() <= size.get());
                let expected_last = match buf.len() % size.get() {
                    0 => size.get(),
                    n => n,
                };
                prop_assert_eq!(last.len(), expected_last);
            }

            prop_assert_eq!(chunks.concat(), buf);
        }
    }

    #[tokio::test]
    async fn test_send_fragmented_writes_each_chunk() {
        let mut dst = tokio_test::io::Builder::new()
            .write(b"hello")
            .write(b" frag")
            .write(b"ments")
            .write(b"!")
            .build();

        let report = send_fragmented(b"hello fragments!", &mut dst, &config(5, 0))
            .await
            .unwrap();

        assert_eq!(report, FragmentReport { chunks: 4, bytes: 16 });
    }

    #[tokio::test]
    async fn test_send_fragmented_empty_buffer() {
        let mut dst = tokio_test::io::Builder::new().build();
        let report = send_fragmented(b"", &mut dst, &config(5, 0)).await.unwrap();
        assert_eq!(report, FragmentReport { chunks: 0, bytes: 0 });
    }

    #[tokio::test]
    async fn test_send_fragmented_aborts_on_write_error() {
        let mut dst = tokio_test::io::Builder::new()
            .write(b"ab")
            .write_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();

        let err = send_fragmented(b"abcdef", &mut dst, &config(2, 0))
            .await
            .unwrap_err();

        match err {
            RelayError::Fragment { sent, total, source } => {
                assert_eq!(sent, 1);
                assert_eq!(total, 3);
                assert_eq!(source.kind(), io::ErrorKind::ConnectionReset);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_send_fragmented_sleeps_after_every_chunk() {
        let mut dst = tokio::io::sink();
        let buf = vec![7u8; 200];

        let started = Instant::now();
        let report = send_fragmented(&buf, &mut dst, &config(50, 10)).await.unwrap();

        assert_eq!(report.chunks, 4);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
