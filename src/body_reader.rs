//! Acquiring a response body: streamed to the caller, or buffered with a size limit.

use futures_util::io::AsyncReadExt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{error, warn};

use crate::body::Body;
use crate::buffer_pool::BufferPool;
use crate::cancel::CancelToken;
use crate::response::Content;
use crate::settings::TransportSettings;

/// Bodies at least this large are read through pooled scratch buffers instead of straight into
/// their destination.
pub const LARGE_BUFFER_THRESHOLD: usize = 85_000;

/// Largest declared length that is allocated before any of the body arrives. Longer bodies grow
/// their buffer as bytes are received, and bypass the buffer factory.
pub(crate) const MAX_UP_FRONT_ALLOCATION: usize = 4 * 1024 * 1024;

#[derive(Debug)]
pub(crate) enum BodyOutcome {
    Buffered(Content),
    /// The caller takes the live body, and with it the connection.
    Streamed(Body),
    TooLarge,
    ReceiveFailed,
    Canceled,
}

pub(crate) struct ResponseBodyReader<'a> {
    settings: &'a TransportSettings,
    pool: &'static BufferPool,
}

impl<'a> ResponseBodyReader<'a> {
    pub(crate) fn new(settings: &'a TransportSettings) -> Self {
        Self {
            settings,
            pool: BufferPool::shared(),
        }
    }

    pub(crate) async fn read(
        &self,
        target: &str,
        length: Option<u64>,
        body: Body,
        token: &CancelToken,
    ) -> BodyOutcome {
        if self.use_streaming(target, length) {
            return BodyOutcome::Streamed(body);
        }

        let max = self.settings.max_response_body_size;
        match length {
            Some(length) => {
                if max.map_or(false, |max| length > max) {
                    warn!(authority = %target, length, "Response body exceeds the maximum size");
                    return BodyOutcome::TooLarge;
                }
                let length = match usize::try_from(length) {
                    Ok(length) => length,
                    Err(_) => {
                        warn!(authority = %target, length, "Response body does not fit in memory");
                        return BodyOutcome::TooLarge;
                    }
                };
                if length == 0 {
                    return BodyOutcome::Buffered(Content::from(Vec::new()));
                }
                self.read_known(target, length, body, token).await
            }
            None => self.read_unknown(target, max, body, token).await,
        }
    }

    fn use_streaming(&self, target: &str, length: Option<u64>) -> bool {
        let predicate = &self.settings.use_response_streaming;
        match catch_unwind(AssertUnwindSafe(|| predicate(length))) {
            Ok(stream) => stream,
            Err(_) => {
                error!(authority = %target, "Response streaming predicate panicked, buffering instead");
                false
            }
        }
    }

    async fn read_known(&self, target: &str, length: usize, mut body: Body, token: &CancelToken) -> BodyOutcome {
        let filled = if length <= MAX_UP_FRONT_ALLOCATION {
            let mut buffer = (self.settings.buffer_factory)(length);
            if buffer.len() < length {
                buffer.resize(length, 0);
            }
            token
                .guard(async {
                    self.fill(&mut body, &mut buffer[..length]).await?;
                    Ok::<_, io::Error>(buffer)
                })
                .await
        } else {
            token.guard(self.fill_growing(&mut body, length)).await
        };

        match filled {
            Ok(Ok(buffer)) => BodyOutcome::Buffered(Content::new(buffer, length)),
            Ok(Err(err)) => {
                warn!(authority = %target, error = %err, "Failed reading response body");
                BodyOutcome::ReceiveFailed
            }
            Err(_) => BodyOutcome::Canceled,
        }
    }

    /// Read exactly `length` bytes without trusting `length` for allocation.
    async fn fill_growing(&self, body: &mut Body, length: usize) -> io::Result<Vec<u8>> {
        let mut data = Vec::with_capacity(MAX_UP_FRONT_ALLOCATION);
        let mut scratch = self.pool.acquire();
        while data.len() < length {
            let want = scratch.len().min(length - data.len());
            let n = body.read(&mut scratch[..want]).await?;
            if n == 0 {
                return Err(premature_end(data.len(), length));
            }
            data.extend_from_slice(&scratch[..n]);
        }
        Ok(data)
    }

    async fn fill(&self, body: &mut Body, dest: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;

        if dest.len() < LARGE_BUFFER_THRESHOLD {
            while filled < dest.len() {
                let n = body.read(&mut dest[filled..]).await?;
                if n == 0 {
                    return Err(premature_end(filled, dest.len()));
                }
                filled += n;
            }
            return Ok(());
        }

        let mut scratch = self.pool.acquire();
        while filled < dest.len() {
            let want = scratch.len().min(dest.len() - filled);
            let n = body.read(&mut scratch[..want]).await?;
            if n == 0 {
                return Err(premature_end(filled, dest.len()));
            }
            dest[filled..filled + n].copy_from_slice(&scratch[..n]);
            filled += n;
        }
        Ok(())
    }

    async fn read_unknown(&self, target: &str, max: Option<u64>, mut body: Body, token: &CancelToken) -> BodyOutcome {
        match token.guard(self.accumulate(&mut body, max)).await {
            Ok(Ok(Some(data))) => BodyOutcome::Buffered(Content::from(data)),
            Ok(Ok(None)) => {
                warn!(authority = %target, "Response body grew past the maximum size");
                BodyOutcome::TooLarge
            }
            Ok(Err(err)) => {
                warn!(authority = %target, error = %err, "Failed reading response body");
                BodyOutcome::ReceiveFailed
            }
            Err(_) => BodyOutcome::Canceled,
        }
    }

    /// Read to the end of `body`. `None` if it grows past `max`.
    async fn accumulate(&self, body: &mut Body, max: Option<u64>) -> io::Result<Option<Vec<u8>>> {
        let mut data = Vec::new();
        let mut scratch = self.pool.acquire();
        loop {
            let n = body.read(&mut scratch[..]).await?;
            if n == 0 {
                return Ok(Some(data));
            }
            if max.map_or(false, |max| (data.len() + n) as u64 > max) {
                return Ok(None);
            }
            data.extend_from_slice(&scratch[..n]);
        }
    }
}

fn premature_end(read: usize, expected: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("response body ended after {} of {} bytes", read, expected),
    )
}
