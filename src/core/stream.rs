// Row cursor to JSON array streaming: delimiters around sentinel-stripped payloads.
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::core::cancel::CancelToken;
use crate::core::cursor::{DEFAULT_PAYLOAD_COLUMN, RowCursor, RowShape};
use crate::core::error::{Error, ErrorKind};
use crate::core::sentinel::{DEFAULT_CHUNK_SIZE, copy_payload};

const LEFT_BRACKET: &[u8] = b"[";
const RIGHT_BRACKET: &[u8] = b"]";
const COMMA: &[u8] = b",";

#[derive(Clone, Debug)]
pub struct StreamOptions {
    pub chunk_size: usize,
    pub payload_column: String,
}

impl StreamOptions {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            payload_column: DEFAULT_PAYLOAD_COLUMN.to_string(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_payload_column(mut self, name: impl Into<String>) -> Self {
        self.payload_column = name.into();
        self
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Relays stored JSON documents from a cursor into a byte sink.
///
/// Payloads are never parsed. On error or cancellation the destination keeps
/// whatever was already written, which may be a truncated array; callers must
/// discard it. Closing the cursor stays with the caller.
#[derive(Clone, Debug, Default)]
pub struct JsonStreamer {
    options: StreamOptions,
}

impl JsonStreamer {
    pub fn new(options: StreamOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Writes the bare payload of the first row. Returns 0 or 1.
    pub async fn stream_one<C, W>(
        &self,
        cursor: &mut C,
        destination: &mut W,
        cancel: &CancelToken,
    ) -> Result<u64, Error>
    where
        C: RowCursor + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        if !advance(cursor, cancel, 0).await? {
            trace!("no row to stream");
            return Ok(0);
        }
        let shape = RowShape::resolve(&*cursor, &self.options.payload_column)
            .map_err(|err| err.with_row(0))?;
        let bytes = self
            .copy_row(cursor, shape, destination, cancel)
            .await
            .map_err(|err| err.or_row(0))?;
        flush(destination, cancel).await?;
        debug!(rows = 1, bytes, "streamed json document");
        Ok(1)
    }

    /// Writes every row as one JSON array: `[`, payloads joined by `,`, `]`.
    pub async fn stream_many<C, W>(
        &self,
        cursor: &mut C,
        destination: &mut W,
        cancel: &CancelToken,
    ) -> Result<u64, Error>
    where
        C: RowCursor + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        write_delimiter(destination, LEFT_BRACKET, cancel).await?;

        let mut count = 0u64;
        let mut bytes = 0u64;
        let mut shape: Option<RowShape> = None;
        while advance(cursor, cancel, count).await? {
            let row_shape = match shape {
                Some(shape) => {
                    shape
                        .check(&*cursor, &self.options.payload_column)
                        .map_err(|err| err.with_row(count))?;
                    shape
                }
                None => {
                    let resolved = RowShape::resolve(&*cursor, &self.options.payload_column)
                        .map_err(|err| err.with_row(count))?;
                    shape = Some(resolved);
                    resolved
                }
            };
            if count > 0 {
                write_delimiter(destination, COMMA, cancel)
                    .await
                    .map_err(|err| err.with_row(count))?;
            }
            bytes += self
                .copy_row(cursor, row_shape, destination, cancel)
                .await
                .map_err(|err| err.or_row(count))?;
            trace!(row = count, "streamed array element");
            count += 1;
        }

        write_delimiter(destination, RIGHT_BRACKET, cancel).await?;
        flush(destination, cancel).await?;
        debug!(rows = count, bytes, "streamed json array");
        Ok(count)
    }

    async fn copy_row<C, W>(
        &self,
        cursor: &mut C,
        shape: RowShape,
        destination: &mut W,
        cancel: &CancelToken,
    ) -> Result<u64, Error>
    where
        C: RowCursor + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut source = cancel.guard(cursor.open_payload(shape.ordinal())).await?;
        copy_payload(&mut source, destination, self.options.chunk_size, cancel).await
    }
}

async fn advance<C>(cursor: &mut C, cancel: &CancelToken, index: u64) -> Result<bool, Error>
where
    C: RowCursor + ?Sized,
{
    cancel
        .guard(cursor.advance())
        .await
        .map_err(|err| match err.kind() {
            ErrorKind::Cancelled => err,
            _ => err.or_row(index),
        })
}

async fn write_delimiter<W>(
    destination: &mut W,
    delimiter: &'static [u8],
    cancel: &CancelToken,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    cancel
        .guard(async {
            destination.write_all(delimiter).await.map_err(|err| {
                Error::new(ErrorKind::Transfer)
                    .with_message("failed to write array delimiter")
                    .with_source(err)
            })
        })
        .await
}

async fn flush<W>(destination: &mut W, cancel: &CancelToken) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    cancel
        .guard(async {
            destination.flush().await.map_err(|err| {
                Error::new(ErrorKind::Transfer)
                    .with_message("failed to flush destination")
                    .with_source(err)
            })
        })
        .await
}
