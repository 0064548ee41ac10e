//! Purpose: Connection-level entry points that own the cursor they stream from.
//! Exports: `Connection`, `Selector`, `JsonSelector`, `stream_one_query`,
//! `stream_many_query`, `load_one`.
//! Role: Pairs query execution with guaranteed cursor release on every exit path.
//! Invariants: `close` runs after success, error, and cancellation alike.
//! Invariants: A streaming error takes precedence over a close error.
//! Notes: `load_one` is the materializing path; streaming helpers never buffer a document.
#![allow(clippy::result_large_err)]

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWrite;
use tracing::warn;

use crate::core::cancel::CancelToken;
use crate::core::cursor::{RowCursor, RowShape};
use crate::core::error::{Error, ErrorKind};
use crate::core::sentinel::copy_payload;
use crate::core::stream::{JsonStreamer, StreamOptions};

/// Executes prepared commands and hands back an open cursor.
#[async_trait]
pub trait Connection: Send + Sync {
    type Command: Send + Sync;
    type Cursor: RowCursor;

    async fn execute(&self, command: &Self::Command) -> Result<Self::Cursor, Error>;
}

/// Builds a value from the row a cursor is positioned on.
#[async_trait]
pub trait Selector<C: RowCursor>: Send + Sync {
    type Output: Send;

    async fn resolve(&self, cursor: &mut C, cancel: &CancelToken) -> Result<Self::Output, Error>;
}

/// Deserializes the sentinel-stripped payload column into `T`.
#[derive(Debug)]
pub struct JsonSelector<T> {
    options: StreamOptions,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSelector<T> {
    pub fn new() -> Self {
        Self::with_options(StreamOptions::default())
    }

    pub fn with_options(options: StreamOptions) -> Self {
        Self {
            options,
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSelector<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<C, T> Selector<C> for JsonSelector<T>
where
    C: RowCursor,
    T: DeserializeOwned + Send,
{
    type Output = T;

    async fn resolve(&self, cursor: &mut C, cancel: &CancelToken) -> Result<T, Error> {
        let shape = RowShape::resolve(&*cursor, &self.options.payload_column)?;
        let mut source = cancel.guard(cursor.open_payload(shape.ordinal())).await?;
        let mut document = Vec::new();
        copy_payload(&mut source, &mut document, self.options.chunk_size, cancel).await?;
        serde_json::from_slice(&document).map_err(|err| {
            Error::new(ErrorKind::Decode)
                .with_message("stored document is not valid for the requested type")
                .with_source(err)
        })
    }
}

/// Streams the first row's document. Returns whether a row was found.
pub async fn stream_one_query<Conn, W>(
    connection: &Conn,
    command: &Conn::Command,
    streamer: &JsonStreamer,
    destination: &mut W,
    cancel: &CancelToken,
) -> Result<bool, Error>
where
    Conn: Connection,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut cursor = cancel.guard(connection.execute(command)).await?;
    let result = streamer.stream_one(&mut cursor, destination, cancel).await;
    release(&mut cursor, result).await.map(|count| count == 1)
}

/// Streams every row as a JSON array. Returns the row count.
pub async fn stream_many_query<Conn, W>(
    connection: &Conn,
    command: &Conn::Command,
    streamer: &JsonStreamer,
    destination: &mut W,
    cancel: &CancelToken,
) -> Result<u64, Error>
where
    Conn: Connection,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut cursor = cancel.guard(connection.execute(command)).await?;
    let result = streamer.stream_many(&mut cursor, destination, cancel).await;
    release(&mut cursor, result).await
}

/// Resolves the first row through `selector`, or `None` for an empty result.
pub async fn load_one<Conn, S>(
    connection: &Conn,
    command: &Conn::Command,
    selector: &S,
    cancel: &CancelToken,
) -> Result<Option<S::Output>, Error>
where
    Conn: Connection,
    S: Selector<Conn::Cursor>,
{
    let mut cursor = cancel.guard(connection.execute(command)).await?;
    let result = select_first(&mut cursor, selector, cancel).await;
    release(&mut cursor, result).await
}

async fn select_first<C, S>(
    cursor: &mut C,
    selector: &S,
    cancel: &CancelToken,
) -> Result<Option<S::Output>, Error>
where
    C: RowCursor,
    S: Selector<C>,
{
    if !cancel.guard(cursor.advance()).await? {
        return Ok(None);
    }
    selector.resolve(cursor, cancel).await.map(Some)
}

async fn release<C, T>(cursor: &mut C, result: Result<T, Error>) -> Result<T, Error>
where
    C: RowCursor,
{
    let closed = cursor.close().await;
    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(Error::new(ErrorKind::CursorFault)
            .with_message("failed to release cursor")
            .with_source(err)),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(close_err)) => {
            warn!(error = %close_err, "failed to release cursor after streaming error");
            Err(err)
        }
    }
}
