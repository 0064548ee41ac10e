// In-memory cursor for embedding and tests; serves payloads in fixed-size chunks.
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};

use crate::core::cursor::{DEFAULT_PAYLOAD_COLUMN, RowCursor};
use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, Default)]
pub struct MemoryRow {
    columns: Vec<(String, Bytes)>,
}

impl MemoryRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single-column row holding `payload`.
    pub fn payload(payload: impl Into<Bytes>) -> Self {
        Self::new().with_column(DEFAULT_PAYLOAD_COLUMN, payload)
    }

    pub fn with_column(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.columns.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug)]
pub struct MemoryCursor {
    rows: VecDeque<MemoryRow>,
    current: Option<MemoryRow>,
    advanced: u64,
    chunk_size: usize,
    fault_at: Option<u64>,
    payload_fault: Option<(u64, usize)>,
    closes: Arc<AtomicUsize>,
}

impl MemoryCursor {
    pub fn new(rows: Vec<MemoryRow>) -> Self {
        Self {
            rows: VecDeque::from(rows),
            current: None,
            advanced: 0,
            chunk_size: 8192,
            fault_at: None,
            payload_fault: None,
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Documents as single-column rows.
    pub fn from_payloads<I, P>(payloads: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Bytes>,
    {
        Self::new(payloads.into_iter().map(MemoryRow::payload).collect())
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Fails the advance that would produce row `index` (zero-based).
    pub fn with_fault_at(mut self, index: u64) -> Self {
        self.fault_at = Some(index);
        self
    }

    /// Fails reads of row `index`'s payload once `after_bytes` have been served.
    pub fn with_payload_fault(mut self, index: u64, after_bytes: usize) -> Self {
        self.payload_fault = Some((index, after_bytes));
        self
    }

    /// Number of successful advances so far.
    pub fn advanced(&self) -> u64 {
        self.advanced
    }

    /// Shared counter of `close` calls; stays readable after the cursor is dropped.
    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }

    fn current_row(&self) -> Result<&MemoryRow, Error> {
        self.current.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message("cursor is not positioned on a row")
        })
    }
}

#[async_trait]
impl RowCursor for MemoryCursor {
    type Payload = MemoryPayload;

    async fn advance(&mut self) -> Result<bool, Error> {
        if self.fault_at == Some(self.advanced) {
            self.current = None;
            return Err(Error::new(ErrorKind::CursorFault)
                .with_message("connection reset while fetching rows")
                .with_row(self.advanced));
        }
        self.current = self.rows.pop_front();
        if self.current.is_some() {
            self.advanced += 1;
        }
        Ok(self.current.is_some())
    }

    fn column_count(&self) -> usize {
        self.current.as_ref().map_or(0, |row| row.columns.len())
    }

    fn ordinal(&self, name: &str) -> Option<usize> {
        self.current
            .as_ref()?
            .columns
            .iter()
            .position(|(column, _)| column == name)
    }

    async fn open_payload(&mut self, ordinal: usize) -> Result<MemoryPayload, Error> {
        let row = self.current_row()?;
        let (_, data) = row.columns.get(ordinal).ok_or_else(|| {
            Error::new(ErrorKind::ColumnNotFound)
                .with_message(format!("no column at ordinal {ordinal}"))
        })?;
        let index = self.advanced.saturating_sub(1);
        let fail_after = match self.payload_fault {
            Some((fault_row, after)) if fault_row == index => Some(after),
            _ => None,
        };
        Ok(MemoryPayload {
            data: data.clone(),
            pos: 0,
            chunk_size: self.chunk_size,
            fail_after,
        })
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.rows.clear();
        self.current = None;
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryPayload {
    data: Bytes,
    pos: usize,
    chunk_size: usize,
    fail_after: Option<usize>,
}

impl AsyncRead for MemoryPayload {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let mut limit = this.data.len();
        if let Some(fail_after) = this.fail_after {
            if this.pos >= fail_after {
                return Poll::Ready(Err(io::Error::other("payload stream interrupted")));
            }
            limit = limit.min(fail_after);
        }
        let take = (limit - this.pos).min(this.chunk_size).min(buf.remaining());
        buf.put_slice(&this.data[this.pos..this.pos + take]);
        this.pos += take;
        Poll::Ready(Ok(()))
    }
}
