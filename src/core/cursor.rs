// Forward-only row cursor capability and the per-cursor payload column decision.
use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::core::error::{Error, ErrorKind};

/// Column name holding the document when a row carries more than one column.
pub const DEFAULT_PAYLOAD_COLUMN: &str = "data";

/// An open, forward-only cursor over query result rows.
///
/// Column accessors describe the row the cursor is positioned on after a
/// successful `advance`. Rows cannot be revisited. Whoever opened the cursor
/// calls `close` exactly once it is done, whatever the outcome of streaming.
#[async_trait]
pub trait RowCursor: Send {
    type Payload: AsyncRead + Unpin + Send;

    /// Moves to the next row. `Ok(false)` means the cursor is exhausted.
    async fn advance(&mut self) -> Result<bool, Error>;

    fn column_count(&self) -> usize;

    fn ordinal(&self, name: &str) -> Option<usize>;

    /// Opens a column of the current row as an incremental byte source.
    async fn open_payload(&mut self, ordinal: usize) -> Result<Self::Payload, Error>;

    /// Releases the underlying query resource. Calling it twice is harmless.
    async fn close(&mut self) -> Result<(), Error>;
}

/// Where the payload lives, decided once from the first row of a cursor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RowShape {
    SingleColumn,
    MultiColumn { width: usize, ordinal: usize },
}

impl RowShape {
    pub fn resolve<C>(cursor: &C, payload_column: &str) -> Result<Self, Error>
    where
        C: RowCursor + ?Sized,
    {
        let width = cursor.column_count();
        if width == 1 {
            return Ok(RowShape::SingleColumn);
        }
        match cursor.ordinal(payload_column) {
            Some(ordinal) => Ok(RowShape::MultiColumn { width, ordinal }),
            None => Err(Error::new(ErrorKind::ColumnNotFound)
                .with_message("row has no payload column")
                .with_column(payload_column)
                .with_hint("Select the document column by name, or select it alone.")),
        }
    }

    pub fn ordinal(self) -> usize {
        match self {
            RowShape::SingleColumn => 0,
            RowShape::MultiColumn { ordinal, .. } => ordinal,
        }
    }

    pub fn width(self) -> usize {
        match self {
            RowShape::SingleColumn => 1,
            RowShape::MultiColumn { width, .. } => width,
        }
    }

    /// Rejects a row whose layout differs from the row the shape came from:
    /// another column count, or the payload column moved or gone.
    pub fn check<C>(self, cursor: &C, payload_column: &str) -> Result<(), Error>
    where
        C: RowCursor + ?Sized,
    {
        let width = cursor.column_count();
        if width != self.width() {
            return Err(Error::new(ErrorKind::ShapeMismatch).with_message(format!(
                "row has {width} columns but the cursor started with {}",
                self.width()
            )));
        }
        let RowShape::MultiColumn { ordinal, .. } = self else {
            return Ok(());
        };
        match cursor.ordinal(payload_column) {
            Some(found) if found == ordinal => Ok(()),
            Some(found) => Err(Error::new(ErrorKind::ShapeMismatch)
                .with_message(format!(
                    "payload column moved from ordinal {ordinal} to {found}"
                ))
                .with_column(payload_column)),
            None => Err(Error::new(ErrorKind::ColumnNotFound)
                .with_message("row has no payload column")
                .with_column(payload_column)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_PAYLOAD_COLUMN, RowCursor, RowShape};
    use crate::core::error::ErrorKind;
    use crate::core::memory::{MemoryCursor, MemoryRow};

    async fn positioned(row: MemoryRow) -> MemoryCursor {
        let mut cursor = MemoryCursor::new(vec![row]);
        assert!(cursor.advance().await.expect("advance"));
        cursor
    }

    #[tokio::test]
    async fn single_column_uses_first_ordinal() {
        let cursor = positioned(MemoryRow::payload(b"{}".to_vec())).await;
        let shape = RowShape::resolve(&cursor, DEFAULT_PAYLOAD_COLUMN).expect("shape");
        assert_eq!(shape, RowShape::SingleColumn);
        assert_eq!(shape.ordinal(), 0);
    }

    #[tokio::test]
    async fn single_column_ignores_column_name() {
        let row = MemoryRow::new().with_column("doc", b"{}".to_vec());
        let cursor = positioned(row).await;
        let shape = RowShape::resolve(&cursor, DEFAULT_PAYLOAD_COLUMN).expect("shape");
        assert_eq!(shape.ordinal(), 0);
    }

    #[tokio::test]
    async fn multi_column_finds_data_by_name() {
        let row = MemoryRow::new()
            .with_column("id", b"7".to_vec())
            .with_column("version", b"2".to_vec())
            .with_column("data", b"{}".to_vec());
        let cursor = positioned(row).await;
        let shape = RowShape::resolve(&cursor, DEFAULT_PAYLOAD_COLUMN).expect("shape");
        assert_eq!(shape, RowShape::MultiColumn { width: 3, ordinal: 2 });
        assert_eq!(
            RowShape::resolve(&cursor, DEFAULT_PAYLOAD_COLUMN).expect("again"),
            shape
        );
    }

    #[tokio::test]
    async fn multi_column_without_data_is_column_not_found() {
        let row = MemoryRow::new()
            .with_column("id", b"7".to_vec())
            .with_column("body", b"{}".to_vec());
        let cursor = positioned(row).await;
        let err = RowShape::resolve(&cursor, DEFAULT_PAYLOAD_COLUMN).expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::ColumnNotFound);
        assert_eq!(err.column(), Some("data"));
    }

    #[tokio::test]
    async fn check_rejects_width_change() {
        let cursor = positioned(
            MemoryRow::new()
                .with_column("id", b"1".to_vec())
                .with_column("data", b"{}".to_vec()),
        )
        .await;
        let err = RowShape::SingleColumn
            .check(&cursor, DEFAULT_PAYLOAD_COLUMN)
            .expect_err("mismatch");
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
        RowShape::MultiColumn { width: 2, ordinal: 1 }
            .check(&cursor, DEFAULT_PAYLOAD_COLUMN)
            .expect("same layout");
    }

    #[tokio::test]
    async fn check_rejects_moved_or_missing_payload_column() {
        let shape = RowShape::MultiColumn { width: 2, ordinal: 1 };

        let moved = positioned(
            MemoryRow::new()
                .with_column("data", b"{}".to_vec())
                .with_column("id", b"1".to_vec()),
        )
        .await;
        let err = shape
            .check(&moved, DEFAULT_PAYLOAD_COLUMN)
            .expect_err("moved");
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
        assert_eq!(err.column(), Some("data"));

        let missing = positioned(
            MemoryRow::new()
                .with_column("id", b"1".to_vec())
                .with_column("body", b"{}".to_vec()),
        )
        .await;
        let err = shape
            .check(&missing, DEFAULT_PAYLOAD_COLUMN)
            .expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::ColumnNotFound);
    }
}
