//! Purpose: Serve a directory of stored JSON documents through the cursor boundary.
//! Exports: `DirectoryStore`, `DocQuery`, `DirectoryCursor`, `DirPayload`.
//! Role: Concrete query layer used by the CLI and HTTP server.
//! Invariants: One `*.json` file per document; the file stem is the document id.
//! Invariants: `DocQuery::All` yields documents ordered by id.
//! Invariants: Document files are opened only when their payload column is read.
#![allow(clippy::result_large_err)]

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;

use super::query::Connection;
use crate::core::cursor::{DEFAULT_PAYLOAD_COLUMN, RowCursor};
use crate::core::error::{Error, ErrorKind};

const DOC_EXTENSION: &str = "json";
const ID_COLUMN: &str = "id";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DocQuery {
    All,
    ById(String),
}

impl DocQuery {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self::ById(id.into())
    }
}

#[derive(Clone, Debug)]
pub struct DirectoryStore {
    root: PathBuf,
    payload_only: bool,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            payload_only: false,
        }
    }

    /// Produce single-column rows holding only the document.
    pub fn payload_only(mut self) -> Self {
        self.payload_only = true;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn list_documents(&self) -> Result<Vec<(String, PathBuf)>, Error> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|err| dir_error(err, &self.root))?;
        let mut docs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| dir_error(err, &self.root))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(DOC_EXTENSION) {
                continue;
            }
            if !is_document_file(&path).await? {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            docs.push((id.to_string(), path.clone()));
        }
        docs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(docs)
    }

    /// Whether a document with this id exists.
    pub async fn contains(&self, id: &str) -> Result<bool, Error> {
        Ok(!self.find_document(id).await?.is_empty())
    }

    async fn find_document(&self, id: &str) -> Result<Vec<(String, PathBuf)>, Error> {
        validate_id(id)?;
        let path = self.root.join(format!("{id}.{DOC_EXTENSION}"));
        if is_document_file(&path).await? {
            return Ok(vec![(id.to_string(), path)]);
        }
        // A missing document is an empty result; a missing store is not.
        tokio::fs::metadata(&self.root)
            .await
            .map_err(|err| dir_error(err, &self.root))?;
        Ok(Vec::new())
    }
}

/// Whether `path` resolves, following symlinks, to a regular file.
async fn is_document_file(path: &Path) -> Result<bool, Error> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.is_file()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(Error::new(ErrorKind::Io)
            .with_message(format!("failed to stat document {}", path.display()))
            .with_source(err)),
    }
}

#[async_trait]
impl Connection for DirectoryStore {
    type Command = DocQuery;
    type Cursor = DirectoryCursor;

    async fn execute(&self, command: &DocQuery) -> Result<DirectoryCursor, Error> {
        let docs = match command {
            DocQuery::All => self.list_documents().await?,
            DocQuery::ById(id) => self.find_document(id).await?,
        };
        debug!(root = %self.root.display(), rows = docs.len(), "opened document cursor");
        Ok(DirectoryCursor {
            pending: VecDeque::from(docs),
            current: None,
            payload_only: self.payload_only,
            closed: false,
        })
    }
}

#[derive(Debug)]
pub struct DirectoryCursor {
    pending: VecDeque<(String, PathBuf)>,
    current: Option<(String, PathBuf)>,
    payload_only: bool,
    closed: bool,
}

impl DirectoryCursor {
    fn columns(&self) -> &'static [&'static str] {
        if self.payload_only {
            &[DEFAULT_PAYLOAD_COLUMN]
        } else {
            &[ID_COLUMN, DEFAULT_PAYLOAD_COLUMN]
        }
    }
}

#[async_trait]
impl RowCursor for DirectoryCursor {
    type Payload = DirPayload;

    async fn advance(&mut self) -> Result<bool, Error> {
        if self.closed {
            return Ok(false);
        }
        self.current = self.pending.pop_front();
        Ok(self.current.is_some())
    }

    fn column_count(&self) -> usize {
        if self.current.is_some() {
            self.columns().len()
        } else {
            0
        }
    }

    fn ordinal(&self, name: &str) -> Option<usize> {
        self.current.as_ref()?;
        self.columns().iter().position(|column| *column == name)
    }

    async fn open_payload(&mut self, ordinal: usize) -> Result<DirPayload, Error> {
        let Some((id, path)) = self.current.as_ref() else {
            return Err(Error::new(ErrorKind::Usage).with_message("cursor is not positioned on a row"));
        };
        match self.columns().get(ordinal).copied() {
            Some(DEFAULT_PAYLOAD_COLUMN) => {
                let file = File::open(path).await.map_err(|err| {
                    Error::new(ErrorKind::Transfer)
                        .with_message(format!("failed to open document {}", path.display()))
                        .with_source(err)
                })?;
                Ok(DirPayload::File(file))
            }
            Some(_) => Ok(DirPayload::Inline(io::Cursor::new(id.clone().into_bytes()))),
            None => Err(Error::new(ErrorKind::ColumnNotFound)
                .with_message(format!("no column at ordinal {ordinal}"))),
        }
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.closed = true;
        self.pending.clear();
        self.current = None;
        Ok(())
    }
}

/// Byte source for one column of a directory row.
#[derive(Debug)]
pub enum DirPayload {
    File(File),
    Inline(io::Cursor<Vec<u8>>),
}

impl AsyncRead for DirPayload {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DirPayload::File(file) => Pin::new(file).poll_read(cx, buf),
            DirPayload::Inline(bytes) => Pin::new(bytes).poll_read(cx, buf),
        }
    }
}

fn validate_id(id: &str) -> Result<(), Error> {
    if id.is_empty() || id.contains('/') || id.contains('\\') || id == "." || id == ".." {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("document id must not be empty or contain path separators"));
    }
    Ok(())
}

fn dir_error(err: io::Error, root: &Path) -> Error {
    let kind = match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        _ => ErrorKind::Io,
    };
    Error::new(kind)
        .with_message(format!("failed to read document directory {}", root.display()))
        .with_hint("Pass an existing directory of *.json documents.")
        .with_source(err)
}
