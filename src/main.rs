//! Purpose: `docstream` CLI entry point.
//! Role: Binary crate root; parses args, streams documents to stdout, runs the server.
//! Invariants: stdout carries only document bytes; diagnostics and logs go to stderr.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{
    CommandFactory, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod command_dispatch;
mod serve;

use docstream::api::{
    CancelToken, DEFAULT_CHUNK_SIZE, DEFAULT_PAYLOAD_COLUMN, DirectoryStore, DocQuery, Error,
    ErrorKind, JsonStreamer, StreamOptions, stream_many_query, stream_one_query, to_exit_code,
};

const DEFAULT_BIND: &str = "127.0.0.1:7411";
const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 64;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome { exit_code });
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint("Try `docstream --help`."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    init_tracing();
    let color_mode = cli.color;
    let settings = StreamSettings {
        options: StreamOptions::new()
            .with_chunk_size(cli.chunk_size)
            .with_payload_column(cli.column),
        payload_only: cli.payload_only,
    };

    command_dispatch::dispatch_command(cli.command, settings)
        .map_err(add_io_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "docstream",
    version,
    about = "Stream stored JSON documents as JSON arrays",
    long_about = r#"Stream a directory of stored JSON documents to stdout or over HTTP.

Each document is relayed byte-for-byte. A leading 0x01 marker byte, if present,
is dropped. Nothing is parsed or re-encoded."#
)]
struct Cli {
    #[arg(
        long,
        global = true,
        default_value_t = DEFAULT_CHUNK_SIZE,
        help = "Bytes copied per read from each document"
    )]
    chunk_size: usize,
    #[arg(
        long,
        global = true,
        default_value = DEFAULT_PAYLOAD_COLUMN,
        help = "Column holding the document in multi-column rows"
    )]
    column: String,
    #[arg(
        long,
        global = true,
        help = "Expose rows with the document column only (no id column)"
    )]
    payload_only: bool,
    #[arg(
        long,
        global = true,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        arg_required_else_help = true,
        about = "Print every document as one JSON array",
        after_help = r#"EXAMPLES
  $ docstream array ./docs
  $ docstream array ./docs | jq length"#
    )]
    Array {
        #[arg(help = "Directory of *.json documents", value_hint = ValueHint::DirPath)]
        dir: PathBuf,
    },
    #[command(
        arg_required_else_help = true,
        about = "Print one document by id",
        after_help = r#"EXAMPLES
  $ docstream get ./docs order-42"#
    )]
    Get {
        #[arg(help = "Directory of *.json documents", value_hint = ValueHint::DirPath)]
        dir: PathBuf,
        #[arg(help = "Document id (file name without .json)")]
        id: String,
    },
    #[command(
        about = "Serve documents over HTTP",
        long_about = r#"Serve a document directory over HTTP.

Endpoints:
  GET /healthz
  GET /v0/docs        all documents as one JSON array
  GET /v0/docs/{id}   one document"#,
        after_help = r#"EXAMPLES
  $ docstream serve --dir ./docs
  $ curl -s http://127.0.0.1:7411/v0/docs"#
    )]
    Serve {
        #[arg(long, help = "Directory of *.json documents", value_hint = ValueHint::DirPath)]
        dir: PathBuf,
        #[arg(long, default_value = DEFAULT_BIND, help = "Address to listen on")]
        bind: String,
        #[arg(long, help = "Allow binding to a non-loopback address")]
        allow_non_loopback: bool,
        #[arg(
            long,
            default_value_t = DEFAULT_MAX_CONCURRENT_STREAMS,
            help = "Maximum number of responses streaming at once"
        )]
        max_concurrent_streams: usize,
    },
    #[command(about = "Generate shell completion scripts")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

struct StreamSettings {
    options: StreamOptions,
    payload_only: bool,
}

impl StreamSettings {
    fn store(&self, dir: PathBuf) -> DirectoryStore {
        let store = DirectoryStore::new(dir);
        if self.payload_only {
            store.payload_only()
        } else {
            store
        }
    }

    fn streamer(&self) -> JsonStreamer {
        JsonStreamer::new(self.options.clone())
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn build_runtime() -> Result<tokio::runtime::Runtime, Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })
}

/// Cancels `cancel` on the first Ctrl-C.
fn cancel_on_ctrl_c(cancel: &CancelToken) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt received; cancelling stream");
            cancel.cancel();
        }
    });
}

fn parse_bind(bind: &str) -> Result<SocketAddr, Error> {
    bind.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid bind address")
            .with_hint("Use a host:port value like 127.0.0.1:7411.")
    })
}

async fn write_array(store: &DirectoryStore, streamer: &JsonStreamer) -> Result<u64, Error> {
    let cancel = CancelToken::new();
    cancel_on_ctrl_c(&cancel);
    let mut stdout = BufWriter::new(tokio::io::stdout());
    let count = stream_many_query(store, &DocQuery::All, streamer, &mut stdout, &cancel).await?;
    flush_stdout(&mut stdout).await?;
    Ok(count)
}

async fn write_document(
    store: &DirectoryStore,
    streamer: &JsonStreamer,
    id: &str,
) -> Result<(), Error> {
    let cancel = CancelToken::new();
    cancel_on_ctrl_c(&cancel);
    let mut stdout = BufWriter::new(tokio::io::stdout());
    let found =
        stream_one_query(store, &DocQuery::by_id(id), streamer, &mut stdout, &cancel).await?;
    if !found {
        return Err(Error::new(ErrorKind::NotFound)
            .with_message(format!("document {id} not found"))
            .with_hint("Run `docstream array <DIR>` to see stored documents."));
    }
    flush_stdout(&mut stdout).await
}

async fn flush_stdout<W: tokio::io::AsyncWrite + Unpin>(stdout: &mut W) -> Result<(), Error> {
    stdout.flush().await.map_err(stdout_error)
}

fn stdout_error(err: io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to write stdout")
        .with_source(err)
}

fn add_io_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Io || err.hint().is_some() {
        return err;
    }
    err.with_hint("Check that the document directory is readable.")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::NotFound => "not found",
        ErrorKind::ColumnNotFound => "payload column not found",
        ErrorKind::ShapeMismatch => "row shape changed mid-stream",
        ErrorKind::Transfer => "document transfer failed",
        ErrorKind::CursorFault => "cursor failed",
        ErrorKind::Cancelled => "cancelled",
        ErrorKind::Decode => "document could not be decoded",
        ErrorKind::Busy => "busy",
        ErrorKind::Io => "i/o error",
    }
    .to_string()
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(column) = err.column() {
        inner.insert("column".to_string(), json!(column));
    }
    if let Some(row) = err.row() {
        inner.insert("row".to_string(), json!(row));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = vec![format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    )];
    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(row) = err.row() {
        lines.push(format!(
            "{} {row}",
            colorize_label("row:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(offset) = err.offset() {
        lines.push(format!(
            "{} {offset}",
            colorize_label("offset:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
