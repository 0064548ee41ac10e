//! Purpose: Hold top-level CLI command dispatch for `docstream`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Each streaming command owns one runtime and one cancel token.

use super::*;

pub(super) fn dispatch_command(
    command: Command,
    settings: StreamSettings,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "docstream", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Array { dir } => {
            let store = settings.store(dir);
            let streamer = settings.streamer();
            let runtime = build_runtime()?;
            let count = runtime.block_on(write_array(&store, &streamer))?;
            debug!(rows = count, "array written");
            Ok(RunOutcome::ok())
        }
        Command::Get { dir, id } => {
            let store = settings.store(dir);
            let streamer = settings.streamer();
            let runtime = build_runtime()?;
            runtime.block_on(write_document(&store, &streamer, &id))?;
            Ok(RunOutcome::ok())
        }
        Command::Serve {
            dir,
            bind,
            allow_non_loopback,
            max_concurrent_streams,
        } => {
            let config = serve::ServeConfig {
                bind: parse_bind(&bind)?,
                doc_dir: dir,
                allow_non_loopback,
                payload_only: settings.payload_only,
                max_concurrent_streams,
                stream_options: settings.options,
            };
            let runtime = build_runtime()?;
            runtime.block_on(serve::serve(config))?;
            Ok(RunOutcome::ok())
        }
    }
}
