use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target, WriteStyle};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Install the process logger.
///
/// The filter comes from `RUST_LOG` (default `info`). With `log_file` set,
/// records go to that file, truncated on start, instead of stderr.
pub fn init(log_file: Option<&Path>) -> Result<()> {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));

    if let Some(path) = log_file {
        let file = File::create(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        builder
            .target(Target::Pipe(Box::new(file)))
            .write_style(WriteStyle::Never)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} - {} - {} - {}",
                    buf.timestamp(),
                    record.target(),
                    record.level(),
                    record.args()
                )
            });
    }

    builder.try_init().context("Logger already initialised")
}
