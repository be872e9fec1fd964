//! Logging setup shared by the command line tools.
//!
//! Log lines go to stderr, so that tools which write their results to stdout
//! can be piped. The filter is taken from `RUST_LOG` and defaults to
//! [DEFAULT_FILTER].
use std::path::Path;

use time::{UtcOffset, format_description::well_known::Iso8601};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, time::OffsetTime},
    layer::SubscriberExt,
};

pub const DEFAULT_FILTER: &str = "info";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("local UTC offset of {0} seconds is invalid")]
    InvalidOffset(i32, #[source] time::error::ComponentRange),
    #[error("could not create log file \"{}\"", path.display())]
    CreateLogFile {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("a global tracing subscriber is already set")]
    AlreadySet(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Log to stderr only.
pub fn init() -> Result<(), Error> {
    initiate_logging(None)
}

/// Log to stderr and, if `path` is given, also to that file.
pub fn initiate_logging(path: Option<&Path>) -> Result<(), Error> {
    // Fixed offset from the local timezone at startup.
    let offset_secs = chrono::Local::now().offset().local_minus_utc();
    let offset = UtcOffset::from_whole_seconds(offset_secs)
        .map_err(|e| Error::InvalidOffset(offset_secs, e))?;
    let timer = OffsetTime::new(offset, Iso8601::DEFAULT);

    let file_layer = match path {
        Some(path) => {
            let file = std::fs::File::create(path).map_err(|source| Error::CreateLogFile {
                path: path.to_path_buf(),
                source,
            })?;
            Some(
                fmt::layer()
                    .with_timer(timer.clone())
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true),
            )
        }
        None => None,
    };

    let console_layer = fmt::layer()
        .with_timer(timer)
        .with_writer(std::io::stderr)
        .with_ansi(!cfg!(windows));

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(env_filter());
    tracing::subscriber::set_global_default(collector)?;

    match std::env::var("RUST_LOG") {
        Ok(var) => tracing::debug!("logging initiated with RUST_LOG=\"{var}\""),
        Err(_) => tracing::debug!("logging initiated with default filter \"{DEFAULT_FILTER}\""),
    }
    if let Some(path) = path {
        tracing::debug!("also logging to \"{}\"", path.display());
    }
    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
