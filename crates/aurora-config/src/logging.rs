use std::path::PathBuf;

use snafu::{ResultExt as _, Snafu};
use tracing_appender::rolling::{InitError, RollingFileAppender};
use tracing_subscriber::{
    EnvFilter, Layer as _, Registry, filter::ParseError, layer::SubscriberExt as _,
    util::{SubscriberInitExt as _, TryInitError},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse the default log level"))]
    DefaultFilter { source: ParseError },

    #[snafu(display("failed to initialize rolling file appender in {directory:?}"))]
    FileAppender {
        source: InitError,
        directory: PathBuf,
    },

    #[snafu(display("failed to install the global tracing subscriber"))]
    InstallSubscriber { source: TryInitError },
}

/// Initializes `tracing` logging with options from the environment variable
/// given in the `env` parameter, e.g. `AURORA_LOG`.
///
/// If the variable is not set, the maximum log level is INFO.
///
/// Log output is additionally written as JSON to a rotated file when
/// `{env}_DIRECTORY` (e.g. `AURORA_LOG_DIRECTORY`) points to a directory.
pub fn initialize_logging(env: &str, app_name: &str) -> Result<(), Error> {
    let filter = match EnvFilter::try_from_env(env) {
        Ok(env_filter) => env_filter,
        _ => EnvFilter::try_new(tracing::Level::INFO.to_string()).context(DefaultFilterSnafu)?,
    };

    let file_appender_directory = std::env::var_os(format!("{env}_DIRECTORY")).map(PathBuf::from);
    let file_layer = file_appender_directory
        .as_deref()
        .map(|directory| {
            RollingFileAppender::builder()
                .filename_suffix(format!("{app_name}.log"))
                .max_log_files(6)
                .build(directory)
                .context(FileAppenderSnafu { directory })
        })
        .transpose()?
        .map(|appender| tracing_subscriber::fmt::layer().json().with_writer(appender).boxed());

    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    Registry::default()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context(InstallSubscriberSnafu)?;

    // need to delay logging until after tracing is initialized
    match file_appender_directory {
        Some(dir) => tracing::info!(directory = %dir.display(), "file logging enabled"),
        None => tracing::debug!("file logging disabled, because no log directory set"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use tracing::{debug, error, info};

    // Run
    //      AURORA_TEST_LOG=debug cargo test default_tracing -- --nocapture
    // to see all messages.
    #[test]
    fn default_tracing_level_is_set_to_info() {
        super::initialize_logging("AURORA_TEST_LOG", "test").expect("first subscriber in this test");

        error!("ERROR level messages should be seen.");
        info!("INFO level messages should also be seen by default.");
        debug!("DEBUG level messages should be seen only if you set the AURORA_TEST_LOG env var.");
    }
}
