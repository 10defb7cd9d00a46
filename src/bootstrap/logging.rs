use crate::log_buffer::{create_log_buffer, LogBuffer};
use crate::logging;

/// Creates the shared log buffer and installs the global subscriber. Must
/// run before anything else in `setup()` touches `tracing`.
pub fn setup(config: &crate::config::Config) -> LogBuffer {
    let log_buffer = create_log_buffer();
    logging::init(&config.logging, log_buffer.clone());

    tracing::info!("starting signal dispatch & execution engine");
    if config.logging.enabled {
        tracing::info!(
            directory = %config.logging.directory,
            prefix = %config.logging.file_prefix,
            rotation = %config.logging.rotation,
            "file logging enabled"
        );
    }

    log_buffer
}
