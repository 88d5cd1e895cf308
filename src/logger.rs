// Logging setup for programs embedding the mesh allocator. The library itself only ever logs
// through the https://crates.io/crates/log facade; this installs simplelog behind it.

use std::fs::File;

use log::LevelFilter;
use simplelog::{ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode, WriteLogger};

use crate::config::LoggingConfig;

#[derive(thiserror::Error, Debug)]
pub enum LoggerError {
    #[error("Could not create log file: {0:?}")]
    CouldntCreateLogFile(#[from] std::io::Error),
    #[error("A logger was already installed: {0}")]
    AlreadyInitialized(#[from] log::SetLoggerError),
}

/// Installs a terminal logger, plus a file logger if `config.log_file` is set.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggerError> {
    let level: LevelFilter = config.level.into();

    let mut log_config_builder = ConfigBuilder::default();
    log_config_builder.set_target_level(LevelFilter::Error);
    let log_config = log_config_builder.build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(level, log_config.clone(), TerminalMode::Mixed, ColorChoice::Auto)];
    if let Some(path) = config.log_file.as_ref() {
        loggers.push(WriteLogger::new(level, log_config, File::create(path)?));
    }

    CombinedLogger::init(loggers)?;
    Ok(())
}
