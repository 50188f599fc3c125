mod config;
mod error;
mod format;
mod log;

pub use config::LoggerConfig;
pub use error::LoggerError;
pub use format::LoggerFormat;

/// Install the global `tracing` subscriber described by `cfg`.
///
/// Fails with [`LoggerError::AlreadyInitialized`] when a global subscriber is already set.
pub fn logger_init(cfg: &LoggerConfig) -> Result<(), LoggerError> {
    match cfg.format {
        LoggerFormat::Text => log::Logger::text(cfg),
        LoggerFormat::Json => log::Logger::json(cfg),
        LoggerFormat::Journald => log::Logger::journald(cfg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_rejected() {
        let cfg = LoggerConfig::default().with_level("warden_core=debug,info");
        logger_init(&cfg).unwrap();

        let again = logger_init(&LoggerConfig::default().with_format(LoggerFormat::Json));
        assert!(matches!(again, Err(LoggerError::AlreadyInitialized)));
    }

    #[test]
    fn bad_level_is_reported_before_init() {
        let cfg = LoggerConfig::default().with_level("warden_core=loud");
        assert!(matches!(
            logger_init(&cfg),
            Err(LoggerError::InvalidLogLevel(level)) if level == "warden_core=loud"
        ));
    }
}
