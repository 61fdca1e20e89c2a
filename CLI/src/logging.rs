use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};

/// Terminal at `level`, plus `logs/lanchat-<role>.log` at debug.
pub fn setup_logger(role: &str, term_level: LevelFilter) -> Result<()> {
    let log_dir = Path::new("logs");
    std::fs::create_dir_all(log_dir).context("Failed to create log dir")?;
    let log_file = File::create(log_dir.join(format!("lanchat-{}.log", role)))
        .context("Failed to create log file")?;

    let mut builder = ConfigBuilder::new();
    // Offset lookup can fail on some platforms; UTC timestamps are fine then.
    let _ = builder.set_time_offset_to_local();
    let config = builder
        .add_filter_ignore_str("tungstenite")
        .add_filter_ignore_str("tokio_tungstenite")
        .add_filter_ignore_str("reqwest")
        .add_filter_ignore_str("hyper")
        .build();

    let loggers: Vec<Box<dyn SharedLogger>> = vec![
        TermLogger::new(
            term_level,
            config.clone(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Debug, config, log_file),
    ];

    CombinedLogger::init(loggers).ok();
    Ok(())
}
