// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Once;

use couriercommon::config::{LoggerConfig, LoggerType};
use tracing::level_filters::LevelFilter;
use tracing::warn;
use tracing_subscriber::EnvFilter;

static INIT_LOGGER_ONCE: Once = Once::new();

/// Initializes the process-wide tracing subscriber from the configuration's
/// logger section. Idempotent; later calls are ignored, as is an already
/// installed subscriber.
pub fn init_logging(config: &LoggerConfig) {
    INIT_LOGGER_ONCE.call_once(|| do_init_logging(config));
}

fn do_init_logging(config: &LoggerConfig) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_from_flags(&config.flags).into())
        .from_env_lossy();

    let result = match config.logger_type {
        LoggerType::Stdout => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .try_init(),
        LoggerType::File => match std::fs::File::options()
            .create(true)
            .append(true)
            .open(&config.file)
        {
            Ok(file) => tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .try_init(),
            Err(error) => {
                eprintln!(
                    "could not open log file {}: {error}, logging to stdout",
                    config.file
                );
                tracing_subscriber::fmt()
                    .with_env_filter(env_filter)
                    .try_init()
            }
        },
        LoggerType::Syslog => {
            // no syslog sink in this build
            let result = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .try_init();
            warn!("syslog logging is not available, falling back to stdout");
            result
        }
    };
    if let Err(error) = result {
        eprintln!("could not install tracing subscriber: {error}");
    }
}

/// Maps the pipe-separated flag list onto the most verbose level it names.
fn level_from_flags(flags: &str) -> LevelFilter {
    let mut level = None;
    for flag in flags.split('|').map(str::trim) {
        let candidate = match flag {
            "LOG_ALL" => LevelFilter::TRACE,
            "LOG_DEBUG" | "LOG_MSG_TYPES" | "LOG_MSG_TIME" => LevelFilter::DEBUG,
            "LOG_INFO" => LevelFilter::INFO,
            "LOG_WARNING" => LevelFilter::WARN,
            "LOG_ERROR" => LevelFilter::ERROR,
            "LOG_NONE" => LevelFilter::OFF,
            _ => continue,
        };
        level = Some(match level {
            Some(current) if current > candidate => current,
            _ => candidate,
        });
    }
    level.unwrap_or(LevelFilter::INFO)
}
