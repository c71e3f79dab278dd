use std::fs;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer, Registry};

use crate::config::CONFIG;
use crate::utils::timing::TIMING_TARGET;

const LOGS_DIR: &str = "logs";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// A daily-rolled file under `logs/`.
struct LogFile {
    name: &'static str,
    json: bool,
    timing: bool,
}

const LOG_FILES: [LogFile; 4] = [
    LogFile { name: "server.log", json: false, timing: false },
    LogFile { name: "server.jsonl", json: true, timing: false },
    LogFile { name: "timing.log", json: false, timing: true },
    LogFile { name: "timing.jsonl", json: true, timing: true },
];

/// Keeps the non-blocking file writers flushing until dropped.
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

fn parse_log_level(value: &str) -> LevelFilter {
    match value.trim().to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

fn general_targets(level: LevelFilter) -> Targets {
    Targets::new()
        .with_default(level)
        .with_target(TIMING_TARGET, LevelFilter::OFF)
        .with_target("hyper", LevelFilter::WARN)
        .with_target("hyper_util", LevelFilter::WARN)
        .with_target("hyper_util::client::legacy::pool", LevelFilter::WARN)
        .with_target("reqwest", LevelFilter::WARN)
        .with_target("sqlx::query", LevelFilter::WARN)
}

fn timing_targets() -> Targets {
    Targets::new()
        .with_default(LevelFilter::OFF)
        .with_target(TIMING_TARGET, LevelFilter::INFO)
}

fn file_layer(logs_dir: &Path, file: &LogFile, general: &Targets) -> (BoxedLayer, WorkerGuard) {
    let appender = tracing_appender::rolling::daily(logs_dir, file.name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = if file.timing {
        timing_targets()
    } else {
        general.clone()
    };

    let layer = if file.json {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_filter(filter)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(filter)
            .boxed()
    };
    (layer, guard)
}

pub fn init_logging() -> LoggingGuards {
    let logs_dir = Path::new(LOGS_DIR);
    if let Err(err) = fs::create_dir_all(logs_dir) {
        eprintln!("Failed to create logs directory: {err}");
    }

    let general = general_targets(parse_log_level(&CONFIG.log_level));
    let mut layers: Vec<BoxedLayer> = vec![fmt::layer()
        .with_writer(std::io::stdout)
        .with_filter(general.clone())
        .boxed()];
    let mut guards = Vec::with_capacity(LOG_FILES.len());

    for file in &LOG_FILES {
        let (layer, guard) = file_layer(logs_dir, file, &general);
        layers.push(layer);
        guards.push(guard);
    }

    tracing_subscriber::registry().with(layers).init();

    LoggingGuards { _guards: guards }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_levels_default_to_info() {
        assert_eq!(parse_log_level("WARNING"), LevelFilter::WARN);
        assert_eq!(parse_log_level(" debug "), LevelFilter::DEBUG);
        assert_eq!(parse_log_level("loud"), LevelFilter::INFO);
    }

    #[test]
    fn timing_lines_stay_out_of_general_logs() {
        let general = general_targets(LevelFilter::DEBUG);
        assert!(!general.would_enable(TIMING_TARGET, &tracing::Level::INFO));
        assert!(general.would_enable("generation_tracker", &tracing::Level::DEBUG));
        assert!(!general.would_enable("sqlx::query", &tracing::Level::INFO));

        let timing = timing_targets();
        assert!(timing.would_enable(TIMING_TARGET, &tracing::Level::INFO));
        assert!(!timing.would_enable("generation_tracker", &tracing::Level::INFO));
    }
}
