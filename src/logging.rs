use std::sync::OnceLock;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use crate::Result;

static SUBSCRIBER: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Environment variable holding `EnvFilter` directives for the pipeline's log stream.
pub const LOG_FILTER_ENV: &str = "BCRISK_LOG";

/// Pipeline steps at info, dependencies only when they warn.
const DEFAULT_FILTER: &str = "warn,bcrisk=info";

/// One pipeline step as it appears in the JSON log stream.
#[derive(Debug, Serialize)]
pub struct LogEvent<'a> {
    pub filename: &'a str,
    pub timestamp: DateTime<Utc>,
    pub component: &'a str,
    pub function: &'a str,
    pub stage: &'a str,
    pub line_num: u32,
    pub rows: Option<usize>,
    pub error: Option<&'a str>,
    pub message: &'a str,
}

/// Filter for the log stream. Directives that fail to parse fall back to the default.
pub fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the JSON subscriber on stderr, filtered by [`LOG_FILTER_ENV`]. Stdout is left
/// to the regression tables.
///
/// Calling this function multiple times is safe; only the first invocation installs the
/// subscriber.
pub fn init_logging() -> Result<()> {
    let result = SUBSCRIBER.get_or_init(|| {
        let directives = std::env::var(LOG_FILTER_ENV).ok();
        fmt()
            .with_env_filter(log_filter(directives.as_deref()))
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|error| error.to_string())?;

        Ok(())
    });

    match result {
        Ok(()) => Ok(()),
        Err(message) => Err(anyhow!(message.clone())),
    }
}

/// Emit a structured record for a pipeline step. `rows` carries the row count of the
/// table the step produced, when there is one.
#[allow(clippy::too_many_arguments)]
pub fn log_event(
    filename: &str,
    component: &str,
    function: &str,
    stage: &str,
    line_num: u32,
    message: &str,
    rows: Option<usize>,
    error: Option<&str>,
) {
    let event = LogEvent {
        filename,
        timestamp: Utc::now(),
        component,
        function,
        stage,
        line_num,
        rows,
        error,
        message,
    };

    if let Ok(serialized) = serde_json::to_string(&event) {
        info!(target: "bcrisk", json = %serialized);
    } else {
        info!(target: "bcrisk", message);
    }
}
