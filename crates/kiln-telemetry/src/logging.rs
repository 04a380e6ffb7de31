use tracing::Span;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

/// Crates whose logs follow the requested level; everything else logs at `warn`.
const ENGINE_TARGETS: [&str; 5] = [
    "kiln_core",
    "kiln_harness",
    "kiln_bridge",
    "kiln_telemetry",
    "kiln_agents",
];

/// Output format selected by `KILN_LOG_FORMAT` (`json` or anything else).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Human
        }
    }

    pub fn from_env() -> Self {
        std::env::var("KILN_LOG_FORMAT")
            .map(|v| Self::parse(&v))
            .unwrap_or(LogFormat::Human)
    }
}

/// Filter directives for `level`: a bare level such as `debug` applies to the
/// engine crates only, while anything containing `=` or `,` is used as-is.
pub fn engine_directives(level: &str) -> String {
    let level = level.trim();
    if level.contains('=') || level.contains(',') {
        return level.to_string();
    }
    let mut parts: Vec<String> = ENGINE_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect();
    parts.push("warn".to_string());
    parts.join(",")
}

fn filter_for(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(engine_directives(default_level)))
}

/// Initialize logging with human-readable output format.
///
/// Uses `RUST_LOG` if set, otherwise [`engine_directives`] for `default_level`.
/// Safe to call multiple times (e.g. in tests) -- subsequent calls are no-ops.
pub fn init_logging(service_name: &str, default_level: &str) {
    fmt()
        .with_env_filter(filter_for(default_level))
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised (human-readable)");
}

/// Initialize logging with JSON output format. Same filter rules as
/// [`init_logging`]. Safe to call multiple times.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    fmt()
        .json()
        .with_env_filter(filter_for(default_level))
        .with_target(true)
        .with_current_span(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised (json)");
}

/// Initialize with the format chosen by `KILN_LOG_FORMAT`.
pub fn init_from_env(service_name: &str, default_level: &str) {
    match LogFormat::from_env() {
        LogFormat::Json => init_logging_json(service_name, default_level),
        LogFormat::Human => init_logging(service_name, default_level),
    }
}

// ---------------------------------------------------------------------------
// Spans
// ---------------------------------------------------------------------------

/// Span wrapping all background work for one build.
pub fn build_span(build_id: Uuid) -> Span {
    tracing::info_span!("build", build_id = %build_id)
}

/// Span for a single task execution.
pub fn task_span(build_id: Uuid, task_id: Uuid, role: &str) -> Span {
    tracing::info_span!("task", build_id = %build_id, task_id = %task_id, role = role)
}
