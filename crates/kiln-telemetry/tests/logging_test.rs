use kiln_telemetry::logging::{self, LogFormat};
use uuid::Uuid;

#[test]
fn test_init_logging_human() {
    // Should not panic; second call is a safe no-op.
    logging::init_logging("kiln-test", "debug");
    logging::init_logging("kiln-test", "info");

    tracing::info!(key = "value", "human-readable log line");
}

#[test]
fn test_init_logging_json() {
    // The global subscriber may already be set by another test; this no-ops.
    logging::init_logging_json("kiln-test-json", "info");
    tracing::info!(key = "value", "json log line");
}

#[test]
fn test_engine_directives_scope_bare_levels() {
    let directives = logging::engine_directives("debug");
    assert!(directives.contains("kiln_agents=debug"));
    assert!(directives.contains("kiln_core=debug"));
    assert!(directives.ends_with(",warn"));
}

#[test]
fn test_engine_directives_pass_through_explicit_filters() {
    assert_eq!(
        logging::engine_directives("kiln_agents=trace,info"),
        "kiln_agents=trace,info"
    );
}

#[test]
fn test_log_format_parse() {
    assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
    assert_eq!(LogFormat::parse(" json "), LogFormat::Json);
    assert_eq!(LogFormat::parse("pretty"), LogFormat::Human);
}

#[test]
fn test_spans_can_be_entered() {
    logging::init_logging("kiln-span-test", "info");
    let build = Uuid::new_v4();
    let span = logging::task_span(build, Uuid::new_v4(), "backend");
    let _guard = span.enter();
    let _inner = logging::build_span(build).entered();
    tracing::info!("inside spans");
}
