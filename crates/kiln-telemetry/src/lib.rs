//! Telemetry for kiln: `tracing-subscriber` initialisation with human or JSON
//! output, plus the build and task spans the engine runs its work under.

pub mod logging;
