//! Engine configuration.
//!
//! Settings are read through the `config` crate from an optional file
//! (any format `config` understands, e.g. `reteclad.toml`) and then from
//! `RETECLAD_*` environment variables, which take precedence.

use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of rule base partitions. Each partition has its own working
    /// memory state and may be advanced by its own thread.
    pub partitions: u16,
    /// Evaluate partitions on scoped threads in `Session::evaluate_all`.
    pub parallel_evaluation: bool,
    /// Filter handed to `tracing_subscriber::EnvFilter` by the demo binary.
    pub log_filter: String,
    /// Upper bound on path evaluations performed by one `evaluate_all` call.
    pub max_path_evaluations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            partitions: 1,
            parallel_evaluation: false,
            log_filter: String::from("info"),
            max_path_evaluations: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("RETECLAD"))
            .build()?;
        let mut engine: EngineConfig = settings.try_deserialize()?;
        // zero partitions would leave nowhere to put node memories
        if engine.partitions == 0 {
            engine.partitions = 1;
        }
        Ok(engine)
    }
}
