use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{AgentRole, BuildMode, PowerMode};

/// Engine configuration loaded from `~/.kiln/engine.toml`.
///
/// Every field has a default, so an empty file (or no file) yields a usable
/// configuration. Environment overrides are applied on top by
/// [`EngineConfig::apply_env_overrides`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub tokens: TokensConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
}

impl EngineConfig {
    /// Load from the default path, falling back to defaults when the file
    /// does not exist, then apply process environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        let mut cfg = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific path. Environment overrides are not applied.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: EngineConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, limits) in [("fast", &self.limits.fast), ("full", &self.limits.full)] {
            if limits.max_retries > MAX_RETRY_CEILING {
                return Err(ConfigError::Validation(format!(
                    "limits.{name}.max_retries must be at most {MAX_RETRY_CEILING}"
                )));
            }
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "scheduler.poll_interval_ms must be positive".into(),
            ));
        }
        if self.dispatcher.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "dispatcher.queue_capacity must be positive".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.consensus.temperature) {
            return Err(ConfigError::Validation(
                "consensus.temperature must be within 0.0..=2.0".into(),
            ));
        }
        Ok(())
    }

    /// Apply `BUILD_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply `BUILD_*` overrides from an arbitrary lookup.
    ///
    /// Mode-suffixed keys (`BUILD_MAX_AGENTS_FAST`) win over the global key
    /// (`BUILD_MAX_AGENTS`). Values that fail to parse are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let int = |key: &str| -> Option<i64> {
            lookup(key).and_then(|v| v.trim().parse::<i64>().ok())
        };

        for (suffix, limits) in [("FAST", &mut self.limits.fast), ("FULL", &mut self.limits.full)] {
            let pick = |base: &str| int(&format!("{base}_{suffix}")).or_else(|| int(base));
            if let Some(v) = pick("BUILD_MAX_AGENTS") {
                limits.max_agents = v.max(1) as u32;
            }
            if let Some(v) = pick("BUILD_MAX_RETRIES") {
                limits.max_retries = v.clamp(0, MAX_RETRY_CEILING as i64) as u32;
            }
            if let Some(v) = pick("BUILD_MAX_REQUESTS") {
                limits.max_requests = v.max(0) as u32;
            }
            if let Some(v) = pick("BUILD_MAX_TOKENS") {
                limits.max_tokens_per_request = Some(v.max(0) as u32);
            }
        }

        if let Some(v) = int("BUILD_TIMEOUT_FAST_SECONDS") {
            self.timeouts.build_fast_secs = v.max(0) as u64;
            self.timeouts.fast_explicit = true;
        }
        if let Some(v) = int("BUILD_TIMEOUT_FULL_SECONDS") {
            self.timeouts.build_full_secs = v.max(0) as u64;
            self.timeouts.full_explicit = true;
        }

        if let Some(v) = int("BUILD_MAX_FIX_LOOPS") {
            self.recovery.max_fix_loops = v.max(0) as u32;
        }
        if let Some(v) = int("BUILD_MAX_REVIEW_FIX_LOOPS") {
            self.recovery.max_review_fix_loops = v.max(0) as u32;
        }
        if let Some(v) = int("BUILD_MAX_TEST_FIX_LOOPS") {
            self.recovery.max_test_fix_loops = v.max(0) as u32;
        }

        if let Some(v) = lookup("BUILD_REQUIRE_PREVIEW_READY_DEFAULT") {
            let v = v.trim().to_ascii_lowercase();
            self.readiness.require_preview_default = matches!(v.as_str(), "1" | "true" | "yes" | "on");
        }
    }

    /// Effective guardrails for a new build.
    ///
    /// When the mode has no explicit token cap, the mode default is raised to
    /// the power-mode floor.
    pub fn limits_for(&self, mode: BuildMode, power: PowerMode) -> BuildLimits {
        let limits = match mode {
            BuildMode::Fast => &self.limits.fast,
            BuildMode::Full => &self.limits.full,
        };
        let max_tokens_per_request = match limits.max_tokens_per_request {
            Some(explicit) => explicit,
            None => default_mode_tokens(mode).max(power_token_floor(power)),
        };
        BuildLimits {
            max_agents: limits.max_agents.max(1),
            max_retries: limits.max_retries.min(MAX_RETRY_CEILING),
            max_requests: limits.max_requests,
            max_tokens_per_request,
        }
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".kiln")
            .join("engine.toml")
    }
}

/// Upper bound on per-task retries regardless of configuration.
pub const MAX_RETRY_CEILING: u32 = 3;

/// Token floor applied per power mode when no explicit cap is configured.
pub fn power_token_floor(power: PowerMode) -> u32 {
    match power {
        PowerMode::Max => 24_000,
        PowerMode::Balanced => 18_000,
        PowerMode::Fast => 12_000,
    }
}

fn default_mode_tokens(mode: BuildMode) -> u32 {
    match mode {
        BuildMode::Fast => 2_000,
        BuildMode::Full => 4_000,
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLimits {
    pub max_agents: u32,
    pub max_retries: u32,
    /// Zero means unlimited.
    pub max_requests: u32,
    /// Zero means unlimited.
    pub max_tokens_per_request: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeLimits {
    pub max_agents: u32,
    pub max_retries: u32,
    pub max_requests: u32,
    #[serde(default)]
    pub max_tokens_per_request: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_fast_limits")]
    pub fast: ModeLimits,
    #[serde(default = "default_full_limits")]
    pub full: ModeLimits,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            fast: default_fast_limits(),
            full: default_full_limits(),
        }
    }
}

fn default_fast_limits() -> ModeLimits {
    ModeLimits {
        max_agents: 7,
        max_retries: 2,
        max_requests: 30,
        max_tokens_per_request: None,
    }
}

fn default_full_limits() -> ModeLimits {
    ModeLimits {
        max_agents: 8,
        max_retries: 3,
        max_requests: 72,
        max_tokens_per_request: None,
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokensConfig {
    #[serde(default = "default_planner_tokens")]
    pub planner: u32,
    #[serde(default = "default_architect_tokens")]
    pub architect: u32,
    #[serde(default = "default_codegen_tokens")]
    pub frontend: u32,
    #[serde(default = "default_codegen_tokens")]
    pub backend: u32,
    #[serde(default = "default_role_tokens")]
    pub database: u32,
    #[serde(default = "default_role_tokens")]
    pub testing: u32,
    #[serde(default = "default_planner_tokens")]
    pub reviewer: u32,
    #[serde(default = "default_solver_tokens")]
    pub solver: u32,
    #[serde(default = "default_lead_tokens")]
    pub lead: u32,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            planner: default_planner_tokens(),
            architect: default_architect_tokens(),
            frontend: default_codegen_tokens(),
            backend: default_codegen_tokens(),
            database: default_role_tokens(),
            testing: default_role_tokens(),
            reviewer: default_planner_tokens(),
            solver: default_solver_tokens(),
            lead: default_lead_tokens(),
        }
    }
}

impl TokensConfig {
    /// Role budget scaled by the power-mode multiplier (1x, 1.5x, 2x).
    pub fn for_role(&self, role: AgentRole, power: PowerMode) -> u32 {
        let base = match role {
            AgentRole::Planner => self.planner,
            AgentRole::Architect => self.architect,
            AgentRole::Frontend => self.frontend,
            AgentRole::Backend => self.backend,
            AgentRole::Database => self.database,
            AgentRole::Testing => self.testing,
            AgentRole::Reviewer => self.reviewer,
            AgentRole::Solver => self.solver,
            AgentRole::Lead => self.lead,
        };
        match power {
            PowerMode::Fast => base,
            PowerMode::Balanced => base.saturating_mul(3) / 2,
            PowerMode::Max => base.saturating_mul(2),
        }
    }
}

/// Sampling temperature per role.
pub fn temperature_for_role(role: AgentRole) -> f32 {
    match role {
        AgentRole::Planner => 0.4,
        AgentRole::Architect => 0.5,
        AgentRole::Database => 0.3,
        AgentRole::Backend => 0.6,
        AgentRole::Frontend => 0.7,
        AgentRole::Testing => 0.3,
        AgentRole::Reviewer => 0.4,
        AgentRole::Solver => 0.35,
        AgentRole::Lead => 0.6,
    }
}

fn default_planner_tokens() -> u32 {
    4_000
}
fn default_architect_tokens() -> u32 {
    6_000
}
fn default_codegen_tokens() -> u32 {
    12_000
}
fn default_role_tokens() -> u32 {
    8_000
}
fn default_solver_tokens() -> u32 {
    10_000
}
fn default_lead_tokens() -> u32 {
    2_000
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_task_execution_secs")]
    pub task_execution_secs: u64,
    #[serde(default = "default_build_fast_secs")]
    pub build_fast_secs: u64,
    #[serde(default = "default_build_full_secs")]
    pub build_full_secs: u64,
    #[serde(default = "default_local_build_fast_secs")]
    pub local_build_fast_secs: u64,
    #[serde(default = "default_local_build_full_secs")]
    pub local_build_full_secs: u64,
    #[serde(default = "default_inactivity_check_ms")]
    pub inactivity_check_ms: u64,
    #[serde(default = "default_inactivity_threshold_ms")]
    pub inactivity_threshold_ms: u64,
    #[serde(default = "default_inactivity_warnings")]
    pub inactivity_warnings: u32,
    /// Set when the fast build timeout came from the environment.
    #[serde(skip)]
    pub fast_explicit: bool,
    /// Set when the full build timeout came from the environment.
    #[serde(skip)]
    pub full_explicit: bool,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            task_execution_secs: default_task_execution_secs(),
            build_fast_secs: default_build_fast_secs(),
            build_full_secs: default_build_full_secs(),
            local_build_fast_secs: default_local_build_fast_secs(),
            local_build_full_secs: default_local_build_full_secs(),
            inactivity_check_ms: default_inactivity_check_ms(),
            inactivity_threshold_ms: default_inactivity_threshold_ms(),
            inactivity_warnings: default_inactivity_warnings(),
            fast_explicit: false,
            full_explicit: false,
        }
    }
}

/// Builds never time out sooner than this.
pub const MIN_BUILD_TIMEOUT: Duration = Duration::from_secs(30);

impl TimeoutsConfig {
    pub fn task_execution(&self) -> Duration {
        Duration::from_secs(self.task_execution_secs)
    }

    /// Wall-clock limit for a build. The local profile extends the default
    /// unless the operator set the mode's timeout explicitly.
    pub fn build_timeout(&self, mode: BuildMode, local_profile: bool) -> Duration {
        let secs = match mode {
            BuildMode::Fast if local_profile && !self.fast_explicit => self.local_build_fast_secs,
            BuildMode::Fast => self.build_fast_secs,
            BuildMode::Full if local_profile && !self.full_explicit => self.local_build_full_secs,
            BuildMode::Full => self.build_full_secs,
        };
        Duration::from_secs(secs).max(MIN_BUILD_TIMEOUT)
    }

    pub fn inactivity_check(&self) -> Duration {
        Duration::from_millis(self.inactivity_check_ms)
    }

    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_millis(self.inactivity_threshold_ms)
    }
}

fn default_task_execution_secs() -> u64 {
    300
}
fn default_build_fast_secs() -> u64 {
    240
}
fn default_build_full_secs() -> u64 {
    600
}
fn default_local_build_fast_secs() -> u64 {
    900
}
fn default_local_build_full_secs() -> u64 {
    1_800
}
fn default_inactivity_check_ms() -> u64 {
    15_000
}
fn default_inactivity_threshold_ms() -> u64 {
    120_000
}
fn default_inactivity_warnings() -> u32 {
    5
}

// ---------------------------------------------------------------------------
// Scheduler / consensus / recovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            phase_timeout_secs: default_phase_timeout_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}
fn default_phase_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_consensus_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_consensus_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_consensus_temperature")]
    pub temperature: f32,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_consensus_timeout_secs(),
            max_tokens: default_consensus_max_tokens(),
            temperature: default_consensus_temperature(),
        }
    }
}

impl ConsensusConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_consensus_timeout_secs() -> u64 {
    45
}
fn default_consensus_max_tokens() -> u32 {
    180
}
fn default_consensus_temperature() -> f32 {
    0.2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_fix_loops")]
    pub max_fix_loops: u32,
    #[serde(default = "default_fix_loops")]
    pub max_review_fix_loops: u32,
    #[serde(default = "default_fix_loops")]
    pub max_test_fix_loops: u32,
    #[serde(default = "default_duplicate_cooldown_secs")]
    pub duplicate_cooldown_secs: u64,
    #[serde(default = "default_max_error_history")]
    pub max_error_history: usize,
    #[serde(default = "default_error_context_chars")]
    pub error_context_chars: usize,
    /// Multiplier applied to `retry_count` for the backoff delay.
    #[serde(default = "default_backoff_step_ms")]
    pub backoff_step_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_fix_loops: default_fix_loops(),
            max_review_fix_loops: default_fix_loops(),
            max_test_fix_loops: default_fix_loops(),
            duplicate_cooldown_secs: default_duplicate_cooldown_secs(),
            max_error_history: default_max_error_history(),
            error_context_chars: default_error_context_chars(),
            backoff_step_ms: default_backoff_step_ms(),
        }
    }
}

impl RecoveryConfig {
    pub fn duplicate_cooldown(&self) -> Duration {
        Duration::from_secs(self.duplicate_cooldown_secs)
    }
}

fn default_fix_loops() -> u32 {
    3
}
fn default_duplicate_cooldown_secs() -> u64 {
    20
}
fn default_max_error_history() -> usize {
    8
}
fn default_error_context_chars() -> usize {
    3_000
}
fn default_backoff_step_ms() -> u64 {
    2_000
}

// ---------------------------------------------------------------------------
// Dispatcher / registry / readiness
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1_024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_spawn_backoff_ms")]
    pub spawn_backoff_ms: u64,
    #[serde(default)]
    pub provider_grace_ms: u64,
    /// Force the reduced local/offline team regardless of providers.
    #[serde(default)]
    pub local_profile: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            spawn_backoff_ms: default_spawn_backoff_ms(),
            provider_grace_ms: 0,
            local_profile: false,
        }
    }
}

impl RegistryConfig {
    pub fn spawn_backoff(&self) -> Duration {
        Duration::from_millis(self.spawn_backoff_ms)
    }

    pub fn provider_grace(&self) -> Duration {
        Duration::from_millis(self.provider_grace_ms)
    }
}

fn default_spawn_backoff_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReadinessConfig {
    #[serde(default)]
    pub require_preview_default: bool,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_mode_tables() {
        let cfg = EngineConfig::default();
        let full = cfg.limits_for(BuildMode::Full, PowerMode::Fast);
        assert_eq!(full.max_agents, 8);
        assert_eq!(full.max_retries, 3);
        assert_eq!(full.max_requests, 72);
        assert_eq!(full.max_tokens_per_request, 12_000);

        let fast = cfg.limits_for(BuildMode::Fast, PowerMode::Max);
        assert_eq!(fast.max_agents, 7);
        assert_eq!(fast.max_retries, 2);
        assert_eq!(fast.max_requests, 30);
        assert_eq!(fast.max_tokens_per_request, 24_000);
    }

    #[test]
    fn mode_specific_override_beats_global() {
        let mut cfg = EngineConfig::default();
        cfg.apply_overrides_from(env(&[
            ("BUILD_MAX_AGENTS", "4"),
            ("BUILD_MAX_AGENTS_FAST", "2"),
        ]));
        assert_eq!(cfg.limits.fast.max_agents, 2);
        assert_eq!(cfg.limits.full.max_agents, 4);
    }

    #[test]
    fn overrides_are_clamped() {
        let mut cfg = EngineConfig::default();
        cfg.apply_overrides_from(env(&[
            ("BUILD_MAX_AGENTS", "0"),
            ("BUILD_MAX_RETRIES", "9"),
            ("BUILD_MAX_REQUESTS", "-5"),
            ("BUILD_MAX_TOKENS_FULL", "-1"),
        ]));
        assert_eq!(cfg.limits.full.max_agents, 1);
        assert_eq!(cfg.limits.full.max_retries, 3);
        assert_eq!(cfg.limits.full.max_requests, 0);
        assert_eq!(cfg.limits.full.max_tokens_per_request, Some(0));
    }

    #[test]
    fn explicit_token_cap_skips_power_floor() {
        let mut cfg = EngineConfig::default();
        cfg.apply_overrides_from(env(&[("BUILD_MAX_TOKENS_FAST", "1500")]));
        let limits = cfg.limits_for(BuildMode::Fast, PowerMode::Max);
        assert_eq!(limits.max_tokens_per_request, 1_500);
    }

    #[test]
    fn unparseable_values_are_ignored() {
        let mut cfg = EngineConfig::default();
        cfg.apply_overrides_from(env(&[("BUILD_MAX_REQUESTS", "lots")]));
        assert_eq!(cfg.limits.full.max_requests, 72);
    }

    #[test]
    fn build_timeout_honours_local_profile_and_floor() {
        let mut cfg = EngineConfig::default();
        assert_eq!(
            cfg.timeouts.build_timeout(BuildMode::Fast, false),
            Duration::from_secs(240)
        );
        assert_eq!(
            cfg.timeouts.build_timeout(BuildMode::Full, true),
            Duration::from_secs(1_800)
        );
        cfg.apply_overrides_from(env(&[("BUILD_TIMEOUT_FULL_SECONDS", "5")]));
        assert_eq!(
            cfg.timeouts.build_timeout(BuildMode::Full, true),
            MIN_BUILD_TIMEOUT
        );
    }

    #[test]
    fn role_tokens_scale_with_power_mode() {
        let tokens = TokensConfig::default();
        assert_eq!(tokens.for_role(AgentRole::Frontend, PowerMode::Fast), 12_000);
        assert_eq!(tokens.for_role(AgentRole::Frontend, PowerMode::Balanced), 18_000);
        assert_eq!(tokens.for_role(AgentRole::Frontend, PowerMode::Max), 24_000);
        assert_eq!(tokens.for_role(AgentRole::Lead, PowerMode::Fast), 2_000);
    }

    #[test]
    fn preview_default_flag_parses_truthy_values() {
        let mut cfg = EngineConfig::default();
        cfg.apply_overrides_from(env(&[("BUILD_REQUIRE_PREVIEW_READY_DEFAULT", "TRUE")]));
        assert!(cfg.readiness.require_preview_default);
    }
}
