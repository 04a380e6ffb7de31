//! Model provider abstraction for kiln-harness.
//!
//! The engine never talks to a vendor API directly. Every generation call goes
//! through [`ModelProvider`], which takes a target [`Provider`], a prompt and a
//! set of [`GenerateOptions`], and returns either a [`Generation`] or a typed
//! [`ProviderError`].
//!
//! # Implementation Guide
//!
//! To implement a new adapter:
//!
//! 1. Hold client state (credentials, HTTP client, rate limiter) in a struct
//! 2. Implement [`ModelProvider::generate`] for every [`Provider`] you support
//! 3. Report key availability through [`ModelProvider::available_providers`]
//! 4. Map vendor errors to [`ProviderError`], keeping the vendor text verbatim
//!
//! The last point matters: the engine's failure classifier works on the
//! rendered error string, so substrings such as `invalid api key`, `429` or
//! `model not found` must survive into `Display`.
//!
//! # Example
//!
//! ```rust,no_run
//! use kiln_core::types::{PowerMode, Provider};
//! use kiln_harness::provider::{GenerateOptions, ModelProvider, ProviderError};
//!
//! async fn example(provider: &dyn ModelProvider) -> Result<(), ProviderError> {
//!     let opts = GenerateOptions::new(42)
//!         .with_max_tokens(2_000)
//!         .with_power_mode(PowerMode::Balanced);
//!     let generation = provider.generate(Provider::Claude, "Write a README", &opts).await?;
//!     println!("{} answered: {}", generation.model, generation.content);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use kiln_core::types::{PowerMode, Provider};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors returned by a [`ModelProvider`].
///
/// The `Display` output of each variant keeps the vendor message intact and
/// prefixes it with a stable marker the failure classifier recognises.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Credentials or client for the provider are missing.
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    /// The vendor API rejected the request. The message is the vendor's text.
    #[error("api error: {0}")]
    Api(String),

    /// The vendor throttled the request.
    #[error("rate limit exceeded (429) - retry after {retry_after_ms}ms")]
    RateLimited {
        /// Milliseconds the vendor asked callers to wait.
        retry_after_ms: u64,
    },

    /// No response within the configured deadline.
    #[error("request timed out")]
    Timeout,

    /// The build owning the request was cancelled while the call was in flight.
    #[error("request cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Whether the call was abandoned because its build was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Per-call generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// User the call is billed to.
    pub user_id: u64,
    /// Output token ceiling. Zero leaves the vendor default in place.
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: Option<String>,
    pub power_mode: PowerMode,
    /// Use platform-owned keys instead of the user's own keys.
    pub use_platform_keys: bool,
}

impl GenerateOptions {
    pub fn new(user_id: u64) -> Self {
        Self {
            user_id,
            max_tokens: 0,
            temperature: 0.7,
            system_prompt: None,
            power_mode: PowerMode::default(),
            use_platform_keys: true,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_power_mode(mut self, power_mode: PowerMode) -> Self {
        self.power_mode = power_mode;
        self
    }

    pub fn with_platform_keys(mut self, use_platform_keys: bool) -> Self {
        self.use_platform_keys = use_platform_keys;
        self
    }
}

/// A successful generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub content: String,
    /// Model that actually served the request.
    pub model: String,
}

impl Generation {
    pub fn new(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
        }
    }
}

/// Whose keys decide which providers are usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderScope {
    /// Providers backed by platform keys.
    Platform,
    /// Providers the given user has configured keys for.
    User(u64),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Adapter over the language-model vendors.
///
/// Implementations must be safe for concurrent use; the engine issues calls
/// for many agents and builds at once through one shared `Arc<dyn ModelProvider>`.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Run a single generation against `provider`.
    async fn generate(
        &self,
        provider: Provider,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> Result<Generation, ProviderError>;

    /// Providers usable under `scope`, in no particular order.
    async fn available_providers(&self, scope: &ProviderScope) -> Vec<Provider>;

    /// Lightweight readiness probe used before an agent is bound to
    /// `provider`. The default accepts every provider.
    async fn check_provider(
        &self,
        _provider: Provider,
        _scope: &ProviderScope,
    ) -> Result<(), ProviderError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StubProvider
// ---------------------------------------------------------------------------

/// Provider that has nothing configured. Every call fails with
/// [`ProviderError::NotConfigured`].
#[derive(Debug, Default, Clone, Copy)]
pub struct StubProvider;

#[async_trait]
impl ModelProvider for StubProvider {
    async fn generate(
        &self,
        provider: Provider,
        _prompt: &str,
        _opts: &GenerateOptions,
    ) -> Result<Generation, ProviderError> {
        Err(ProviderError::NotConfigured(format!(
            "no client available for {provider}"
        )))
    }

    async fn available_providers(&self, _scope: &ProviderScope) -> Vec<Provider> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
