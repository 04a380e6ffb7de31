//! Deterministic [`ModelProvider`] for tests and offline runs.
//!
//! A [`ScriptedProvider`] answers from an ordered list of rules. Each rule
//! matches on any combination of target provider, addressed role (read from
//! the [`AgentRole::prompt_header`] line that opens task prompts) and a prompt
//! substring. The first matching rule answers; its replies are consumed in
//! order and the last one repeats. When nothing matches, the default reply is
//! used. Every call and provider probe is recorded in a ledger.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use kiln_core::types::{AgentRole, Provider};

use crate::provider::{GenerateOptions, Generation, ModelProvider, ProviderError, ProviderScope};

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(ProviderError),
    /// Wait, then answer with the inner reply.
    Delayed(Duration, Box<Reply>),
    /// Never answer.
    Hang,
}

impl Reply {
    pub fn text(content: impl Into<String>) -> Self {
        Reply::Text(content.into())
    }

    pub fn api_error(message: impl Into<String>) -> Self {
        Reply::Fail(ProviderError::Api(message.into()))
    }

    pub fn delayed(delay: Duration, reply: Reply) -> Self {
        Reply::Delayed(delay, Box::new(reply))
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub seq: usize,
    pub provider: Provider,
    pub role: Option<AgentRole>,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

struct Rule {
    provider: Option<Provider>,
    role: Option<AgentRole>,
    contains: Option<String>,
    replies: Mutex<VecDeque<Reply>>,
}

impl Rule {
    fn matches(&self, provider: Provider, role: Option<AgentRole>, prompt: &str) -> bool {
        self.provider.is_none_or(|p| p == provider)
            && self.role.is_none_or(|r| Some(r) == role)
            && self.contains.as_deref().is_none_or(|s| prompt.contains(s))
    }

    fn next_reply(&self) -> Option<Reply> {
        let mut replies = self.replies.lock().unwrap_or_else(PoisonError::into_inner);
        if replies.len() > 1 {
            replies.pop_front()
        } else {
            replies.front().cloned()
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedProvider
// ---------------------------------------------------------------------------

pub struct ScriptedProvider {
    available: Vec<Provider>,
    scoped: DashMap<ProviderScope, Vec<Provider>>,
    rules: Vec<Rule>,
    default_reply: Reply,
    probe_failures: DashMap<Provider, usize>,
    calls: DashMap<Provider, Vec<CallRecord>>,
    probes: DashMap<Provider, usize>,
    seq: AtomicUsize,
}

impl ScriptedProvider {
    /// Provider reporting `available` for every scope and answering `"ok"`.
    pub fn new(available: impl IntoIterator<Item = Provider>) -> Self {
        Self {
            available: available.into_iter().collect(),
            scoped: DashMap::new(),
            rules: Vec::new(),
            default_reply: Reply::text("ok"),
            probe_failures: DashMap::new(),
            calls: DashMap::new(),
            probes: DashMap::new(),
            seq: AtomicUsize::new(0),
        }
    }

    pub fn with_default_reply(mut self, reply: Reply) -> Self {
        self.default_reply = reply;
        self
    }

    /// Replies for every prompt sent to `provider`.
    pub fn on_provider(self, provider: Provider, replies: Vec<Reply>) -> Self {
        self.with_rule(Some(provider), None, None, replies)
    }

    /// Replies for every task prompt addressed to `role`.
    pub fn on_role(self, role: AgentRole, replies: Vec<Reply>) -> Self {
        self.with_rule(None, Some(role), None, replies)
    }

    /// Replies for prompts containing `needle`.
    pub fn on_prompt(self, needle: impl Into<String>, replies: Vec<Reply>) -> Self {
        self.with_rule(None, None, Some(needle.into()), replies)
    }

    /// Replies for prompts to `provider` containing `needle`.
    pub fn on_prompt_to(
        self,
        provider: Provider,
        needle: impl Into<String>,
        replies: Vec<Reply>,
    ) -> Self {
        self.with_rule(Some(provider), None, Some(needle.into()), replies)
    }

    /// Replies for `role` when served by `provider`.
    pub fn on_role_with(self, role: AgentRole, provider: Provider, replies: Vec<Reply>) -> Self {
        self.with_rule(Some(provider), Some(role), None, replies)
    }

    fn with_rule(
        mut self,
        provider: Option<Provider>,
        role: Option<AgentRole>,
        contains: Option<String>,
        replies: Vec<Reply>,
    ) -> Self {
        self.rules.push(Rule {
            provider,
            role,
            contains,
            replies: Mutex::new(replies.into()),
        });
        self
    }

    /// Availability for one scope, overriding the default list.
    pub fn set_available(&self, scope: ProviderScope, providers: Vec<Provider>) {
        self.scoped.insert(scope, providers);
    }

    /// Make the next `times` probes of `provider` fail. `usize::MAX` fails forever.
    pub fn fail_probes(self, provider: Provider, times: usize) -> Self {
        self.probe_failures.insert(provider, times);
        self
    }

    // -- ledger ---------------------------------------------------------------

    pub fn total_calls(&self) -> usize {
        self.seq.load(Ordering::SeqCst)
    }

    pub fn calls_to(&self, provider: Provider) -> Vec<CallRecord> {
        self.calls
            .get(&provider)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Every recorded call in issue order.
    pub fn calls(&self) -> Vec<CallRecord> {
        let mut all: Vec<CallRecord> = self
            .calls
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();
        all.sort_by_key(|c| c.seq);
        all
    }

    pub fn calls_for_role(&self, role: AgentRole) -> Vec<CallRecord> {
        self.calls()
            .into_iter()
            .filter(|c| c.role == Some(role))
            .collect()
    }

    pub fn probes_of(&self, provider: Provider) -> usize {
        self.probes.get(&provider).map(|v| *v).unwrap_or(0)
    }

    fn role_of(prompt: &str) -> Option<AgentRole> {
        let first = prompt.lines().next()?.trim();
        AgentRole::ALL
            .into_iter()
            .find(|role| role.prompt_header() == first)
    }

    fn pick(&self, provider: Provider, role: Option<AgentRole>, prompt: &str) -> Reply {
        self.rules
            .iter()
            .filter(|rule| rule.matches(provider, role, prompt))
            .find_map(Rule::next_reply)
            .unwrap_or_else(|| self.default_reply.clone())
    }
}

async fn resolve(reply: Reply, model: &str) -> Result<Generation, ProviderError> {
    let mut reply = reply;
    loop {
        match reply {
            Reply::Text(content) => return Ok(Generation::new(content, model)),
            Reply::Fail(err) => return Err(err),
            Reply::Delayed(delay, inner) => {
                tokio::time::sleep(delay).await;
                reply = *inner;
            }
            Reply::Hang => std::future::pending::<()>().await,
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn generate(
        &self,
        provider: Provider,
        prompt: &str,
        opts: &GenerateOptions,
    ) -> Result<Generation, ProviderError> {
        let role = Self::role_of(prompt);
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.calls.entry(provider).or_default().push(CallRecord {
            seq,
            provider,
            role,
            prompt: prompt.to_string(),
            system_prompt: opts.system_prompt.clone(),
            max_tokens: opts.max_tokens,
            temperature: opts.temperature,
        });

        let reply = self.pick(provider, role, prompt);
        resolve(reply, provider.model_for(opts.power_mode)).await
    }

    async fn available_providers(&self, scope: &ProviderScope) -> Vec<Provider> {
        self.scoped
            .get(scope)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.available.clone())
    }

    async fn check_provider(
        &self,
        provider: Provider,
        _scope: &ProviderScope,
    ) -> Result<(), ProviderError> {
        *self.probes.entry(provider).or_insert(0) += 1;
        if let Some(mut remaining) = self.probe_failures.get_mut(&provider) {
            if *remaining > 0 {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                return Err(ProviderError::Api(format!("{provider} health check failed")));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> GenerateOptions {
        GenerateOptions::new(1)
    }

    #[tokio::test]
    async fn last_reply_repeats() {
        let mock = ScriptedProvider::new([Provider::Claude]).on_provider(
            Provider::Claude,
            vec![Reply::api_error("boom"), Reply::text("fine")],
        );
        assert!(mock.generate(Provider::Claude, "x", &opts()).await.is_err());
        assert_eq!(
            mock.generate(Provider::Claude, "x", &opts()).await.unwrap().content,
            "fine"
        );
        assert_eq!(
            mock.generate(Provider::Claude, "x", &opts()).await.unwrap().content,
            "fine"
        );
        assert_eq!(mock.calls_to(Provider::Claude).len(), 3);
    }

    #[tokio::test]
    async fn role_rules_read_prompt_header() {
        let mock = ScriptedProvider::new([Provider::Gpt4])
            .on_role(AgentRole::Backend, vec![Reply::text("backend")]);
        let prompt = format!("{}\nBuild the API", AgentRole::Backend.prompt_header());
        let out = mock.generate(Provider::Gpt4, &prompt, &opts()).await.unwrap();
        assert_eq!(out.content, "backend");
        let other = mock.generate(Provider::Gpt4, "no header", &opts()).await.unwrap();
        assert_eq!(other.content, "ok");
        assert_eq!(mock.calls_for_role(AgentRole::Backend).len(), 1);
    }

    #[tokio::test]
    async fn prompt_rules_can_target_one_provider() {
        let mock = ScriptedProvider::new([Provider::Claude, Provider::Gemini])
            .on_prompt_to(Provider::Gemini, "vote", vec![Reply::text("gemini vote")]);
        let gemini = mock.generate(Provider::Gemini, "cast a vote", &opts()).await.unwrap();
        assert_eq!(gemini.content, "gemini vote");
        let claude = mock.generate(Provider::Claude, "cast a vote", &opts()).await.unwrap();
        assert_eq!(claude.content, "ok");
        let plain = mock.generate(Provider::Gemini, "build it", &opts()).await.unwrap();
        assert_eq!(plain.content, "ok");
    }

    #[tokio::test]
    async fn probe_failures_count_down() {
        let mock = ScriptedProvider::new([Provider::Gemini]).fail_probes(Provider::Gemini, 1);
        let scope = ProviderScope::Platform;
        assert!(mock.check_provider(Provider::Gemini, &scope).await.is_err());
        assert!(mock.check_provider(Provider::Gemini, &scope).await.is_ok());
        assert_eq!(mock.probes_of(Provider::Gemini), 2);
    }

    #[tokio::test]
    async fn scoped_availability_overrides_default() {
        let mock = ScriptedProvider::new([Provider::Claude, Provider::Gpt4]);
        mock.set_available(ProviderScope::User(9), vec![Provider::Ollama]);
        assert_eq!(
            mock.available_providers(&ProviderScope::User(9)).await,
            vec![Provider::Ollama]
        );
        assert_eq!(mock.available_providers(&ProviderScope::Platform).await.len(), 2);
    }
}
