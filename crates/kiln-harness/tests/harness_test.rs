//! Integration tests for the provider seam: scripted replies, call ledger,
//! and cancellation racing an in-flight generation.

use std::sync::Arc;
use std::time::Duration;

use kiln_core::types::{AgentRole, PowerMode, Provider};
use kiln_harness::cancel::CancelToken;
use kiln_harness::mock::{Reply, ScriptedProvider};
use kiln_harness::provider::{GenerateOptions, ModelProvider, ProviderError, ProviderScope};

// ===========================================================================
// Scripted provider
// ===========================================================================

#[tokio::test]
async fn test_rules_match_in_insertion_order() {
    let mock = ScriptedProvider::new([Provider::Claude, Provider::Gpt4])
        .on_role_with(AgentRole::Reviewer, Provider::Claude, vec![Reply::text("claude review")])
        .on_role(AgentRole::Reviewer, vec![Reply::text("any review")]);

    let prompt = format!("{}\nReview the code", AgentRole::Reviewer.prompt_header());
    let opts = GenerateOptions::new(1);

    let a = mock.generate(Provider::Claude, &prompt, &opts).await.unwrap();
    let b = mock.generate(Provider::Gpt4, &prompt, &opts).await.unwrap();
    assert_eq!(a.content, "claude review");
    assert_eq!(b.content, "any review");
}

#[tokio::test]
async fn test_model_follows_power_mode() {
    let mock = ScriptedProvider::new([Provider::Claude]);
    let opts = GenerateOptions::new(1).with_power_mode(PowerMode::Max);
    let out = mock.generate(Provider::Claude, "hello", &opts).await.unwrap();
    assert_eq!(out.model, Provider::Claude.model_for(PowerMode::Max));
}

#[tokio::test]
async fn test_ledger_records_options() {
    let mock = ScriptedProvider::new([Provider::Gemini]);
    let opts = GenerateOptions::new(3)
        .with_max_tokens(180)
        .with_temperature(0.2)
        .with_system_prompt("incident commander");
    mock.generate(Provider::Gemini, "VOTE please", &opts).await.unwrap();

    let calls = mock.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].max_tokens, 180);
    assert_eq!(calls[0].system_prompt.as_deref(), Some("incident commander"));
    assert_eq!(mock.total_calls(), 1);
}

#[tokio::test]
async fn test_prompt_rules_return_typed_errors() {
    let mock = ScriptedProvider::new([Provider::Gpt4]).on_prompt(
        "explode",
        vec![Reply::Fail(ProviderError::RateLimited { retry_after_ms: 10 })],
    );
    let err = mock
        .generate(Provider::Gpt4, "please explode", &GenerateOptions::new(1))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("429"));
}

// ===========================================================================
// Cancellation
// ===========================================================================

#[tokio::test]
async fn test_cancel_abandons_hung_generation() {
    let mock: Arc<dyn ModelProvider> =
        Arc::new(ScriptedProvider::new([Provider::Claude]).with_default_reply(Reply::Hang));
    let token = CancelToken::new();

    let worker = {
        let mock = mock.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let opts = GenerateOptions::new(1);
            tokio::select! {
                _ = token.cancelled() => Err(ProviderError::Cancelled),
                out = mock.generate(Provider::Claude, "x", &opts) => out,
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    token.cancel();
    let result = worker.await.unwrap();
    assert!(matches!(result, Err(ProviderError::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn test_delayed_reply_resolves_after_delay() {
    let mock = ScriptedProvider::new([Provider::Grok])
        .with_default_reply(Reply::delayed(Duration::from_secs(60), Reply::text("late")));
    let opts = GenerateOptions::new(1);

    let fast = tokio::time::timeout(
        Duration::from_secs(1),
        mock.generate(Provider::Grok, "x", &opts),
    )
    .await;
    assert!(fast.is_err());

    let slow = tokio::time::timeout(
        Duration::from_secs(120),
        mock.generate(Provider::Grok, "x", &opts),
    )
    .await
    .expect("resolves after delay")
    .unwrap();
    assert_eq!(slow.content, "late");
}

#[tokio::test]
async fn test_scope_lookup() {
    let mock = ScriptedProvider::new([Provider::Claude]);
    assert_eq!(
        mock.available_providers(&ProviderScope::User(5)).await,
        vec![Provider::Claude]
    );
}
