use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Every event kind pushed to build observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "build:started")]
    BuildStarted,
    #[serde(rename = "build:progress")]
    BuildProgress,
    #[serde(rename = "build:checkpoint")]
    BuildCheckpoint,
    #[serde(rename = "build:completed")]
    BuildCompleted,
    #[serde(rename = "build:error")]
    BuildError,
    #[serde(rename = "build:phase")]
    BuildPhase,

    #[serde(rename = "agent:spawned")]
    AgentSpawned,
    #[serde(rename = "agent:working")]
    AgentWorking,
    #[serde(rename = "agent:thinking")]
    AgentThinking,
    #[serde(rename = "agent:generating")]
    AgentGenerating,
    #[serde(rename = "agent:generation_failed")]
    AgentGenerationFailed,
    #[serde(rename = "agent:completed")]
    AgentCompleted,
    #[serde(rename = "agent:error")]
    AgentError,
    #[serde(rename = "agent:retrying")]
    AgentRetrying,
    #[serde(rename = "agent:verification_failed")]
    AgentVerificationFailed,
    #[serde(rename = "agent:provider_switched")]
    AgentProviderSwitched,

    #[serde(rename = "task:created")]
    TaskCreated,
    #[serde(rename = "file:created")]
    FileCreated,
    #[serde(rename = "code:generated")]
    CodeGenerated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::BuildStarted => "build:started",
            EventType::BuildProgress => "build:progress",
            EventType::BuildCheckpoint => "build:checkpoint",
            EventType::BuildCompleted => "build:completed",
            EventType::BuildError => "build:error",
            EventType::BuildPhase => "build:phase",
            EventType::AgentSpawned => "agent:spawned",
            EventType::AgentWorking => "agent:working",
            EventType::AgentThinking => "agent:thinking",
            EventType::AgentGenerating => "agent:generating",
            EventType::AgentGenerationFailed => "agent:generation_failed",
            EventType::AgentCompleted => "agent:completed",
            EventType::AgentError => "agent:error",
            EventType::AgentRetrying => "agent:retrying",
            EventType::AgentVerificationFailed => "agent:verification_failed",
            EventType::AgentProviderSwitched => "agent:provider_switched",
            EventType::TaskCreated => "task:created",
            EventType::FileCreated => "file:created",
            EventType::CodeGenerated => "code:generated",
        }
    }

    /// Events that end a build's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventType::BuildCompleted | EventType::BuildError)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One real-time update about a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub build_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl BuildEvent {
    pub fn new(event_type: EventType, build_id: Uuid) -> Self {
        Self {
            event_type,
            build_id,
            agent_id: None,
            timestamp: Utc::now(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_agent(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// String field from `data`, if present.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_serializes_with_colon_names() {
        let ev = BuildEvent::new(EventType::AgentProviderSwitched, Uuid::new_v4())
            .with_data(json!({"from": "claude", "to": "gpt4"}));
        let text = serde_json::to_string(&ev).unwrap();
        assert!(text.contains("\"type\":\"agent:provider_switched\""));
        assert!(!text.contains("agent_id"));

        let back: BuildEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back.event_type, EventType::AgentProviderSwitched);
        assert_eq!(back.data_str("to"), Some("gpt4"));
    }

    #[test]
    fn display_matches_wire_name() {
        for ty in [EventType::BuildPhase, EventType::CodeGenerated, EventType::TaskCreated] {
            let wire = serde_json::to_value(ty).unwrap();
            assert_eq!(wire.as_str(), Some(ty.as_str()));
        }
    }
}
