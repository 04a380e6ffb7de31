#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kiln_agents::BuildManager;
use kiln_core::config::EngineConfig;
use kiln_core::types::{Build, Provider, TaskType};
use kiln_harness::mock::ScriptedProvider;
use kiln_harness::provider::ModelProvider;
use uuid::Uuid;

pub const ALL_PROVIDERS: [Provider; 3] = [Provider::Claude, Provider::Gpt4, Provider::Gemini];

/// A minimal React + Vite app that passes verification and readiness.
pub const FRONTEND_APP: &str = r#"Here is the frontend.

// File: package.json
{"name":"notes","private":true,"scripts":{"dev":"vite","build":"vite build"},"dependencies":{"react":"^18.2.0","react-dom":"^18.2.0"},"devDependencies":{"vite":"^5.0.0"}}
// File: index.html
<!doctype html>
<html><body><div id="root"></div><script type="module" src="/src/main.tsx"></script></body></html>
// File: vite.config.ts
import { defineConfig } from 'vite';
export default defineConfig({ server: { port: 5173 } });
// File: src/main.tsx
import { createRoot } from 'react-dom/client';
import App from './App';
createRoot(document.getElementById('root')!).render(<App />);
// File: src/App.tsx
export default function App() {
  return <h1>Notes</h1>;
}
"#;

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.scheduler.poll_interval_ms = 10;
    config.recovery.backoff_step_ms = 1;
    config.registry.spawn_backoff_ms = 1;
    config.consensus.enabled = false;
    config
}

pub fn start(config: EngineConfig, mock: &Arc<ScriptedProvider>) -> BuildManager {
    let provider: Arc<dyn ModelProvider> = mock.clone();
    BuildManager::start(config, provider)
}

/// Poll until the build reaches a terminal status.
pub async fn wait_for_terminal(manager: &BuildManager, build_id: Uuid) -> Build {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let build = manager.get_build(build_id).await.unwrap();
        if build.status.is_terminal() {
            return build;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "build {build_id} stuck in {} at {}%",
            build.status,
            build.progress
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn tasks_of(build: &Build, task_type: TaskType) -> Vec<&kiln_core::types::Task> {
    build.tasks.iter().filter(|t| t.task_type == task_type).collect()
}
