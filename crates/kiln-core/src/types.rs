use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// BuildStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    #[default]
    Pending,
    Planning,
    InProgress,
    Testing,
    Reviewing,
    Completed,
    Failed,
    Cancelled,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Completed | BuildStatus::Failed | BuildStatus::Cancelled
        )
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Planning => "planning",
            BuildStatus::InProgress => "in_progress",
            BuildStatus::Testing => "testing",
            BuildStatus::Reviewing => "reviewing",
            BuildStatus::Completed => "completed",
            BuildStatus::Failed => "failed",
            BuildStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    Fast,
    #[default]
    Full,
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildMode::Fast => write!(f, "fast"),
            BuildMode::Full => write!(f, "full"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    #[default]
    Fast,
    Balanced,
    Max,
}

impl fmt::Display for PowerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerMode::Fast => write!(f, "fast"),
            PowerMode::Balanced => write!(f, "balanced"),
            PowerMode::Max => write!(f, "max"),
        }
    }
}

/// Whose credentials pay for a build's generation calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMode {
    #[default]
    Platform,
    Byok,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Claude,
    Gpt4,
    Gemini,
    Grok,
    Ollama,
}

impl Provider {
    pub const ALL: [Provider; 5] = [
        Provider::Claude,
        Provider::Gpt4,
        Provider::Gemini,
        Provider::Grok,
        Provider::Ollama,
    ];

    /// Providers polled for recovery votes, in polling order.
    pub const MAJOR: [Provider; 3] = [Provider::Claude, Provider::Gpt4, Provider::Gemini];

    /// Reasoning capability rank used for lead selection (higher is stronger).
    pub fn capability_rank(&self) -> u8 {
        match self {
            Provider::Claude => 5,
            Provider::Gpt4 => 4,
            Provider::Gemini => 3,
            Provider::Grok => 2,
            Provider::Ollama => 1,
        }
    }

    /// Model name requested for this provider at the given power mode.
    pub fn model_for(&self, power: PowerMode) -> &'static str {
        match (self, power) {
            (Provider::Claude, PowerMode::Fast) => "claude-haiku",
            (Provider::Claude, PowerMode::Balanced) => "claude-sonnet",
            (Provider::Claude, PowerMode::Max) => "claude-opus",
            (Provider::Gpt4, PowerMode::Fast) => "gpt-4o-mini",
            (Provider::Gpt4, PowerMode::Balanced) => "gpt-4o",
            (Provider::Gpt4, PowerMode::Max) => "gpt-4.1",
            (Provider::Gemini, PowerMode::Fast) => "gemini-flash",
            (Provider::Gemini, _) => "gemini-pro",
            (Provider::Grok, PowerMode::Fast) => "grok-mini",
            (Provider::Grok, _) => "grok",
            (Provider::Ollama, _) => "local",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Provider::Claude => "claude",
            Provider::Gpt4 => "gpt4",
            Provider::Gemini => "gemini",
            Provider::Grok => "grok",
            Provider::Ollama => "ollama",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// AgentRole / AgentStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Lead,
    Planner,
    Architect,
    Frontend,
    Backend,
    Database,
    Testing,
    Reviewer,
    Solver,
}

impl AgentRole {
    pub const ALL: [AgentRole; 9] = [
        AgentRole::Lead,
        AgentRole::Planner,
        AgentRole::Architect,
        AgentRole::Frontend,
        AgentRole::Backend,
        AgentRole::Database,
        AgentRole::Testing,
        AgentRole::Reviewer,
        AgentRole::Solver,
    ];

    /// First line of every task prompt addressed to this role.
    pub fn prompt_header(&self) -> String {
        format!("ROLE: {self}")
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentRole::Lead => "lead",
            AgentRole::Planner => "planner",
            AgentRole::Architect => "architect",
            AgentRole::Frontend => "frontend",
            AgentRole::Backend => "backend",
            AgentRole::Database => "database",
            AgentRole::Testing => "testing",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Solver => "solver",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Working,
    Completed,
    Error,
    Terminated,
}

impl AgentStatus {
    /// Whether the agent can still accept work.
    pub fn is_available(&self) -> bool {
        !matches!(self, AgentStatus::Error | AgentStatus::Terminated)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::Completed => "completed",
            AgentStatus::Error => "error",
            AgentStatus::Terminated => "terminated",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// TaskType / TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Plan,
    Architecture,
    GenerateFile,
    GenerateApi,
    GenerateUi,
    GenerateSchema,
    Test,
    Review,
    Fix,
}

impl TaskType {
    /// Task types whose output is parsed into files and verified.
    pub fn is_code_generation(&self) -> bool {
        matches!(
            self,
            TaskType::GenerateFile
                | TaskType::GenerateApi
                | TaskType::GenerateUi
                | TaskType::GenerateSchema
                | TaskType::Fix
                | TaskType::Test
        )
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskType::Plan => "plan",
            TaskType::Architecture => "architecture",
            TaskType::GenerateFile => "generate_file",
            TaskType::GenerateApi => "generate_api",
            TaskType::GenerateUi => "generate_ui",
            TaskType::GenerateSchema => "generate_schema",
            TaskType::Test => "test",
            TaskType::Review => "review",
            TaskType::Fix => "fix",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// RetryStrategy / TaskAction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    #[default]
    StandardRetry,
    Backoff,
    SwitchProvider,
    ReduceContext,
    FixAndRetry,
    NonRetriable,
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RetryStrategy::StandardRetry => "standard_retry",
            RetryStrategy::Backoff => "backoff",
            RetryStrategy::SwitchProvider => "switch_provider",
            RetryStrategy::ReduceContext => "reduce_context",
            RetryStrategy::FixAndRetry => "fix_and_retry",
            RetryStrategy::NonRetriable => "non_retriable",
        };
        write!(f, "{}", label)
    }
}

/// Purpose of an automatically created follow-up task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    SolveBuildFailure,
    FixTests,
    FixReviewIssues,
    RegressionTest,
    PostFixReview,
}

impl TaskAction {
    /// Actions that belong to the test/review fix loop and are cancelled when
    /// a loop cap is hit.
    pub fn is_fix_loop(&self) -> bool {
        matches!(
            self,
            TaskAction::FixTests
                | TaskAction::FixReviewIssues
                | TaskAction::RegressionTest
                | TaskAction::PostFixReview
        )
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskAction::SolveBuildFailure => "solve_build_failure",
            TaskAction::FixTests => "fix_tests",
            TaskAction::FixReviewIssues => "fix_review_issues",
            TaskAction::RegressionTest => "regression_test",
            TaskAction::PostFixReview => "post_fix_review",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Request / stack
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechStack {
    #[serde(default)]
    pub frontend: Option<String>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub styling: Option<String>,
    #[serde(default)]
    pub extras: Vec<String>,
}

impl TechStack {
    /// One-line summary used in prompts, e.g. `Frontend: React | Backend: Express`.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(v) = &self.frontend {
            parts.push(format!("Frontend: {v}"));
        }
        if let Some(v) = &self.backend {
            parts.push(format!("Backend: {v}"));
        }
        if let Some(v) = &self.database {
            parts.push(format!("Database: {v}"));
        }
        if let Some(v) = &self.styling {
            parts.push(format!("Styling: {v}"));
        }
        if !self.extras.is_empty() {
            parts.push(format!("Extras: {}", self.extras.join(", ")));
        }
        parts.join(" | ")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildRequest {
    pub description: String,
    #[serde(default)]
    pub mode: BuildMode,
    #[serde(default)]
    pub power_mode: PowerMode,
    #[serde(default)]
    pub provider_mode: ProviderMode,
    #[serde(default)]
    pub require_preview_ready: bool,
    #[serde(default)]
    pub tech_stack: Option<TechStack>,
}

impl BuildRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: BuildMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_power_mode(mut self, power_mode: PowerMode) -> Self {
        self.power_mode = power_mode;
        self
    }

    pub fn with_provider_mode(mut self, provider_mode: ProviderMode) -> Self {
        self.provider_mode = provider_mode;
        self
    }

    pub fn with_tech_stack(mut self, stack: TechStack) -> Self {
        self.tech_stack = Some(stack);
        self
    }
}

// ---------------------------------------------------------------------------
// Files / outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
    pub language: String,
    pub size: u64,
    pub is_new: bool,
}

impl GeneratedFile {
    /// Build a file record, detecting the language from the path extension.
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let path = path.into();
        let content = content.into();
        Self {
            language: crate::files::detect_language(&path).to_string(),
            size: content.len() as u64,
            path,
            content,
            is_new: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub files: Vec<GeneratedFile>,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorAttempt {
    pub attempt: u32,
    pub error: String,
    /// Strategy chosen after this attempt, or the verification marker.
    pub context: String,
    pub timestamp: DateTime<Utc>,
}

/// Structured context handed to the agent executing a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInput {
    pub app_description: String,
    #[serde(default)]
    pub tech_stack: Option<TechStack>,
    #[serde(default)]
    pub action: Option<TaskAction>,
    #[serde(default)]
    pub retry_strategy: Option<RetryStrategy>,
    #[serde(default)]
    pub retry_guidance: Option<String>,
    #[serde(default)]
    pub previous_errors: Vec<ErrorAttempt>,
    #[serde(default)]
    pub verification_errors: Vec<String>,
    #[serde(default)]
    pub validation_errors: Vec<String>,
    #[serde(default)]
    pub repair_hints: Vec<String>,
    /// Test output or review findings that triggered a fix task.
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub architecture_context: Option<String>,
    #[serde(default)]
    pub schema_context: Option<String>,
    #[serde(default)]
    pub failed_task_id: Option<Uuid>,
    #[serde(default)]
    pub failed_task_type: Option<TaskType>,
    #[serde(default)]
    pub failed_task_description: Option<String>,
    #[serde(default)]
    pub failure_error: Option<String>,
    #[serde(default)]
    pub trigger_task: Option<Uuid>,
    #[serde(default)]
    pub recovery_queued: bool,
    #[serde(default)]
    pub superseded_by: Option<Uuid>,
    #[serde(default)]
    pub consensus_decision: Option<String>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub build_id: Uuid,
    pub task_type: TaskType,
    pub description: String,
    pub priority: u8,
    pub status: TaskStatus,
    pub assigned_to: Option<Uuid>,
    pub input: TaskInput,
    pub output: Option<TaskOutput>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_strategy: RetryStrategy,
    pub error_history: Vec<ErrorAttempt>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        build_id: Uuid,
        task_type: TaskType,
        description: impl Into<String>,
        priority: u8,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            build_id,
            task_type,
            description: description.into(),
            priority,
            status: TaskStatus::Pending,
            assigned_to: None,
            input: TaskInput::default(),
            output: None,
            retry_count: 0,
            max_retries,
            retry_strategy: RetryStrategy::StandardRetry,
            error_history: Vec::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_input(mut self, input: TaskInput) -> Self {
        self.input = input;
        self
    }

    /// Record a failed attempt, dropping the oldest entries beyond `cap`.
    pub fn record_attempt(&mut self, error: impl Into<String>, context: impl Into<String>, cap: usize) {
        self.error_history.push(ErrorAttempt {
            attempt: self.retry_count + 1,
            error: error.into(),
            context: context.into(),
            timestamp: Utc::now(),
        });
        if cap > 0 && self.error_history.len() > cap {
            let excess = self.error_history.len() - cap;
            self.error_history.drain(..excess);
        }
    }

    /// Move to a terminal status. Returns `false` when already terminal.
    pub fn finish(&mut self, status: TaskStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
        true
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub build_id: Uuid,
    pub role: AgentRole,
    pub provider: Provider,
    pub model: String,
    pub status: AgentStatus,
    pub current_task: Option<Uuid>,
    pub output: Vec<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(build_id: Uuid, role: AgentRole, provider: Provider, power: PowerMode) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            build_id,
            role,
            provider,
            model: provider.model_for(power).to_string(),
            status: AgentStatus::Idle,
            current_task: None,
            output: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub number: u32,
    pub name: String,
    pub description: String,
    pub files: Vec<GeneratedFile>,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub user_id: u64,
    pub description: String,
    pub status: BuildStatus,
    pub mode: BuildMode,
    pub power_mode: PowerMode,
    pub provider_mode: ProviderMode,
    pub require_preview_ready: bool,
    pub tech_stack: Option<TechStack>,
    pub max_agents: u32,
    pub max_retries: u32,
    pub max_requests: u32,
    pub max_tokens_per_request: u32,
    pub requests_used: u32,
    pub tasks: Vec<Task>,
    pub agents: HashMap<Uuid, Agent>,
    pub checkpoints: Vec<Checkpoint>,
    pub progress: u8,
    pub error: Option<String>,
    pub readiness_recovery_attempts: u32,
    pub readiness_error_class: Option<String>,
    pub readiness_errors: Vec<String>,
    pub phased_pipeline_complete: bool,
    /// Roles the lead covers because their agent could not be spawned.
    #[serde(default)]
    pub absorbed_roles: Vec<AgentRole>,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Build {
    pub fn new(user_id: u64, request: &BuildRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            description: request.description.clone(),
            status: BuildStatus::Pending,
            mode: request.mode,
            power_mode: request.power_mode,
            provider_mode: request.provider_mode,
            require_preview_ready: request.require_preview_ready,
            tech_stack: request.tech_stack.clone(),
            max_agents: 0,
            max_retries: 0,
            max_requests: 0,
            max_tokens_per_request: 0,
            requests_used: 0,
            tasks: Vec::new(),
            agents: HashMap::new(),
            checkpoints: Vec::new(),
            progress: 0,
            error: None,
            readiness_recovery_attempts: 0,
            readiness_error_class: None,
            readiness_errors: Vec::new(),
            phased_pipeline_complete: false,
            absorbed_roles: Vec::new(),
            last_activity: now,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn task(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// First agent holding `role`, in spawn order.
    pub fn agent_by_role(&self, role: AgentRole) -> Option<&Agent> {
        self.agents
            .values()
            .filter(|a| a.role == role)
            .min_by_key(|a| a.created_at)
    }

    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// Set the top-level error unless one is already recorded.
    pub fn set_error_once(&mut self, message: impl Into<String>) -> bool {
        if self.error.as_deref().is_some_and(|e| !e.trim().is_empty()) {
            return false;
        }
        self.error = Some(message.into());
        true
    }

    /// Raise progress, never lowering it.
    pub fn raise_progress(&mut self, value: u8) {
        let capped = if self.status == BuildStatus::Completed {
            value.min(100)
        } else {
            value.min(99)
        };
        if capped > self.progress {
            self.progress = capped;
        }
    }

    /// Flip every pending or in-progress task to cancelled.
    pub fn cancel_open_tasks(&mut self) -> usize {
        let mut cancelled = 0;
        for task in self.tasks.iter_mut() {
            if matches!(task.status, TaskStatus::Pending | TaskStatus::InProgress)
                && task.finish(TaskStatus::Cancelled)
            {
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = now;
        self.last_activity = now;
    }
}
