//! Prompt assembly for task execution.
//!
//! Every task prompt starts with the agent's [`AgentRole::prompt_header`] line
//! followed by the task, the app description and whatever upstream context the
//! role needs. System prompts carry the per-role brief plus shared rules.

use kiln_core::types::{
    Agent, AgentRole, Build, RetryStrategy, Task, TaskInput, TaskStatus, TaskType, TechStack,
};

use crate::output::collect_build_files;

/// Size cap on the inlined code block given to reviewers and solvers.
pub const FULL_CODE_CHARS: usize = 15_000;

/// Completed tasks summarised in the team coordination brief.
pub const BRIEF_TASKS: usize = 6;

pub const BRIEF_SUMMARY_CHARS: usize = 180;

/// Description length kept when the assembled prompt grows past
/// [`PROMPT_SOFT_LIMIT`].
const DESCRIPTION_KEEP_CHARS: usize = 2_000;
const PROMPT_SOFT_LIMIT: usize = 30_000;

const FIX_AND_RETRY_GUIDANCE: &str = "\
This is a fix-and-retry attempt:
1. Read the exact error messages above.
2. Identify the root cause of each one.
3. Emit corrected code that addresses every error directly.
4. Do not repeat the previous mistakes.";

const OUTPUT_FORMAT: &str = "\
OUTPUT FORMAT:
Precede every file with a marker line, then its fenced content:

// File: path/to/filename.ext
```language
<complete file content>
```

REQUIREMENTS:
1. Complete, runnable code only.
2. Mark every file with a `// File:` line using a plain relative path.
3. No placeholders, mock data, TODO comments or stub functions.
4. Read external credentials from environment variables.
5. Include every import, type and error path.";

const SHARED_RULES: &str = "\n\nRULES:\n\
1. Never emit placeholder, demo or mock content.\n\
2. Every function body is fully implemented.\n\
3. File paths are plain relative paths with no annotations.\n\
4. React/Vite apps always ship index.html at the project root and vite.config.ts.\n\
5. React apps declare both react and react-dom in package.json.\n\
6. Before finishing, check for valid package.json scripts and a real entry point.";

// ---------------------------------------------------------------------------
// Truncation helpers
// ---------------------------------------------------------------------------

/// `s` cut to `max` bytes with `suffix` appended when anything was removed.
pub fn clip(s: &str, max: usize, suffix: &str) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    format!("{}{suffix}", head_chars(s, max))
}

/// Last `max` bytes of `s`, moved forward to a char boundary.
pub fn tail_chars(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// First `max` bytes of `s`, moved back to a char boundary.
pub fn head_chars(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ---------------------------------------------------------------------------
// Task prompt
// ---------------------------------------------------------------------------

fn error_context(input: &TaskInput, max_chars: usize) -> Option<String> {
    if input.previous_errors.is_empty() && input.verification_errors.is_empty() {
        return None;
    }
    let mut history = String::new();
    for attempt in &input.previous_errors {
        history.push_str(&format!(
            "attempt {} ({}): {}\n",
            attempt.attempt, attempt.context, attempt.error
        ));
    }
    for err in &input.verification_errors {
        history.push_str(&format!("verification: {err}\n"));
    }

    let mut block = String::from("\nPREVIOUS ATTEMPTS FAILED. LEARN FROM THESE ERRORS:\n");
    block.push_str(tail_chars(&history, max_chars));
    if let Some(guidance) = &input.retry_guidance {
        block.push_str(&format!("\n{guidance}\n"));
    }
    if input.retry_strategy == Some(RetryStrategy::FixAndRetry) {
        block.push_str(&format!("\n{FIX_AND_RETRY_GUIDANCE}\n"));
    }
    block.push_str("Use a different, corrected approach this time.\n");
    Some(block)
}

fn list_block(tag: &str, items: &[String]) -> Option<String> {
    let items: Vec<&str> = items.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
    if items.is_empty() {
        return None;
    }
    Some(format!("\n<{tag}>\n- {}\n</{tag}>\n", items.join("\n- ")))
}

/// Joined messages of the latest completed task of `task_type`.
pub fn completed_output(build: &Build, task_type: TaskType) -> Option<String> {
    build
        .tasks
        .iter()
        .rev()
        .filter(|t| t.task_type == task_type && t.status == TaskStatus::Completed)
        .find_map(|t| {
            let out = t.output.as_ref()?;
            let text = out.messages.join("\n");
            (!text.trim().is_empty()).then_some(text)
        })
}

fn role_context(build: &Build, task: &Task, role: AgentRole) -> String {
    let mut ctx = String::new();

    if matches!(role, AgentRole::Frontend | AgentRole::Backend | AgentRole::Database) {
        let arch = task
            .input
            .architecture_context
            .clone()
            .or_else(|| completed_output(build, TaskType::Architecture));
        if let Some(arch) = arch {
            ctx.push_str(&format!("\n<architecture_context>\n{arch}\n</architecture_context>\n"));
        }
    }
    if role == AgentRole::Backend {
        let schema = task
            .input
            .schema_context
            .clone()
            .or_else(|| completed_output(build, TaskType::GenerateSchema));
        if let Some(schema) = schema {
            ctx.push_str(&format!("\n<schema_context>\n{schema}\n</schema_context>\n"));
        }
    }

    let files = collect_build_files(build);
    if role == AgentRole::Testing && !files.is_empty() {
        let manifest: String = files
            .iter()
            .map(|f| format!("- {} ({}, {} bytes)\n", f.path, f.language, f.size))
            .collect();
        ctx.push_str(&format!("\n<generated_files>\n{manifest}</generated_files>\n"));
    }
    if matches!(role, AgentRole::Reviewer | AgentRole::Solver) && !files.is_empty() {
        let code: String = files
            .iter()
            .map(|f| format!("// File: {}\n```{}\n{}\n```\n\n", f.path, f.language, f.content))
            .collect();
        let code = clip(&code, FULL_CODE_CHARS, "\n... (truncated)");
        let tag = if role == AgentRole::Solver { "code_to_fix" } else { "code_to_review" };
        ctx.push_str(&format!("\n<{tag}>\n{code}</{tag}>\n"));
    }

    if role == AgentRole::Solver {
        let input = &task.input;
        if input.failed_task_id.is_some() || input.failure_error.is_some() {
            ctx.push_str(&format!(
                "\n<failure_context>\nfailed_task_id: {}\nfailed_task_type: {}\nfailed_task_description: {}\nerror: {}\n</failure_context>\n",
                input.failed_task_id.map(|id| id.to_string()).unwrap_or_default(),
                input.failed_task_type.map(|t| t.to_string()).unwrap_or_default(),
                input.failed_task_description.as_deref().unwrap_or_default(),
                input.failure_error.as_deref().unwrap_or_default(),
            ));
        }
    }
    ctx
}

/// Recent completed work from other tasks, oldest first.
pub fn team_brief(build: &Build, task: &Task, role: AgentRole) -> Option<String> {
    let mut lines: Vec<String> = build
        .tasks
        .iter()
        .rev()
        .filter(|t| t.id != task.id && t.status == TaskStatus::Completed && t.output.is_some())
        .filter_map(|t| {
            let who = t
                .assigned_to
                .and_then(|id| build.agents.get(&id))
                .map(|a| a.role.to_string())
                .unwrap_or_else(|| "agent".to_string());
            let summary = t
                .output
                .as_ref()
                .and_then(|o| o.messages.first())
                .map(|m| m.trim())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| t.description.trim());
            if summary.is_empty() {
                return None;
            }
            let summary = clip(summary, BRIEF_SUMMARY_CHARS, "...");
            Some(format!("- {who} ({}): {summary}", t.task_type))
        })
        .take(BRIEF_TASKS)
        .collect();
    if lines.is_empty() {
        return None;
    }
    lines.reverse();
    Some(format!(
        "Shared team updates for {role}. Align with the other agents on one integrated implementation.\n{}",
        lines.join("\n")
    ))
}

/// Full prompt for `task` executed by `agent`.
pub fn task_prompt(build: &Build, task: &Task, agent: &Agent, error_context_chars: usize) -> String {
    let errors = error_context(&task.input, error_context_chars).unwrap_or_default();
    let hints = list_block("repair_hints", &task.input.repair_hints).unwrap_or_default();
    let validation = list_block("validation_errors", &task.input.validation_errors).unwrap_or_default();
    let findings = list_block("findings", &task.input.findings).unwrap_or_default();
    let stack = build
        .tech_stack
        .as_ref()
        .map(TechStack::summary)
        .filter(|s| !s.is_empty())
        .map(|s| format!("\nTech stack preference: {s}\n"))
        .unwrap_or_default();
    let context = role_context(build, task, agent.role);
    let brief = team_brief(build, task, agent.role)
        .map(|b| format!("\n<team_coordination>\n{b}\n</team_coordination>\n"))
        .unwrap_or_default();

    let extra = errors.len() + context.len() + brief.len() + hints.len() + validation.len();
    let description = if build.description.len() + extra > PROMPT_SOFT_LIMIT {
        clip(&build.description, DESCRIPTION_KEEP_CHARS, "... (description truncated)")
    } else {
        build.description.clone()
    };

    let format_rules = if task.task_type.is_code_generation() { OUTPUT_FORMAT } else { "" };

    format!(
        "{header}\nTask: {kind}\n\nDescription: {desc}\n\nApp being built: {description}\n{stack}{errors}{validation}{hints}{findings}{context}{brief}\n{format_rules}",
        header = agent.role.prompt_header(),
        kind = task.task_type,
        desc = task.description,
    )
}

// ---------------------------------------------------------------------------
// System prompts
// ---------------------------------------------------------------------------

fn role_brief(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Lead => "You are the lead agent. You coordinate the specialist agents, draft the build plan and summarise progress for the user. Proceed without user input whenever you can.",
        AgentRole::Planner => "You are the planning agent. Break the app into a file-by-file plan: every file with its purpose, data models, API endpoints, UI components, dependencies and the execution order (database, backend, frontend, tests).",
        AgentRole::Architect => "You are the architect agent. Make concrete technology decisions and produce a compact blueprint: pinned library versions, directory layout, file ownership per agent, API surface, data model, auth strategy, environment variables and run scripts. Do not emit application source files.",
        AgentRole::Frontend => "You are the frontend agent. Build a complete React + TypeScript UI. Always emit index.html, vite.config.ts, package.json, tsconfig.json, src/main.tsx, src/App.tsx and src/index.css. Cover loading, error and empty states.",
        AgentRole::Backend => "You are the backend agent. Build a secure REST API with input validation, authentication middleware, correct status codes and full error handling.",
        AgentRole::Database => "You are the database agent. Design a normalized schema with keys, constraints, indexes, audit columns, migrations and seed data. Use one persistence stack only.",
        AgentRole::Testing => "You are the testing agent. Write runnable tests for the generated code and report failures plainly.",
        AgentRole::Reviewer => "You are the reviewer agent. Review the generated code for bugs, security vulnerabilities and integration gaps. Label blocking findings as CRITICAL.",
        AgentRole::Solver => "You are the solver agent. Diagnose the failure in the supplied context and emit corrected, complete files that resolve it.",
    }
}

/// System prompt for `role`, with stack hints when the build names a stack.
pub fn system_prompt(role: AgentRole, stack: Option<&TechStack>) -> String {
    let mut prompt = role_brief(role).to_string();
    if let Some(stack) = stack {
        let summary = stack.summary();
        if !summary.is_empty() {
            prompt.push_str(&format!("\nProject stack: {summary}."));
        }
    }
    prompt.push_str(SHARED_RULES);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::types::{
        BuildRequest, ErrorAttempt, GeneratedFile, PowerMode, Provider, TaskOutput,
    };

    fn build_with(role: AgentRole) -> (Build, Agent) {
        let build = Build::new(1, &BuildRequest::new("a todo app"));
        let agent = Agent::new(build.id, role, Provider::Claude, PowerMode::Fast);
        (build, agent)
    }

    #[test]
    fn prompt_starts_with_role_header() {
        let (build, agent) = build_with(AgentRole::Backend);
        let task = Task::new(build.id, TaskType::GenerateApi, "api", 70, 2);
        let prompt = task_prompt(&build, &task, &agent, 3000);
        assert!(prompt.starts_with("ROLE: backend\n"));
        assert!(prompt.contains("App being built: a todo app"));
        assert!(prompt.contains("// File: path/to/filename.ext"));
    }

    #[test]
    fn error_history_is_tail_truncated() {
        let (build, agent) = build_with(AgentRole::Frontend);
        let mut task = Task::new(build.id, TaskType::GenerateUi, "ui", 60, 2);
        task.input.retry_strategy = Some(RetryStrategy::FixAndRetry);
        task.input.previous_errors = vec![ErrorAttempt {
            attempt: 1,
            error: format!("{}END", "x".repeat(5000)),
            context: "fix_and_retry".into(),
            timestamp: chrono::Utc::now(),
        }];
        let prompt = task_prompt(&build, &task, &agent, 100);
        assert!(prompt.contains("END"));
        assert!(!prompt.contains(&"x".repeat(200)));
        assert!(prompt.contains("fix-and-retry attempt"));
    }

    #[test]
    fn backend_sees_architecture_and_schema() {
        let (mut build, agent) = build_with(AgentRole::Backend);
        for (kind, text) in [(TaskType::Architecture, "use express"), (TaskType::GenerateSchema, "users table")] {
            let mut t = Task::new(build.id, kind, "x", 50, 1);
            t.status = TaskStatus::Completed;
            t.output = Some(TaskOutput { files: Vec::new(), messages: vec![text.into()] });
            build.tasks.push(t);
        }
        let task = Task::new(build.id, TaskType::GenerateApi, "api", 70, 2);
        let prompt = task_prompt(&build, &task, &agent, 3000);
        assert!(prompt.contains("<architecture_context>\nuse express"));
        assert!(prompt.contains("<schema_context>\nusers table"));
        assert!(prompt.contains("<team_coordination>"));
    }

    #[test]
    fn reviewer_gets_inlined_code() {
        let (mut build, agent) = build_with(AgentRole::Reviewer);
        let mut t = Task::new(build.id, TaskType::GenerateUi, "ui", 60, 1);
        t.status = TaskStatus::Completed;
        t.output = Some(TaskOutput {
            files: vec![GeneratedFile::new("src/App.tsx", "export const App = 1;")],
            messages: Vec::new(),
        });
        build.tasks.push(t);
        let task = Task::new(build.id, TaskType::Review, "review", 40, 1);
        let prompt = task_prompt(&build, &task, &agent, 3000);
        assert!(prompt.contains("<code_to_review>\n// File: src/App.tsx"));
        assert!(!prompt.contains("OUTPUT FORMAT"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "ééééé";
        assert_eq!(tail_chars(s, 3), "é");
        assert_eq!(head_chars(s, 3), "é");
        assert_eq!(head_chars("abc", 10), "abc");
    }

    #[test]
    fn system_prompt_mentions_stack() {
        let stack = TechStack {
            frontend: Some("React".into()),
            ..TechStack::default()
        };
        let prompt = system_prompt(AgentRole::Frontend, Some(&stack));
        assert!(prompt.contains("Project stack: Frontend: React."));
        assert!(prompt.contains("React.\n\nRULES:\n1. Never emit"));
        assert!(prompt.contains("mock content.\n2. Every function"));
    }
}
