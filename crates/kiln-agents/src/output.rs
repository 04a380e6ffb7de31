//! Turning a raw model response into a [`TaskOutput`].

use kiln_core::files::{language_to_extension, merge_files, FALLBACK_PREFIX};
use kiln_core::paths::sanitize_file_path;
use kiln_core::types::{Build, GeneratedFile, TaskOutput, TaskType};

/// Warning appended when the response stops inside a fenced block.
pub const UNTERMINATED_FENCE_WARNING: &str =
    "AI response ended with an unterminated code block; final file output may be truncated";

const FILE_MARKERS: [(&str, &str); 4] = [
    ("// File:", ""),
    ("# File:", ""),
    ("/* File:", "*/"),
    ("<!-- File:", "-->"),
];

/// Minimum length of an unfenced response considered for whole-file fallback.
const WHOLE_RESPONSE_MIN_LEN: usize = 100;

/// Lines at the head and tail of a response kept as messages when they sit
/// outside any file.
const MESSAGE_EDGE_LINES: usize = 5;

const CODE_INDICATORS: [&str; 23] = [
    "function ", "const ", "let ", "var ", "import ", "export ", "class ", "interface ", "type ",
    "def ", "async ", "await ", "return ", "if (", "for (", "while (", "package ", "func ",
    "public ", "private ", "protected ", "struct ", "enum ",
];

/// Path named by a file marker line, or `None` when the line is not a marker.
fn marker_path(trimmed: &str) -> Option<&str> {
    FILE_MARKERS.iter().find_map(|(prefix, suffix)| {
        let rest = trimmed.strip_prefix(prefix)?;
        let rest = rest.trim();
        Some(rest.strip_suffix(suffix).unwrap_or(rest).trim())
    })
}

struct FileBuilder {
    path: String,
    buffer: String,
}

impl FileBuilder {
    fn new(path: String) -> Self {
        Self {
            path,
            buffer: String::new(),
        }
    }

    fn push_line(&mut self, line: &str) {
        if !self.buffer.is_empty() {
            self.buffer.push('\n');
        }
        self.buffer.push_str(line);
    }

    /// Finished file, or `None` when nothing was buffered.
    fn finish(self) -> Option<GeneratedFile> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(GeneratedFile::new(self.path, self.buffer.trim()))
    }
}

/// Parse a response for `task_type`.
///
/// Non-code tasks keep the trimmed response as their single message. Code
/// tasks are split into files using file marker lines and fenced blocks; a
/// fenced block with a language tag and no preceding marker becomes
/// `generated_<n>.<ext>` unless the response uses markers anywhere.
pub fn parse_task_output(task_type: TaskType, response: &str) -> TaskOutput {
    let mut output = TaskOutput::default();

    if !task_type.is_code_generation() {
        let trimmed = response.trim();
        if !trimmed.is_empty() {
            output.messages.push(trimmed.to_string());
        }
        return output;
    }

    let has_markers = FILE_MARKERS.iter().any(|(prefix, _)| response.contains(prefix));
    let lines: Vec<&str> = response.split('\n').collect();
    let total = lines.len();

    let mut current: Option<FileBuilder> = None;
    let mut in_fence = false;

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();

        if let Some(raw_path) = marker_path(trimmed) {
            if let Some(file) = current.take().and_then(FileBuilder::finish) {
                output.files.push(file);
            }
            if raw_path.is_empty() {
                tracing::debug!(
                    line = i + 1,
                    "file marker without a path, skipping until next marker"
                );
            } else {
                match sanitize_file_path(raw_path) {
                    Some(path) => current = Some(FileBuilder::new(path)),
                    None => tracing::warn!(path = raw_path, "skipping file with unsafe path"),
                }
            }
            continue;
        }

        if let Some(tag) = trimmed.strip_prefix("```") {
            if !in_fence {
                in_fence = true;
                let language = tag.trim();
                if current.is_none() && !language.is_empty() && !has_markers {
                    let path = format!(
                        "{FALLBACK_PREFIX}{}.{}",
                        output.files.len() + 1,
                        language_to_extension(language)
                    );
                    current = Some(FileBuilder::new(path));
                }
            } else {
                in_fence = false;
                // An empty block keeps the marker-named file open.
                if current.as_ref().is_some_and(|b| !b.buffer.is_empty()) {
                    if let Some(file) = current.take().and_then(FileBuilder::finish) {
                        output.files.push(file);
                    }
                }
            }
            continue;
        }

        match current.as_mut() {
            Some(builder) => builder.push_line(line),
            None => {
                let at_edge = i < MESSAGE_EDGE_LINES || i + MESSAGE_EDGE_LINES > total;
                if at_edge && !trimmed.is_empty() {
                    output.messages.push(trimmed.to_string());
                }
            }
        }
    }

    if let Some(file) = current.take().and_then(FileBuilder::finish) {
        output.files.push(file);
    }

    if output.files.is_empty() && response.len() > WHOLE_RESPONSE_MIN_LEN {
        if looks_like_code(response) {
            let language = detect_language_from_content(response);
            let path = format!("{FALLBACK_PREFIX}1.{}", language_to_extension(language));
            output.files.push(GeneratedFile::new(path, response));
        } else {
            output.messages = vec![response.to_string()];
        }
    }

    if in_fence {
        output.messages.push(UNTERMINATED_FENCE_WARNING.to_string());
    }

    output
}

/// Merged file set across every task output in `build`, in task order.
pub fn collect_build_files(build: &Build) -> Vec<GeneratedFile> {
    merge_files(
        build
            .tasks
            .iter()
            .filter_map(|t| t.output.as_ref())
            .flat_map(|o| o.files.iter()),
    )
}

pub fn looks_like_code(content: &str) -> bool {
    let lower = content.to_lowercase();
    CODE_INDICATORS.iter().any(|i| lower.contains(i))
}

/// Best-effort language tag for unlabelled code.
pub fn detect_language_from_content(content: &str) -> &'static str {
    let lower = content.to_lowercase();

    if content.contains("import React")
        || content.contains("from 'react'")
        || (content.contains("interface ") && content.contains(": "))
    {
        return "typescript";
    }
    if content.contains("package main") || (content.contains("func ") && content.contains("{}")) {
        return "go";
    }
    if content.contains("def ") && content.contains(':') && !content.contains('{') {
        return "python";
    }
    if lower.contains("function ") || lower.contains("const ") || lower.contains("let ") {
        return "javascript";
    }
    if content.contains("fn ") && content.contains("-> ") {
        return "rust";
    }
    if content.contains("public class ") || content.contains("private class ") {
        return "java";
    }
    "text"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_code_tasks_keep_whole_response() {
        let out = parse_task_output(TaskType::Plan, "  1. do things\n2. more  ");
        assert!(out.files.is_empty());
        assert_eq!(out.messages, vec!["1. do things\n2. more".to_string()]);
    }

    #[test]
    fn markers_name_files_and_fences_are_stripped() {
        let response = "Here you go\n// File: src/main.ts\n```ts\nconsole.log(1);\n```\n// File: src/util.ts\n```ts\nexport const x = 1;\n```\nDone";
        let out = parse_task_output(TaskType::GenerateApi, response);
        let paths: Vec<&str> = out.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["src/main.ts", "src/util.ts"]);
        assert_eq!(out.files[0].content, "console.log(1);");
        assert_eq!(out.files[0].language, "typescript");
        assert!(out.messages.contains(&"Here you go".to_string()));
    }

    #[test]
    fn unmarked_fences_become_fallback_files() {
        let response = "```python\nprint('a')\n```\n```go\npackage main\n```";
        let out = parse_task_output(TaskType::GenerateFile, response);
        let paths: Vec<&str> = out.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["generated_1.py", "generated_2.go"]);
    }

    #[test]
    fn markers_anywhere_suppress_fallback_names() {
        let response = "```js\norphan();\n```\n// File: app.js\nreal();";
        let out = parse_task_output(TaskType::GenerateUi, response);
        assert_eq!(out.files.len(), 1);
        assert_eq!(out.files[0].path, "app.js");
        assert_eq!(out.files[0].content, "real();");
    }

    #[test]
    fn unsafe_marker_paths_are_skipped() {
        let response = "// File: ../../etc/passwd\nroot:x:0:0\n// File: ok.txt\nfine";
        let out = parse_task_output(TaskType::GenerateFile, response);
        assert_eq!(out.files.len(), 1);
        assert_eq!(out.files[0].path, "ok.txt");
    }

    #[test]
    fn empty_marker_closes_the_open_file() {
        let response = "// File: a.ts\nconst a = 1;\n// File:\nlost();\n// File: b.ts\nconst b = 2;";
        let out = parse_task_output(TaskType::GenerateApi, response);
        let paths: Vec<&str> = out.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.ts", "b.ts"]);
        assert!(out.files.iter().all(|f| !f.content.contains("lost")));
    }

    #[test]
    fn html_and_block_comment_markers() {
        let response = "<!-- File: index.html -->\n<html></html>\n/* File: style.css */\nbody {}";
        let out = parse_task_output(TaskType::GenerateUi, response);
        let paths: Vec<&str> = out.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["index.html", "style.css"]);
    }

    #[test]
    fn unterminated_fence_warns_and_keeps_content() {
        let response = "// File: src/a.ts\n```ts\nexport const a = 1;\nexport const b =";
        let out = parse_task_output(TaskType::GenerateApi, response);
        assert_eq!(out.files.len(), 1);
        assert!(out.messages.iter().any(|m| m == UNTERMINATED_FENCE_WARNING));
    }

    #[test]
    fn long_unfenced_code_becomes_single_file() {
        let body = "import React from 'react';\nexport function App() {\n  return <div>Hello world from a long component body</div>;\n}\n";
        assert!(body.len() > 100);
        let out = parse_task_output(TaskType::GenerateUi, body);
        assert_eq!(out.files.len(), 1);
        assert_eq!(out.files[0].path, "generated_1.ts");
    }

    #[test]
    fn long_prose_becomes_single_message() {
        let prose = "I was unable to produce the files you asked for because the requirements were ambiguous and contradictory in several places.";
        let out = parse_task_output(TaskType::GenerateApi, prose);
        assert!(out.files.is_empty());
        assert_eq!(out.messages, vec![prose.to_string()]);
    }

    #[test]
    fn language_heuristics() {
        assert_eq!(detect_language_from_content("package main\nfunc main() {}"), "go");
        assert_eq!(detect_language_from_content("def f(x):\n    return x"), "python");
        assert_eq!(detect_language_from_content("fn main() -> i32 { 0 }"), "rust");
        assert_eq!(detect_language_from_content("hello"), "text");
    }
}
