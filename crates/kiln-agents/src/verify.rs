//! Quick structural checks on a code-generation task's output.
//!
//! These run before a task is accepted. Any problem sends the task back for a
//! corrective retry; they never inspect semantics.

use std::sync::LazyLock;

use regex::Regex;

use kiln_core::types::{GeneratedFile, TaskOutput};

const PLACEHOLDERS: [&str; 13] = [
    "TODO",
    "FIXME",
    "// TODO:",
    "// FIXME:",
    "throw new Error('Not implemented')",
    "throw new Error(\"Not implemented\")",
    "raise NotImplementedError",
    "panic(\"not implemented\")",
    "// ... rest of implementation",
    "/* placeholder */",
    "[complete file content here]",
    "[complete code here]",
    "your implementation here",
];

const TRUNCATED_SUFFIXES: [&str; 7] = ["=", "=>", ".", ",", ":", "(", "["];

static TRUNCATED_TAILS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(r"^(const|let|var|import|export|return|await|throw|new)\b\s*$")
            .expect("Invalid keyword tail regex"),
        Regex::new(r"^(if|for|while|switch|catch)\b.*$").expect("Invalid control tail regex"),
        Regex::new(r"^(async\s+)?function\b.*$").expect("Invalid function tail regex"),
    ]
});

static EMPTY_JS_FUNCTIONS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(r"function\s+\w+\s*\([^)]*\)\s*\{\s*\}").expect("Invalid js function regex"),
        Regex::new(r"=>\s*\{\s*\}").expect("Invalid arrow function regex"),
        Regex::new(r"async\s+function\s+\w+\s*\([^)]*\)\s*\{\s*\}")
            .expect("Invalid async function regex"),
    ]
});

static EMPTY_GO_FUNCTIONS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"func\s+\w+\s*\([^)]*\)\s*\{\s*\}").expect("Invalid go func regex"),
        Regex::new(r"func\s+\([^)]+\)\s+\w+\s*\([^)]*\)\s*\{\s*\}")
            .expect("Invalid go method regex"),
    ]
});

static EMPTY_PY_FUNCTIONS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"(?m)def\s+\w+\s*\([^)]*\)\s*:\s*pass\s*$").expect("Invalid py pass regex"),
        Regex::new(r"(?m)def\s+\w+\s*\([^)]*\)\s*:\s*\.\.\.\s*$")
            .expect("Invalid py ellipsis regex"),
    ]
});

/// All problems found in `output`; empty means the output passes.
pub fn verify_generated_code(output: &TaskOutput) -> Vec<String> {
    let mut problems: Vec<String> = output
        .messages
        .iter()
        .filter(|m| m.to_lowercase().contains("unterminated code block"))
        .map(|m| format!("AI response parsing warning: {m}"))
        .collect();

    for file in &output.files {
        problems.extend(quick_syntax_check(file));
    }

    for file in &output.files {
        for placeholder in PLACEHOLDERS {
            if file.content.contains(placeholder) {
                problems.push(format!(
                    "{}: Contains placeholder code '{placeholder}'",
                    file.path
                ));
            }
        }
        if has_empty_functions(&file.content, &file.language) {
            problems.push(format!("{}: Contains empty function bodies", file.path));
        }
    }

    problems
}

fn quick_syntax_check(file: &GeneratedFile) -> Vec<String> {
    let mut problems = Vec::new();
    let content = &file.content;

    match file.language.as_str() {
        "typescript" | "javascript" => {
            if content.matches("```").count() % 2 != 0 {
                problems.push(format!("{}: Contains unmatched markdown code fence", file.path));
            }
            if let Some(tail) = truncated_js_tail(&file.path, content) {
                problems.push(tail);
            }
        }
        "go" => {
            if file.path.to_lowercase().ends_with(".go") && !content.contains("package ") {
                problems.push(format!("{}: Missing package declaration", file.path));
            }
        }
        "python" => {
            let lines: Vec<&str> = content.split('\n').collect();
            let mixed = lines
                .windows(2)
                .position(|pair| pair[1].starts_with('\t') && pair[0].starts_with("    "));
            if let Some(idx) = mixed {
                problems.push(format!("{}:{}: Mixed tabs and spaces", file.path, idx + 2));
            }
        }
        "html" => {
            let lower = content.to_lowercase();
            if lower.contains("<html") && !lower.contains("</html>") {
                problems.push(format!(
                    "{}: Incomplete HTML document (missing </html>)",
                    file.path
                ));
            }
            if lower.contains("<body") && !lower.contains("</body>") {
                problems.push(format!(
                    "{}: Incomplete HTML document (missing </body>)",
                    file.path
                ));
            }
        }
        "json" => {
            if serde_json::from_str::<serde_json::Value>(content).is_err() {
                problems.push(format!("{}: Invalid JSON syntax", file.path));
            }
        }
        _ => {}
    }

    problems
}

/// Problem text when the last line of a JS/TS file looks cut off.
fn truncated_js_tail(path: &str, content: &str) -> Option<String> {
    let last = content.trim().lines().last()?.trim();
    if last.is_empty() {
        return None;
    }
    if TRUNCATED_TAILS.iter().any(|re| re.is_match(last)) {
        return Some(format!(
            "{path}: Likely truncated source file (abrupt EOF after '{last}')"
        ));
    }
    if TRUNCATED_SUFFIXES.iter().any(|s| last.ends_with(s)) {
        return Some(format!(
            "{path}: Likely truncated source file (abrupt EOF near '{last}')"
        ));
    }
    None
}

fn has_empty_functions(content: &str, language: &str) -> bool {
    let patterns: &[Regex] = match language {
        "typescript" | "javascript" => &*EMPTY_JS_FUNCTIONS,
        "go" => &*EMPTY_GO_FUNCTIONS,
        "python" => &*EMPTY_PY_FUNCTIONS,
        _ => return false,
    };
    patterns.iter().any(|re| re.is_match(content))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(files: Vec<GeneratedFile>) -> TaskOutput {
        TaskOutput {
            files,
            messages: Vec::new(),
        }
    }

    #[test]
    fn clean_output_passes() {
        let out = output(vec![
            GeneratedFile::new("src/a.ts", "export const a = 1;\nexport function f() { return a; }"),
            GeneratedFile::new("main.go", "package main\n\nfunc main() { println(1) }"),
            GeneratedFile::new("package.json", r#"{"name":"x"}"#),
        ]);
        assert!(verify_generated_code(&out).is_empty());
    }

    #[test]
    fn unterminated_fence_message_is_reported() {
        let out = TaskOutput {
            files: Vec::new(),
            messages: vec![crate::output::UNTERMINATED_FENCE_WARNING.to_string()],
        };
        let problems = verify_generated_code(&out);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].starts_with("AI response parsing warning:"));
    }

    #[test]
    fn truncated_tail_variants() {
        let after = output(vec![GeneratedFile::new("a.ts", "const x = 1;\nexport")]);
        assert!(verify_generated_code(&after)[0].contains("abrupt EOF after 'export'"));

        let near = output(vec![GeneratedFile::new("b.js", "const y = {\n  a: 1,")]);
        assert!(verify_generated_code(&near)[0].contains("abrupt EOF near 'a: 1,'"));
    }

    #[test]
    fn go_without_package_and_bad_json() {
        let out = output(vec![
            GeneratedFile::new("cmd/x.go", "func main() { run() }"),
            GeneratedFile::new("tsconfig.json", "{ \"compilerOptions\": "),
        ]);
        let problems = verify_generated_code(&out);
        assert!(problems.contains(&"cmd/x.go: Missing package declaration".to_string()));
        assert!(problems.contains(&"tsconfig.json: Invalid JSON syntax".to_string()));
    }

    #[test]
    fn python_mixed_indentation_reports_line() {
        let out = output(vec![GeneratedFile::new(
            "app.py",
            "def f(x):\n    y = x\n\treturn y",
        )]);
        let problems = verify_generated_code(&out);
        assert_eq!(problems, vec!["app.py:3: Mixed tabs and spaces".to_string()]);
    }

    #[test]
    fn incomplete_html() {
        let out = output(vec![GeneratedFile::new("index.html", "<html><body><div>")]);
        assert_eq!(verify_generated_code(&out).len(), 2);
    }

    #[test]
    fn placeholders_and_empty_bodies() {
        let out = output(vec![GeneratedFile::new(
            "src/svc.ts",
            "// TODO: wire this\nexport function handler() {}\n",
        )]);
        let problems = verify_generated_code(&out);
        assert!(problems.iter().any(|p| p.contains("placeholder code 'TODO'")));
        assert!(problems.iter().any(|p| p.contains("placeholder code '// TODO:'")));
        assert!(problems.iter().any(|p| p.ends_with("Contains empty function bodies")));
    }

    #[test]
    fn python_pass_body_is_empty() {
        let out = output(vec![GeneratedFile::new("x.py", "def run(a):\n    pass\n\nrun(1)")]);
        assert!(verify_generated_code(&out)
            .iter()
            .any(|p| p.ends_with("Contains empty function bodies")));
    }
}
