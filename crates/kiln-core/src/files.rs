use std::collections::HashMap;

use crate::paths::{base_name, extension, sanitize_file_path};
use crate::types::GeneratedFile;

/// Prefix given to files the output parser could not name.
pub const FALLBACK_PREFIX: &str = "generated_";

/// Language label for a file path, keyed on its extension.
pub fn detect_language(path: &str) -> &'static str {
    match extension(path).as_str() {
        ".ts" | ".tsx" => "typescript",
        ".js" | ".jsx" => "javascript",
        ".py" => "python",
        ".go" => "go",
        ".rs" => "rust",
        ".java" => "java",
        ".html" => "html",
        ".css" => "css",
        ".sql" => "sql",
        ".json" => "json",
        ".yaml" | ".yml" => "yaml",
        ".md" => "markdown",
        ".sh" => "bash",
        _ => "text",
    }
}

/// File extension (without the dot) for a fenced-code language tag.
pub fn language_to_extension(language: &str) -> &'static str {
    match language.trim().to_ascii_lowercase().as_str() {
        "typescript" | "tsx" | "ts" => "ts",
        "javascript" | "jsx" | "js" => "js",
        "python" | "py" => "py",
        "go" | "golang" => "go",
        "rust" | "rs" => "rs",
        "java" => "java",
        "html" => "html",
        "css" => "css",
        "sql" => "sql",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "markdown" | "md" => "md",
        "bash" | "shell" | "sh" => "sh",
        _ => "txt",
    }
}

/// Whether the path carries the parser's unnamed-file convention.
pub fn is_fallback_artifact(path: &str) -> bool {
    base_name(path).starts_with(FALLBACK_PREFIX)
}

/// Merge files from several task outputs into one deduplicated set.
///
/// Paths are sanitized (unsafe paths are skipped), blank files are skipped,
/// and when a path repeats the longer trimmed content wins. First-seen order
/// is kept. Fallback artifacts are dropped once any real file exists.
pub fn merge_files<'a, I>(files: I) -> Vec<GeneratedFile>
where
    I: IntoIterator<Item = &'a GeneratedFile>,
{
    let mut by_path: HashMap<String, GeneratedFile> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for file in files {
        if file.content.trim().is_empty() {
            continue;
        }
        let Some(path) = sanitize_file_path(&file.path) else {
            tracing::debug!(path = %file.path, "skipping generated file with unsafe path");
            continue;
        };

        let mut candidate = file.clone();
        candidate.path = path.clone();

        match by_path.get(&path) {
            None => {
                order.push(path.clone());
                by_path.insert(path, candidate);
            }
            Some(existing) => {
                if candidate.content.trim().len() > existing.content.trim().len() {
                    by_path.insert(path, candidate);
                }
            }
        }
    }

    let has_real_files = order.iter().any(|p| !is_fallback_artifact(p));
    order
        .into_iter()
        .filter(|p| !(has_real_files && is_fallback_artifact(p)))
        .filter_map(|p| by_path.remove(&p))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_detection_round_trips_common_tags() {
        assert_eq!(detect_language("src/App.tsx"), "typescript");
        assert_eq!(detect_language("main.go"), "go");
        assert_eq!(detect_language("README"), "text");
        assert_eq!(language_to_extension("TypeScript"), "ts");
        assert_eq!(language_to_extension("golang"), "go");
        assert_eq!(language_to_extension("brainfuck"), "txt");
    }

    #[test]
    fn fallback_artifacts_dropped_when_real_files_exist() {
        let files = vec![
            GeneratedFile::new("generated_1.ts", "const a = 1;"),
            GeneratedFile::new("src/index.ts", "export const b = 2;"),
        ];
        let merged = merge_files(&files);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].path, "src/index.ts");
    }

    #[test]
    fn fallback_artifacts_kept_when_alone() {
        let files = vec![GeneratedFile::new("generated_1.ts", "const a = 1;")];
        assert_eq!(merge_files(&files).len(), 1);
    }

    #[test]
    fn longer_content_wins_and_order_is_stable() {
        let files = vec![
            GeneratedFile::new("a.ts", "short"),
            GeneratedFile::new("b.ts", "b"),
            GeneratedFile::new("./a.ts", "a much longer body"),
        ];
        let merged = merge_files(&files);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].path, "a.ts");
        assert_eq!(merged[0].content, "a much longer body");
        assert_eq!(merged[1].path, "b.ts");
    }
}
