//! Path sanitization for model-generated file names.

/// Normalize a generated file path into a safe relative path.
///
/// Returns `None` for paths that are empty, absolute, drive-prefixed, or that
/// escape the project root after cleaning. Annotations such as
/// `package.json (root)` are stripped, however many there are. Applying the function to its own output
/// returns the same value.
pub fn sanitize_file_path(path: &str) -> Option<String> {
    let mut cleaned = path.trim().to_string();
    if cleaned.is_empty() {
        return None;
    }

    while let Some(idx) = cleaned.find(" (") {
        let Some(end) = cleaned[idx..].find(')') else {
            break;
        };
        let stripped = format!("{}{}", &cleaned[..idx], &cleaned[idx + end + 1..]);
        cleaned = stripped.trim().to_string();
    }
    if cleaned.is_empty() {
        return None;
    }

    let cleaned = cleaned.replace('\\', "/");
    let bytes = cleaned.as_bytes();
    if cleaned.starts_with('/') || (bytes.len() > 1 && bytes[1] == b':') {
        return None;
    }

    let normalized = clean(&cleaned);
    if normalized == "." || normalized.is_empty() || normalized.starts_with("..") {
        return None;
    }
    Some(normalized)
}

/// Lexical cleaning of a relative, slash-separated path: collapses repeated
/// separators, drops `.` segments, and resolves `..` where possible.
fn clean(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(last) if *last != ".." => {
                    segments.pop();
                }
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        ".".to_string()
    } else {
        segments.join("/")
    }
}

/// Final path component.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim().trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Lowercased extension including the dot, or an empty string.
pub fn extension(path: &str) -> String {
    let base = base_name(path);
    match base.rfind('.') {
        Some(idx) if idx > 0 || base.len() > 1 => base[idx..].to_ascii_lowercase(),
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_annotation_suffix() {
        assert_eq!(
            sanitize_file_path("package.json (root)").as_deref(),
            Some("package.json")
        );
        assert_eq!(
            sanitize_file_path("src/main.tsx (entry)").as_deref(),
            Some("src/main.tsx")
        );
    }

    #[test]
    fn rejects_absolute_and_drive_paths() {
        assert_eq!(sanitize_file_path("/etc/passwd"), None);
        assert_eq!(sanitize_file_path("C:\\Windows\\system.ini"), None);
        assert_eq!(sanitize_file_path("   "), None);
    }

    #[test]
    fn rejects_traversal_after_cleaning() {
        assert_eq!(sanitize_file_path("../secrets.env"), None);
        assert_eq!(sanitize_file_path("src/../../x.ts"), None);
        assert_eq!(sanitize_file_path("./"), None);
    }

    #[test]
    fn normalizes_inner_segments() {
        assert_eq!(
            sanitize_file_path("src//components/./App.tsx").as_deref(),
            Some("src/components/App.tsx")
        );
        assert_eq!(
            sanitize_file_path("src\\lib\\..\\util.ts").as_deref(),
            Some("src/util.ts")
        );
    }

    #[test]
    fn sanitizing_twice_is_a_no_op() {
        let inputs = [
            "package.json (root)",
            "src//a/./b.ts",
            "a\\b\\c.go",
            "docs/readme (draft",
            "x/../y/z.py",
            "src/App (1).tsx (frontend)",
            "api/server.go (backend) (v2)",
        ];
        for input in inputs {
            let once = sanitize_file_path(input).expect("sanitizable");
            assert_eq!(sanitize_file_path(&once).as_deref(), Some(once.as_str()));
        }
    }

    #[test]
    fn strips_every_annotation() {
        assert_eq!(
            sanitize_file_path("src/App (1).tsx (frontend)").as_deref(),
            Some("src/App.tsx")
        );
        assert_eq!(
            sanitize_file_path("api/server.go (backend) (v2)").as_deref(),
            Some("api/server.go")
        );
        assert_eq!(sanitize_file_path("README.md  (docs)").as_deref(), Some("README.md"));
    }

    #[test]
    fn extension_and_base_name() {
        assert_eq!(extension("src/App.TSX"), ".tsx");
        assert_eq!(extension("Makefile"), "");
        assert_eq!(base_name("a/b/generated_1.ts"), "generated_1.ts");
    }
}
