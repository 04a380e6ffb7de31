//! Final-output readiness validation.
//!
//! [`validate_readiness`] is the pure gate a build passes before it is marked
//! completed. Deeper checks that need a manifest walk or a sandbox sit behind
//! the [`PreviewVerifier`] trait.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use kiln_core::paths::extension;
use kiln_core::types::GeneratedFile;

pub const NO_FILES: &str = "No files were generated by the build";
pub const NO_SOURCE_FILES: &str = "No source files were generated";
pub const MISSING_HTML_ENTRY: &str =
    "Frontend app is missing an HTML entry point (index.html or public/index.html)";
pub const MISSING_FRONTEND_ENTRY: &str = "Frontend app is missing an entry source file";

const SOURCE_EXTENSIONS: [&str; 16] = [
    ".js", ".jsx", ".ts", ".tsx", ".go", ".py", ".rs", ".java", ".kt", ".swift", ".php", ".rb",
    ".c", ".cc", ".cpp", ".cs",
];

const PROSE_MARKERS: [&str; 3] = [
    "This implementation includes:",
    "Here is the implementation:",
    "Explanation:",
];

const ROOT_MANIFEST: &str = "package.json";

/// Frontend manifests preferred over the workspace root manifest.
const FRONTEND_MANIFESTS: [&str; 5] = [
    "frontend/package.json",
    "web/package.json",
    "apps/web/package.json",
    "packages/frontend/package.json",
    "packages/web/package.json",
];

const INDEX_HTML_PATHS: [&str; 5] = [
    "index.html",
    "public/index.html",
    "src/index.html",
    "frontend/index.html",
    "frontend/public/index.html",
];

const ENTRY_ROOTS: [&str; 6] = [
    "",
    "apps/web/",
    "packages/frontend/",
    "packages/web/",
    "web/",
    "frontend/",
];

const BUNDLER_MARKERS: [&str; 4] = ["vite.config", "webpack.config", "parcel", "craco.config"];

fn is_frontend_entry(path: &str) -> bool {
    const ROOT_ONLY: [&str; 10] = [
        "app/page.tsx",
        "app/page.jsx",
        "src/app/page.tsx",
        "src/app/page.jsx",
        "src/pages/index.tsx",
        "src/pages/index.jsx",
        "pages/index.tsx",
        "pages/index.jsx",
        "src/main.tsx",
        "src/main.jsx",
    ];
    if ROOT_ONLY.contains(&path) {
        return true;
    }
    ENTRY_ROOTS.iter().any(|root| {
        path.strip_prefix(root).is_some_and(|rest| {
            matches!(
                rest,
                "src/main.tsx" | "src/main.jsx" | "src/index.tsx" | "src/index.jsx"
            )
        })
    })
}

// ---------------------------------------------------------------------------
// Per-file detectors
// ---------------------------------------------------------------------------

pub fn has_patch_markers(content: &str) -> bool {
    if content.contains("<<<<<<<") || content.contains(">>>>>>>") {
        return true;
    }
    let has_search = content.contains("SEARCH:") || content.contains("<<<<<<< SEARCH");
    let has_replace = content.contains("REPLACE:") || content.contains(">>>>>>> REPLACE");
    has_search
        && has_replace
        && (content.contains("=======")
            || content.contains("<<<<<<< SEARCH")
            || content.contains(">>>>>>> REPLACE"))
}

fn source_anomalies(path: &str, content: &str, ext: &str) -> Vec<String> {
    if content.trim().is_empty() {
        return Vec::new();
    }
    let mut problems = Vec::new();
    if PROSE_MARKERS.iter().any(|m| content.contains(m)) {
        problems.push(format!("{path} contains explanatory prose appended to source code"));
    }
    if ext == ".tsx" || ext == ".jsx" {
        let lower = content.to_lowercase();
        let react = lower.contains("from 'react'") || lower.contains("from \"react\"") || lower.contains("react.");
        let express = lower.contains("from 'express'")
            || lower.contains("from \"express\"")
            || lower.contains("require('express')")
            || lower.contains("require(\"express\")");
        if react && express {
            problems.push(format!(
                "{path} mixes frontend React and backend Express code in the same source file"
            ));
        }
    }
    problems
}

fn persistence_stacks(path: &str, content: &str) -> Vec<&'static str> {
    let path = path.to_lowercase();
    let lower = content.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    let mut stacks = Vec::new();
    if path.contains("drizzle.config") || any(&["drizzle-orm", "drizzle-kit"]) {
        stacks.push("drizzle");
    }
    if path.contains("schema.prisma") || any(&["@prisma/client", "new prismaclient"]) {
        stacks.push("prisma");
    }
    if any(&["from 'mongoose'", "from \"mongoose\"", "new schema<", "mongoose.connect("]) {
        stacks.push("mongoose");
    }
    if any(&["from 'sequelize'", "from \"sequelize\"", "sequelize.define(", "new sequelize("]) {
        stacks.push("sequelize");
    }
    if any(&["from 'typeorm'", "from \"typeorm\"", "@entity(", "datasource("]) {
        stacks.push("typeorm");
    }
    stacks
}

// ---------------------------------------------------------------------------
// package.json analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ManifestSummary {
    react: bool,
    react_dom: bool,
    next: bool,
    missing_scripts: Vec<&'static str>,
}

fn analyze_manifest(content: &str) -> Result<ManifestSummary, String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err("package.json is empty".to_string());
    }
    let pkg: serde_json::Value = serde_json::from_str(trimmed).map_err(|e| e.to_string())?;

    let has_dep = |name: &str| {
        ["dependencies", "devDependencies", "peerDependencies"]
            .iter()
            .any(|section| pkg.get(section).and_then(|s| s.get(name)).is_some())
    };
    let has_script = |name: &str| {
        pkg.get("scripts")
            .and_then(|s| s.get(name))
            .and_then(|v| v.as_str())
            .is_some_and(|v| !v.trim().is_empty())
    };

    let mut summary = ManifestSummary {
        react: has_dep("react"),
        react_dom: has_dep("react-dom"),
        next: has_dep("next"),
        missing_scripts: Vec::new(),
    };
    if !has_script("build") {
        summary.missing_scripts.push("build");
    }
    if summary.next {
        if !has_script("start") {
            summary.missing_scripts.push("start");
        }
    } else if !(has_script("dev") || has_script("preview") || has_script("start")) {
        summary.missing_scripts.push("dev|preview|start");
    }
    Ok(summary)
}

// ---------------------------------------------------------------------------
// validate_readiness
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Problems {
    list: Vec<String>,
    seen: HashSet<String>,
}

impl Problems {
    fn add(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        if self.seen.insert(msg.clone()) {
            self.list.push(msg);
        }
    }
}

/// Structural problems that would keep the file set from running. Empty means
/// the set is ready. Each problem is reported once.
pub fn validate_readiness(files: &[GeneratedFile]) -> Vec<String> {
    if files.is_empty() {
        return vec![NO_FILES.to_string()];
    }

    let mut problems = Problems::default();
    let mut manifest: Option<&str> = None;
    let mut has_index_html = false;
    let mut has_entry = false;
    let mut has_tsx_or_jsx = false;
    let mut has_bundler = false;
    let mut source_files = 0usize;
    let mut stacks: BTreeSet<&'static str> = BTreeSet::new();

    for file in files {
        let path = file.path.trim().to_lowercase();
        if path.is_empty() {
            continue;
        }

        if has_patch_markers(&file.content) {
            problems.add(format!("{} contains unresolved patch/merge markers", file.path));
        }

        let ext = extension(&path);
        if SOURCE_EXTENSIONS.contains(&ext.as_str()) {
            source_files += 1;
            for msg in source_anomalies(&file.path, &file.content, &ext) {
                problems.add(msg);
            }
            stacks.extend(persistence_stacks(&file.path, &file.content));
        }
        if ext == ".tsx" || ext == ".jsx" {
            has_tsx_or_jsx = true;
        }
        if path.ends_with("index.html") || INDEX_HTML_PATHS.contains(&path.as_str()) {
            has_index_html = true;
        }
        if BUNDLER_MARKERS.iter().any(|m| path.contains(m)) {
            has_bundler = true;
        }
        if path == ROOT_MANIFEST {
            if manifest.is_none() {
                manifest = Some(&file.content);
            }
        } else if FRONTEND_MANIFESTS.contains(&path.as_str()) {
            manifest = Some(&file.content);
        }
        if is_frontend_entry(&path) {
            has_entry = true;
        }
    }

    if source_files == 0 {
        problems.add(NO_SOURCE_FILES);
    }
    if stacks.len() > 1 {
        let names: Vec<&str> = stacks.into_iter().collect();
        problems.add(format!(
            "Backend app mixes multiple persistence stacks ({}); generated app should use one database ORM/ODM stack consistently",
            names.join(", ")
        ));
    }

    let is_frontend_app =
        has_tsx_or_jsx || has_bundler || has_index_html || has_entry || manifest.is_some();
    if is_frontend_app {
        let mut is_next = false;
        if let Some(content) = manifest {
            match analyze_manifest(content) {
                Ok(summary) => {
                    is_next = summary.next;
                    if summary.react && !summary.react_dom && !summary.next {
                        problems.add("package.json includes react but is missing react-dom");
                    }
                    if !summary.missing_scripts.is_empty() && (summary.react || summary.next) {
                        problems.add(format!(
                            "package.json is missing runnable scripts ({})",
                            summary.missing_scripts.join("/")
                        ));
                    }
                }
                Err(err) => problems.add(format!("package.json is invalid: {err}")),
            }
        }
        if !is_next && !has_index_html && !has_bundler {
            problems.add(MISSING_HTML_ENTRY);
        }
        if !has_entry {
            problems.add(MISSING_FRONTEND_ENTRY);
        }
    }

    problems.list
}

/// Merge extra problems into `base`, keeping first-seen order.
pub fn merge_problems(base: &mut Vec<String>, extra: Vec<String>) {
    for msg in extra {
        let msg = msg.trim().to_string();
        if !msg.is_empty() && !base.contains(&msg) {
            base.push(msg);
        }
    }
}

// ---------------------------------------------------------------------------
// Error class / repair hints
// ---------------------------------------------------------------------------

/// Stable grouping key for a problem set, used to detect a recovery pass that
/// failed the same way twice.
pub fn readiness_error_class(problems: &[String]) -> String {
    let Some(first) = problems.first() else {
        return String::new();
    };
    let joined = problems.join("; ").to_lowercase();
    let known = [
        ("dependency check failed", "dependency_check"),
        ("missing a build script", "missing_build_script"),
        ("tsconfig.json is missing", "missing_tsconfig"),
        ("preview verification build failed", "preview_build_failed"),
        ("backend verification build failed", "backend_build_failed"),
        ("unresolved patch/merge markers", "unresolved_patch_markers"),
        ("missing an html entry point", "missing_html_entry"),
        ("missing an entry source file", "missing_frontend_entry"),
    ];
    if let Some((_, class)) = known.iter().find(|(needle, _)| joined.contains(needle)) {
        return (*class).to_string();
    }

    let lower = first.trim().to_lowercase();
    let prefix = match lower.find(':') {
        Some(idx) if idx > 0 => lower[..idx].trim(),
        _ => lower.as_str(),
    };
    prefix.chars().take(120).collect()
}

static MISSING_DEPENDENCY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"does not declare dependency "([^"]+)""#).expect("Invalid dependency regex")
});

static MISSING_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"source imports "([^"]+)""#).expect("Invalid import regex"));

fn placement_hint(pkg: &str) -> String {
    let lower = pkg.to_lowercase();
    if lower.starts_with("@types/")
        || lower == "typescript"
        || lower == "vite"
        || lower.starts_with("@vitejs/")
    {
        format!("{pkg} -> devDependencies")
    } else if lower == "vitest" || lower == "jest" || lower.starts_with("@testing-library/") {
        format!("{pkg} -> devDependencies (unless tests are intentionally removed)")
    } else {
        format!("{pkg} -> dependencies")
    }
}

/// Concrete instructions for a recovery agent, derived from problems that
/// name undeclared dependencies. Empty when no problem names one.
pub fn repair_hints(problems: &[String]) -> Vec<String> {
    let mut packages = BTreeSet::new();
    let mut specs = BTreeSet::new();
    for msg in problems {
        if let Some(m) = MISSING_DEPENDENCY.captures(msg) {
            packages.insert(m[1].to_string());
        }
        if let Some(m) = MISSING_IMPORT.captures(msg) {
            specs.insert(m[1].to_string());
        }
    }
    if packages.is_empty() && specs.is_empty() {
        return Vec::new();
    }

    let mut hints = Vec::new();
    if !packages.is_empty() {
        let list: Vec<&str> = packages.iter().map(String::as_str).collect();
        hints.push(format!(
            "Update package.json dependencies/devDependencies to include missing package(s): {}",
            list.join(", ")
        ));
        let placements: Vec<String> = packages.iter().map(|p| placement_hint(p)).collect();
        hints.push(format!("Package placement guidance: {}", placements.join("; ")));
    }
    if !specs.is_empty() {
        let list: Vec<&str> = specs.iter().map(String::as_str).collect();
        hints.push(format!(
            "Preserve and satisfy imports used by source files (do not remove features just to silence errors): {}",
            list.join(", ")
        ));
    }
    if specs
        .iter()
        .any(|s| s == "@vitejs/plugin-react" || s == "@vitejs/plugin-react-swc")
    {
        hints.push("If vite.config imports @vitejs/plugin-react* then add it to devDependencies and keep vite.config.ts in ESM syntax (import/export, not require).".to_string());
    }
    hints.push("If a config-only import (jest/vitest config) is not needed for runtime/preview, keep config self-consistent or remove the unused config file and related scripts together.".to_string());
    hints
}

// ---------------------------------------------------------------------------
// PreviewVerifier
// ---------------------------------------------------------------------------

/// Deep verification run when a build requires a previewable result.
#[async_trait]
pub trait PreviewVerifier: Send + Sync {
    async fn verify(&self, files: &[GeneratedFile]) -> Vec<String>;
}

/// Performs no deep checks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPreviewVerifier;

#[async_trait]
impl PreviewVerifier for NoopPreviewVerifier {
    async fn verify(&self, _files: &[GeneratedFile]) -> Vec<String> {
        Vec::new()
    }
}

const PREVIEW_MANIFESTS: [&str; 7] = [
    "frontend/package.json",
    "client/package.json",
    "web/package.json",
    "apps/web/package.json",
    "apps/frontend/package.json",
    "packages/web/package.json",
    "packages/frontend/package.json",
];

const NODE_BUILTINS: [&str; 19] = [
    "fs", "path", "url", "http", "https", "crypto", "stream", "events", "util", "os", "zlib",
    "buffer", "timers", "assert", "tty", "net", "tls", "dns", "child_process",
];

static IMPORT_SPEC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)(?:^|\s)(?:import\s+(?:type\s+)?(?:[^'"]+\s+from\s+)?|export\s+[^'"]+\s+from\s+|import\s*\(|require\()\s*['"]([^'"]+)['"]"#,
    )
    .expect("Invalid import specifier regex")
});

/// Package a bare import specifier resolves to, or `None` for relative,
/// aliased, builtin-scheme and URL imports.
pub fn package_name(spec: &str) -> Option<&str> {
    let spec = spec.trim();
    let local_prefixes = [".", "/", "#", "node:", "http://", "https://", "@/", "~/"];
    if spec.is_empty() || local_prefixes.iter().any(|p| spec.starts_with(p)) {
        return None;
    }
    if spec.starts_with('@') {
        let mut slashes = spec.match_indices('/');
        return match (slashes.next(), slashes.next()) {
            (Some(_), Some((second, _))) => Some(&spec[..second]),
            _ => Some(spec),
        };
    }
    Some(spec.split('/').next().unwrap_or(spec))
}

fn is_test_path(path: &str) -> bool {
    let markers = ["/__tests__/", "/test/", "/tests/", ".test.", ".spec."];
    let suffixes = [
        "jest.config.js",
        "jest.config.ts",
        "vitest.config.ts",
        "vitest.config.js",
        "setuptests.ts",
        "setuptests.tsx",
    ];
    markers.iter().any(|m| path.contains(m)) || suffixes.iter().any(|s| path.ends_with(s))
}

/// Manifest-level preview check that needs no sandbox: the frontend manifest
/// must parse, carry a build script, and declare every package its sources
/// import.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticPreviewVerifier;

impl StaticPreviewVerifier {
    fn check(files: &[GeneratedFile]) -> Vec<String> {
        let by_path: HashMap<String, &GeneratedFile> = files
            .iter()
            .map(|f| (f.path.trim().to_lowercase(), f))
            .collect();

        let (manifest_path, prefix) = match PREVIEW_MANIFESTS
            .iter()
            .find(|candidate| by_path.contains_key(**candidate))
        {
            Some(candidate) => (*candidate, candidate.trim_end_matches(ROOT_MANIFEST)),
            None if by_path.contains_key(ROOT_MANIFEST) => (ROOT_MANIFEST, ""),
            None => {
                return vec![
                    "Preview verification skipped: package.json not found for frontend app"
                        .to_string(),
                ]
            }
        };
        let Some(manifest_file) = by_path.get(manifest_path) else {
            return Vec::new();
        };
        if manifest_file.content.trim().is_empty() {
            return vec![format!("Preview verification failed: {manifest_path} is empty")];
        }
        let manifest: serde_json::Value = match serde_json::from_str(&manifest_file.content) {
            Ok(v) => v,
            Err(e) => {
                return vec![format!(
                    "Preview verification failed: {manifest_path} is invalid JSON ({e})"
                )]
            }
        };
        if manifest.get("scripts").and_then(|s| s.get("build")).is_none() {
            return vec!["Preview verification failed: package.json is missing a build script".to_string()];
        }

        let mut declared: HashSet<String> = HashSet::new();
        for section in ["dependencies", "devDependencies"] {
            if let Some(obj) = manifest.get(section).and_then(|s| s.as_object()) {
                declared.extend(obj.keys().map(|k| k.trim().to_string()));
            }
        }

        let mut issues = Vec::new();
        let mut reported: HashSet<String> = HashSet::new();
        for file in files {
            let path = file.path.trim().trim_start_matches("./").to_lowercase();
            if path.is_empty() || file.content.trim().is_empty() || !path.starts_with(prefix) {
                continue;
            }
            if !matches!(
                extension(&path).as_str(),
                ".js" | ".jsx" | ".ts" | ".tsx" | ".mjs" | ".cjs"
            ) || is_test_path(&path)
            {
                continue;
            }
            for caps in IMPORT_SPEC.captures_iter(&file.content) {
                let spec = caps[1].trim();
                let Some(pkg) = package_name(spec) else {
                    continue;
                };
                if pkg == "vite/client" || NODE_BUILTINS.contains(&pkg) || declared.contains(pkg) {
                    continue;
                }
                if reported.insert(pkg.to_string()) {
                    issues.push(format!(
                        "Preview verification dependency check failed: source imports \"{spec}\" but package.json does not declare dependency \"{pkg}\""
                    ));
                }
            }
        }
        issues
    }
}

#[async_trait]
impl PreviewVerifier for StaticPreviewVerifier {
    async fn verify(&self, files: &[GeneratedFile]) -> Vec<String> {
        Self::check(files)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
