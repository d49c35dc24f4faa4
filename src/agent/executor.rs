// src/agent/executor.rs
//! Test planning from suite manifests
//!
//! A manifest is a JSON file describing a suite:
//!
//! ```json
//! { "suite": "math", "tests": [ { "name": "adds", "outcome": "passed", "duration_ms": 12 } ] }
//! ```
//!
//! `suite` defaults to the file stem. Each planned case carries the outcome it
//! will report and how long executing it takes.

use crate::model::{TestCaseResult, TestFilter, TestOutcome, TestPackage};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct SuiteManifest {
    #[serde(default)]
    suite: Option<String>,

    #[serde(default)]
    tests: Vec<CaseManifest>,
}

#[derive(Debug, Deserialize)]
struct CaseManifest {
    name: String,

    #[serde(default)]
    outcome: TestOutcome,

    #[serde(default)]
    duration_ms: u64,

    #[serde(default)]
    message: Option<String>,
}

/// Resolve a package path against the package's working directory
fn resolve(package: &TestPackage, path: &Path) -> PathBuf {
    match &package.working_dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}

fn load(path: &Path) -> Result<SuiteManifest, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&content).map_err(|e| e.to_string())
}

/// Cases to execute for a package, in manifest order.
///
/// A manifest that cannot be read or parsed becomes a single `Error` case
/// named after its path, whatever the filter says.
pub fn plan(package: &TestPackage, filter: &TestFilter) -> Vec<TestCaseResult> {
    let mut cases = Vec::new();

    for path in &package.paths {
        let resolved = resolve(package, path);
        let manifest = match load(&resolved) {
            Ok(manifest) => manifest,
            Err(reason) => {
                warn!(path = %resolved.display(), "Unusable suite manifest: {}", reason);
                let name = path.display().to_string();
                cases.push(TestCaseResult {
                    suite: name.clone(),
                    name,
                    outcome: TestOutcome::Error,
                    duration_ms: 0,
                    message: Some(reason),
                });
                continue;
            }
        };

        let suite = manifest.suite.unwrap_or_else(|| {
            resolved
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| resolved.display().to_string())
        });

        let before = cases.len();
        cases.extend(
            manifest
                .tests
                .into_iter()
                .map(|case| TestCaseResult {
                    suite: suite.clone(),
                    name: case.name,
                    outcome: case.outcome,
                    duration_ms: case.duration_ms,
                    message: case.message,
                })
                .filter(|case| filter.matches(&case.full_name())),
        );
        debug!(suite = %suite, selected = cases.len() - before, "Planned suite");
    }

    cases
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, file: &str, content: &str) -> PathBuf {
        let path = dir.join(file);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_plan_reads_manifest_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "math.json",
            r#"{"tests":[
                {"name":"adds","outcome":"passed","duration_ms":5},
                {"name":"divides","outcome":"failed","message":"by zero"},
                {"name":"rounds"}
            ]}"#,
        );

        let cases = plan(&TestPackage::new(vec![path]), &TestFilter::empty());
        let names: Vec<_> = cases.iter().map(|c| c.full_name()).collect();
        assert_eq!(names, vec!["math.adds", "math.divides", "math.rounds"]);
        assert_eq!(cases[0].duration_ms, 5);
        assert_eq!(cases[1].outcome, TestOutcome::Failed);
        assert_eq!(cases[1].message.as_deref(), Some("by zero"));
        assert_eq!(cases[2].outcome, TestOutcome::Passed);
    }

    #[test]
    fn test_plan_applies_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "suite.json",
            r#"{"suite":"strings","tests":[{"name":"concat"},{"name":"split_slow"},{"name":"trim"}]}"#,
        );

        let filter = TestFilter::empty().include("strings.").exclude("slow");
        let cases = plan(&TestPackage::new(vec![path]), &filter);
        let names: Vec<_> = cases.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["concat", "trim"]);
        assert!(cases.iter().all(|c| c.suite == "strings"));
    }

    #[test]
    fn test_plan_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "rel.json", r#"{"tests":[{"name":"found"}]}"#);

        let mut package = TestPackage::new(vec![PathBuf::from("rel.json")]);
        package.working_dir = Some(dir.path().to_path_buf());

        let cases = plan(&package, &TestFilter::empty());
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].full_name(), "rel.found");
    }

    #[test]
    fn test_unusable_manifest_yields_error_case() {
        let dir = tempfile::tempdir().unwrap();
        let broken = write(dir.path(), "broken.json", "{ not json");
        let missing = dir.path().join("missing.json");

        let cases = plan(
            &TestPackage::new(vec![broken.clone(), missing.clone()]),
            &TestFilter::empty().include("nothing matches this"),
        );
        assert_eq!(cases.len(), 2);
        assert!(cases.iter().all(|c| c.outcome == TestOutcome::Error));
        assert_eq!(cases[0].name, broken.display().to_string());
        assert_eq!(cases[1].name, missing.display().to_string());
        assert!(cases[1].message.is_some());
    }

    #[test]
    fn test_empty_package_plans_nothing() {
        assert!(plan(&TestPackage::new(vec![]), &TestFilter::empty()).is_empty());
    }
}
