//! Task manifest and pattern-based overrides.
//!
//! ```toml
//! [[task]]
//! name = "Copy.Basic"
//! executable = "test_copy"
//! args = ["--gtest_filter=Copy.Basic*"]
//!
//! [overrides."*"]
//! timeout_secs = 300
//!
//! [overrides."Copy.*"]
//! timeout_secs = 900
//! ```
//!
//! Settings are applied from most general to most specific: the configured
//! default timeout, the `"*"` entry, the task's own fields, wildcard patterns
//! (fewer literal characters first), then an exact-name entry.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const TASKS_FILE: &str = "tasks.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskEntry>,

    #[serde(default)]
    pub overrides: BTreeMap<String, Override>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskEntry {
    pub name: String,
    /// Relative to the binary directory
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Override {
    /// 0 disables the timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub skip: Option<bool>,
}

/// A task with every override applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTask {
    pub name: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
    pub skip: bool,
}

impl ResolvedTask {
    fn apply(&mut self, rule: &Override) {
        if let Some(secs) = rule.timeout_secs {
            self.timeout = timeout_from_secs(secs);
        }
        if let Some(args) = &rule.args {
            self.args.clone_from(args);
        }
        if let Some(skip) = rule.skip {
            self.skip = skip;
        }
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read task manifest: {}", path.display()))?;
        let manifest: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse task manifest: {}", path.display()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.name.as_str()) {
                bail!("Task '{}' is listed more than once", task.name);
            }
        }
        Ok(())
    }

    /// Resolves every task against the overrides, in manifest order.
    pub fn resolve(&self, default_timeout: Option<Duration>) -> Vec<ResolvedTask> {
        let mut wildcards: Vec<(&str, &Override)> = self
            .overrides
            .iter()
            .filter(|(pattern, _)| pattern.contains('*') && pattern.as_str() != "*")
            .map(|(pattern, rule)| (pattern.as_str(), rule))
            .collect();
        wildcards.sort_by_key(|(pattern, _)| pattern.chars().filter(|c| *c != '*').count());

        self.tasks
            .iter()
            .map(|entry| {
                let mut task = ResolvedTask {
                    name: entry.name.clone(),
                    executable: entry.executable.clone(),
                    args: Vec::new(),
                    timeout: default_timeout,
                    skip: false,
                };
                if let Some(rule) = self.overrides.get("*") {
                    task.apply(rule);
                }
                if !entry.args.is_empty() {
                    task.args.clone_from(&entry.args);
                }
                if let Some(secs) = entry.timeout_secs {
                    task.timeout = timeout_from_secs(secs);
                }
                for (pattern, rule) in &wildcards {
                    if matches(pattern, &entry.name) {
                        task.apply(rule);
                    }
                }
                if let Some(rule) = self.overrides.get(&entry.name) {
                    task.apply(rule);
                }
                task
            })
            .collect()
    }
}

fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Whole-string match where `*` matches any run of characters.
pub fn matches(pattern: &str, name: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return name.is_empty();
    };
    let Some(mut rest) = name.strip_prefix(first) else {
        return false;
    };

    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        // No '*' at all
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(index) => rest = &rest[index + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
[[task]]
name = "Copy.Basic"
executable = "test_copy"
args = ["--gtest_filter=Copy.Basic*"]

[[task]]
name = "Copy.Large"
executable = "test_copy"
timeout_secs = 60

[[task]]
name = "Event.Signal"
executable = "test_event"

[overrides."*"]
timeout_secs = 300

[overrides."Copy.*"]
timeout_secs = 900

[overrides."Copy.L*"]
args = ["--large"]

[overrides."Event.Signal"]
skip = true
"#;

    fn resolved() -> Vec<ResolvedTask> {
        let manifest: Manifest = toml::from_str(MANIFEST).unwrap();
        manifest.resolve(Some(Duration::from_secs(600)))
    }

    #[test]
    fn test_matches() {
        assert!(matches("*", "anything"));
        assert!(matches("*", ""));
        assert!(matches("Copy.*", "Copy.Basic"));
        assert!(matches("*.Basic", "Copy.Basic"));
        assert!(matches("C*y.*c", "Copy.Basic"));
        assert!(matches("Copy.Basic", "Copy.Basic"));
        assert!(!matches("Copy.Basic", "Copy.Basics"));
        assert!(!matches("Copy.*", "Event.Copy"));
        assert!(!matches("*ab*ab", "xab"));
        assert!(matches("a*a", "aa"));
        assert!(!matches("a*a", "a"));
    }

    #[test]
    fn test_star_applies_to_everything() {
        let tasks = resolved();
        assert_eq!(tasks[2].timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_wildcard_beats_star_and_task_fields() {
        let tasks = resolved();
        assert_eq!(tasks[0].timeout, Some(Duration::from_secs(900)));
        assert_eq!(tasks[1].timeout, Some(Duration::from_secs(900)));
        assert_eq!(tasks[0].args, vec!["--gtest_filter=Copy.Basic*"]);
    }

    #[test]
    fn test_more_specific_wildcard_applies_last() {
        let tasks = resolved();
        assert_eq!(tasks[1].args, vec!["--large"]);
    }

    #[test]
    fn test_exact_override() {
        let tasks = resolved();
        assert!(tasks[2].skip);
        assert!(!tasks[0].skip);
    }

    #[test]
    fn test_zero_timeout_disables_deadline() {
        let manifest: Manifest = toml::from_str(
            r#"
[[task]]
name = "Soak"
executable = "soak"

[overrides.Soak]
timeout_secs = 0
"#,
        )
        .unwrap();
        let tasks = manifest.resolve(Some(Duration::from_secs(600)));
        assert_eq!(tasks[0].timeout, None);
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TASKS_FILE);
        fs::write(
            &path,
            "[[task]]\nname = \"A\"\nexecutable = \"a\"\n[[task]]\nname = \"A\"\nexecutable = \"b\"\n",
        )
        .unwrap();
        let err = Manifest::load(&path).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_missing_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Manifest::load(&dir.path().join(TASKS_FILE)).is_err());
    }
}
