//! Checklist progress of the implementation plan.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

static CHECKBOX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*]\s+\[([ xX])\]").expect("checkbox pattern is valid")
});

/// Completed and total checklist items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanProgress {
    pub total: u32,
    pub completed: u32,
}

impl PlanProgress {
    /// Count `- [ ]` / `- [x]` items (also with `*` bullets).
    #[must_use]
    pub fn parse(markdown: &str) -> Self {
        let mut progress = Self::default();
        for line in markdown.lines() {
            if let Some(caps) = CHECKBOX.captures(line) {
                progress.total += 1;
                if &caps[1] != " " {
                    progress.completed += 1;
                }
            }
        }
        progress
    }

    /// Read the plan file. A missing or unreadable file has no items.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!("Could not read plan file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// True when there is at least one item and every item is checked.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.completed == self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_counts_items() {
        let plan = "\
# Plan
- [x] tokenizer
- [X] parser
* [ ] code generator
  - [ ] nested item
- not a task
[x] missing bullet
";
        assert_eq!(
            PlanProgress::parse(plan),
            PlanProgress {
                total: 4,
                completed: 2
            }
        );
    }

    #[test]
    fn test_empty_plan_is_not_complete() {
        assert!(!PlanProgress::parse("# Nothing yet").is_complete());
    }

    #[test]
    fn test_all_checked_is_complete() {
        assert!(PlanProgress::parse("- [x] one\n- [x] two").is_complete());
        assert!(!PlanProgress::parse("- [x] one\n- [ ] two").is_complete());
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        assert_eq!(
            PlanProgress::load(&temp.path().join("IMPLEMENTATION_PLAN.md")),
            PlanProgress::default()
        );
    }

    #[test]
    fn test_load_from_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("IMPLEMENTATION_PLAN.md");
        std::fs::write(&path, "- [x] a\n- [ ] b\n").unwrap();
        assert_eq!(PlanProgress::load(&path).completed, 1);
    }
}
