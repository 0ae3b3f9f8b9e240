//! Real implementations of the collaborator traits.
//!
//! These use the system clock, git, and the terminal. They implement the same
//! traits as the mocks, enabling dependency injection.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::testing::{ChangeDetector, Clock, OperatorChoice, OperatorPrompt};

/// Wall clock backed by tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Change detection through git.
///
/// The marker is the `HEAD` commit hash (empty outside a repository).
#[derive(Debug, Clone)]
pub struct GitChangeDetector {
    project_dir: PathBuf,
}

impl GitChangeDetector {
    #[must_use]
    pub fn new(project_dir: PathBuf) -> Self {
        Self { project_dir }
    }

    fn git_lines(&self, args: &[&str]) -> Vec<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.project_dir)
            .output();

        match output {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
            Ok(out) => {
                debug!(
                    "git {} failed: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                Vec::new()
            }
            Err(e) => {
                debug!("Failed to run git {}: {}", args.join(" "), e);
                Vec::new()
            }
        }
    }
}

impl ChangeDetector for GitChangeDetector {
    fn marker(&self) -> String {
        self.git_lines(&["rev-parse", "HEAD"])
            .into_iter()
            .next()
            .unwrap_or_default()
    }

    fn changed_files_since(&self, marker: &str) -> u32 {
        let mut files: BTreeSet<String> = BTreeSet::new();
        files.extend(self.git_lines(&["diff", "--name-only"]));
        files.extend(self.git_lines(&["diff", "--name-only", "--cached"]));
        if !marker.is_empty() {
            files.extend(self.git_lines(&["diff", "--name-only", marker, "HEAD"]));
        }
        debug!("{} file(s) changed since {}", files.len(), marker);
        files.len() as u32
    }
}

/// Asks the operator on the terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinOperatorPrompt;

/// Interpret an operator's answer.
fn parse_choice(answer: &str) -> OperatorChoice {
    match answer.trim().to_lowercase().as_str() {
        "1" | "w" | "wait" | "y" | "yes" => OperatorChoice::Wait,
        "2" | "x" | "exit" | "n" | "no" | "q" | "quit" => OperatorChoice::Exit,
        _ => OperatorChoice::NoResponse,
    }
}

#[async_trait]
impl OperatorPrompt for StdinOperatorPrompt {
    async fn api_limit_choice(&self, timeout: Duration) -> OperatorChoice {
        eprintln!();
        eprintln!("{}", "The API usage limit has been reached.".yellow().bold());
        eprintln!("  {} wait for the limit to reset and continue", "1)".cyan());
        eprintln!("  {} exit now", "2)".cyan());
        eprintln!(
            "{}",
            format!("No answer within {}s exits.", timeout.as_secs()).dimmed()
        );

        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        match tokio::time::timeout(timeout, stdin.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 => parse_choice(&line),
            _ => OperatorChoice::NoResponse,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_choice() {
        assert_eq!(parse_choice("1\n"), OperatorChoice::Wait);
        assert_eq!(parse_choice(" wait "), OperatorChoice::Wait);
        assert_eq!(parse_choice("2"), OperatorChoice::Exit);
        assert_eq!(parse_choice("EXIT"), OperatorChoice::Exit);
        assert_eq!(parse_choice("maybe"), OperatorChoice::NoResponse);
    }

    #[test]
    fn test_outside_repository_counts_nothing() {
        let temp = TempDir::new().unwrap();
        let detector = GitChangeDetector::new(temp.path().to_path_buf());
        let marker = detector.marker();
        assert_eq!(detector.changed_files_since(&marker), 0);
    }

    #[tokio::test]
    async fn test_system_clock_sleep() {
        let before = SystemClock.now();
        SystemClock.sleep(Duration::from_millis(5)).await;
        assert!(SystemClock.now() >= before);
    }
}
