//! Collaborator abstractions and their test doubles.
//!
//! - **Traits**: the agent process, change detection, the clock, the operator
//! - **Mocks**: controllable implementations for deterministic tests
//!
//! # Example
//!
//! ```rust,ignore
//! use ralph_loop::testing::{MockAgentProcess, MockChangeDetector, MockClock};
//!
//! let clock = MockClock::at("2025-03-01T10:00:00Z");
//! let changes = MockChangeDetector::new().with_changes(vec![2, 0, 0]);
//! let agent = MockAgentProcess::new().with_run(AgentRun::exited(0, "ok"));
//! ```

pub mod mocks;
pub mod traits;

pub use mocks::*;
pub use traits::*;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_mock_clock_sleep_advances_time() {
        let clock = MockClock::at("2025-03-01T10:00:00Z");
        clock.sleep(Duration::from_secs(90)).await;
        assert_eq!(clock.now().to_rfc3339(), "2025-03-01T10:01:30+00:00");
        assert_eq!(clock.total_slept(), Duration::from_secs(90));
    }

    #[test]
    fn test_mock_change_detector_script_then_fallback() {
        let changes = MockChangeDetector::new()
            .with_changes(vec![3, 0])
            .with_fallback(1);
        assert_eq!(changes.changed_files_since("m"), 3);
        assert_eq!(changes.changed_files_since("m"), 0);
        assert_eq!(changes.changed_files_since("m"), 1);
    }

    #[tokio::test]
    async fn test_mock_agent_records_requests() {
        let agent = MockAgentProcess::new()
            .with_run(AgentRun::exited(1, "boom"))
            .with_spawn_error("not installed");
        let request = AgentRequest {
            loop_number: 1,
            prompt: "go".into(),
            continuity_token: Some("tok".into()),
            timeout: Duration::from_secs(60),
        };

        let first = agent.run(&request).await.unwrap();
        assert_eq!(first.exit_code, Some(1));
        assert!(agent.run(&request).await.is_err());
        // Script exhausted: fallback is a clean exit
        assert!(agent.run(&request).await.unwrap().succeeded());
        assert_eq!(agent.call_count(), 3);
        assert_eq!(
            agent.requests()[0].continuity_token.as_deref(),
            Some("tok")
        );
    }

    #[tokio::test]
    async fn test_mock_operator_choices() {
        let operator =
            MockOperatorPrompt::new(OperatorChoice::Exit).with_choices(vec![OperatorChoice::Wait]);
        let timeout = Duration::from_secs(1);
        assert_eq!(operator.api_limit_choice(timeout).await, OperatorChoice::Wait);
        assert_eq!(operator.api_limit_choice(timeout).await, OperatorChoice::Exit);
    }

    #[test]
    fn test_agent_run_success_requires_zero_exit() {
        assert!(AgentRun::exited(0, "").succeeded());
        assert!(!AgentRun::exited(2, "").succeeded());
        assert!(!AgentRun::timed_out(Duration::from_secs(5), "").succeeded());
    }
}
