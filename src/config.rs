use std::time::Duration;

/// How long a gated step waits for its decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalWaitPolicy {
    /// Park until a decision arrives, however long that takes.
    KeepWaiting,
    /// Fail the waiting step once the duration elapses.
    FailAfter(Duration),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkConfig {
    StdOut,
}

/// Engine-wide configuration.
///
/// Defaults resolve from the environment (via dotenv) so deployments can
/// tune limits without code changes:
///
/// - `GREENLIGHT_FANOUT_LIMIT`: default fan-out concurrency bound
/// - `GREENLIGHT_APPROVAL_TIMEOUT_SECS`: switches the wait policy to
///   `FailAfter` of that many seconds
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub sinks: Vec<SinkConfig>,
    /// Bound on in-flight fan-out operations per batch. `None` is unbounded.
    pub default_concurrency_limit: Option<usize>,
    pub approval_wait: ApprovalWaitPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sinks: Vec::new(),
            default_concurrency_limit: Self::resolve_concurrency_limit(),
            approval_wait: Self::resolve_wait_policy(),
        }
    }
}

impl EngineConfig {
    fn resolve_concurrency_limit() -> Option<usize> {
        dotenvy::dotenv().ok();
        std::env::var("GREENLIGHT_FANOUT_LIMIT")
            .ok()
            .and_then(|raw| raw.parse().ok())
    }

    fn resolve_wait_policy() -> ApprovalWaitPolicy {
        dotenvy::dotenv().ok();
        std::env::var("GREENLIGHT_APPROVAL_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .map(|secs| ApprovalWaitPolicy::FailAfter(Duration::from_secs(secs)))
            .unwrap_or(ApprovalWaitPolicy::KeepWaiting)
    }

    #[must_use]
    pub fn with_stdout_sink(mut self) -> Self {
        if !self.sinks.contains(&SinkConfig::StdOut) {
            self.sinks.push(SinkConfig::StdOut);
        }
        self
    }

    #[must_use]
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.default_concurrency_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_approval_wait(mut self, policy: ApprovalWaitPolicy) -> Self {
        self.approval_wait = policy;
        self
    }
}
