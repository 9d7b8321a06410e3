use std::time::Duration;
use tokio::time::Instant;

use super::policy::ExecutionPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    TimedOut,
    StepLimitExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetCheck {
    Continue,
    Halt(HaltReason),
}

/// Step and wall-clock accounting for one session. Uses tokio's clock so
/// paused-time tests see the same deadline as the session loop.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    max_steps: u32,
    timeout: Duration,
    started_at: Instant,
    steps_taken: u32,
}

impl BudgetTracker {
    pub fn start(policy: &ExecutionPolicy) -> Self {
        Self {
            max_steps: policy.max_steps(),
            timeout: policy.timeout(),
            started_at: Instant::now(),
            steps_taken: 0,
        }
    }

    /// Counts a completed step, then checks the budget.
    pub fn record_step(&mut self) -> BudgetCheck {
        self.steps_taken = self.steps_taken.saturating_add(1);
        self.check()
    }

    /// Time first, then steps: a run that is both out of time and out of
    /// steps reports the timeout.
    pub fn check(&self) -> BudgetCheck {
        if self.elapsed() >= self.timeout {
            BudgetCheck::Halt(HaltReason::TimedOut)
        } else if self.steps_taken >= self.max_steps {
            BudgetCheck::Halt(HaltReason::StepLimitExceeded)
        } else {
            BudgetCheck::Continue
        }
    }

    pub fn steps_taken(&self) -> u32 {
        self.steps_taken
    }

    pub fn remaining_steps(&self) -> u32 {
        self.max_steps.saturating_sub(self.steps_taken)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn deadline(&self) -> Instant {
        self.started_at + self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max_steps: i64, timeout_ms: i64) -> BudgetTracker {
        BudgetTracker::start(&ExecutionPolicy::new(max_steps, timeout_ms, None, true, false).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_ceiling() {
        let mut budget = tracker(3, 60_000);
        assert_eq!(budget.check(), BudgetCheck::Continue);
        assert_eq!(budget.record_step(), BudgetCheck::Continue);
        assert_eq!(budget.record_step(), BudgetCheck::Continue);
        assert_eq!(budget.remaining_steps(), 1);
        assert_eq!(
            budget.record_step(),
            BudgetCheck::Halt(HaltReason::StepLimitExceeded)
        );
        assert_eq!(budget.steps_taken(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_checked_before_steps() {
        let mut budget = tracker(1, 5_000);
        tokio::time::advance(Duration::from_millis(5_000)).await;
        assert_eq!(budget.record_step(), BudgetCheck::Halt(HaltReason::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_start_plus_timeout() {
        let budget = tracker(5, 10_000);
        let start = Instant::now();
        assert_eq!(budget.deadline(), start + Duration::from_millis(10_000));
        tokio::time::advance(Duration::from_millis(9_999)).await;
        assert_eq!(budget.check(), BudgetCheck::Continue);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(budget.check(), BudgetCheck::Halt(HaltReason::TimedOut));
    }
}
