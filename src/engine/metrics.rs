use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Process exited on its own; the exit code is the client's business.
    Closed,
    /// Spawn failure or compile failure.
    Failed,
    TimedOut,
    Killed,
    Superseded,
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    runs_started_total: AtomicU64,
    runs_rejected_total: AtomicU64,
    runs_closed_total: AtomicU64,
    runs_failed_total: AtomicU64,
    runs_timed_out_total: AtomicU64,
    runs_killed_total: AtomicU64,
    runs_superseded_total: AtomicU64,
    active_sessions: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) {
        self.runs_started_total.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rejected(&self) {
        self.runs_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finished(&self, outcome: SessionOutcome) {
        let counter = match outcome {
            SessionOutcome::Closed => &self.runs_closed_total,
            SessionOutcome::Failed => &self.runs_failed_total,
            SessionOutcome::TimedOut => &self.runs_timed_out_total,
            SessionOutcome::Killed => &self.runs_killed_total,
            SessionOutcome::Superseded => &self.runs_superseded_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.decrement_active();
    }

    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# TYPE coderun_runs_started_total counter\n",
                "coderun_runs_started_total {}\n",
                "# TYPE coderun_runs_rejected_total counter\n",
                "coderun_runs_rejected_total {}\n",
                "# TYPE coderun_runs_closed_total counter\n",
                "coderun_runs_closed_total {}\n",
                "# TYPE coderun_runs_failed_total counter\n",
                "coderun_runs_failed_total {}\n",
                "# TYPE coderun_runs_timed_out_total counter\n",
                "coderun_runs_timed_out_total {}\n",
                "# TYPE coderun_runs_killed_total counter\n",
                "coderun_runs_killed_total {}\n",
                "# TYPE coderun_runs_superseded_total counter\n",
                "coderun_runs_superseded_total {}\n",
                "# TYPE coderun_active_sessions gauge\n",
                "coderun_active_sessions {}\n"
            ),
            self.runs_started_total.load(Ordering::Relaxed),
            self.runs_rejected_total.load(Ordering::Relaxed),
            self.runs_closed_total.load(Ordering::Relaxed),
            self.runs_failed_total.load(Ordering::Relaxed),
            self.runs_timed_out_total.load(Ordering::Relaxed),
            self.runs_killed_total.load(Ordering::Relaxed),
            self.runs_superseded_total.load(Ordering::Relaxed),
            self.active_sessions.load(Ordering::Relaxed),
        )
    }

    fn decrement_active(&self) {
        let mut current = self.active_sessions.load(Ordering::Relaxed);
        while current > 0 {
            match self.active_sessions.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}
