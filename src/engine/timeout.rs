use std::{pin::Pin, time::Duration};

use tokio::time::Sleep;

/// Wall-clock budget for a whole session, compile stage included.
///
/// The guard is armed once and polled from the session task. Dropping it (or calling
/// [`TimeoutGuard::disarm`]) cancels the deadline; both consume the guard, so a finished
/// session can never fire a late timeout at an already reaped process.
pub struct TimeoutGuard {
    budget: Duration,
    sleep: Pin<Box<Sleep>>,
    fired: bool,
}

impl TimeoutGuard {
    pub fn arm(budget: Duration) -> Self {
        Self {
            budget,
            sleep: Box::pin(tokio::time::sleep(budget)),
            fired: false,
        }
    }

    /// Resolves when the deadline passes. Pending forever once it has already fired.
    pub async fn expired(&mut self) {
        if self.fired {
            std::future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.fired = true;
    }

    pub fn message(&self) -> String {
        if self.budget.subsec_millis() == 0 {
            format!("Process timed out after {} seconds", self.budget.as_secs())
        } else {
            format!(
                "Process timed out after {} milliseconds",
                self.budget.as_millis()
            )
        }
    }

    pub fn disarm(self) {}
}
