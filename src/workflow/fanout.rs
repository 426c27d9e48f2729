//! Bounded fan-out / fan-in.
//!
//! Every unit runs as its own task behind a semaphore permit and reports into
//! a channel. The join waits for the full cohort; when the phase deadline
//! passes, the remaining units are cancelled cooperatively and reported as
//! [`UnitOutcome::Cancelled`] instead of blocking the join.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of one fan-out unit.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome<T> {
    Completed(T),
    /// Cancelled by the phase deadline or the caller before finishing.
    Cancelled,
}

/// Runs a cohort of units with bounded parallelism.
#[derive(Debug, Clone)]
pub struct FanOut {
    max_parallel: usize,
    phase_timeout: Option<Duration>,
}

impl FanOut {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            phase_timeout: None,
        }
    }

    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = Some(timeout);
        self
    }

    /// Run every unit and return their outcomes in input order.
    ///
    /// Cancelling `cancel` cancels every unit still pending.
    pub async fn run<T, F>(
        &self,
        units: Vec<(String, F)>,
        cancel: &CancellationToken,
    ) -> Vec<(String, UnitOutcome<T>)>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let count = units.len();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let phase_token = cancel.child_token();
        let (result_tx, mut result_rx) = mpsc::channel::<(usize, UnitOutcome<T>)>(count.max(1));

        let mut ids = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for (index, (id, work)) in units.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let token = phase_token.child_token();
            let result_tx = result_tx.clone();
            let unit = id.clone();
            ids.push(id);

            handles.push(tokio::spawn(async move {
                let outcome = tokio::select! {
                    biased;
                    _ = token.cancelled() => UnitOutcome::Cancelled,
                    outcome = async {
                        match semaphore.acquire_owned().await {
                            Ok(_permit) => UnitOutcome::Completed(work.await),
                            Err(_) => UnitOutcome::Cancelled,
                        }
                    } => outcome,
                };
                if matches!(outcome, UnitOutcome::Cancelled) {
                    debug!(unit = %unit, "Fan-out unit cancelled");
                }
                result_tx.send((index, outcome)).await.ok();
            }));
        }
        drop(result_tx);

        let deadline = self.phase_timeout;
        let expired = async move {
            match deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::pin!(expired);

        let mut results: Vec<Option<UnitOutcome<T>>> = (0..count).map(|_| None).collect();
        let mut timed_out = false;
        loop {
            tokio::select! {
                next = result_rx.recv() => match next {
                    Some((index, outcome)) => results[index] = Some(outcome),
                    None => break,
                },
                _ = &mut expired, if !timed_out => {
                    timed_out = true;
                    warn!(
                        pending = results.iter().filter(|r| r.is_none()).count(),
                        "Phase timeout reached, cancelling pending units"
                    );
                    phase_token.cancel();
                }
            }
        }

        for joined in futures::future::join_all(handles).await {
            if let Err(e) = joined {
                warn!(error = %e, "Fan-out unit aborted");
            }
        }

        ids.into_iter()
            .zip(results)
            .map(|(id, outcome)| (id, outcome.unwrap_or(UnitOutcome::Cancelled)))
            .collect()
    }
}
