//! One admitted collaborator call.
//!
//! The dispatcher takes a budget reservation that has already been granted
//! and spends it on a single logical invocation: rate limiting, transient
//! retries with backoff, the per-invocation timeout, output validation and a
//! single fallback to the participant's backup. The reservation is settled
//! exactly once with the cost actually reported.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::agent::{
    CollaboratorRegistry, InvocationError, InvocationRequest, Participant, RawOutput,
};
use crate::audit::{EventLog, WorkflowEvent};
use crate::budget::{BudgetGovernor, RateLimiter, Reservation};
use crate::errors::ErrorKind;

/// Retries after a transient failure, per candidate.
pub const DEFAULT_TRANSIENT_RETRIES: u32 = 2;

/// Why a dispatch produced no usable output.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchFailure {
    #[error("{0}")]
    AgentFailure(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl DispatchFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchFailure::AgentFailure(_) => ErrorKind::AgentFailure,
            DispatchFailure::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

/// Validated output and who produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched<T> {
    pub value: T,
    pub served_by: String,
    pub cost: f64,
}

/// Result of trying one candidate.
enum Attempt<T> {
    Served(T),
    /// Move on to the backup, if any.
    FallBack(String),
    TimedOut(Duration),
}

#[derive(Debug)]
pub struct Dispatcher {
    registry: CollaboratorRegistry,
    limiter: Arc<RateLimiter>,
    budget: Arc<BudgetGovernor>,
    events: Arc<EventLog>,
    transient_retries: u32,
}

impl Dispatcher {
    pub fn new(
        registry: CollaboratorRegistry,
        limiter: Arc<RateLimiter>,
        budget: Arc<BudgetGovernor>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            registry,
            limiter,
            budget,
            events,
            transient_retries: DEFAULT_TRANSIENT_RETRIES,
        }
    }

    pub fn with_transient_retries(mut self, retries: u32) -> Self {
        self.transient_retries = retries;
        self
    }

    pub fn registry(&self) -> &CollaboratorRegistry {
        &self.registry
    }

    /// Invoke `request.participant`, falling back to its backup once.
    ///
    /// `parse` validates the raw output; a validation failure counts as an
    /// agent failure. A timeout is returned as-is without trying the backup.
    pub async fn invoke<T, P>(
        &self,
        request: InvocationRequest,
        reservation: Reservation,
        parse: P,
    ) -> Result<Dispatched<T>, DispatchFailure>
    where
        P: Fn(&RawOutput) -> Result<T, String>,
    {
        let Some(primary) = self.registry.get(&request.participant) else {
            self.settle(&request, &reservation, 0.0);
            return Err(DispatchFailure::AgentFailure(format!(
                "participant '{}' is not registered",
                request.participant
            )));
        };

        let mut candidates: Vec<&Participant> = vec![primary];
        if let Some(backup) = self.registry.backup_of(&request.participant) {
            candidates.push(backup);
        }

        let mut cost = 0.0;
        let mut failures = Vec::new();
        let mut outcome = None;
        for candidate in candidates {
            let id = candidate.collaborator.id().to_string();
            match self.attempt(candidate, &request, &parse, &mut cost).await {
                Attempt::Served(value) => {
                    outcome = Some(Ok(Dispatched {
                        value,
                        served_by: id,
                        cost: 0.0,
                    }));
                    break;
                }
                Attempt::TimedOut(limit) => {
                    outcome = Some(Err(DispatchFailure::Timeout(limit)));
                    break;
                }
                Attempt::FallBack(reason) => {
                    warn!(
                        participant = %request.participant,
                        collaborator = %id,
                        reason = %reason,
                        "Collaborator failed"
                    );
                    failures.push(format!("{}: {}", id, reason));
                }
            }
        }

        let charged = self.settle(&request, &reservation, cost);
        match outcome {
            Some(Ok(mut dispatched)) => {
                dispatched.cost = charged;
                Ok(dispatched)
            }
            Some(Err(e)) => Err(e),
            None => Err(DispatchFailure::AgentFailure(failures.join("; "))),
        }
    }

    async fn attempt<T, P>(
        &self,
        candidate: &Participant,
        request: &InvocationRequest,
        parse: &P,
        cost: &mut f64,
    ) -> Attempt<T>
    where
        P: Fn(&RawOutput) -> Result<T, String>,
    {
        let backoff = self.limiter.backoff();
        let limit = request.timeout();
        let mut transient = 0u32;

        loop {
            let result = match self.limiter.acquire(&candidate.channel).await {
                Err(e) => Err(InvocationError::Transient(e.to_string())),
                Ok(()) => match tokio::time::timeout(limit, candidate.collaborator.invoke(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(InvocationError::Timeout(limit)),
                },
            };

            match result {
                Ok(raw) => {
                    *cost += raw.cost_usd.unwrap_or(0.0);
                    return match parse(&raw) {
                        Ok(value) => Attempt::Served(value),
                        Err(message) => Attempt::FallBack(format!("malformed output: {}", message)),
                    };
                }
                Err(InvocationError::Timeout(after)) => return Attempt::TimedOut(after),
                Err(InvocationError::Failed(message)) => return Attempt::FallBack(message),
                Err(InvocationError::Transient(message)) => {
                    if transient >= self.transient_retries {
                        return Attempt::FallBack(format!(
                            "transient failures persisted after {} retries: {}",
                            transient, message
                        ));
                    }
                    let delay = backoff.delay(transient);
                    debug!(
                        participant = %request.participant,
                        attempt = transient,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    transient += 1;
                }
            }
        }
    }

    /// Settle the reservation and log the spend. Returns the amount recorded.
    fn settle(&self, request: &InvocationRequest, reservation: &Reservation, cost: f64) -> f64 {
        let charged = match self.budget.settle(reservation, cost) {
            Ok(charged) => charged,
            Err(e) => {
                error!(participant = %request.participant, error = %e, "Failed to settle reservation");
                return 0.0;
            }
        };
        let project_spent = self.budget.project_spent().unwrap_or(0.0);
        if let Err(e) = self.events.append(WorkflowEvent::Spend {
            phase: request.phase,
            participant: request.participant.clone(),
            amount: charged,
            project_spent,
        }) {
            warn!(error = %e, "Failed to record spend event");
        }
        charged
    }
}
