//! Approval broker: the asynchronous request/response channel used to
//! unblock governance exceptions and risky patches.
//!
//! A request is persisted with `status = pending`, emitted to the
//! configured notification channels and then awaited. Resolution
//! arrives from one of three places: an explicit response (first
//! wins; duplicates are logged and ignored), the timeout sweeper
//! (which applies `default_on_timeout`), or cancellation when the
//! enclosing phase terminates. All waiters on the same request observe
//! the same outcome, and a request resolves at most once; a
//! conditional single-statement update in the store enforces this.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ApprovalDefault;
use crate::store::Store;

/// What kind of decision is being escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalKind {
    RiskyPatch,
    AmbiguousDecision,
    GovernanceException,
    DeletionThreshold,
}

impl ApprovalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalKind::RiskyPatch => "risky-patch",
            ApprovalKind::AmbiguousDecision => "ambiguous-decision",
            ApprovalKind::GovernanceException => "governance-exception",
            ApprovalKind::DeletionThreshold => "deletion-threshold",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
    Errored,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::TimedOut => "timed-out",
            ApprovalStatus::Errored => "errored",
        }
    }
}

/// The durable approval request record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub run_id: String,
    pub phase_id: String,
    pub kind: ApprovalKind,
    pub summary: String,
    pub evidence: String,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub default_on_timeout: ApprovalDefault,
    pub status: ApprovalStatus,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub error_reason: Option<String>,
    /// Opaque metadata for the notification channel's reply routing
    pub response_channel_metadata: Option<serde_json::Value>,
}

impl ApprovalRequest {
    pub fn new(
        run_id: &str,
        phase_id: &str,
        kind: ApprovalKind,
        summary: impl Into<String>,
        evidence: impl Into<String>,
        timeout: Duration,
        default_on_timeout: ApprovalDefault,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            phase_id: phase_id.to_string(),
            kind,
            summary: summary.into(),
            evidence: evidence.into(),
            created_at: now,
            timeout_at: now + timeout,
            default_on_timeout,
            status: ApprovalStatus::Pending,
            decided_by: None,
            decided_at: None,
            error_reason: None,
            response_channel_metadata: None,
        }
    }

    /// The effective yes/no of a resolved request.
    pub fn effective_approval(&self) -> bool {
        match self.status {
            ApprovalStatus::Approved => true,
            ApprovalStatus::TimedOut => self.default_on_timeout == ApprovalDefault::Approve,
            ApprovalStatus::Pending | ApprovalStatus::Rejected | ApprovalStatus::Errored => false,
        }
    }
}

/// A decision pushed in through the approval ingress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub request_id: String,
    pub approve: bool,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

/// What a waiter receives once the request resolves.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalOutcome {
    pub request_id: String,
    pub approved: bool,
    pub status: ApprovalStatus,
    pub decided_by: Option<String>,
}

impl ApprovalOutcome {
    fn from_request(request: &ApprovalRequest) -> Self {
        Self {
            request_id: request.request_id.clone(),
            approved: request.effective_approval(),
            status: request.status,
            decided_by: request.decided_by.clone(),
        }
    }
}

/// External notification sink. Channel failures are recorded but never
/// change the pending status.
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;
    fn notify(&self, request: &ApprovalRequest) -> Result<()>;
}

type WaiterMap = Mutex<HashMap<String, watch::Sender<Option<ApprovalOutcome>>>>;

/// The broker.
pub struct ApprovalBroker {
    store: Arc<Store>,
    channels: Vec<Arc<dyn NotificationChannel>>,
    waiters: WaiterMap,
    /// Waiter poll fallback; also the sweeper cadence in
    /// [`ApprovalBroker::spawn_sweeper`]
    sweep_interval: std::time::Duration,
}

impl ApprovalBroker {
    pub fn new(
        store: Arc<Store>,
        channels: Vec<Arc<dyn NotificationChannel>>,
        sweep_interval: std::time::Duration,
    ) -> Self {
        Self {
            store,
            channels,
            waiters: Mutex::new(HashMap::new()),
            sweep_interval,
        }
    }

    fn notify_channels(&self, request: &ApprovalRequest) {
        for channel in &self.channels {
            if let Err(e) = channel.notify(request) {
                warn!(
                    channel = channel.name(),
                    request_id = %request.request_id,
                    error = %e,
                    "notification channel failed"
                );
            }
        }
    }

    /// Persist and emit a request, then wait for its resolution.
    pub async fn request(&self, request: ApprovalRequest) -> Result<ApprovalOutcome> {
        let request_id = request.request_id.clone();
        self.store
            .insert_approval(&request)
            .context("Failed to persist approval request")?;
        self.notify_channels(&request);
        debug!(request_id = %request_id, kind = request.kind.as_str(), "approval request created");

        self.wait_for(&request_id).await
    }

    /// Wait for an already-persisted request to resolve.
    pub async fn wait_for(&self, request_id: &str) -> Result<ApprovalOutcome> {
        let mut rx = {
            let mut waiters = self.waiters.lock().expect("waiter lock poisoned");
            let tx = waiters
                .entry(request_id.to_string())
                .or_insert_with(|| watch::channel(None).0);
            tx.subscribe()
        };

        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return Ok(outcome);
            }

            // The resolution may have landed in the store from another
            // process; the poll fallback picks it up.
            if let Some(stored) = self.store.get_approval(request_id)? {
                if stored.status != ApprovalStatus::Pending {
                    let outcome = ApprovalOutcome::from_request(&stored);
                    self.wake(request_id, &outcome);
                    return Ok(outcome);
                }
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Sender dropped without a value; fall back to
                        // the store on the next iteration.
                        tokio::time::sleep(self.sweep_interval).await;
                    }
                }
                _ = tokio::time::sleep(self.sweep_interval) => {}
            }
        }
    }

    fn wake(&self, request_id: &str, outcome: &ApprovalOutcome) {
        let mut waiters = self.waiters.lock().expect("waiter lock poisoned");
        if let Some(tx) = waiters.remove(request_id) {
            let _ = tx.send(Some(outcome.clone()));
        }
    }

    /// Approval ingress: apply an explicit decision. Returns `false`
    /// when the request was already resolved (the duplicate is logged
    /// and ignored).
    pub fn submit_response(&self, response: &ApprovalResponse) -> Result<bool> {
        let Some(mut request) = self.store.get_approval(&response.request_id)? else {
            anyhow::bail!("Unknown approval request: {}", response.request_id);
        };
        if request.status != ApprovalStatus::Pending {
            debug!(
                request_id = %response.request_id,
                status = request.status.as_str(),
                "duplicate approval response ignored"
            );
            return Ok(false);
        }

        request.status = if response.approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        request.decided_by = Some(response.actor.clone());
        request.decided_at = Some(response.timestamp);

        let won = self.store.resolve_approval(&request)?;
        if won {
            let outcome = ApprovalOutcome::from_request(&request);
            self.wake(&request.request_id, &outcome);
            self.notify_channels(&request);
        }
        Ok(won)
    }

    /// One sweeper pass: resolve pending requests past their timeout
    /// with `default_on_timeout`, and wake waiters whose requests were
    /// resolved externally. Returns how many requests were timed out.
    pub fn sweep_once(&self) -> Result<usize> {
        let now = Utc::now();
        let mut timed_out = 0;

        for mut request in self.store.pending_past_timeout(now)? {
            request.status = ApprovalStatus::TimedOut;
            request.decided_at = Some(now);
            if self.store.resolve_approval(&request)? {
                timed_out += 1;
                let outcome = ApprovalOutcome::from_request(&request);
                debug!(
                    request_id = %request.request_id,
                    default = %request.default_on_timeout,
                    "approval request timed out"
                );
                self.wake(&request.request_id, &outcome);
                self.notify_channels(&request);
            }
        }

        // Externally-resolved requests (e.g. a CLI decision written
        // straight to the store) still have in-process waiters.
        let waiting: Vec<String> = {
            let waiters = self.waiters.lock().expect("waiter lock poisoned");
            waiters.keys().cloned().collect()
        };
        for request_id in waiting {
            if let Some(stored) = self.store.get_approval(&request_id)? {
                if stored.status != ApprovalStatus::Pending {
                    let outcome = ApprovalOutcome::from_request(&stored);
                    self.wake(&request_id, &outcome);
                }
            }
        }

        Ok(timed_out)
    }

    /// Background sweeper at bounded cadence.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(self);
        let interval = broker.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = broker.sweep_once() {
                    warn!(error = %e, "approval sweeper pass failed");
                }
            }
        })
    }

    /// Cancel every pending request of a phase that terminated.
    pub fn cancel_phase(&self, run_id: &str, phase_id: &str, reason: &str) -> Result<usize> {
        let mut cancelled = 0;
        for mut request in self.store.pending_for_phase(run_id, phase_id)? {
            request.status = ApprovalStatus::Errored;
            request.error_reason = Some(reason.to_string());
            request.decided_at = Some(Utc::now());
            if self.store.resolve_approval(&request)? {
                cancelled += 1;
                self.wake(
                    &request.request_id,
                    &ApprovalOutcome::from_request(&request),
                );
            }
        }
        Ok(cancelled)
    }

    /// Cancel every pending request of a run (abort path).
    pub fn cancel_run(&self, run_id: &str, reason: &str) -> Result<usize> {
        let mut cancelled = 0;
        for mut request in self.store.pending_for_run(run_id)? {
            request.status = ApprovalStatus::Errored;
            request.error_reason = Some(reason.to_string());
            request.decided_at = Some(Utc::now());
            if self.store.resolve_approval(&request)? {
                cancelled += 1;
                self.wake(
                    &request.request_id,
                    &ApprovalOutcome::from_request(&request),
                );
            }
        }
        Ok(cancelled)
    }
}
