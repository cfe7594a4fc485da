//! Escalation and suspension management
//!
//! An escalation is a suspended decision point: a recorded question, a
//! timeout, and a resume condition. The run parks while one is pending and
//! resumes later with injected data - a first-class, restart-safe state, not
//! an in-process blocking wait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::types::{EscalationId, MessageId, SideEffect, TaskId};
use crate::worker::WorkerError;

/// Lifecycle status of an escalation
///
/// `pending --timeout--> timed-out`; `timed-out --reminder--> reminder-sent`
/// (at most once); any non-resolved state `--response--> resolved`. `abort`
/// moves pending escalations to `cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EscalationStatus {
    Pending,
    Resolved,
    TimedOut,
    ReminderSent,
    Cancelled,
}

/// Why an escalation was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EscalationReason {
    /// Comparison classified as warned; needs sign-off before finalizing
    DiscrepancyWarned,
    /// Comparison beyond tolerance
    DiscrepancyExceeded,
    /// Verification read back different totals than generation declared
    GenerationVerificationMismatch,
    /// A worker signalled it cannot proceed without human input
    NeedsInput,
    /// A non-idempotent task may have partially applied
    DuplicateRisk,
    /// Transient failures exhausted every retry
    RetriesExhausted,
}

/// A suspended decision point awaiting external input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: EscalationId,
    pub reason: EscalationReason,
    /// Free-form context shown to the human responder
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub timeout: Duration,
    pub status: EscalationStatus,
    /// When the current wait expires
    pub deadline: DateTime<Utc>,
    /// Set once the single reminder has gone out
    pub reminder_sent: bool,
    /// Message id from the human-input channel
    pub message_id: Option<MessageId>,
    /// Discrepancy subject this escalation is attached to, if any
    pub subject: Option<String>,
    /// Task that triggered the escalation, if any
    pub task: Option<TaskId>,
    resume_payload: Option<serde_json::Value>,
}

impl Escalation {
    /// Whether this escalation still blocks finalization
    pub fn blocks_finalize(&self) -> bool {
        matches!(
            self.status,
            EscalationStatus::Pending | EscalationStatus::ReminderSent | EscalationStatus::TimedOut
        )
    }

    /// Inject the external response. Fails if already resolved; the payload
    /// is stored for exactly one later application via
    /// [`take_resume_payload`](Self::take_resume_payload).
    pub fn resolve(&mut self, payload: serde_json::Value) -> Result<(), EngineError> {
        match self.status {
            EscalationStatus::Resolved => Err(EngineError::AlreadyResolved(self.id)),
            EscalationStatus::Cancelled => Err(EngineError::InvalidTransition {
                state: crate::types::RunState::Aborted,
                action: "resolve cancelled escalation",
            }),
            _ => {
                self.status = EscalationStatus::Resolved;
                self.resume_payload = Some(payload);
                Ok(())
            }
        }
    }

    /// Take the resume payload for application to workflow state.
    ///
    /// Returns `Some` exactly once per resolution.
    pub fn take_resume_payload(&mut self) -> Option<serde_json::Value> {
        self.resume_payload.take()
    }

    /// Cancel a still-open escalation (abort path)
    pub fn cancel(&mut self) {
        if self.blocks_finalize() {
            self.status = EscalationStatus::Cancelled;
        }
    }
}

/// Human-input channel contract (e.g. email)
///
/// Modeled as send-then-poll: the manager records the message id and checks
/// deadlines on each `advance`, even if the real channel is asynchronous.
#[async_trait]
pub trait HumanChannel: Send + Sync {
    /// Deliver an escalation question; returns the channel's message id
    async fn send(
        &self,
        recipient: &str,
        context: &serde_json::Value,
    ) -> Result<MessageId, WorkerError>;

    /// Poll for a response to a previously sent message
    async fn await_response(
        &self,
        message: MessageId,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>, WorkerError>;
}

/// Owns the "wait for external input" primitive
pub struct EscalationManager {
    channel: Arc<dyn HumanChannel>,
    /// Who gets escalation emails
    recipient: String,
    default_timeout: Duration,
}

impl EscalationManager {
    pub fn new(channel: Arc<dyn HumanChannel>, recipient: impl Into<String>) -> Self {
        Self {
            channel,
            recipient: recipient.into(),
            default_timeout: Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Record a pending escalation and send the question out.
    ///
    /// Returns the escalation plus the side effect of the send, for the
    /// caller to fold into workflow state.
    pub async fn raise(
        &self,
        reason: EscalationReason,
        context: serde_json::Value,
        subject: Option<String>,
        task: Option<TaskId>,
        timeout: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<(Escalation, SideEffect), EngineError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let message_id = self.channel.send(&self.recipient, &context).await?;

        let deadline = now
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365));

        let escalation = Escalation {
            id: EscalationId::new(),
            reason,
            context,
            created_at: now,
            timeout,
            status: EscalationStatus::Pending,
            deadline,
            reminder_sent: false,
            message_id: Some(message_id),
            subject,
            task,
            resume_payload: None,
        };

        info!(
            escalation_id = %escalation.id,
            reason = ?reason,
            deadline = %deadline,
            "raised escalation"
        );

        let effect = SideEffect::EmailSent {
            recipient: self.recipient.clone(),
            message_id,
            at: now,
        };

        Ok((escalation, effect))
    }

    /// Sweep deadlines: expired pending escalations get one reminder; an
    /// expired reminder leaves the escalation timed-out.
    ///
    /// Returns the side effects of any reminders sent, and the ids of
    /// escalations now terminally timed out.
    pub async fn check_timeouts(
        &self,
        escalations: &mut [Escalation],
        now: DateTime<Utc>,
    ) -> (Vec<SideEffect>, Vec<EscalationId>) {
        let mut effects = Vec::new();
        let mut timed_out = Vec::new();

        for esc in escalations.iter_mut() {
            match esc.status {
                EscalationStatus::Pending if now >= esc.deadline => {
                    if esc.reminder_sent {
                        // Reminder already consumed on a previous sweep
                        esc.status = EscalationStatus::TimedOut;
                        timed_out.push(esc.id);
                        continue;
                    }
                    warn!(escalation_id = %esc.id, "escalation timed out, sending reminder");
                    match self.channel.send(&self.recipient, &esc.context).await {
                        Ok(message_id) => {
                            esc.status = EscalationStatus::ReminderSent;
                            esc.reminder_sent = true;
                            esc.deadline = now
                                + chrono::Duration::from_std(esc.timeout)
                                    .unwrap_or_else(|_| chrono::Duration::days(1));
                            effects.push(SideEffect::EmailSent {
                                recipient: self.recipient.clone(),
                                message_id,
                                at: now,
                            });
                        }
                        Err(e) => {
                            warn!(escalation_id = %esc.id, error = %e, "reminder send failed");
                            esc.status = EscalationStatus::TimedOut;
                            timed_out.push(esc.id);
                        }
                    }
                }
                EscalationStatus::ReminderSent if now >= esc.deadline => {
                    warn!(escalation_id = %esc.id, "second timeout, parking run");
                    esc.status = EscalationStatus::TimedOut;
                    timed_out.push(esc.id);
                }
                _ => {}
            }
        }

        (effects, timed_out)
    }

    /// Poll the channel for a response to a pending escalation
    pub async fn poll_response(
        &self,
        escalation: &Escalation,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>, EngineError> {
        let Some(message_id) = escalation.message_id else {
            return Ok(None);
        };
        Ok(self.channel.await_response(message_id, timeout).await?)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Channel double that records sends and replays queued responses
    #[derive(Default)]
    pub struct RecordingChannel {
        pub sent: Mutex<Vec<(String, serde_json::Value)>>,
        pub responses: Mutex<Vec<serde_json::Value>>,
        pub fail_sends: Mutex<bool>,
    }

    #[async_trait]
    impl HumanChannel for RecordingChannel {
        async fn send(
            &self,
            recipient: &str,
            context: &serde_json::Value,
        ) -> Result<MessageId, WorkerError> {
            if *self.fail_sends.lock() {
                return Err(WorkerError::Connection("smtp down".into()));
            }
            self.sent
                .lock()
                .push((recipient.to_string(), context.clone()));
            Ok(MessageId::new())
        }

        async fn await_response(
            &self,
            _message: MessageId,
            _timeout: Duration,
        ) -> Result<Option<serde_json::Value>, WorkerError> {
            Ok(self.responses.lock().pop())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingChannel;
    use super::*;
    use serde_json::json;

    fn manager(channel: Arc<RecordingChannel>) -> EscalationManager {
        EscalationManager::new(channel, "billing@example.com")
            .with_default_timeout(Duration::from_secs(3600))
    }

    async fn raise_one(mgr: &EscalationManager, now: DateTime<Utc>) -> Escalation {
        let (esc, _effect) = mgr
            .raise(
                EscalationReason::DiscrepancyExceeded,
                json!({ "subject": "GEIG Didier/Modernisation/2025-09" }),
                Some("GEIG Didier/Modernisation/2025-09".into()),
                None,
                None,
                now,
            )
            .await
            .unwrap();
        esc
    }

    // === Raise ===

    #[tokio::test]
    async fn test_raise_sends_and_records() {
        let channel = Arc::new(RecordingChannel::default());
        let mgr = manager(channel.clone());
        let now = Utc::now();

        let esc = raise_one(&mgr, now).await;

        assert_eq!(esc.status, EscalationStatus::Pending);
        assert!(esc.message_id.is_some());
        assert!(!esc.reminder_sent);
        assert_eq!(channel.sent.lock().len(), 1);
        assert_eq!(channel.sent.lock()[0].0, "billing@example.com");
    }

    // === Timeout and the single reminder ===

    #[tokio::test]
    async fn test_timeout_sends_single_reminder_then_parks() {
        let channel = Arc::new(RecordingChannel::default());
        let mgr = manager(channel.clone());
        let now = Utc::now();

        let mut escalations = vec![raise_one(&mgr, now).await];

        // First deadline passes: one reminder, status reminder-sent
        let later = now + chrono::Duration::seconds(3700);
        let (effects, timed_out) = mgr.check_timeouts(&mut escalations, later).await;
        assert_eq!(effects.len(), 1);
        assert!(timed_out.is_empty());
        assert_eq!(escalations[0].status, EscalationStatus::ReminderSent);
        assert!(escalations[0].reminder_sent);
        assert_eq!(channel.sent.lock().len(), 2);

        // Second deadline passes: no second reminder, terminally timed out
        let much_later = later + chrono::Duration::seconds(3700);
        let (effects, timed_out) = mgr.check_timeouts(&mut escalations, much_later).await;
        assert!(effects.is_empty());
        assert_eq!(timed_out, vec![escalations[0].id]);
        assert_eq!(escalations[0].status, EscalationStatus::TimedOut);
        assert_eq!(channel.sent.lock().len(), 2);
        assert!(escalations[0].blocks_finalize());
    }

    #[tokio::test]
    async fn test_no_sweep_before_deadline() {
        let channel = Arc::new(RecordingChannel::default());
        let mgr = manager(channel.clone());
        let now = Utc::now();

        let mut escalations = vec![raise_one(&mgr, now).await];
        let (effects, timed_out) = mgr
            .check_timeouts(&mut escalations, now + chrono::Duration::seconds(10))
            .await;

        assert!(effects.is_empty());
        assert!(timed_out.is_empty());
        assert_eq!(escalations[0].status, EscalationStatus::Pending);
    }

    // === Resolution ===

    #[tokio::test]
    async fn test_resolve_applies_payload_exactly_once() {
        let channel = Arc::new(RecordingChannel::default());
        let mgr = manager(channel);
        let mut esc = raise_one(&mgr, Utc::now()).await;

        esc.resolve(json!({ "agreed_days": 12.0 })).unwrap();
        assert_eq!(esc.status, EscalationStatus::Resolved);
        assert!(!esc.blocks_finalize());

        // Second resolve is rejected
        assert!(matches!(
            esc.resolve(json!({})),
            Err(EngineError::AlreadyResolved(_))
        ));

        // Payload comes out exactly once
        assert_eq!(
            esc.take_resume_payload(),
            Some(json!({ "agreed_days": 12.0 }))
        );
        assert_eq!(esc.take_resume_payload(), None);
    }

    #[tokio::test]
    async fn test_resolve_after_timeout_still_allowed() {
        // A parked run is not aborted; a late response still resolves it
        let channel = Arc::new(RecordingChannel::default());
        let mgr = manager(channel);
        let mut esc = raise_one(&mgr, Utc::now()).await;
        esc.status = EscalationStatus::TimedOut;

        assert!(esc.resolve(json!({ "late": true })).is_ok());
        assert_eq!(esc.status, EscalationStatus::Resolved);
    }

    #[tokio::test]
    async fn test_cancel_on_abort() {
        let channel = Arc::new(RecordingChannel::default());
        let mgr = manager(channel);
        let mut esc = raise_one(&mgr, Utc::now()).await;

        esc.cancel();
        assert_eq!(esc.status, EscalationStatus::Cancelled);
        assert!(!esc.blocks_finalize());
        assert!(esc.resolve(json!({})).is_err());
    }

    #[tokio::test]
    async fn test_poll_response_passthrough() {
        let channel = Arc::new(RecordingChannel::default());
        channel.responses.lock().push(json!({ "answer": 42 }));
        let mgr = manager(channel);
        let esc = raise_one(&mgr, Utc::now()).await;

        let response = mgr
            .poll_response(&esc, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(response, Some(json!({ "answer": 42 })));
    }
}
