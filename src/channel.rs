//! Event stream for engine observers

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::escalation::EscalationReason;
use crate::reconcile::Classification;
use crate::types::{EscalationId, RunId, TaskId, TaskStatus};

/// Notifications the engine emits while driving runs
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    RunSubmitted {
        run_id: RunId,
        tasks: usize,
    },
    TaskStarted {
        run_id: RunId,
        task: TaskId,
    },
    TaskFinished {
        run_id: RunId,
        task: TaskId,
        status: TaskStatus,
    },
    DiscrepancyDetected {
        run_id: RunId,
        subject: String,
        classification: Classification,
    },
    EscalationRaised {
        run_id: RunId,
        escalation: EscalationId,
        reason: EscalationReason,
    },
    EscalationResolved {
        run_id: RunId,
        escalation: EscalationId,
    },
    RunSuspended {
        run_id: RunId,
    },
    RunFinalized {
        run_id: RunId,
    },
    RunAborted {
        run_id: RunId,
    },
}

/// Sender half handed to the orchestrator
pub struct ChannelPair {
    /// Channel for emitting events
    pub event_tx: mpsc::UnboundedSender<Event>,
}

/// Client-side channel for observing the engine
#[derive(Clone)]
pub struct EngineChannel {
    event_rx: Arc<parking_lot::Mutex<mpsc::UnboundedReceiver<Event>>>,
}

impl EngineChannel {
    /// Create a new channel pair
    ///
    /// Returns the client channel and the engine's sender half
    pub fn new() -> (Self, ChannelPair) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let channel = Self {
            event_rx: Arc::new(parking_lot::Mutex::new(event_rx)),
        };

        (channel, ChannelPair { event_tx })
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&self) -> Option<Event> {
        self.event_rx.lock().try_recv().ok()
    }

    /// Drain all currently buffered events
    pub fn drain(&self) -> Vec<Event> {
        let mut guard = self.event_rx.lock();
        let mut events = Vec::new();
        while let Ok(event) = guard.try_recv() {
            events.push(event);
        }
        events
    }
}
