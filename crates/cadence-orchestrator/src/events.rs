use crate::monitor::Alert;
use cadence_core::Priority;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Every notification the engine publishes to presentation layers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    WorkflowStarted {
        workflow_id: Uuid,
    },
    WorkflowStopped {
        workflow_id: Uuid,
    },
    WorkflowPaused {
        workflow_id: Uuid,
    },
    WorkflowResumed {
        workflow_id: Uuid,
    },
    /// A unit failed without retry budget or exhausted its retries.
    WorkflowFailed {
        workflow_id: Uuid,
        unit_id: String,
        error: String,
    },
    UnitStarted {
        workflow_id: Option<Uuid>,
        unit_id: String,
    },
    UnitCompleted {
        workflow_id: Option<Uuid>,
        unit_id: String,
        success: bool,
        duration_ms: u64,
    },
    ChainCompleted {
        workflow_id: Uuid,
        chain_id: u32,
        cycle: u64,
    },
    CycleCompleted {
        workflow_id: Uuid,
        cycle: u64,
    },
    ApprovalRequested {
        workflow_id: Uuid,
        unit_id: String,
    },
    ApprovalGranted {
        workflow_id: Uuid,
        unit_id: String,
        approver: String,
    },
    ApprovalRejected {
        workflow_id: Uuid,
        unit_id: String,
        approver: String,
    },
    ApprovalTimedOut {
        workflow_id: Uuid,
        unit_id: String,
    },
    ItemEnqueued {
        item_id: Uuid,
        unit_id: String,
        chain_id: u32,
        priority: Priority,
    },
    ItemDequeued {
        item_id: Uuid,
        unit_id: String,
    },
    ItemCompleted {
        item_id: Uuid,
        unit_id: String,
        duration_ms: u64,
    },
    ItemFailed {
        item_id: Uuid,
        unit_id: String,
        error: String,
        attempts: u32,
    },
    ItemRetrying {
        item_id: Uuid,
        unit_id: String,
        attempt: u32,
        scheduled_for: DateTime<Utc>,
    },
    ItemDeadLettered {
        item_id: Uuid,
        unit_id: String,
    },
    ItemReprioritized {
        item_id: Uuid,
        from: Priority,
        to: Priority,
    },
    ItemCancelled {
        item_id: Uuid,
        unit_id: String,
    },
    AlertCreated {
        alert: Alert,
    },
    CriticalAlert {
        alert: Alert,
    },
    ModeChanged {
        from: Option<String>,
        to: String,
    },
    ScheduleTriggered {
        schedule: String,
        mode: String,
    },
    ConfirmationRequired {
        mode: String,
    },
}

impl Event {
    /// The serialized `type` tag of this event.
    pub fn name(&self) -> &'static str {
        match self {
            Event::WorkflowStarted { .. } => "workflow_started",
            Event::WorkflowStopped { .. } => "workflow_stopped",
            Event::WorkflowPaused { .. } => "workflow_paused",
            Event::WorkflowResumed { .. } => "workflow_resumed",
            Event::WorkflowFailed { .. } => "workflow_failed",
            Event::UnitStarted { .. } => "unit_started",
            Event::UnitCompleted { .. } => "unit_completed",
            Event::ChainCompleted { .. } => "chain_completed",
            Event::CycleCompleted { .. } => "cycle_completed",
            Event::ApprovalRequested { .. } => "approval_requested",
            Event::ApprovalGranted { .. } => "approval_granted",
            Event::ApprovalRejected { .. } => "approval_rejected",
            Event::ApprovalTimedOut { .. } => "approval_timed_out",
            Event::ItemEnqueued { .. } => "item_enqueued",
            Event::ItemDequeued { .. } => "item_dequeued",
            Event::ItemCompleted { .. } => "item_completed",
            Event::ItemFailed { .. } => "item_failed",
            Event::ItemRetrying { .. } => "item_retrying",
            Event::ItemDeadLettered { .. } => "item_dead_lettered",
            Event::ItemReprioritized { .. } => "item_reprioritized",
            Event::ItemCancelled { .. } => "item_cancelled",
            Event::AlertCreated { .. } => "alert_created",
            Event::CriticalAlert { .. } => "critical_alert",
            Event::ModeChanged { .. } => "mode_changed",
            Event::ScheduleTriggered { .. } => "schedule_triggered",
            Event::ConfirmationRequired { .. } => "confirmation_required",
        }
    }
}

/// Fan-out channel shared by all engine components.
///
/// Emission never blocks the producer: with no subscribers the event is
/// dropped, and subscribers that fall more than `capacity` events behind
/// observe a `Lagged` error on their next receive.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: Event) {
        trace!(event = event.name(), "emit");
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
