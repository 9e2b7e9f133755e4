//! Fire-and-forget task telemetry. Emission is tracing-backed and can never
//! fail a caller.

use tracing::info;
use uuid::Uuid;

#[derive(Debug)]
pub enum TaskEvent<'a> {
    TaskCreated {
        task_id: &'a str,
        owner_id: Uuid,
        kind: &'a str,
    },
    TaskCompleted {
        task_id: &'a str,
        owner_id: Uuid,
    },
    TaskFailed {
        task_id: &'a str,
        owner_id: Uuid,
        error: &'a str,
    },
    OfferCompleted {
        offer_id: Uuid,
        request_id: Uuid,
        duration_ms: i64,
    },
    OfferFailed {
        offer_id: Uuid,
        request_id: Uuid,
        error: &'a str,
    },
}

pub fn emit(event: &TaskEvent<'_>) {
    match event {
        TaskEvent::TaskCreated {
            task_id,
            owner_id,
            kind,
        } => info!(target: "telemetry", %owner_id, kind, "task created: {task_id}"),
        TaskEvent::TaskCompleted { task_id, owner_id } => {
            info!(target: "telemetry", %owner_id, "task completed: {task_id}")
        }
        TaskEvent::TaskFailed {
            task_id,
            owner_id,
            error,
        } => info!(target: "telemetry", %owner_id, error, "task failed: {task_id}"),
        TaskEvent::OfferCompleted {
            offer_id,
            request_id,
            duration_ms,
        } => info!(target: "telemetry", %request_id, duration_ms, "offer completed: {offer_id}"),
        TaskEvent::OfferFailed {
            offer_id,
            request_id,
            error,
        } => info!(target: "telemetry", %request_id, error, "offer failed: {offer_id}"),
    }
}
