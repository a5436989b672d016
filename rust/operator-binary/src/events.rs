//! Event records appended to the cluster event sink, one per noteworthy
//! lifecycle edge.

use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use spark_application_crd::constants::OPERATOR_NAME;
use spark_application_crd::SparkApplication;

pub const APPLICATION_ADDED: &str = "ApplicationAdded";
pub const APPLICATION_DELETED: &str = "ApplicationDeleted";
pub const APPLICATION_SUBMITTED: &str = "ApplicationSubmitted";
pub const APPLICATION_PENDING_RERUN: &str = "ApplicationPendingRerun";
pub const APPLICATION_COMPLETED: &str = "ApplicationCompleted";
pub const APPLICATION_FAILED: &str = "ApplicationFailed";
pub const SPEC_UPDATE_PROCESSED: &str = "SpecUpdateProcessed";
pub const SPEC_UPDATE_FAILED: &str = "SpecUpdateFailed";
pub const SPEC_INVALID: &str = "SpecInvalid";
pub const SUBMISSION_JOB_CREATED: &str = "SubmissionJobCreated";
pub const SUBMISSION_FAILED: &str = "SubmissionFailed";
pub const DRIVER_COMPLETED: &str = "DriverCompleted";
pub const DRIVER_FAILED: &str = "DriverFailed";
pub const EXECUTOR_COMPLETED: &str = "ExecutorCompleted";
pub const EXECUTOR_FAILED: &str = "ExecutorFailed";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// Injected event sink. The Kubernetes implementation appends `Event`
/// records; tests collect them in memory.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(
        &self,
        app: &SparkApplication,
        severity: EventSeverity,
        reason: &str,
        message: String,
    );
}

pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: OPERATOR_NAME.to_owned(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(
        &self,
        app: &SparkApplication,
        severity: EventSeverity,
        reason: &str,
        message: String,
    ) {
        let event = Event {
            type_: match severity {
                EventSeverity::Normal => EventType::Normal,
                EventSeverity::Warning => EventType::Warning,
            },
            reason: reason.to_owned(),
            note: Some(message),
            action: "Reconciling".to_owned(),
            secondary: None,
        };
        // Event delivery is best-effort; reconciliation must not fail on it.
        if let Err(error) = self
            .recorder
            .publish(&event, &app.object_ref(&()))
            .await
        {
            tracing::warn!(%error, reason, "failed to publish event");
        }
    }
}
