//! Derives driver and executor state from observed pods.

use k8s_openapi::api::core::v1::{ContainerStateTerminated, Pod, PodStatus};
use kube::ResourceExt;
use spark_application_crd::constants::{
    DRIVER_CONTAINER_NAME, LABEL_SPARK_ROLE, LABEL_SUBMISSION_ID, SPARK_DRIVER_ROLE,
    SPARK_EXECUTOR_ROLE,
};
use spark_application_crd::{ApplicationStateType, DriverState, ExecutorState};

pub fn is_driver_pod(pod: &Pod) -> bool {
    pod.labels().get(LABEL_SPARK_ROLE).map(String::as_str) == Some(SPARK_DRIVER_ROLE)
}

pub fn is_executor_pod(pod: &Pod) -> bool {
    pod.labels().get(LABEL_SPARK_ROLE).map(String::as_str) == Some(SPARK_EXECUTOR_ROLE)
}

/// Pods from an earlier attempt may linger while a rerun is in flight. A pod
/// carrying a submission-id label different from the current attempt is not
/// part of this application run.
pub fn matches_submission(pod: &Pod, submission_id: Option<&str>) -> bool {
    match (pod.labels().get(LABEL_SUBMISSION_ID), submission_id) {
        (Some(pod_id), Some(current)) => pod_id == current,
        _ => true,
    }
}

fn driver_container_terminated_state(status: &PodStatus) -> Option<&ContainerStateTerminated> {
    status
        .container_statuses
        .as_ref()?
        .iter()
        .find(|container| container.name == DRIVER_CONTAINER_NAME)?
        .state
        .as_ref()?
        .terminated
        .as_ref()
}

/// Classifies the driver pod. The driver container is authoritative:
/// sidecars are ignored, and a zero exit code of the driver container maps
/// to `Completed` even when the pod phase is `Failed`.
pub fn driver_state(pod: &Pod) -> DriverState {
    let Some(status) = pod.status.as_ref() else {
        return DriverState::Unknown;
    };
    match status.phase.as_deref() {
        Some("Pending") => DriverState::Pending,
        Some("Succeeded") => DriverState::Completed,
        Some("Running") => match driver_container_terminated_state(status) {
            Some(terminated) if terminated.exit_code == 0 => DriverState::Completed,
            Some(_) => DriverState::Failed,
            None => DriverState::Running,
        },
        Some("Failed") => match driver_container_terminated_state(status) {
            Some(terminated) if terminated.exit_code == 0 => DriverState::Completed,
            _ => DriverState::Failed,
        },
        _ => DriverState::Unknown,
    }
}

/// Total on all driver states.
pub fn driver_state_to_app_state(state: DriverState) -> ApplicationStateType {
    match state {
        DriverState::Pending => ApplicationStateType::Submitted,
        DriverState::Running => ApplicationStateType::Running,
        DriverState::Completed => ApplicationStateType::Succeeding,
        DriverState::Failed => ApplicationStateType::Failing,
        DriverState::Unknown => ApplicationStateType::Unknown,
    }
}

/// Total on all pod phases.
pub fn pod_phase_to_executor_state(phase: Option<&str>) -> ExecutorState {
    match phase {
        Some("Pending") => ExecutorState::Pending,
        Some("Running") => ExecutorState::Running,
        Some("Succeeded") => ExecutorState::Completed,
        Some("Failed") => ExecutorState::Failed,
        _ => ExecutorState::Unknown,
    }
}

/// Terminal executor states are sticky.
pub fn is_valid_executor_transition(old: ExecutorState, new: ExecutorState) -> bool {
    !old.is_terminal() && old != new
}

/// User-facing message for a failed driver.
pub fn driver_failure_message(pod: &Pod) -> String {
    match pod
        .status
        .as_ref()
        .and_then(driver_container_terminated_state)
    {
        Some(terminated) => format!(
            "driver container failed with ExitCode: {}, Reason: {}",
            terminated.exit_code,
            terminated.reason.as_deref().unwrap_or_default()
        ),
        None => "driver container status missing".to_owned(),
    }
}
