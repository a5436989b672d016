//! Restart and expiry decisions. Pure functions of `(status, spec, now)`,
//! consulted by the reconciler after each status computation.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::{DateTime, Duration, Utc};
use spark_application_crd::{
    ApplicationStateType, RestartPolicyType, SparkApplicationSpec, SparkApplicationStatus,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    /// Nothing to do; a pending retry interval also lands here.
    Noop,
    /// Tear down the previous run and transition to `PendingRerun`.
    Retry,
    /// The application outlived its TTL; delete the resource.
    Delete,
}

/// Whether the restart policy permits another execution attempt for the
/// current (terminating) state. A denied retry makes the state terminal.
pub fn retry_allowed(status: &SparkApplicationStatus, spec: &SparkApplicationSpec) -> bool {
    let policy = &spec.restart_policy;
    match status.app_state.state {
        ApplicationStateType::Succeeding => policy.policy_type == RestartPolicyType::Always,
        ApplicationStateType::Failing => match policy.policy_type {
            RestartPolicyType::Always => true,
            RestartPolicyType::Never => false,
            RestartPolicyType::OnFailure => policy
                .on_failure_retries
                .is_some_and(|max| status.execution_attempts <= max),
        },
        ApplicationStateType::FailedSubmission => match policy.policy_type {
            RestartPolicyType::Always => true,
            RestartPolicyType::Never => false,
            RestartPolicyType::OnFailure => policy
                .on_submission_failure_retries
                .is_some_and(|max| status.submission_attempts <= max),
        },
        _ => false,
    }
}

/// The interval check backs off linearly with the attempt count:
/// `now ≥ last_event_time + interval × attempts`. An unset interval, a zero
/// attempt count or a missing timestamp all deny the retry.
pub fn retry_interval_passed(
    interval_seconds: Option<i64>,
    attempts: i32,
    last_event_time: Option<&Time>,
    now: DateTime<Utc>,
) -> bool {
    let Some(interval_seconds) = interval_seconds else {
        return false;
    };
    if attempts <= 0 {
        return false;
    }
    let Some(last_event_time) = last_event_time else {
        return false;
    };
    let elapsed = Duration::seconds(interval_seconds.saturating_mul(attempts as i64));
    now >= last_event_time.0 + elapsed
}

/// Single entry point for the reconciler: retry, expiry, or nothing.
pub fn decide(
    status: &SparkApplicationStatus,
    spec: &SparkApplicationSpec,
    now: DateTime<Utc>,
) -> Decision {
    let policy = &spec.restart_policy;
    match status.app_state.state {
        ApplicationStateType::Succeeding => {
            if retry_allowed(status, spec) {
                Decision::Retry
            } else {
                Decision::Noop
            }
        }
        ApplicationStateType::Failing => {
            if retry_allowed(status, spec)
                && retry_interval_passed(
                    policy.on_failure_retry_interval,
                    status.execution_attempts,
                    status.termination_time.as_ref(),
                    now,
                )
            {
                Decision::Retry
            } else {
                Decision::Noop
            }
        }
        ApplicationStateType::FailedSubmission => {
            if retry_allowed(status, spec)
                && retry_interval_passed(
                    policy.on_submission_failure_retry_interval,
                    status.submission_attempts,
                    status.submission_time.as_ref(),
                    now,
                )
            {
                Decision::Retry
            } else {
                Decision::Noop
            }
        }
        ApplicationStateType::Completed | ApplicationStateType::Failed => {
            let expired = spec.time_to_live_seconds.is_some_and(|ttl| {
                status
                    .termination_time
                    .as_ref()
                    .is_some_and(|termination| now >= termination.0 + Duration::seconds(ttl))
            });
            if expired {
                Decision::Delete
            } else {
                Decision::Noop
            }
        }
        // Never fires while a rerun or invalidation is already in progress.
        _ => Decision::Noop,
    }
}
