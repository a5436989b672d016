//! Counters and gauges keyed on state transitions. Exported by diffing the
//! previous and the freshly persisted status, so repeated reconciliations of
//! the same observation move nothing.

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};
use spark_application_crd::{ApplicationStateType, ExecutorState, SparkApplicationStatus};

const LABELS: &[&str] = &["namespace", "name"];

pub struct ApplicationMetrics {
    app_submit_count: IntCounterVec,
    app_success_count: IntCounterVec,
    app_failure_count: IntCounterVec,
    app_failed_submission_count: IntCounterVec,
    app_running_count: IntGaugeVec,
    executor_success_count: IntCounterVec,
    executor_failure_count: IntCounterVec,
    executor_running_count: IntGaugeVec,
}

impl ApplicationMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let counter = |name: &str, help: &str| -> Result<IntCounterVec, prometheus::Error> {
            let counter = IntCounterVec::new(Opts::new(name, help), LABELS)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };
        let gauge = |name: &str, help: &str| -> Result<IntGaugeVec, prometheus::Error> {
            let gauge = IntGaugeVec::new(Opts::new(name, help), LABELS)?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        Ok(Self {
            app_submit_count: counter(
                "spark_app_submit_count",
                "Number of application submissions accepted by the cluster",
            )?,
            app_success_count: counter(
                "spark_app_success_count",
                "Number of applications that completed successfully",
            )?,
            app_failure_count: counter(
                "spark_app_failure_count",
                "Number of applications that terminally failed",
            )?,
            app_failed_submission_count: counter(
                "spark_app_failed_submission_count",
                "Number of failed submission attempts",
            )?,
            app_running_count: gauge(
                "spark_app_running_count",
                "Number of applications currently running",
            )?,
            executor_success_count: counter(
                "spark_app_executor_success_count",
                "Number of executors that completed successfully",
            )?,
            executor_failure_count: counter(
                "spark_app_executor_failure_count",
                "Number of executors that failed",
            )?,
            executor_running_count: gauge(
                "spark_app_executor_running_count",
                "Number of executors currently running",
            )?,
        })
    }

    /// Exports the deltas between two persisted statuses.
    pub fn export(
        &self,
        old: &SparkApplicationStatus,
        new: &SparkApplicationStatus,
        namespace: &str,
        name: &str,
    ) {
        let labels = &[namespace, name];
        let old_state = old.app_state.state;
        let new_state = new.app_state.state;

        if old_state != new_state {
            match new_state {
                ApplicationStateType::Submitted => {
                    self.app_submit_count.with_label_values(labels).inc()
                }
                ApplicationStateType::FailedSubmission => self
                    .app_failed_submission_count
                    .with_label_values(labels)
                    .inc(),
                ApplicationStateType::Running => {
                    self.app_running_count.with_label_values(labels).inc()
                }
                ApplicationStateType::Completed => {
                    self.app_success_count.with_label_values(labels).inc()
                }
                ApplicationStateType::Failed => {
                    self.app_failure_count.with_label_values(labels).inc()
                }
                _ => {}
            }
            if old_state == ApplicationStateType::Running {
                self.app_running_count.with_label_values(labels).dec();
            }
        }

        for (executor, new_executor_state) in &new.executor_state {
            let old_executor_state = old.executor_state.get(executor);
            if old_executor_state == Some(new_executor_state) {
                continue;
            }
            let was_running = old_executor_state == Some(&ExecutorState::Running);
            match new_executor_state {
                ExecutorState::Running => {
                    self.executor_running_count.with_label_values(labels).inc()
                }
                ExecutorState::Completed => {
                    self.executor_success_count.with_label_values(labels).inc()
                }
                ExecutorState::Failed => {
                    self.executor_failure_count.with_label_values(labels).inc()
                }
                _ => {}
            }
            if was_running && *new_executor_state != ExecutorState::Running {
                self.executor_running_count.with_label_values(labels).dec();
            }
        }
    }
}
