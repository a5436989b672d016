//! The application state machine and its worker loop.
//!
//! Each `sync_application` invocation loads the application and its pods from
//! the cache, computes the next state from what it observes, and persists the
//! mutated status. Only transient cluster errors propagate back to the work
//! queue; every domain failure is encoded into status.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::Utc;
use kube::ResourceExt;
use snafu::{OptionExt, ResultExt, Snafu};
use spark_application_crd::constants::DRIVER_CLEANUP_FINALIZER;
use spark_application_crd::{
    constants::ALREADY_SUBMITTED_ERROR_CODE, ApplicationState, ApplicationStateType, DriverInfo,
    DriverState, ExecutorState, SparkApplication,
};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::app_status;
use crate::client::{self, ApplicationClient};
use crate::events::{self, EventRecorder, EventSeverity};
use crate::metrics::ApplicationMetrics;
use crate::policy::{self, Decision};
use crate::store::{split_object_key, ApplicationStore, PodStore};
use crate::submission::{self, SubmissionJobManager, SubmissionOutcome};
use crate::workqueue::WorkQueue;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("invalid work-queue key [{key}]"))]
    InvalidKey { key: String },

    #[snafu(display("failed to persist application status"))]
    PersistStatus { source: client::Error },

    #[snafu(display("failed to persist application metadata"))]
    PersistApplication { source: client::Error },

    #[snafu(display("failed to delete expired application"))]
    DeleteExpiredApplication { source: client::Error },

    #[snafu(display("failed to delete driver pod"))]
    DeleteDriverPod { source: client::Error },

    #[snafu(display("failed to check for leftover driver pod"))]
    CheckDriverPod { source: client::Error },

    #[snafu(display("failed to look up the driver node external IP"))]
    NodeExternalIp { source: client::Error },

    #[snafu(display("failed to inspect submission job"))]
    InspectSubmissionJob { source: submission::Error },

    #[snafu(display("failed to delete submission job"))]
    DeleteSubmissionJob { source: submission::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

pub struct Controller {
    queue: Arc<WorkQueue>,
    apps: Arc<ApplicationStore>,
    pods: Arc<PodStore>,
    client: Arc<dyn ApplicationClient>,
    job_manager: Arc<dyn SubmissionJobManager>,
    recorder: Arc<dyn EventRecorder>,
    metrics: ApplicationMetrics,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<WorkQueue>,
        apps: Arc<ApplicationStore>,
        pods: Arc<PodStore>,
        client: Arc<dyn ApplicationClient>,
        job_manager: Arc<dyn SubmissionJobManager>,
        recorder: Arc<dyn EventRecorder>,
        metrics: ApplicationMetrics,
    ) -> Self {
        Self {
            queue,
            apps,
            pods,
            client,
            job_manager,
            recorder,
            metrics,
        }
    }

    /// Blocking `get → sync → done` loop shared by all workers. Failed syncs
    /// are re-queued with backoff, successful ones reset it.
    pub async fn run_worker(self: Arc<Self>) {
        while let Some(key) = self.queue.get().await {
            tracing::debug!(%key, "processing application");
            match self.sync_application(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(error) => {
                    let category: &'static str = ErrorDiscriminants::from(&error).into();
                    tracing::error!(%error, category, %key, "failed to sync application");
                    self.queue.add_rate_limited(&key);
                }
            }
            self.queue.done(&key);
        }
    }

    /// One reconciliation pass: observe → decide → persist → emit.
    pub async fn sync_application(&self, key: &str) -> Result<()> {
        let (namespace, name) = split_object_key(key).context(InvalidKeySnafu { key })?;
        let Some(cached) = self.apps.get(key) else {
            tracing::debug!(key, "application no longer in cache, nothing to do");
            return Ok(());
        };
        let app = (*cached).clone();

        if app.metadata.deletion_timestamp.is_some() {
            return self.finalize_application(&app).await;
        }

        let mut updated = app.clone();
        match app.application_state() {
            ApplicationStateType::New => self.sync_new(&mut updated).await?,
            ApplicationStateType::PendingSubmission => {
                self.check_submission(&mut updated).await?
            }
            ApplicationStateType::Submitted
            | ApplicationStateType::Running
            | ApplicationStateType::Unknown => self.observe_pods(&mut updated).await?,
            ApplicationStateType::Succeeding => {
                if self.decide(&updated) == Decision::Retry {
                    self.prepare_rerun(&mut updated).await?;
                } else {
                    set_state(&mut updated, ApplicationStateType::Completed);
                    self.recorder
                        .publish(
                            &updated,
                            EventSeverity::Normal,
                            events::APPLICATION_COMPLETED,
                            format!("application {name} completed"),
                        )
                        .await;
                }
            }
            ApplicationStateType::Failing => {
                if !policy::retry_allowed(status_of(&updated), &updated.spec) {
                    set_state(&mut updated, ApplicationStateType::Failed);
                    self.recorder
                        .publish(
                            &updated,
                            EventSeverity::Warning,
                            events::APPLICATION_FAILED,
                            failure_note(&updated),
                        )
                        .await;
                } else if self.decide(&updated) == Decision::Retry {
                    self.prepare_rerun(&mut updated).await?;
                }
            }
            ApplicationStateType::FailedSubmission => {
                if !policy::retry_allowed(status_of(&updated), &updated.spec) {
                    set_state(&mut updated, ApplicationStateType::Failed);
                    self.recorder
                        .publish(
                            &updated,
                            EventSeverity::Warning,
                            events::APPLICATION_FAILED,
                            failure_note(&updated),
                        )
                        .await;
                } else if self.decide(&updated) == Decision::Retry {
                    self.prepare_rerun(&mut updated).await?;
                }
            }
            ApplicationStateType::Invalidating => self.invalidate(&mut updated).await?,
            ApplicationStateType::PendingRerun => self.resume_after_rerun(&mut updated).await?,
            ApplicationStateType::Completed | ApplicationStateType::Failed => {
                if self.decide(&updated) == Decision::Delete {
                    tracing::info!(key, "application outlived its TTL, deleting");
                    self.client
                        .delete_application(namespace, name)
                        .await
                        .context(DeleteExpiredApplicationSnafu)?;
                    return Ok(());
                }
            }
        }

        self.persist(&app, updated).await
    }

    fn decide(&self, app: &SparkApplication) -> Decision {
        policy::decide(status_of(app), &app.spec, Utc::now())
    }

    /// Validates a fresh application and creates its first submission.
    async fn sync_new(&self, app: &mut SparkApplication) -> Result<()> {
        if let Err(message) = validate_application(app) {
            let status = app.status.get_or_insert_with(Default::default);
            status.app_state = ApplicationState {
                state: ApplicationStateType::Failed,
                error_message: Some(message.clone()),
            };
            self.recorder
                .publish(app, EventSeverity::Warning, events::SPEC_INVALID, message)
                .await;
            return Ok(());
        }
        self.submit(app).await
    }

    /// Creates a submission job and records the attempt in status.
    async fn submit(&self, app: &mut SparkApplication) -> Result<()> {
        let name = app.name_any();
        match self.job_manager.create(app).await {
            Ok(handle) => {
                let status = app.status.get_or_insert_with(Default::default);
                status.app_state = ApplicationState {
                    state: ApplicationStateType::PendingSubmission,
                    error_message: None,
                };
                status.submission_id = Some(handle.submission_id);
                status.submission_attempts += 1;
                status.execution_attempts += 1;
                status.submission_time = Some(Time(Utc::now()));
                status.termination_time = None;
                status.completion_time = None;
                status.driver_info = DriverInfo {
                    pod_name: Some(handle.driver_pod_name),
                    ..DriverInfo::default()
                };
                status.executor_state.clear();
                self.recorder
                    .publish(
                        app,
                        EventSeverity::Normal,
                        events::SUBMISSION_JOB_CREATED,
                        format!("created submission job for application {name}"),
                    )
                    .await;
            }
            Err(error) if error.is_already_exists() => {
                // The previous attempt is still in flight; track it without
                // counting another attempt.
                tracing::warn!(%name, "submission job already exists, adopting it");
                let status = app.status.get_or_insert_with(Default::default);
                status.app_state.state = ApplicationStateType::PendingSubmission;
            }
            Err(error) => {
                let message = error.to_string();
                let status = app.status.get_or_insert_with(Default::default);
                status.app_state = ApplicationState {
                    state: ApplicationStateType::FailedSubmission,
                    error_message: Some(message.clone()),
                };
                status.submission_attempts += 1;
                status.submission_time = Some(Time(Utc::now()));
                status.termination_time = Some(Time(Utc::now()));
                self.recorder
                    .publish(
                        app,
                        EventSeverity::Warning,
                        events::SUBMISSION_FAILED,
                        format!("failed to create a submission job for application {name}: {message}"),
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Tracks the in-flight launcher job until it reports an outcome.
    async fn check_submission(&self, app: &mut SparkApplication) -> Result<()> {
        let name = app.name_any();
        let outcome = self
            .job_manager
            .has_succeeded(app)
            .await
            .context(InspectSubmissionJobSnafu)?;
        match outcome {
            SubmissionOutcome::InFlight => {}
            SubmissionOutcome::Succeeded { .. } => {
                {
                    let status = app.status.get_or_insert_with(Default::default);
                    status.app_state = ApplicationState {
                        state: ApplicationStateType::Submitted,
                        error_message: None,
                    };
                }
                add_driver_finalizer(app);
                self.recorder
                    .publish(
                        app,
                        EventSeverity::Normal,
                        events::APPLICATION_SUBMITTED,
                        format!("application {name} was submitted to the cluster"),
                    )
                    .await;
                // The launcher job served its purpose.
                self.job_manager
                    .delete(app)
                    .await
                    .context(DeleteSubmissionJobSnafu)?;
            }
            SubmissionOutcome::Failed { message } => {
                if message.contains(ALREADY_SUBMITTED_ERROR_CODE) {
                    // The driver of this attempt already exists; keep the
                    // attempt and let pod observation take over.
                    tracing::warn!(%name, "submission was already accepted earlier");
                    let status = app.status.get_or_insert_with(Default::default);
                    status.app_state.state = ApplicationStateType::Submitted;
                } else {
                    let status = app.status.get_or_insert_with(Default::default);
                    status.app_state = ApplicationState {
                        state: ApplicationStateType::FailedSubmission,
                        error_message: Some(message.clone()),
                    };
                    if status.termination_time.is_none() {
                        status.termination_time = Some(Time(Utc::now()));
                    }
                    self.recorder
                        .publish(
                            app,
                            EventSeverity::Warning,
                            events::SUBMISSION_FAILED,
                            format!("submission of application {name} failed: {message}"),
                        )
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Aggregates driver and executor pod observations into status.
    async fn observe_pods(&self, app: &mut SparkApplication) -> Result<()> {
        let namespace = app.namespace().unwrap_or_default();
        let name = app.name_any();
        let old_state = app.application_state();
        let submission_id = app
            .status
            .as_ref()
            .and_then(|status| status.submission_id.clone());

        let mut driver_pod: Option<Arc<Pod>> = None;
        let mut executor_pods: Vec<Arc<Pod>> = Vec::new();
        for pod in self.pods.list_for_app(&namespace, &name) {
            if !app_status::matches_submission(&pod, submission_id.as_deref()) {
                continue;
            }
            if app_status::is_driver_pod(&pod) {
                driver_pod = Some(pod);
            } else if app_status::is_executor_pod(&pod) {
                executor_pods.push(pod);
            }
        }

        // Resolve the driver node address before borrowing status mutably.
        let mut web_ui_address = None;
        if let Some(pod) = &driver_pod {
            let node_name = pod.spec.as_ref().and_then(|spec| spec.node_name.clone());
            let web_ui_port = app
                .status
                .as_ref()
                .and_then(|status| status.driver_info.web_ui_port);
            if let (Some(node_name), Some(port)) = (node_name, web_ui_port) {
                if let Some(ip) = self
                    .client
                    .node_external_ip(&node_name)
                    .await
                    .context(NodeExternalIpSnafu)?
                {
                    web_ui_address = Some(format!("{ip}:{port}"));
                }
            }
        }

        let mut pending_events: Vec<(EventSeverity, &'static str, String)> = Vec::new();
        {
            let status = app.status.get_or_insert_with(Default::default);

            match &driver_pod {
                Some(pod) => {
                    let driver_state = app_status::driver_state(pod);
                    let new_state = app_status::driver_state_to_app_state(driver_state);
                    status.driver_info.pod_name = Some(pod.name_any());
                    if let Some(address) = web_ui_address {
                        status.driver_info.web_ui_address = Some(address);
                    }
                    if driver_state.has_terminated() {
                        if status.completion_time.is_none() {
                            status.completion_time = Some(Time(Utc::now()));
                        }
                        if status.termination_time.is_none() {
                            status.termination_time = Some(Time(Utc::now()));
                        }
                    }
                    if driver_state == DriverState::Failed {
                        status.app_state.error_message =
                            Some(app_status::driver_failure_message(pod));
                    }
                    status.app_state.state = new_state;
                    if new_state != old_state {
                        match new_state {
                            ApplicationStateType::Succeeding => pending_events.push((
                                EventSeverity::Normal,
                                events::DRIVER_COMPLETED,
                                format!("driver {} completed", pod.name_any()),
                            )),
                            ApplicationStateType::Failing => pending_events.push((
                                EventSeverity::Warning,
                                events::DRIVER_FAILED,
                                format!("driver {} failed", pod.name_any()),
                            )),
                            _ => {}
                        }
                    }
                }
                None => {
                    status.app_state = ApplicationState {
                        state: ApplicationStateType::Failing,
                        error_message: Some("driver pod not found".to_owned()),
                    };
                    if status.termination_time.is_none() {
                        status.termination_time = Some(Time(Utc::now()));
                    }
                }
            }

            // Executor aggregation; terminal states are sticky.
            let mut observed: BTreeMap<String, ExecutorState> = BTreeMap::new();
            for pod in &executor_pods {
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|status| status.phase.as_deref());
                observed.insert(pod.name_any(), app_status::pod_phase_to_executor_state(phase));
            }
            for (executor, new_executor_state) in &observed {
                let old_executor_state = status.executor_state.get(executor).copied();
                let apply = match old_executor_state {
                    Some(old) => app_status::is_valid_executor_transition(old, *new_executor_state),
                    None => true,
                };
                if apply {
                    status
                        .executor_state
                        .insert(executor.clone(), *new_executor_state);
                    match new_executor_state {
                        ExecutorState::Completed => pending_events.push((
                            EventSeverity::Normal,
                            events::EXECUTOR_COMPLETED,
                            format!("executor {executor} completed"),
                        )),
                        ExecutorState::Failed => pending_events.push((
                            EventSeverity::Warning,
                            events::EXECUTOR_FAILED,
                            format!("executor {executor} failed"),
                        )),
                        _ => {}
                    }
                }
            }
            // An executor that was seen before and is gone now did not exit
            // cleanly.
            let vanished: Vec<String> = status
                .executor_state
                .iter()
                .filter(|(executor, state)| {
                    !state.is_terminal() && !observed.contains_key(*executor)
                })
                .map(|(executor, _)| executor.clone())
                .collect();
            for executor in vanished {
                status
                    .executor_state
                    .insert(executor.clone(), ExecutorState::Failed);
                pending_events.push((
                    EventSeverity::Warning,
                    events::EXECUTOR_FAILED,
                    format!("executor {executor} disappeared and is assumed failed"),
                ));
            }
        }

        for (severity, reason, message) in pending_events {
            self.recorder.publish(app, severity, reason, message).await;
        }
        Ok(())
    }

    /// Tears down the previous run so a fresh submission can start.
    async fn prepare_rerun(&self, app: &mut SparkApplication) -> Result<()> {
        self.cleanup_run_resources(app).await?;
        let status = app.status.get_or_insert_with(Default::default);
        status.app_state.state = ApplicationStateType::PendingRerun;
        let name = app.name_any();
        self.recorder
            .publish(
                app,
                EventSeverity::Normal,
                events::APPLICATION_PENDING_RERUN,
                format!("application {name} is pending rerun"),
            )
            .await;
        Ok(())
    }

    /// A spec change was observed; wipe the previous run entirely.
    async fn invalidate(&self, app: &mut SparkApplication) -> Result<()> {
        self.cleanup_run_resources(app).await?;
        let status = app.status.get_or_insert_with(Default::default);
        status.app_state = ApplicationState {
            state: ApplicationStateType::PendingRerun,
            error_message: None,
        };
        status.submission_id = None;
        status.submission_attempts = 0;
        status.execution_attempts = 0;
        status.submission_time = None;
        status.termination_time = None;
        status.completion_time = None;
        status.driver_info = DriverInfo::default();
        status.executor_state.clear();
        let name = app.name_any();
        self.recorder
            .publish(
                app,
                EventSeverity::Normal,
                events::APPLICATION_PENDING_RERUN,
                format!("application {name} was invalidated and is pending rerun"),
            )
            .await;
        Ok(())
    }

    /// Creates the next submission once the previous run's artifacts are
    /// verifiably gone.
    async fn resume_after_rerun(&self, app: &mut SparkApplication) -> Result<()> {
        if self
            .job_manager
            .get(app)
            .await
            .context(InspectSubmissionJobSnafu)?
            .is_some()
        {
            return Ok(());
        }
        let namespace = app.namespace().unwrap_or_default();
        let driver_pod_name = app
            .status
            .as_ref()
            .and_then(|status| status.driver_info.pod_name.clone())
            .unwrap_or_else(|| app.driver_pod_name());
        if self
            .client
            .driver_pod_exists(&namespace, &driver_pod_name)
            .await
            .context(CheckDriverPodSnafu)?
        {
            return Ok(());
        }
        self.submit(app).await
    }

    async fn cleanup_run_resources(&self, app: &SparkApplication) -> Result<()> {
        self.job_manager
            .delete(app)
            .await
            .context(DeleteSubmissionJobSnafu)?;
        let namespace = app.namespace().unwrap_or_default();
        if let Some(driver_pod_name) = app
            .status
            .as_ref()
            .and_then(|status| status.driver_info.pod_name.clone())
        {
            self.client
                .delete_driver_pod(&namespace, &driver_pod_name)
                .await
                .context(DeleteDriverPodSnafu)?;
        }
        Ok(())
    }

    /// Deletion timestamp observed: drain launcher artifacts, then release
    /// the finalizer.
    async fn finalize_application(&self, app: &SparkApplication) -> Result<()> {
        self.cleanup_run_resources(app).await?;
        let has_finalizer = app
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|finalizers| {
                finalizers.iter().any(|f| f == DRIVER_CLEANUP_FINALIZER)
            });
        if has_finalizer {
            let mut updated = app.clone();
            if let Some(finalizers) = updated.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != DRIVER_CLEANUP_FINALIZER);
            }
            self.client
                .update_application(&updated)
                .await
                .context(PersistApplicationSnafu)?;
        }
        Ok(())
    }

    /// Persists the mutation and exports transition metrics. The update is
    /// optimistic; a conflict propagates and re-queues the key.
    async fn persist(&self, old: &SparkApplication, mut updated: SparkApplication) -> Result<()> {
        if old.metadata.finalizers != updated.metadata.finalizers {
            let replaced = self
                .client
                .update_application(&updated)
                .await
                .context(PersistApplicationSnafu)?;
            updated.metadata.resource_version = replaced.metadata.resource_version.clone();
        }
        if old.status != updated.status {
            let namespace = updated.namespace().unwrap_or_default();
            let name = updated.name_any();
            let old_status = old.status.clone().unwrap_or_default();
            let new_status = updated.status.clone().unwrap_or_default();
            tracing::debug!(
                namespace,
                name,
                from = %old_status.app_state.state,
                to = %new_status.app_state.state,
                "persisting application status"
            );
            self.client
                .update_status(&updated)
                .await
                .context(PersistStatusSnafu)?;
            self.metrics
                .export(&old_status, &new_status, &namespace, &name);
        }
        Ok(())
    }
}

fn status_of(app: &SparkApplication) -> &spark_application_crd::SparkApplicationStatus {
    static EMPTY: std::sync::OnceLock<spark_application_crd::SparkApplicationStatus> =
        std::sync::OnceLock::new();
    app.status
        .as_ref()
        .unwrap_or_else(|| EMPTY.get_or_init(Default::default))
}

fn set_state(app: &mut SparkApplication, state: ApplicationStateType) {
    app.status.get_or_insert_with(Default::default).app_state.state = state;
}

fn failure_note(app: &SparkApplication) -> String {
    let name = app.name_any();
    match &status_of(app).app_state.error_message {
        Some(message) => format!("application {name} failed: {message}"),
        None => format!("application {name} failed"),
    }
}

fn add_driver_finalizer(app: &mut SparkApplication) {
    let finalizers = app.metadata.finalizers.get_or_insert_with(Vec::new);
    if !finalizers.iter().any(|f| f == DRIVER_CLEANUP_FINALIZER) {
        finalizers.push(DRIVER_CLEANUP_FINALIZER.to_owned());
    }
}

/// A node selector defined at both application and pod level is ambiguous:
/// the launcher would silently prefer one of them.
fn validate_application(app: &SparkApplication) -> std::result::Result<(), String> {
    let app_level = app
        .spec
        .node_selector
        .as_ref()
        .is_some_and(|selector| !selector.is_empty());
    let pod_level = [
        &app.spec.driver.spark_pod_spec.node_selector,
        &app.spec.executor.spark_pod_spec.node_selector,
    ]
    .iter()
    .any(|selector| selector.as_ref().is_some_and(|selector| !selector.is_empty()));
    if app_level && pod_level {
        return Err(
            "node selector must not be defined at both application and pod level".to_owned(),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::object_key;
    use crate::testutil::{
        application, CreateBehavior, FakeCluster, FakeJobManager, FakeRecorder, PodBuilder,
    };
    use k8s_openapi::chrono::Duration as ChronoDuration;
    use prometheus::Registry;
    use spark_application_crd::constants::{
        DRIVER_CONTAINER_NAME, SPARK_DRIVER_ROLE, SPARK_EXECUTOR_ROLE,
    };
    use spark_application_crd::{
        RestartPolicy, RestartPolicyType, SparkApplicationStatus,
    };

    struct Harness {
        controller: Controller,
        registry: Registry,
        cluster: Arc<FakeCluster>,
        job_manager: Arc<FakeJobManager>,
        recorder: Arc<FakeRecorder>,
        apps: Arc<ApplicationStore>,
        pods: Arc<PodStore>,
    }

    impl Harness {
        fn new() -> Self {
            let registry = Registry::new();
            let apps = Arc::new(ApplicationStore::default());
            let pods = Arc::new(PodStore::default());
            let cluster = Arc::new(FakeCluster::default());
            let job_manager = Arc::new(FakeJobManager::default());
            let recorder = Arc::new(FakeRecorder::default());
            let controller = Controller::new(
                WorkQueue::new(),
                apps.clone(),
                pods.clone(),
                cluster.clone(),
                job_manager.clone(),
                recorder.clone(),
                ApplicationMetrics::new(&registry).unwrap(),
            );
            Self {
                controller,
                registry,
                cluster,
                job_manager,
                recorder,
                apps,
                pods,
            }
        }

        fn seed(&self, app: &SparkApplication) {
            let key = object_key(&app.namespace().unwrap(), &app.name_any());
            self.apps.apply(app.clone());
            self.cluster.apps.lock().unwrap().insert(key, app.clone());
        }

        /// Reflects the persisted object back into the cache, as the watch
        /// stream eventually would, then runs one reconciliation.
        async fn sync(&self, key: &str) {
            if let Some(app) = self.cluster.app(key) {
                self.apps.apply(app);
            }
            self.controller.sync_application(key).await.unwrap();
        }

        fn status(&self, key: &str) -> SparkApplicationStatus {
            self.cluster
                .app(key)
                .and_then(|app| app.status)
                .unwrap_or_default()
        }

        fn state(&self, key: &str) -> ApplicationStateType {
            self.status(key).app_state.state
        }

        fn backdate_submission_time(&self, key: &str, seconds: i64) {
            let mut apps = self.cluster.apps.lock().unwrap();
            let status = apps.get_mut(key).unwrap().status.as_mut().unwrap();
            status.submission_time = Some(Time(Utc::now() - ChronoDuration::seconds(seconds)));
        }

        fn backdate_termination_time(&self, key: &str, seconds: i64) {
            let mut apps = self.cluster.apps.lock().unwrap();
            let status = apps.get_mut(key).unwrap().status.as_mut().unwrap();
            status.termination_time = Some(Time(Utc::now() - ChronoDuration::seconds(seconds)));
        }

        fn counter(&self, name: &str) -> u64 {
            self.registry
                .gather()
                .iter()
                .find(|family| family.get_name() == name)
                .map(|family| {
                    family
                        .get_metric()
                        .iter()
                        .map(|metric| metric.get_counter().get_value() as u64)
                        .sum()
                })
                .unwrap_or(0)
        }

        fn gauge(&self, name: &str) -> i64 {
            self.registry
                .gather()
                .iter()
                .find(|family| family.get_name() == name)
                .map(|family| {
                    family
                        .get_metric()
                        .iter()
                        .map(|metric| metric.get_gauge().get_value() as i64)
                        .sum()
                })
                .unwrap_or(0)
        }
    }

    fn running_app(key_name: &str, submission_id: &str) -> SparkApplication {
        let mut app = application("default", key_name);
        let mut status = SparkApplicationStatus::default();
        status.app_state.state = ApplicationStateType::Running;
        status.submission_id = Some(submission_id.to_owned());
        status.submission_attempts = 1;
        status.execution_attempts = 1;
        status.driver_info.pod_name = Some(format!("{key_name}-driver"));
        app.status = Some(status);
        app
    }

    #[tokio::test]
    async fn happy_path_cluster_mode_without_restart() {
        let harness = Harness::new();
        let key = "default/foo";
        harness.seed(&application("default", "foo"));

        // First pass validates and creates the submission job.
        harness.sync(key).await;
        let status = harness.status(key);
        assert_eq!(ApplicationStateType::PendingSubmission, status.app_state.state);
        assert_eq!(1, status.submission_attempts);
        assert_eq!(1, status.execution_attempts);
        assert!(status.submission_time.is_some());
        let submission_id = status.submission_id.clone().expect("submission id assigned");
        assert_eq!(vec!["foo".to_owned()], *harness.job_manager.created.lock().unwrap());
        assert!(harness.recorder.contains(events::SUBMISSION_JOB_CREATED));

        // The launcher job completes: the application is submitted and the
        // job is disposed of.
        *harness.job_manager.outcome.lock().unwrap() =
            SubmissionOutcome::Succeeded { completion_time: None };
        harness.sync(key).await;
        assert_eq!(ApplicationStateType::Submitted, harness.state(key));
        assert!(harness
            .job_manager
            .deleted
            .lock()
            .unwrap()
            .contains(&"foo-spark-submit".to_owned()));
        assert_eq!(1, harness.counter("spark_app_submit_count"));
        assert!(harness.recorder.contains(events::APPLICATION_SUBMITTED));

        // Driver and one executor run.
        harness.pods.apply(
            PodBuilder::new("default", "foo-driver", SPARK_DRIVER_ROLE, "foo")
                .submission_id(&submission_id)
                .phase("Running")
                .build(),
        );
        harness.pods.apply(
            PodBuilder::new("default", "exec-1", SPARK_EXECUTOR_ROLE, "foo")
                .submission_id(&submission_id)
                .phase("Running")
                .build(),
        );
        harness.sync(key).await;
        assert_eq!(ApplicationStateType::Running, harness.state(key));
        assert_eq!(
            Some(&ExecutorState::Running),
            harness.status(key).executor_state.get("exec-1")
        );
        assert_eq!(1, harness.gauge("spark_app_running_count"));

        // Driver container exits zero while the pod is still Running.
        harness.pods.apply(
            PodBuilder::new("default", "foo-driver", SPARK_DRIVER_ROLE, "foo")
                .submission_id(&submission_id)
                .phase("Running")
                .container(DRIVER_CONTAINER_NAME, Some((0, "Completed")))
                .build(),
        );
        harness.sync(key).await;
        assert_eq!(ApplicationStateType::Succeeding, harness.state(key));
        assert!(harness.status(key).completion_time.is_some());
        assert!(harness.status(key).termination_time.is_some());
        assert_eq!(0, harness.gauge("spark_app_running_count"));

        // The next pass retires the application.
        harness.sync(key).await;
        assert_eq!(ApplicationStateType::Completed, harness.state(key));
        assert_eq!(1, harness.counter("spark_app_submit_count"));
        assert_eq!(1, harness.counter("spark_app_success_count"));
        assert!(harness.recorder.contains(events::APPLICATION_COMPLETED));

        // Terminal states are absorbing: nothing else is submitted.
        harness.sync(key).await;
        assert_eq!(1, harness.job_manager.created.lock().unwrap().len());
        assert_eq!(ApplicationStateType::Completed, harness.state(key));
    }

    #[tokio::test]
    async fn submission_failure_retries_until_policy_exhausted() {
        let harness = Harness::new();
        let key = "default/foo";
        let mut app = application("default", "foo");
        app.spec.restart_policy = RestartPolicy {
            policy_type: RestartPolicyType::OnFailure,
            on_submission_failure_retries: Some(2),
            on_submission_failure_retry_interval: Some(50),
            ..RestartPolicy::default()
        };
        harness.seed(&app);
        *harness.job_manager.create_behavior.lock().unwrap() = CreateBehavior::Fail;

        harness.sync(key).await;
        let status = harness.status(key);
        assert_eq!(ApplicationStateType::FailedSubmission, status.app_state.state);
        assert_eq!(1, status.submission_attempts);
        assert!(status.app_state.error_message.is_some());
        assert_eq!(1, harness.counter("spark_app_failed_submission_count"));
        assert!(harness.recorder.contains(events::SUBMISSION_FAILED));

        // The retry interval has not elapsed yet: nothing changes.
        harness.sync(key).await;
        assert_eq!(ApplicationStateType::FailedSubmission, harness.state(key));
        assert_eq!(1, harness.status(key).submission_attempts);

        // Once due, the run is torn down and resubmitted.
        harness.backdate_submission_time(key, 1_000);
        harness.sync(key).await;
        assert_eq!(ApplicationStateType::PendingRerun, harness.state(key));
        harness.sync(key).await;
        assert_eq!(ApplicationStateType::FailedSubmission, harness.state(key));
        assert_eq!(2, harness.status(key).submission_attempts);

        harness.backdate_submission_time(key, 1_000);
        harness.sync(key).await;
        harness.sync(key).await;
        assert_eq!(3, harness.status(key).submission_attempts);

        // Both allowed retries are used up now.
        harness.backdate_submission_time(key, 1_000);
        harness.sync(key).await;
        assert_eq!(ApplicationStateType::Failed, harness.state(key));
        assert_eq!(1, harness.counter("spark_app_failure_count"));
        assert_eq!(3, harness.counter("spark_app_failed_submission_count"));
    }

    #[tokio::test]
    async fn driver_oom_with_completed_sidecar_is_failing() {
        let harness = Harness::new();
        let key = "default/foo";
        harness.seed(&running_app("foo", "sub-1"));
        harness.pods.apply(
            PodBuilder::new("default", "foo-driver", SPARK_DRIVER_ROLE, "foo")
                .submission_id("sub-1")
                .phase("Failed")
                .container(DRIVER_CONTAINER_NAME, Some((137, "OOMKilled")))
                .container("sidecar", Some((0, "Completed")))
                .build(),
        );

        harness.sync(key).await;
        let status = harness.status(key);
        assert_eq!(ApplicationStateType::Failing, status.app_state.state);
        assert_eq!(
            Some("driver container failed with ExitCode: 137, Reason: OOMKilled".to_owned()),
            status.app_state.error_message
        );
        assert!(status.termination_time.is_some());
        assert!(harness.recorder.contains(events::DRIVER_FAILED));
    }

    #[tokio::test]
    async fn sidecar_failure_with_successful_driver_is_succeeding() {
        let harness = Harness::new();
        let key = "default/foo";
        harness.seed(&running_app("foo", "sub-1"));
        harness.pods.apply(
            PodBuilder::new("default", "foo-driver", SPARK_DRIVER_ROLE, "foo")
                .submission_id("sub-1")
                .phase("Failed")
                .container(DRIVER_CONTAINER_NAME, Some((0, "Completed")))
                .container("sidecar", Some((137, "OOMKilled")))
                .build(),
        );

        harness.sync(key).await;
        assert_eq!(ApplicationStateType::Succeeding, harness.state(key));
        assert!(harness.recorder.contains(events::DRIVER_COMPLETED));
    }

    #[tokio::test]
    async fn vanished_executor_is_marked_failed_and_sticky() {
        let harness = Harness::new();
        let key = "default/foo";
        let mut app = running_app("foo", "sub-1");
        app.status
            .as_mut()
            .unwrap()
            .executor_state
            .insert("exec-1".to_owned(), ExecutorState::Running);
        harness.seed(&app);
        harness.pods.apply(
            PodBuilder::new("default", "foo-driver", SPARK_DRIVER_ROLE, "foo")
                .submission_id("sub-1")
                .phase("Running")
                .build(),
        );

        harness.sync(key).await;
        assert_eq!(
            Some(&ExecutorState::Failed),
            harness.status(key).executor_state.get("exec-1")
        );
        assert_eq!(1, harness.counter("spark_app_executor_failure_count"));
        assert!(harness.recorder.contains(events::EXECUTOR_FAILED));

        // Still absent on the next snapshot: the state is sticky and the
        // counter does not move again.
        harness.sync(key).await;
        assert_eq!(
            Some(&ExecutorState::Failed),
            harness.status(key).executor_state.get("exec-1")
        );
        assert_eq!(1, harness.counter("spark_app_executor_failure_count"));
    }

    #[tokio::test]
    async fn ttl_expiry_deletes_the_application() {
        let harness = Harness::new();
        let key = "default/foo";
        let mut app = application("default", "foo");
        app.spec.time_to_live_seconds = Some(1);
        let mut status = SparkApplicationStatus::default();
        status.app_state.state = ApplicationStateType::Completed;
        status.termination_time = Some(Time(Utc::now() - ChronoDuration::seconds(2)));
        app.status = Some(status);
        harness.seed(&app);

        harness.sync(key).await;
        assert!(harness.cluster.app(key).is_none());
        assert_eq!(
            vec![key.to_owned()],
            *harness.cluster.deleted_applications.lock().unwrap()
        );
    }

    #[tokio::test]
    async fn invalid_spec_fails_without_submission() {
        let harness = Harness::new();
        let key = "default/foo";
        let mut app = application("default", "foo");
        app.spec.node_selector = Some([("zone".to_owned(), "a".to_owned())].into());
        app.spec.driver.spark_pod_spec.node_selector =
            Some([("zone".to_owned(), "b".to_owned())].into());
        harness.seed(&app);

        harness.sync(key).await;
        let status = harness.status(key);
        assert_eq!(ApplicationStateType::Failed, status.app_state.state);
        assert!(status.app_state.error_message.is_some());
        assert!(harness.job_manager.created.lock().unwrap().is_empty());
        assert!(harness.recorder.contains(events::SPEC_INVALID));
    }

    #[tokio::test]
    async fn invalidating_resets_and_moves_to_pending_rerun() {
        let harness = Harness::new();
        let key = "default/foo";
        let mut app = running_app("foo", "sub-1");
        {
            let status = app.status.as_mut().unwrap();
            status.app_state.state = ApplicationStateType::Invalidating;
            status.submission_attempts = 3;
            status.execution_attempts = 2;
            status
                .executor_state
                .insert("exec-1".to_owned(), ExecutorState::Running);
        }
        harness.seed(&app);

        harness.sync(key).await;
        let status = harness.status(key);
        assert_eq!(ApplicationStateType::PendingRerun, status.app_state.state);
        assert_eq!(0, status.submission_attempts);
        assert_eq!(0, status.execution_attempts);
        assert_eq!(None, status.submission_id);
        assert_eq!(DriverInfo::default(), status.driver_info);
        assert!(status.executor_state.is_empty());
        // The previous run's artifacts were torn down.
        assert!(harness
            .cluster
            .deleted_driver_pods
            .lock()
            .unwrap()
            .contains(&"default/foo-driver".to_owned()));
        assert_eq!(
            vec!["foo-spark-submit".to_owned()],
            *harness.job_manager.deleted.lock().unwrap()
        );
    }

    #[tokio::test]
    async fn pending_rerun_waits_for_artifact_deletion() {
        let harness = Harness::new();
        let key = "default/foo";
        let mut app = running_app("foo", "sub-1");
        app.status.as_mut().unwrap().app_state.state = ApplicationStateType::PendingRerun;
        harness.seed(&app);

        // The previous submission job still exists.
        *harness.job_manager.existing_job.lock().unwrap() =
            Some(k8s_openapi::api::batch::v1::Job::default());
        harness.sync(key).await;
        assert_eq!(ApplicationStateType::PendingRerun, harness.state(key));
        assert!(harness.job_manager.created.lock().unwrap().is_empty());

        // The job is gone but the driver pod lingers.
        *harness.job_manager.existing_job.lock().unwrap() = None;
        harness
            .cluster
            .existing_driver_pods
            .lock()
            .unwrap()
            .insert("default/foo-driver".to_owned());
        harness.sync(key).await;
        assert_eq!(ApplicationStateType::PendingRerun, harness.state(key));

        // Everything is gone: a fresh attempt starts with a new UUID.
        harness
            .cluster
            .existing_driver_pods
            .lock()
            .unwrap()
            .clear();
        harness.sync(key).await;
        let status = harness.status(key);
        assert_eq!(ApplicationStateType::PendingSubmission, status.app_state.state);
        assert_eq!(2, status.submission_attempts);
        assert_eq!(2, status.execution_attempts);
        assert_ne!(Some("sub-1".to_owned()), status.submission_id);
    }

    #[tokio::test]
    async fn existing_submission_job_is_adopted_without_counting() {
        let harness = Harness::new();
        let key = "default/foo";
        harness.seed(&application("default", "foo"));
        *harness.job_manager.create_behavior.lock().unwrap() = CreateBehavior::AlreadyExists;

        harness.sync(key).await;
        let status = harness.status(key);
        assert_eq!(ApplicationStateType::PendingSubmission, status.app_state.state);
        assert_eq!(0, status.submission_attempts);
        assert_eq!(0, status.execution_attempts);
    }

    #[tokio::test]
    async fn already_submitted_launcher_failure_retains_the_attempt() {
        let harness = Harness::new();
        let key = "default/foo";
        let mut app = running_app("foo", "sub-1");
        {
            let status = app.status.as_mut().unwrap();
            status.app_state.state = ApplicationStateType::PendingSubmission;
        }
        harness.seed(&app);
        *harness.job_manager.outcome.lock().unwrap() = SubmissionOutcome::Failed {
            message: "pod already exists, code=409".to_owned(),
        };

        harness.sync(key).await;
        let status = harness.status(key);
        assert_eq!(ApplicationStateType::Submitted, status.app_state.state);
        assert_eq!(1, status.submission_attempts);
        assert!(!harness.recorder.contains(events::SUBMISSION_FAILED));
    }

    #[tokio::test]
    async fn failed_launcher_job_records_the_failure() {
        let harness = Harness::new();
        let key = "default/foo";
        let mut app = running_app("foo", "sub-1");
        app.status.as_mut().unwrap().app_state.state =
            ApplicationStateType::PendingSubmission;
        harness.seed(&app);
        *harness.job_manager.outcome.lock().unwrap() = SubmissionOutcome::Failed {
            message: "BackoffLimitExceeded".to_owned(),
        };

        harness.sync(key).await;
        let status = harness.status(key);
        assert_eq!(ApplicationStateType::FailedSubmission, status.app_state.state);
        assert_eq!(
            Some("BackoffLimitExceeded".to_owned()),
            status.app_state.error_message
        );
        assert!(status.termination_time.is_some());
        assert_eq!(1, harness.counter("spark_app_failed_submission_count"));
    }

    #[tokio::test]
    async fn missing_driver_pod_while_running_is_failing() {
        let harness = Harness::new();
        let key = "default/foo";
        harness.seed(&running_app("foo", "sub-1"));

        harness.sync(key).await;
        let status = harness.status(key);
        assert_eq!(ApplicationStateType::Failing, status.app_state.state);
        assert_eq!(
            Some("driver pod not found".to_owned()),
            status.app_state.error_message
        );
    }

    #[tokio::test]
    async fn pods_from_other_submission_attempts_are_ignored() {
        let harness = Harness::new();
        let key = "default/foo";
        harness.seed(&running_app("foo", "sub-2"));
        // A leftover driver pod from the first attempt, already failed.
        harness.pods.apply(
            PodBuilder::new("default", "foo-driver", SPARK_DRIVER_ROLE, "foo")
                .submission_id("sub-1")
                .phase("Failed")
                .build(),
        );

        harness.sync(key).await;
        // The old pod is not part of this attempt: the driver is missing.
        assert_eq!(
            Some("driver pod not found".to_owned()),
            harness.status(key).app_state.error_message
        );
    }

    #[tokio::test]
    async fn failing_with_never_policy_becomes_failed() {
        let harness = Harness::new();
        let key = "default/foo";
        let mut app = running_app("foo", "sub-1");
        {
            let status = app.status.as_mut().unwrap();
            status.app_state.state = ApplicationStateType::Failing;
            status.app_state.error_message = Some("driver pod not found".to_owned());
        }
        harness.seed(&app);

        harness.sync(key).await;
        let status = harness.status(key);
        assert_eq!(ApplicationStateType::Failed, status.app_state.state);
        // The cause survives the transition.
        assert_eq!(
            Some("driver pod not found".to_owned()),
            status.app_state.error_message
        );
        assert_eq!(1, harness.counter("spark_app_failure_count"));
        assert!(harness.recorder.contains(events::APPLICATION_FAILED));
    }

    #[tokio::test]
    async fn failing_with_always_policy_reruns_after_interval() {
        let harness = Harness::new();
        let key = "default/foo";
        let mut app = running_app("foo", "sub-1");
        app.spec.restart_policy = RestartPolicy {
            policy_type: RestartPolicyType::Always,
            on_failure_retry_interval: Some(50),
            ..RestartPolicy::default()
        };
        app.status.as_mut().unwrap().app_state.state = ApplicationStateType::Failing;
        app.status.as_mut().unwrap().termination_time = Some(Time(Utc::now()));
        harness.seed(&app);

        // Interval not elapsed: the application keeps Failing.
        harness.sync(key).await;
        assert_eq!(ApplicationStateType::Failing, harness.state(key));

        harness.backdate_termination_time(key, 1_000);
        harness.sync(key).await;
        assert_eq!(ApplicationStateType::PendingRerun, harness.state(key));
        assert!(harness.recorder.contains(events::APPLICATION_PENDING_RERUN));
    }

    #[tokio::test]
    async fn succeeding_with_always_policy_reruns() {
        let harness = Harness::new();
        let key = "default/foo";
        let mut app = running_app("foo", "sub-1");
        app.spec.restart_policy = RestartPolicy {
            policy_type: RestartPolicyType::Always,
            ..RestartPolicy::default()
        };
        app.status.as_mut().unwrap().app_state.state = ApplicationStateType::Succeeding;
        harness.seed(&app);

        harness.sync(key).await;
        assert_eq!(ApplicationStateType::PendingRerun, harness.state(key));
    }

    #[tokio::test]
    async fn sync_is_idempotent_on_equal_observations() {
        let harness = Harness::new();
        let key = "default/foo";
        harness.seed(&running_app("foo", "sub-1"));
        harness.pods.apply(
            PodBuilder::new("default", "foo-driver", SPARK_DRIVER_ROLE, "foo")
                .submission_id("sub-1")
                .phase("Running")
                .build(),
        );
        harness.pods.apply(
            PodBuilder::new("default", "exec-1", SPARK_EXECUTOR_ROLE, "foo")
                .submission_id("sub-1")
                .phase("Running")
                .build(),
        );

        harness.sync(key).await;
        let first = harness.status(key);
        harness.sync(key).await;
        let second = harness.status(key);
        assert_eq!(first, second);
        assert_eq!(1, harness.gauge("spark_app_executor_running_count"));
    }

    #[tokio::test]
    async fn deletion_timestamp_drains_resources_and_finalizer() {
        let harness = Harness::new();
        let key = "default/foo";
        let mut app = running_app("foo", "sub-1");
        app.metadata.deletion_timestamp = Some(Time(Utc::now()));
        app.metadata.finalizers = Some(vec![DRIVER_CLEANUP_FINALIZER.to_owned()]);
        harness.seed(&app);

        harness.sync(key).await;
        assert!(harness
            .cluster
            .deleted_driver_pods
            .lock()
            .unwrap()
            .contains(&"default/foo-driver".to_owned()));
        assert_eq!(
            vec!["foo-spark-submit".to_owned()],
            *harness.job_manager.deleted.lock().unwrap()
        );
        let persisted = harness.cluster.app(key).unwrap();
        assert_eq!(Some(Vec::new()), persisted.metadata.finalizers);
    }
}
