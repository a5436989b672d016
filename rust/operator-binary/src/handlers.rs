//! Translates cache notifications on applications and pods into work-queue
//! enqueues.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use spark_application_crd::constants::LABEL_APP_NAME;
use spark_application_crd::{ApplicationState, ApplicationStateType, SparkApplication};

use crate::client::ApplicationClient;
use crate::events::{self, EventRecorder, EventSeverity};
use crate::store::{object_key, ApplicationStore, PodStore};
use crate::workqueue::WorkQueue;

pub struct EventHandlers {
    queue: Arc<WorkQueue>,
    apps: Arc<ApplicationStore>,
    pods: Arc<PodStore>,
    client: Arc<dyn ApplicationClient>,
    recorder: Arc<dyn EventRecorder>,
}

impl EventHandlers {
    pub fn new(
        queue: Arc<WorkQueue>,
        apps: Arc<ApplicationStore>,
        pods: Arc<PodStore>,
        client: Arc<dyn ApplicationClient>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            queue,
            apps,
            pods,
            client,
            recorder,
        }
    }

    fn app_key(app: &SparkApplication) -> String {
        object_key(&app.namespace().unwrap_or_default(), &app.name_any())
    }

    /// Add or update notification for an application.
    pub async fn application_applied(&self, app: SparkApplication) {
        let key = Self::app_key(&app);
        let previous = self.apps.apply(app.clone());
        match previous {
            None => self.application_added(&key, &app).await,
            Some(previous) => self.application_updated(&key, &previous, &app).await,
        }
    }

    async fn application_added(&self, key: &str, app: &SparkApplication) {
        tracing::info!(key, "application added, enqueueing it for submission");
        self.queue.add_rate_limited(key);
        self.recorder
            .publish(
                app,
                EventSeverity::Normal,
                events::APPLICATION_ADDED,
                format!("application {} was added, enqueued it for submission", app.name_any()),
            )
            .await;
    }

    async fn application_updated(
        &self,
        key: &str,
        previous: &SparkApplication,
        app: &SparkApplication,
    ) {
        if previous.spec != app.spec {
            self.process_spec_update(key, app).await;
            return;
        }
        if app.metadata.deletion_timestamp.is_some() {
            tracing::debug!(key, "application marked for deletion, enqueueing for finalization");
        }
        self.queue.add_rate_limited(key);
    }

    /// Durably marks a spec change by moving the persisted status to
    /// `Invalidating` with reset attempt counters. On a conflict the stale
    /// view is dropped; the subsequent watch notification carries the fresh
    /// object.
    async fn process_spec_update(&self, key: &str, app: &SparkApplication) {
        if app.application_state() == ApplicationStateType::Invalidating {
            self.queue.add_rate_limited(key);
            return;
        }

        let mut updated = app.clone();
        let status = updated.status.get_or_insert_with(Default::default);
        status.app_state = ApplicationState {
            state: ApplicationStateType::Invalidating,
            error_message: None,
        };
        status.submission_attempts = 0;
        status.execution_attempts = 0;

        match self.client.update_status(&updated).await {
            Ok(_) => {
                self.recorder
                    .publish(
                        app,
                        EventSeverity::Normal,
                        events::SPEC_UPDATE_PROCESSED,
                        format!("spec update of application {} accepted", app.name_any()),
                    )
                    .await;
                self.queue.add_rate_limited(key);
            }
            Err(error) if error.is_conflict() => {
                tracing::warn!(key, "conflicting spec update, dropping stale view");
                self.recorder
                    .publish(
                        app,
                        EventSeverity::Warning,
                        events::SPEC_UPDATE_FAILED,
                        format!(
                            "spec update of application {} could not be recorded",
                            app.name_any()
                        ),
                    )
                    .await;
            }
            Err(error) => {
                tracing::error!(%error, key, "failed to record spec update");
                self.recorder
                    .publish(
                        app,
                        EventSeverity::Warning,
                        events::SPEC_UPDATE_FAILED,
                        format!(
                            "spec update of application {} could not be recorded",
                            app.name_any()
                        ),
                    )
                    .await;
            }
        }
    }

    /// Delete notification: the key is dequeued, pending work for it is
    /// meaningless now.
    pub async fn application_deleted(&self, app: SparkApplication) {
        let key = Self::app_key(&app);
        self.apps.remove(&app);
        self.queue.forget(&key);
        self.queue.done(&key);
        tracing::info!(key, "application deleted");
        self.recorder
            .publish(
                &app,
                EventSeverity::Normal,
                events::APPLICATION_DELETED,
                format!("application {} was deleted", app.name_any()),
            )
            .await;
    }

    /// Add or update notification for an operator-launched pod.
    pub fn pod_applied(&self, pod: Pod) {
        self.enqueue_owning_application(&pod);
        self.pods.apply(pod);
    }

    /// Pod deletion enqueues before the cache drops the pod so the next sync
    /// observes the disappearance.
    pub fn pod_deleted(&self, pod: Pod) {
        self.enqueue_owning_application(&pod);
        self.pods.remove(&pod);
    }

    fn enqueue_owning_application(&self, pod: &Pod) {
        if let Some(app_name) = pod.labels().get(LABEL_APP_NAME) {
            let key = object_key(&pod.namespace().unwrap_or_default(), app_name);
            self.queue.add_rate_limited(&key);
        }
    }

    /// Periodic re-list: every cached application gets another pass so
    /// missed events self-heal.
    pub fn resync(&self) {
        for key in self.apps.keys() {
            self.queue.add_rate_limited(&key);
        }
    }
}
