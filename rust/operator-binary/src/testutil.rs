//! In-memory fakes for the cluster-facing capabilities, shared by the
//! controller and handler tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodSpec, PodStatus,
};
use kube::ResourceExt;
use spark_application_crd::constants::{
    LABEL_APP_NAME, LABEL_SPARK_ROLE, LABEL_SUBMISSION_ID,
};
use spark_application_crd::SparkApplication;
use uuid::Uuid;

use crate::client::ApplicationClient;
use crate::events::{EventRecorder, EventSeverity};
use crate::store::object_key;
use crate::submission::{
    self, NoImageSnafu, SubmissionHandle, SubmissionJobManager, SubmissionOutcome,
};

#[derive(Default)]
pub struct FakeCluster {
    pub apps: Mutex<HashMap<String, SparkApplication>>,
    pub deleted_applications: Mutex<Vec<String>>,
    pub deleted_driver_pods: Mutex<Vec<String>>,
    pub existing_driver_pods: Mutex<HashSet<String>>,
    pub node_ips: Mutex<HashMap<String, String>>,
}

impl FakeCluster {
    pub fn app(&self, key: &str) -> Option<SparkApplication> {
        self.apps.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl ApplicationClient for FakeCluster {
    async fn update_status(
        &self,
        app: &SparkApplication,
    ) -> Result<SparkApplication, crate::client::Error> {
        let key = object_key(&app.namespace().unwrap_or_default(), &app.name_any());
        self.apps.lock().unwrap().insert(key, app.clone());
        Ok(app.clone())
    }

    async fn update_application(
        &self,
        app: &SparkApplication,
    ) -> Result<SparkApplication, crate::client::Error> {
        self.update_status(app).await
    }

    async fn delete_application(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), crate::client::Error> {
        let key = object_key(namespace, name);
        self.apps.lock().unwrap().remove(&key);
        self.deleted_applications.lock().unwrap().push(key);
        Ok(())
    }

    async fn delete_driver_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), crate::client::Error> {
        let key = object_key(namespace, name);
        self.existing_driver_pods.lock().unwrap().remove(&key);
        self.deleted_driver_pods.lock().unwrap().push(key);
        Ok(())
    }

    async fn driver_pod_exists(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<bool, crate::client::Error> {
        Ok(self
            .existing_driver_pods
            .lock()
            .unwrap()
            .contains(&object_key(namespace, name)))
    }

    async fn node_external_ip(
        &self,
        node_name: &str,
    ) -> Result<Option<String>, crate::client::Error> {
        Ok(self.node_ips.lock().unwrap().get(node_name).cloned())
    }
}

pub enum CreateBehavior {
    Succeed,
    AlreadyExists,
    Fail,
}

pub struct FakeJobManager {
    pub create_behavior: Mutex<CreateBehavior>,
    pub outcome: Mutex<SubmissionOutcome>,
    pub existing_job: Mutex<Option<Job>>,
    pub created: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
}

impl Default for FakeJobManager {
    fn default() -> Self {
        Self {
            create_behavior: Mutex::new(CreateBehavior::Succeed),
            outcome: Mutex::new(SubmissionOutcome::InFlight),
            existing_job: Mutex::new(None),
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SubmissionJobManager for FakeJobManager {
    async fn create(
        &self,
        app: &SparkApplication,
    ) -> Result<SubmissionHandle, submission::Error> {
        match *self.create_behavior.lock().unwrap() {
            CreateBehavior::Succeed => {
                self.created.lock().unwrap().push(app.name_any());
                Ok(SubmissionHandle {
                    submission_id: Uuid::new_v4().to_string(),
                    driver_pod_name: app.driver_pod_name(),
                })
            }
            CreateBehavior::AlreadyExists => Err(submission::Error::AlreadyExists {
                name: app.name_any(),
            }),
            CreateBehavior::Fail => NoImageSnafu.fail(),
        }
    }

    async fn get(&self, _app: &SparkApplication) -> Result<Option<Job>, submission::Error> {
        Ok(self.existing_job.lock().unwrap().clone())
    }

    async fn has_succeeded(
        &self,
        _app: &SparkApplication,
    ) -> Result<SubmissionOutcome, submission::Error> {
        Ok(self.outcome.lock().unwrap().clone())
    }

    async fn delete(&self, app: &SparkApplication) -> Result<(), submission::Error> {
        self.deleted.lock().unwrap().push(app.submission_job_name());
        *self.existing_job.lock().unwrap() = None;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRecorder {
    pub events: Mutex<Vec<String>>,
}

impl FakeRecorder {
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn contains(&self, reason: &str) -> bool {
        self.events.lock().unwrap().iter().any(|r| r == reason)
    }
}

#[async_trait]
impl EventRecorder for FakeRecorder {
    async fn publish(
        &self,
        _app: &SparkApplication,
        _severity: EventSeverity,
        reason: &str,
        _message: String,
    ) {
        self.events.lock().unwrap().push(reason.to_owned());
    }
}

pub fn application(namespace: &str, name: &str) -> SparkApplication {
    let mut app = SparkApplication::new(name, Default::default());
    app.metadata.namespace = Some(namespace.to_owned());
    app.metadata.uid = Some(Uuid::new_v4().to_string());
    app
}

pub struct PodBuilder {
    pod: Pod,
}

impl PodBuilder {
    pub fn new(namespace: &str, name: &str, role: &str, app_name: &str) -> Self {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_owned());
        pod.metadata.namespace = Some(namespace.to_owned());
        pod.metadata.labels = Some(
            [
                (LABEL_SPARK_ROLE.to_owned(), role.to_owned()),
                (LABEL_APP_NAME.to_owned(), app_name.to_owned()),
            ]
            .into_iter()
            .collect(),
        );
        Self { pod }
    }

    pub fn submission_id(mut self, submission_id: &str) -> Self {
        self.pod
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(LABEL_SUBMISSION_ID.to_owned(), submission_id.to_owned());
        self
    }

    pub fn phase(mut self, phase: &str) -> Self {
        self.pod
            .status
            .get_or_insert_with(PodStatus::default)
            .phase = Some(phase.to_owned());
        self
    }

    pub fn node_name(mut self, node_name: &str) -> Self {
        self.pod
            .spec
            .get_or_insert_with(PodSpec::default)
            .node_name = Some(node_name.to_owned());
        self
    }

    pub fn container(mut self, name: &str, terminated: Option<(i32, &str)>) -> Self {
        let container = ContainerStatus {
            name: name.to_owned(),
            state: Some(ContainerState {
                terminated: terminated.map(|(exit_code, reason)| ContainerStateTerminated {
                    exit_code,
                    reason: Some(reason.to_owned()),
                    ..ContainerStateTerminated::default()
                }),
                ..ContainerState::default()
            }),
            ..ContainerStatus::default()
        };
        self.pod
            .status
            .get_or_insert_with(PodStatus::default)
            .container_statuses
            .get_or_insert_with(Vec::new)
            .push(container);
        self
    }

    pub fn build(self) -> Pod {
        self.pod
    }
}
