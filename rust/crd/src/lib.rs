//! This module provides the `SparkApplication` CRD definition and additional
//! helper methods.

pub mod constants;

use std::collections::{BTreeMap, HashMap};

use constants::*;
use k8s_openapi::api::core::v1::{EnvVar, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// A declarative record of a distributed compute workload. The operator
/// launches the driver through a one-shot submission job and tracks driver
/// and executor pods through their lifetimes.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "sparkoperator.k8s.io",
    version = "v1beta2",
    kind = "SparkApplication",
    shortname = "sparkapp",
    status = "SparkApplicationStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SparkApplicationSpec {
    #[serde(default)]
    pub mode: DeployMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_application_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spark_conf: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deps: Option<Dependencies>,
    #[serde(default)]
    pub driver: DriverSpec,
    #[serde(default)]
    pub executor: ExecutorSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<HashMap<String, String>>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_live_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, JsonSchema, PartialEq,
    Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeployMode {
    #[default]
    Cluster,
    Client,
}

/// Application dependencies distributed to driver and executors.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependencies {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jars: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub py_files: Option<Vec<String>>,
}

/// Pod-level settings shared by driver and executor templates.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SparkPodSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mounts: Option<Vec<VolumeMount>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub java_options: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<HashMap<String, String>>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverSpec {
    #[serde(flatten)]
    pub spark_pod_spec: SparkPodSpec,
    /// Overrides the driver pod name computed by the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorSpec {
    #[serde(flatten)]
    pub spark_pod_spec: SparkPodSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<i32>,
    /// Whether the driver should delete executor pods on termination. The
    /// operator only reflects executor state, it never deletes executors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_on_termination: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartPolicy {
    #[serde(default, rename = "type")]
    pub policy_type: RestartPolicyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_submission_failure_retries: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure_retries: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_submission_failure_retry_interval: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure_retry_interval: Option<i64>,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, JsonSchema, PartialEq,
    Serialize,
)]
pub enum RestartPolicyType {
    Always,
    #[default]
    Never,
    OnFailure,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SparkApplicationStatus {
    #[serde(default)]
    pub app_state: ApplicationState,
    /// UUID assigned on each submission attempt. Pods carrying a different
    /// submission ID label belong to an earlier attempt and are ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<String>,
    #[serde(default)]
    pub submission_attempts: i32,
    #[serde(default)]
    pub execution_attempts: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,
    #[serde(default)]
    pub driver_info: DriverInfo,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub executor_state: BTreeMap<String, ExecutorState>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationState {
    #[serde(default)]
    pub state: ApplicationStateType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, JsonSchema, PartialEq,
    Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStateType {
    #[default]
    New,
    Submitted,
    PendingSubmission,
    FailedSubmission,
    Running,
    Succeeding,
    Failing,
    Completed,
    Failed,
    PendingRerun,
    Invalidating,
    Unknown,
}

impl ApplicationStateType {
    /// Terminal states are absorbing except for a user-triggered spec change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Driver pod classification derived from pod phase and the driver
/// container's terminal state. Not persisted.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum DriverState {
    Pending,
    Running,
    Completed,
    Failed,
    Unknown,
}

impl DriverState {
    pub fn has_terminated(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, JsonSchema, PartialEq,
    Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutorState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Unknown,
}

impl ExecutorState {
    /// Once terminal, an executor state is sticky and never rewritten.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "webUIAddress")]
    pub web_ui_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "webUIPort")]
    pub web_ui_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "webUIServiceName")]
    pub web_ui_service_name: Option<String>,
}

impl SparkApplication {
    /// Name of the one-shot launcher job, deterministic per application.
    pub fn submission_job_name(&self) -> String {
        format!("{}{}", self.name_any(), SUBMISSION_JOB_SUFFIX)
    }

    /// Resolves the driver pod name: spec override, then spark-conf override,
    /// then `<app>-driver`.
    pub fn driver_pod_name(&self) -> String {
        if let Some(name) = self.spec.driver.pod_name.as_deref() {
            if !name.is_empty() {
                return name.to_owned();
            }
        }
        if let Some(name) = self
            .spec
            .spark_conf
            .as_ref()
            .and_then(|conf| conf.get(SPARK_DRIVER_POD_NAME_KEY))
        {
            if !name.is_empty() {
                return name.to_owned();
            }
        }
        format!("{}-driver", self.name_any())
    }

    /// Labels identifying cluster resources created for this application and
    /// its current submission attempt.
    pub fn resource_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::from([
            (LABEL_APP_NAME.to_owned(), self.name_any()),
            (LABEL_LAUNCHED_BY_OPERATOR.to_owned(), "true".to_owned()),
        ]);
        if let Some(submission_id) = self
            .status
            .as_ref()
            .and_then(|status| status.submission_id.as_ref())
        {
            labels.insert(LABEL_SUBMISSION_ID.to_owned(), submission_id.clone());
        }
        labels
    }

    pub fn application_state(&self) -> ApplicationStateType {
        self.status
            .as_ref()
            .map(|status| status.app_state.state)
            .unwrap_or_default()
    }

    pub fn restart_policy(&self) -> &RestartPolicy {
        &self.spec.restart_policy
    }
}
