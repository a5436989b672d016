//! Creates, inspects and deletes the one-shot launcher job for an
//! application. This is the only component that issues launcher invocations.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use snafu::{OptionExt, ResultExt, Snafu};
use spark_application_crd::constants::{
    DEFAULT_SPARK_HOME, SPARK_HOME_ENV_VAR, SUBMISSION_CONTAINER_NAME,
};
use spark_application_crd::SparkApplication;
use uuid::Uuid;

use crate::submission_args;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("a submission job for application [{name}] already exists"))]
    AlreadyExists { name: String },

    #[snafu(display("failed to create submission job for application [{name}]"))]
    CreateJob { source: kube::Error, name: String },

    #[snafu(display("failed to get submission job for application [{name}]"))]
    GetJob { source: kube::Error, name: String },

    #[snafu(display("failed to delete submission job for application [{name}]"))]
    DeleteJob { source: kube::Error, name: String },

    #[snafu(display("failed to build launcher arguments"))]
    BuildArguments { source: submission_args::Error },

    #[snafu(display("application has no namespace associated"))]
    NoNamespace,

    #[snafu(display("application has no uid, cannot build owner reference"))]
    NoUid,

    #[snafu(display("application defines no image to run the launcher with"))]
    #[snafu(visibility(pub(crate)))]
    NoImage,
}

impl Error {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// A freshly created submission attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubmissionHandle {
    pub submission_id: String,
    pub driver_pod_name: String,
}

/// Terminal observation of the launcher job.
#[derive(Clone, Debug, PartialEq)]
pub enum SubmissionOutcome {
    /// The job has neither completed nor failed yet.
    InFlight,
    Succeeded { completion_time: Option<Time> },
    Failed { message: String },
}

/// Small capability over the launcher job, abstracted for testability.
#[async_trait]
pub trait SubmissionJobManager: Send + Sync {
    /// Assigns a fresh submission ID, resolves the driver pod name and
    /// creates the one-shot launcher job. Fails with `AlreadyExists` when the
    /// previous attempt is still in flight.
    async fn create(&self, app: &SparkApplication) -> Result<SubmissionHandle>;

    async fn get(&self, app: &SparkApplication) -> Result<Option<Job>>;

    /// Whether the launcher job finished, and how.
    async fn has_succeeded(&self, app: &SparkApplication) -> Result<SubmissionOutcome>;

    /// Deletes the job with background cascade. A missing job is success.
    async fn delete(&self, app: &SparkApplication) -> Result<()>;
}

pub struct KubeSubmissionJobManager {
    client: Client,
}

impl KubeSubmissionJobManager {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn owner_reference(app: &SparkApplication) -> Result<OwnerReference> {
    Ok(OwnerReference {
        api_version: SparkApplication::api_version(&()).into_owned(),
        kind: SparkApplication::kind(&()).into_owned(),
        name: app.name_any(),
        uid: app.uid().context(NoUidSnafu)?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

fn launcher_command(args: Vec<String>) -> Vec<String> {
    let spark_home =
        std::env::var(SPARK_HOME_ENV_VAR).unwrap_or_else(|_| DEFAULT_SPARK_HOME.to_owned());
    let mut command = vec![format!("{spark_home}/bin/spark-submit")];
    command.extend(args);
    command
}

/// Builds the one-shot job running the launcher. The job owns nothing; the
/// driver pod it creates is independently owned by the cluster.
fn build_submission_job(
    app: &SparkApplication,
    submission_id: &str,
    driver_pod_name: &str,
) -> Result<Job> {
    let image = app
        .spec
        .driver
        .spark_pod_spec
        .image
        .as_ref()
        .or(app.spec.image.as_ref())
        .context(NoImageSnafu)?;
    let args = submission_args::build_submission_args(
        app,
        driver_pod_name,
        submission_id,
        &submission_args::master_url_from_env().context(BuildArgumentsSnafu)?,
    )
    .context(BuildArgumentsSnafu)?;

    let mut labels = app.resource_labels();
    labels.insert(
        spark_application_crd::constants::LABEL_SUBMISSION_ID.to_owned(),
        submission_id.to_owned(),
    );

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(app.submission_job_name()),
            namespace: app.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(app)?]),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: SUBMISSION_CONTAINER_NAME.to_owned(),
                        image: Some(image.clone()),
                        command: Some(launcher_command(args)),
                        ..Container::default()
                    }],
                    restart_policy: Some("Never".to_owned()),
                    service_account_name: app.spec.driver.spark_pod_spec.service_account.clone(),
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        status: None,
    })
}

#[async_trait]
impl SubmissionJobManager for KubeSubmissionJobManager {
    async fn create(&self, app: &SparkApplication) -> Result<SubmissionHandle> {
        let name = app.name_any();
        let namespace = app.namespace().context(NoNamespaceSnafu)?;
        let submission_id = Uuid::new_v4().to_string();
        let driver_pod_name = app.driver_pod_name();

        let job = build_submission_job(app, &submission_id, &driver_pod_name)?;
        match self.jobs(&namespace).create(&PostParams::default(), &job).await {
            Ok(_) => Ok(SubmissionHandle {
                submission_id,
                driver_pod_name,
            }),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                AlreadyExistsSnafu { name }.fail()
            }
            Err(source) => Err(source).context(CreateJobSnafu { name }),
        }
    }

    async fn get(&self, app: &SparkApplication) -> Result<Option<Job>> {
        let namespace = app.namespace().context(NoNamespaceSnafu)?;
        self.jobs(&namespace)
            .get_opt(&app.submission_job_name())
            .await
            .context(GetJobSnafu { name: app.name_any() })
    }

    async fn has_succeeded(&self, app: &SparkApplication) -> Result<SubmissionOutcome> {
        let job = self.get(app).await?;
        Ok(job.map(job_outcome).unwrap_or(SubmissionOutcome::InFlight))
    }

    async fn delete(&self, app: &SparkApplication) -> Result<()> {
        let namespace = app.namespace().context(NoNamespaceSnafu)?;
        match self
            .jobs(&namespace)
            .delete(&app.submission_job_name(), &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(source) => Err(source).context(DeleteJobSnafu { name: app.name_any() }),
        }
    }
}

/// Interprets the job's conditions: `Complete` means the launcher exited
/// zero, `Failed` that it was rejected.
pub fn job_outcome(job: Job) -> SubmissionOutcome {
    let conditions = job
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref());
    for condition in conditions.into_iter().flatten() {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => {
                return SubmissionOutcome::Succeeded {
                    completion_time: job
                        .status
                        .as_ref()
                        .and_then(|status| status.completion_time.clone()),
                }
            }
            "Failed" => {
                return SubmissionOutcome::Failed {
                    message: condition
                        .message
                        .clone()
                        .unwrap_or_else(|| "submission job failed".to_owned()),
                }
            }
            _ => {}
        }
    }
    SubmissionOutcome::InFlight
}
