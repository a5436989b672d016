//! Narrow cluster-API surface consumed by the reconciler. Abstracted as a
//! capability so tests can run the state machine against an in-memory
//! cluster.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};
use snafu::{OptionExt, ResultExt, Snafu};
use spark_application_crd::SparkApplication;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to update application status for [{name}]"))]
    UpdateStatus { source: kube::Error, name: String },

    #[snafu(display("failed to update application [{name}]"))]
    UpdateApplication { source: kube::Error, name: String },

    #[snafu(display("failed to delete application [{name}]"))]
    DeleteApplication { source: kube::Error, name: String },

    #[snafu(display("failed to delete driver pod [{name}]"))]
    DeleteDriverPod { source: kube::Error, name: String },

    #[snafu(display("failed to look up driver pod [{name}]"))]
    GetDriverPod { source: kube::Error, name: String },

    #[snafu(display("failed to look up node [{name}]"))]
    GetNode { source: kube::Error, name: String },

    #[snafu(display("failed to serialize application status"))]
    SerializeStatus { source: serde_json::Error },

    #[snafu(display("application has no namespace associated"))]
    NoNamespace,
}

impl Error {
    /// A stale resource version; the caller re-queues and retries with a
    /// fresh copy.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::UpdateStatus { source: kube::Error::Api(response), .. }
            | Error::UpdateApplication { source: kube::Error::Api(response), .. }
                if response.code == 409
        )
    }
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[async_trait]
pub trait ApplicationClient: Send + Sync {
    /// Persists the status subresource via an optimistic replace. A conflict
    /// surfaces as an error for the work queue to retry.
    async fn update_status(&self, app: &SparkApplication) -> Result<SparkApplication>;

    /// Persists metadata and spec (finalizer changes).
    async fn update_application(&self, app: &SparkApplication) -> Result<SparkApplication>;

    async fn delete_application(&self, namespace: &str, name: &str) -> Result<()>;

    async fn delete_driver_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn driver_pod_exists(&self, namespace: &str, name: &str) -> Result<bool>;

    /// External address of the node hosting the driver, if any.
    async fn node_external_ip(&self, node_name: &str) -> Result<Option<String>>;
}

pub struct KubeApplicationClient {
    client: Client,
}

impl KubeApplicationClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn apps(&self, namespace: &str) -> Api<SparkApplication> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn ignore_not_found(error: kube::Error) -> Result<(), kube::Error> {
    match error {
        kube::Error::Api(ref response) if response.code == 404 => Ok(()),
        other => Err(other),
    }
}

#[async_trait]
impl ApplicationClient for KubeApplicationClient {
    async fn update_status(&self, app: &SparkApplication) -> Result<SparkApplication> {
        let name = app.name_any();
        let namespace = app.namespace().context(NoNamespaceSnafu)?;
        let data = serde_json::to_vec(app).context(SerializeStatusSnafu)?;
        self.apps(&namespace)
            .replace_status(&name, &PostParams::default(), data)
            .await
            .context(UpdateStatusSnafu { name })
    }

    async fn update_application(&self, app: &SparkApplication) -> Result<SparkApplication> {
        let name = app.name_any();
        let namespace = app.namespace().context(NoNamespaceSnafu)?;
        self.apps(&namespace)
            .replace(&name, &PostParams::default(), app)
            .await
            .context(UpdateApplicationSnafu { name })
    }

    async fn delete_application(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .apps(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(error) => {
                ignore_not_found(error).context(DeleteApplicationSnafu { name })
            }
        }
    }

    async fn delete_driver_pod(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .pods(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(error) => ignore_not_found(error).context(DeleteDriverPodSnafu { name }),
        }
    }

    async fn driver_pod_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let pod = self
            .pods(namespace)
            .get_opt(name)
            .await
            .context(GetDriverPodSnafu { name })?;
        Ok(pod.is_some())
    }

    async fn node_external_ip(&self, node_name: &str) -> Result<Option<String>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes
            .get_opt(node_name)
            .await
            .context(GetNodeSnafu { name: node_name })?;
        Ok(node
            .and_then(|node| node.status)
            .and_then(|status| status.addresses)
            .and_then(|addresses| {
                addresses
                    .into_iter()
                    .find(|address| address.type_ == "ExternalIP")
                    .map(|address| address.address)
            }))
    }
}
