pub const APP_NAME: &str = "spark-application";

pub const API_GROUP: &str = "sparkoperator.k8s.io";
pub const OPERATOR_NAME: &str = "spark-application-operator";
pub const CONTROLLER_NAME: &str = "sparkapplication";

pub const LABEL_SPARK_ROLE: &str = "spark-role";
pub const SPARK_DRIVER_ROLE: &str = "driver";
pub const SPARK_EXECUTOR_ROLE: &str = "executor";

pub const LABEL_APP_NAME: &str = "sparkoperator.k8s.io/app-name";
pub const LABEL_SUBMISSION_ID: &str = "sparkoperator.k8s.io/submission-id";
pub const LABEL_LAUNCHED_BY_OPERATOR: &str = "sparkoperator.k8s.io/launched-by-spark-operator";

/// Name of the container running the workload coordinator inside the driver
/// pod. Sidecars carry different names and are ignored when classifying the
/// driver outcome.
pub const DRIVER_CONTAINER_NAME: &str = "spark-kubernetes-driver";

pub const DRIVER_CLEANUP_FINALIZER: &str = "sparkoperator.k8s.io/driver-cleanup";

pub const SUBMISSION_JOB_SUFFIX: &str = "-spark-submit";
pub const SUBMISSION_CONTAINER_NAME: &str = "spark-submit";

pub const SPARK_DRIVER_POD_NAME_KEY: &str = "spark.kubernetes.driver.pod.name";

pub const SPARK_HOME_ENV_VAR: &str = "SPARK_HOME";
pub const DEFAULT_SPARK_HOME: &str = "/opt/spark";
pub const KUBERNETES_SERVICE_HOST_ENV_VAR: &str = "KUBERNETES_SERVICE_HOST";
pub const KUBERNETES_SERVICE_PORT_ENV_VAR: &str = "KUBERNETES_SERVICE_PORT";

/// Magic substring reported by the launcher when the driver pod for this
/// submission already exists. The current attempt is retained.
pub const ALREADY_SUBMITTED_ERROR_CODE: &str = "code=409";
