//! Assembles the launcher argument vector for one submission attempt.

use kube::ResourceExt;
use snafu::{OptionExt, Snafu};
use spark_application_crd::constants::{
    KUBERNETES_SERVICE_HOST_ENV_VAR, KUBERNETES_SERVICE_PORT_ENV_VAR, LABEL_APP_NAME,
    LABEL_LAUNCHED_BY_OPERATOR, LABEL_SUBMISSION_ID, SPARK_DRIVER_POD_NAME_KEY,
};
use spark_application_crd::{SparkApplication, SparkPodSpec};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("environment variable {KUBERNETES_SERVICE_HOST_ENV_VAR} is not set"))]
    NoApiServerHost,
    #[snafu(display("environment variable {KUBERNETES_SERVICE_PORT_ENV_VAR} is not set"))]
    NoApiServerPort,
    #[snafu(display("application has no namespace associated"))]
    NoNamespace,
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Cluster API endpoint from the ambient service environment.
pub fn master_url_from_env() -> Result<String> {
    let host =
        std::env::var(KUBERNETES_SERVICE_HOST_ENV_VAR).ok().context(NoApiServerHostSnafu)?;
    let port =
        std::env::var(KUBERNETES_SERVICE_PORT_ENV_VAR).ok().context(NoApiServerPortSnafu)?;
    Ok(format!("k8s://https://{host}:{port}"))
}

/// Builds the argument vector handed to the launcher executable. The
/// submission ID is stamped onto driver and executor pods so later attempts
/// can tell their own pods from leftovers.
pub fn build_submission_args(
    app: &SparkApplication,
    driver_pod_name: &str,
    submission_id: &str,
    master_url: &str,
) -> Result<Vec<String>> {
    let namespace = app.namespace().context(NoNamespaceSnafu)?;
    let name = app.name_any();
    let spec = &app.spec;

    let mut args = Vec::new();
    if let Some(main_class) = &spec.main_class {
        args.push("--class".to_owned());
        args.push(main_class.clone());
    }
    args.push("--master".to_owned());
    args.push(master_url.to_owned());
    args.push("--deploy-mode".to_owned());
    args.push(spec.mode.to_string());

    let mut conf = |option: String| {
        args.push("--conf".to_owned());
        args.push(option);
    };
    conf(format!("spark.kubernetes.namespace={namespace}"));
    conf(format!("spark.app.name={name}"));
    conf(format!("{SPARK_DRIVER_POD_NAME_KEY}={driver_pod_name}"));
    conf("spark.kubernetes.submission.waitAppCompletion=false".to_owned());

    if let Some(image) = &spec.image {
        conf(format!("spark.kubernetes.container.image={image}"));
    }

    if let Some(deps) = &spec.deps {
        if let Some(jars) = &deps.jars {
            conf(format!("spark.jars={}", jars.join(",")));
        }
        if let Some(files) = &deps.files {
            conf(format!("spark.files={}", files.join(",")));
        }
        if let Some(py_files) = &deps.py_files {
            conf(format!("spark.submit.pyFiles={}", py_files.join(",")));
        }
    }

    for (key, value) in spec.spark_conf.iter().flatten() {
        // The driver pod name is owned by the operator.
        if key != SPARK_DRIVER_POD_NAME_KEY {
            conf(format!("{key}={value}"));
        }
    }

    for (key, value) in spec.node_selector.iter().flatten() {
        conf(format!("spark.kubernetes.node.selector.{key}={value}"));
    }

    driver_conf(&mut conf, &spec.driver.spark_pod_spec, &name, submission_id);
    executor_conf(
        &mut conf,
        &spec.executor.spark_pod_spec,
        spec.executor.instances,
        &name,
        submission_id,
    );

    if let Some(main_application_file) = &spec.main_application_file {
        args.push(main_application_file.clone());
    }
    for argument in spec.arguments.iter().flatten() {
        args.push(argument.clone());
    }

    Ok(args)
}

fn driver_conf(
    conf: &mut impl FnMut(String),
    pod_spec: &SparkPodSpec,
    app_name: &str,
    submission_id: &str,
) {
    if let Some(cores) = pod_spec.cores {
        conf(format!("spark.driver.cores={cores}"));
    }
    if let Some(memory) = &pod_spec.memory {
        conf(format!("spark.driver.memory={memory}"));
    }
    if let Some(service_account) = &pod_spec.service_account {
        conf(format!(
            "spark.kubernetes.authenticate.driver.serviceAccountName={service_account}"
        ));
    }
    if let Some(java_options) = &pod_spec.java_options {
        conf(format!("spark.driver.extraJavaOptions={java_options}"));
    }
    pod_conf(conf, pod_spec, "driver", app_name, submission_id);
}

fn executor_conf(
    conf: &mut impl FnMut(String),
    pod_spec: &SparkPodSpec,
    instances: Option<i32>,
    app_name: &str,
    submission_id: &str,
) {
    conf(format!("spark.executor.instances={}", instances.unwrap_or(1)));
    if let Some(cores) = pod_spec.cores {
        conf(format!("spark.executor.cores={cores}"));
    }
    if let Some(memory) = &pod_spec.memory {
        conf(format!("spark.executor.memory={memory}"));
    }
    if let Some(java_options) = &pod_spec.java_options {
        conf(format!("spark.executor.extraJavaOptions={java_options}"));
    }
    pod_conf(conf, pod_spec, "executor", app_name, submission_id);
}

fn pod_conf(
    conf: &mut impl FnMut(String),
    pod_spec: &SparkPodSpec,
    role: &str,
    app_name: &str,
    submission_id: &str,
) {
    conf(format!(
        "spark.kubernetes.{role}.label.{LABEL_APP_NAME}={app_name}"
    ));
    conf(format!(
        "spark.kubernetes.{role}.label.{LABEL_SUBMISSION_ID}={submission_id}"
    ));
    conf(format!(
        "spark.kubernetes.{role}.label.{LABEL_LAUNCHED_BY_OPERATOR}=true"
    ));
    for (key, value) in pod_spec.labels.iter().flatten() {
        conf(format!("spark.kubernetes.{role}.label.{key}={value}"));
    }
    for (key, value) in pod_spec.annotations.iter().flatten() {
        conf(format!("spark.kubernetes.{role}.annotation.{key}={value}"));
    }
    for env_var in pod_spec.env.iter().flatten() {
        if let Some(value) = &env_var.value {
            conf(format!(
                "spark.kubernetes.{role}Env.{}={value}",
                env_var.name
            ));
        }
    }
}
