use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{event, Level};

/// Errors reported by a [`Workload`].
#[derive(Debug, Error)]
pub enum WorkloadError {
    /// The control surface could not be reached at all
    #[error("workload unreachable: {0}")]
    Unreachable(String),

    /// The control surface answered but refused the request
    #[error("workload rejected request: {0}")]
    Rejected(String),

    /// Any other Kubernetes client failure
    #[error("kubernetes error: {0}")]
    Kube(#[source] kube::Error),
}

impl From<kube::Error> for WorkloadError {
    /// Only a missing object or a failed transport counts as unreachable.
    /// Refusals such as 401 or 403 need an operator and are never retried.
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => Self::Unreachable(resp.message),
            kube::Error::Api(resp) => Self::Rejected(format!("{} ({})", resp.message, resp.code)),
            kube::Error::HyperError(err) => Self::Unreachable(err.to_string()),
            kube::Error::Service(err) => Self::Unreachable(err.to_string()),
            err => Self::Kube(err),
        }
    }
}

/// Whether the supervisor should keep the service running.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Startup {
    #[default]
    Enabled,
    Disabled,
}

/// The full declarative description of how the managed service runs.
///
/// Always submitted whole, never as a delta, so resubmitting an identical
/// spec leaves the workload as it is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Name of the service, and of the container running it.
    pub service: String,
    /// Command line, split on whitespace by [`argv`](Self::argv).
    pub command: String,
    pub environment: BTreeMap<String, String>,
    pub startup: Startup,
}

impl LaunchSpec {
    /// Splits [`command`](Self::command) on whitespace into argv form.
    pub fn argv(&self) -> Vec<String> {
        self.command.split_whitespace().map(str::to_string).collect()
    }
}

/// The control surface of the managed workload.
#[async_trait]
pub trait Workload {
    /// A short liveness check. `Ok(false)` means the control surface is not
    /// there yet; an `Err` is a failure that waiting will not fix.
    /// Implementations should not block for long; callers bound it with a
    /// timeout anyway.
    async fn can_connect(&self) -> Result<bool, WorkloadError>;

    /// Declares `spec` with replace semantics, discarding whatever was
    /// declared for the same service before.
    async fn replace(&self, spec: &LaunchSpec) -> Result<(), WorkloadError>;

    /// Asks the workload to converge onto the declared spec. Services whose
    /// declaration did not change are left running.
    async fn replan(&self) -> Result<(), WorkloadError>;
}

#[async_trait]
impl<W> Workload for Arc<W>
where
    W: Workload + Send + Sync + ?Sized,
{
    async fn can_connect(&self) -> Result<bool, WorkloadError> {
        (**self).can_connect().await
    }

    async fn replace(&self, spec: &LaunchSpec) -> Result<(), WorkloadError> {
        (**self).replace(spec).await
    }

    async fn replan(&self) -> Result<(), WorkloadError> {
        (**self).replan().await
    }
}

/// Field manager used for server-side apply of the declared spec.
pub const FIELD_MANAGER: &str = "holistic-controller";

/// A [`Workload`] backed by a Kubernetes `Deployment` whose container shares
/// the service name.
pub struct DeploymentWorkload {
    api: Api<Deployment>,
    name: String,
}

impl DeploymentWorkload {
    /// Manages the Deployment `name` in `namespace`.
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Workload for DeploymentWorkload {
    async fn can_connect(&self) -> Result<bool, WorkloadError> {
        let lookup = self.api.get(&self.name).await.map(|_| ());
        if let Err(err) = &lookup {
            event!(
                Level::DEBUG,
                deployment = %self.name,
                err = %err,
                "Deployment lookup failed."
            );
        }
        reachability(lookup)
    }

    async fn replace(&self, spec: &LaunchSpec) -> Result<(), WorkloadError> {
        let patch = deployment_patch(&self.name, spec);
        self.api
            .patch(
                &self.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await?;
        Ok(())
    }

    async fn replan(&self) -> Result<(), WorkloadError> {
        // resumes a paused rollout; unchanged spec means no new generation
        let patch = json!({ "spec": { "paused": false } });
        self.api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Classifies the outcome of reading the Deployment: unreachable errors mean
/// "not yet", everything else is passed on.
fn reachability(lookup: Result<(), kube::Error>) -> Result<bool, WorkloadError> {
    match lookup.map_err(WorkloadError::from) {
        Ok(()) => Ok(true),
        Err(WorkloadError::Unreachable(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Builds the server-side apply body declaring `spec` on deployment `name`.
///
/// Only the fields owned by [`FIELD_MANAGER`] are present; everything else in
/// the Deployment belongs to whoever created it.
pub fn deployment_patch(name: &str, spec: &LaunchSpec) -> serde_json::Value {
    let env: Vec<_> = spec
        .environment
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();
    let replicas = match spec.startup {
        Startup::Enabled => 1,
        Startup::Disabled => 0,
    };
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": name },
        "spec": {
            "replicas": replicas,
            "template": {
                "spec": {
                    "containers": [{
                        "name": spec.service,
                        "command": spec.argv(),
                        "env": env,
                    }]
                }
            }
        }
    })
}
