//! Kubernetes objects feeding [`Inputs`] and [`Trigger`]s to a
//! [`Controller`](crate::Controller).
//!
//! The unit's configuration lives in the data of a single `ConfigMap`.
//! Relation data lives in `Secret`s labelled with [`RELATION_LABEL`], whose
//! value names the integration. Several Secrets may carry the same label;
//! their data is merged in Secret name order, later names winning on
//! conflicting keys. The managed `Deployment` is watched for the moment it
//! first has an available replica.

use std::collections::{BTreeMap, BTreeSet};

use futures::stream::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::ResourceExt;
use kube_runtime::watcher::{self, watcher, Event};
use kube_runtime::WatchStreamExt;
use tokio::sync::watch;
use tracing::{event, Level};

use crate::config::Config;
use crate::controller::{Trigger, TriggerSender};
use crate::reconciler::{Inputs, Relations};

/// Label naming the integration a relation `Secret` belongs to.
pub const RELATION_LABEL: &str = "holistic.dev/relation";

/// Runs [`watch_config`], [`watch_relations`] and [`watch_workload`] side by
/// side. The first two feed `inputs`; all three send triggers.
pub async fn watch_inputs(
    config_maps: Api<ConfigMap>,
    name: &str,
    secrets: Api<Secret>,
    deployments: Api<Deployment>,
    workload: &str,
    inputs: watch::Sender<Inputs>,
    triggers: TriggerSender,
) {
    futures::join!(
        watch_config(config_maps, name, &inputs, triggers.clone()),
        watch_relations(secrets, &inputs, triggers.clone()),
        watch_workload(deployments, workload, triggers),
    );
}

/// Watches the `ConfigMap` called `name` and sends
/// [`Trigger::ConfigChanged`] whenever its data changes. Returns once the
/// controller behind `triggers` has stopped.
pub async fn watch_config(
    api: Api<ConfigMap>,
    name: &str,
    inputs: &watch::Sender<Inputs>,
    triggers: TriggerSender,
) {
    let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
    let mut stream = watcher(api, config).default_backoff().boxed();
    while let Some(result) = stream.next().await {
        match result {
            Ok(event) => {
                let changed =
                    inputs.send_if_modified(|inputs| apply_config(&mut inputs.config, name, event));
                if changed && !triggers.send(Trigger::ConfigChanged) {
                    return;
                }
            }
            Err(err) => event!(Level::WARN, err = %err, configmap = name, "Watch error."),
        }
    }
}

/// Watches relation `Secret`s and sends [`Trigger::RelationChanged`] for
/// every integration whose data changed. Returns once the controller behind
/// `triggers` has stopped.
pub async fn watch_relations(
    api: Api<Secret>,
    inputs: &watch::Sender<Inputs>,
    triggers: TriggerSender,
) {
    let config = watcher::Config::default().labels(RELATION_LABEL);
    let mut stream = watcher(api, config).default_backoff().boxed();
    let mut secrets = RelationSecrets::new();
    while let Some(result) = stream.next().await {
        match result {
            Ok(event) => {
                let mut changed = Vec::new();
                inputs.send_if_modified(|inputs| {
                    changed = apply_relations(&mut secrets, &mut inputs.relations, event);
                    !changed.is_empty()
                });
                for name in changed {
                    if !triggers.send(Trigger::RelationChanged(name)) {
                        return;
                    }
                }
            }
            Err(err) => event!(Level::WARN, err = %err, "Watch error."),
        }
    }
}

/// Watches the `Deployment` called `name` and sends
/// [`Trigger::WorkloadReady`] each time it goes from no available replica to
/// at least one. Returns once the controller behind `triggers` has stopped.
pub async fn watch_workload(api: Api<Deployment>, name: &str, triggers: TriggerSender) {
    let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
    let mut stream = watcher(api, config).default_backoff().boxed();
    let mut available = false;
    while let Some(result) = stream.next().await {
        match result {
            Ok(event) => {
                if apply_availability(&mut available, name, event) {
                    event!(Level::DEBUG, deployment = name, "Workload became available.");
                    if !triggers.send(Trigger::WorkloadReady) {
                        return;
                    }
                }
            }
            Err(err) => event!(Level::WARN, err = %err, deployment = name, "Watch error."),
        }
    }
}

fn config_from(config_map: &ConfigMap) -> Config {
    config_map.data.clone().unwrap_or_default().into()
}

/// Folds a watch event into `config`. Returns whether it changed.
fn apply_config(config: &mut Config, name: &str, event: Event<ConfigMap>) -> bool {
    let next = match event {
        Event::Applied(config_map) => config_from(&config_map),
        Event::Deleted(_) => Config::default(),
        Event::Restarted(config_maps) => config_maps
            .iter()
            .find(|config_map| config_map.name_any() == name)
            .map(config_from)
            .unwrap_or_default(),
    };
    if *config == next {
        return false;
    }
    *config = next;
    true
}

/// Relation name and decoded data, keyed by the name of the carrying Secret.
type RelationSecrets = BTreeMap<String, (String, BTreeMap<String, String>)>;

fn relation_from(secret: &Secret) -> Option<(String, BTreeMap<String, String>)> {
    let name = secret.labels().get(RELATION_LABEL)?.clone();
    let data = secret
        .data
        .iter()
        .flatten()
        .filter_map(|(key, value)| match String::from_utf8(value.0.clone()) {
            Ok(value) => Some((key.clone(), value)),
            Err(_) => {
                event!(
                    Level::WARN,
                    secret = %secret.name_any(),
                    key = %key,
                    "Skipping non UTF-8 relation field."
                );
                None
            }
        })
        .collect();
    Some((name, data))
}

fn merged(secrets: &RelationSecrets) -> Relations {
    let mut relations = Relations::new();
    for (name, data) in secrets.values() {
        relations
            .entry(name.clone())
            .or_default()
            .extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    relations
}

/// Folds a watch event into the per-Secret store and rebuilds `relations`
/// from it. Returns the names of the integrations whose data changed, in
/// order.
fn apply_relations(
    secrets: &mut RelationSecrets,
    relations: &mut Relations,
    event: Event<Secret>,
) -> Vec<String> {
    match event {
        Event::Applied(secret) => match relation_from(&secret) {
            Some(entry) => {
                secrets.insert(secret.name_any(), entry);
            }
            None => {
                secrets.remove(&secret.name_any());
            }
        },
        Event::Deleted(secret) => {
            secrets.remove(&secret.name_any());
        }
        Event::Restarted(all) => {
            *secrets = all
                .iter()
                .filter_map(|secret| Some((secret.name_any(), relation_from(secret)?)))
                .collect();
        }
    }

    let next = merged(secrets);
    let changed: BTreeSet<_> = relations
        .keys()
        .chain(next.keys())
        .filter(|name| relations.get(*name) != next.get(*name))
        .cloned()
        .collect();
    *relations = next;
    changed.into_iter().collect()
}

fn has_available_replica(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|status| status.available_replicas)
        .map_or(false, |replicas| replicas > 0)
}

/// Folds a watch event into the availability of deployment `name`. Returns
/// true only when it went from unavailable to available.
fn apply_availability(available: &mut bool, name: &str, event: Event<Deployment>) -> bool {
    let next = match event {
        Event::Applied(deployment) => has_available_replica(&deployment),
        Event::Deleted(_) => false,
        Event::Restarted(deployments) => deployments
            .iter()
            .find(|deployment| deployment.name_any() == name)
            .map_or(false, has_available_replica),
    };
    let became_ready = next && !*available;
    *available = next;
    became_ready
}
