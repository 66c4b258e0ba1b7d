use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::{thread_rng, Rng};
use tokio::sync::Mutex;
use tracing::{event, Level};

use crate::config::{Config, LogLevel, Settings, LOG_LEVEL_KEY};
use crate::error::Error;
use crate::logging::Verbosity;
use crate::status::Status;
use crate::workload::{LaunchSpec, Startup, Workload, WorkloadError};

/// Relation data keyed by integration name, then by field.
pub type Relations = BTreeMap<String, BTreeMap<String, String>>;

/// Everything a pass reads from outside the workload. A fresh snapshot is
/// taken for every pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Inputs {
    pub config: Config,
    pub relations: Relations,
}

/// How a reconcile pass ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing more to do until the next trigger.
    Settled(Status),
    /// The trigger should be delivered again later.
    Deferred(Status),
}

impl Outcome {
    /// The status this pass ended in, deferred or not.
    pub fn status(&self) -> &Status {
        match self {
            Outcome::Settled(status) | Outcome::Deferred(status) => status,
        }
    }

    /// Whether the trigger should be redelivered.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Outcome::Deferred(_))
    }
}

/// The [`Reconcile`] trait is the single entry point every trigger is
/// collapsed onto. It is driven by a [`Controller`](crate::Controller).
#[async_trait]
pub trait Reconcile {
    /// Name used to tag log events for this reconciler.
    const NAME: &'static str;

    /// Converges the managed workload onto `inputs`. Never fails: every
    /// error path ends in the [`Status`] carried by the [`Outcome`].
    async fn reconcile(&self, inputs: &Inputs) -> Outcome;

    /// How long to wait before redelivering a deferred trigger. The count of
    /// consecutive deferrals for that trigger is passed in. The default
    /// implementation uses exponential backoff with a max of 256 seconds
    /// and some added randomization to avoid thundering herds.
    fn defer_delay(&self, consecutive_deferrals: u32) -> Duration {
        let seconds = 2u64.pow(consecutive_deferrals.min(7) + 1);
        Duration::from_millis(thread_rng().gen_range((seconds * 500)..(seconds * 1000)))
    }
}

/// The reconciler for one managed unit.
///
/// Holds no state between passes apart from a lock that keeps passes on the
/// same unit from overlapping.
pub struct Charm<W, V> {
    settings: Settings,
    workload: W,
    verbosity: V,
    pass: Mutex<()>,
}

impl<W, V> Charm<W, V>
where
    W: Workload + Send + Sync,
    V: Verbosity + Send + Sync,
{
    /// Creates a reconciler driving `workload` and tuning `verbosity`.
    pub fn new(settings: Settings, workload: W, verbosity: V) -> Self {
        Self {
            settings,
            workload,
            verbosity,
            pass: Mutex::new(()),
        }
    }

    /// The static settings this reconciler was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The launch spec the workload should run for `inputs` at `level`.
    pub fn desired(&self, level: LogLevel, inputs: &Inputs) -> LaunchSpec {
        let prefix = &self.settings.env_prefix;
        let option_prefix = self.settings.option_prefix();

        let mut environment = BTreeMap::new();
        for (option, value) in inputs.config.iter() {
            if option == LOG_LEVEL_KEY {
                continue;
            }
            let option = option.strip_prefix(&option_prefix).unwrap_or(option);
            environment.insert(format!("{prefix}{}", env_suffix(option)), value.to_string());
        }
        environment.insert(
            format!("{prefix}LOG_LEVEL"),
            level.as_str().to_ascii_uppercase(),
        );
        for (relation, data) in &inputs.relations {
            for (key, value) in data {
                environment.insert(
                    format!("{}_{}", env_suffix(relation), env_suffix(key)),
                    value.clone(),
                );
            }
        }

        LaunchSpec {
            service: self.settings.service.clone(),
            command: self.settings.command.clone(),
            environment,
            startup: Startup::Enabled,
        }
    }

    fn missing_relations(&self, inputs: &Inputs) -> Vec<String> {
        self.settings
            .required_relations
            .iter()
            .filter(|name| inputs.relations.get(*name).map_or(true, BTreeMap::is_empty))
            .cloned()
            .collect()
    }

    /// Runs a workload call under the connect timeout. A call that stalls is
    /// treated like an unreachable workload.
    async fn bounded<F>(&self, call: &str, fut: F) -> Result<(), WorkloadError>
    where
        F: std::future::Future<Output = Result<(), WorkloadError>>,
    {
        let timeout = self.settings.connect_timeout();
        tokio::time::timeout(timeout, fut).await.unwrap_or_else(|_| {
            Err(WorkloadError::Unreachable(format!(
                "{call} on {} did not finish within {:?}",
                self.settings.service, timeout
            )))
        })
    }

    async fn converge(&self, inputs: &Inputs) -> Result<(), Error> {
        let level = inputs.config.log_level()?;
        self.verbosity.set_verbosity(level);

        let missing = self.missing_relations(inputs);
        if !missing.is_empty() {
            return Err(Error::MissingRelations(missing));
        }

        let timeout = self.settings.connect_timeout();
        let reachable = tokio::time::timeout(timeout, self.workload.can_connect())
            .await
            .unwrap_or(Ok(false))?;
        if !reachable {
            return Err(WorkloadError::Unreachable(format!(
                "no answer from {} within {:?}",
                self.settings.service, timeout
            ))
            .into());
        }

        let spec = self.desired(level, inputs);
        event!(
            Level::DEBUG,
            service = %spec.service,
            env_vars = spec.environment.len(),
            "Declaring launch spec."
        );
        self.bounded("replace", self.workload.replace(&spec)).await?;
        self.bounded("replan", self.workload.replan()).await?;
        Ok(())
    }
}

#[async_trait]
impl<W, V> Reconcile for Charm<W, V>
where
    W: Workload + Send + Sync,
    V: Verbosity + Send + Sync,
{
    const NAME: &'static str = "holistic-controller";

    async fn reconcile(&self, inputs: &Inputs) -> Outcome {
        let _pass = self.pass.lock().await;
        match self.converge(inputs).await {
            Ok(()) => Outcome::Settled(Status::Active),
            Err(err) if err.is_blocking() => {
                event!(Level::WARN, controller = Self::NAME, err = %err, "Blocked.");
                Outcome::Settled(Status::Blocked(err.to_string()))
            }
            Err(err) if err.is_transient() => {
                event!(Level::INFO, controller = Self::NAME, err = %err, "Deferring.");
                Outcome::Deferred(Status::Waiting(format!(
                    "waiting for {}: {}",
                    self.settings.service, err
                )))
            }
            Err(err) => {
                event!(Level::ERROR, controller = Self::NAME, err = %err, "Reconcile failed.");
                Outcome::Settled(Status::Error(err.to_string()))
            }
        }
    }
}

/// `db-connect-string` -> `DB_CONNECT_STRING`
fn env_suffix(name: &str) -> String {
    name.to_ascii_uppercase().replace(['-', '.'], "_")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::tests::{charm, charm_with, inputs, Call, MockWorkload};

    #[tokio::test]
    async fn valid_log_levels_end_active() {
        for raw in ["info", "debug", "warning", "error", "critical", "INFO", "Debug", "wArNiNg"] {
            let workload = MockWorkload::reachable();
            let (charm, verbosity) = charm(&workload);
            let outcome = charm.reconcile(&inputs(&[("log-level", raw)])).await;
            assert_eq!(outcome, Outcome::Settled(Status::Active), "log-level {raw}");
            assert_eq!(verbosity.levels(), vec![raw.parse::<LogLevel>().unwrap()]);
        }
    }

    #[tokio::test]
    async fn info_is_declared_in_environment() {
        let workload = MockWorkload::reachable();
        let (charm, _) = charm(&workload);
        let outcome = charm.reconcile(&inputs(&[("log-level", "info")])).await;
        assert_eq!(outcome, Outcome::Settled(Status::Active));

        let calls = workload.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], Call::Replan);
        let spec = workload.last_spec().unwrap();
        assert_eq!(spec.environment["DJANGO_LOG_LEVEL"], "INFO");
        assert_eq!(spec.startup, Startup::Enabled);
        assert_eq!(spec.service, "django");
    }

    #[tokio::test]
    async fn mixed_case_is_normalized() {
        let workload = MockWorkload::reachable();
        let (charm, verbosity) = charm(&workload);
        let outcome = charm.reconcile(&inputs(&[("log-level", "DEBUG")])).await;
        assert!(outcome.status().is_active());
        assert_eq!(verbosity.levels(), vec![LogLevel::Debug]);
        assert_eq!(
            workload.last_spec().unwrap().environment["DJANGO_LOG_LEVEL"],
            "DEBUG"
        );
    }

    #[tokio::test]
    async fn invalid_log_level_blocks_without_touching_workload() {
        for raw in ["trace", "foobar"] {
            let workload = MockWorkload::reachable();
            let (charm, verbosity) = charm(&workload);
            let outcome = charm.reconcile(&inputs(&[("log-level", raw)])).await;
            match outcome {
                Outcome::Settled(Status::Blocked(msg)) => assert!(msg.contains(raw), "{msg}"),
                other => panic!("expected blocked, got {other:?}"),
            }
            assert_eq!(workload.connects(), 0);
            assert!(workload.calls().is_empty());
            assert!(verbosity.levels().is_empty());
        }
    }

    #[tokio::test]
    async fn missing_log_level_blocks() {
        let workload = MockWorkload::reachable();
        let (charm, _) = charm(&workload);
        let outcome = charm.reconcile(&Inputs::default()).await;
        assert!(matches!(outcome, Outcome::Settled(Status::Blocked(_))));
        assert!(workload.calls().is_empty());
    }

    #[tokio::test]
    async fn unreachable_workload_defers_with_waiting() {
        let workload = MockWorkload::unreachable();
        let (charm, verbosity) = charm(&workload);
        let outcome = charm.reconcile(&inputs(&[("log-level", "info")])).await;
        assert!(outcome.is_deferred());
        assert!(matches!(outcome.status(), Status::Waiting(_)));
        assert_eq!(workload.connects(), 1);
        assert!(workload.calls().is_empty());
        // verbosity is still applied before the workload is contacted
        assert_eq!(verbosity.levels(), vec![LogLevel::Info]);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_connect_times_out_as_unreachable() {
        let workload = MockWorkload::hanging();
        let (charm, _) = charm(&workload);
        let outcome = charm.reconcile(&inputs(&[("log-level", "info")])).await;
        assert!(outcome.is_deferred());
        assert!(matches!(outcome.status(), Status::Waiting(_)));
        assert!(workload.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_still_waits_for_workload() {
        let settings = Settings {
            connect_timeout_secs: 0,
            ..Settings::default()
        };
        let workload = MockWorkload::reachable();
        let (charm, _) = charm_with(settings, &workload);
        let outcome = charm.reconcile(&inputs(&[("log-level", "info")])).await;
        assert_eq!(outcome, Outcome::Settled(Status::Active));
    }

    #[tokio::test]
    async fn refused_connect_settles_in_error() {
        let workload = MockWorkload::reachable();
        workload.refuse_connect(|| WorkloadError::Rejected("forbidden (403)".into()));
        let (charm, _) = charm(&workload);
        let outcome = charm.reconcile(&inputs(&[("log-level", "info")])).await;
        match outcome {
            Outcome::Settled(Status::Error(msg)) => assert!(msg.contains("403"), "{msg}"),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(workload.calls().is_empty());
    }

    #[tokio::test]
    async fn rejected_replace_settles_in_error_without_replan() {
        let workload = MockWorkload::reachable();
        workload.fail_replace(|| WorkloadError::Rejected("invalid env".into()));
        let (charm, _) = charm(&workload);
        let outcome = charm.reconcile(&inputs(&[("log-level", "info")])).await;
        assert!(!outcome.is_deferred());
        assert!(matches!(outcome.status(), Status::Error(msg) if msg.contains("invalid env")));
        assert!(!workload.calls().contains(&Call::Replan));
    }

    #[tokio::test]
    async fn unreachable_replace_defers_with_waiting() {
        let workload = MockWorkload::reachable();
        workload.fail_replace(|| WorkloadError::Unreachable("connection reset".into()));
        let (charm, _) = charm(&workload);
        let outcome = charm.reconcile(&inputs(&[("log-level", "info")])).await;
        assert!(outcome.is_deferred());
        assert!(matches!(outcome.status(), Status::Waiting(_)));
        assert!(workload.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_replace_times_out_as_unreachable() {
        let workload = MockWorkload::reachable();
        workload.stall_replace();
        let (charm, _) = charm(&workload);
        let outcome = charm.reconcile(&inputs(&[("log-level", "info")])).await;
        assert!(outcome.is_deferred());
        assert!(matches!(outcome.status(), Status::Waiting(msg) if msg.contains("replace")));
        assert!(workload.calls().is_empty());
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let workload = MockWorkload::reachable();
        let (charm, _) = charm(&workload);
        let inputs = inputs(&[("log-level", "warning"), ("django-debug", "false")]);

        let first = charm.reconcile(&inputs).await;
        let second = charm.reconcile(&inputs).await;
        assert_eq!(first, second);

        let specs: Vec<_> = workload
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Replace(spec) => Some(spec),
                Call::Replan => None,
            })
            .collect();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0], specs[1]);
    }

    #[tokio::test]
    async fn extra_options_are_exported_not_rejected() {
        let workload = MockWorkload::reachable();
        let (charm, _) = charm(&workload);
        let outcome = charm
            .reconcile(&inputs(&[
                ("log-level", "info"),
                ("django-allowed-hosts", "*"),
                ("webhook-url", "http://example.com"),
            ]))
            .await;
        assert!(outcome.status().is_active());
        let env = workload.last_spec().unwrap().environment;
        assert_eq!(env["DJANGO_ALLOWED_HOSTS"], "*");
        assert_eq!(env["DJANGO_WEBHOOK_URL"], "http://example.com");
        assert!(!env.contains_key("DJANGO_LOG-LEVEL"));
    }

    #[tokio::test]
    async fn relation_data_is_exported() {
        let workload = MockWorkload::reachable();
        let (charm, _) = charm(&workload);
        let mut inputs = inputs(&[("log-level", "info")]);
        inputs.relations.insert(
            "postgresql".into(),
            [("db-connect-string".to_string(), "postgresql://db/netbox".to_string())].into(),
        );
        inputs.relations.insert(
            "s3".into(),
            [("access-key".to_string(), "key".to_string())].into(),
        );
        charm.reconcile(&inputs).await;
        let env = workload.last_spec().unwrap().environment;
        assert_eq!(env["POSTGRESQL_DB_CONNECT_STRING"], "postgresql://db/netbox");
        assert_eq!(env["S3_ACCESS_KEY"], "key");
    }

    #[tokio::test]
    async fn missing_required_relations_block() {
        let settings = Settings {
            required_relations: ["redis".to_string(), "postgresql".to_string()].into(),
            ..Settings::default()
        };
        let workload = MockWorkload::reachable();
        let (charm, _) = charm_with(settings, &workload);
        let mut inputs = inputs(&[("log-level", "info")]);
        inputs.relations.insert("redis".into(), BTreeMap::new());

        let outcome = charm.reconcile(&inputs).await;
        assert_eq!(
            outcome,
            Outcome::Settled(Status::Blocked(
                "missing integrations: postgresql, redis".to_string()
            ))
        );
        assert_eq!(workload.connects(), 0);

        inputs.relations.insert(
            "redis".into(),
            [("hostname".to_string(), "redis-0".to_string())].into(),
        );
        inputs.relations.insert(
            "postgresql".into(),
            [("endpoints".to_string(), "db:5432".to_string())].into(),
        );
        assert!(charm.reconcile(&inputs).await.status().is_active());
    }

    #[tokio::test]
    async fn concurrent_passes_do_not_overlap() {
        let workload = MockWorkload::reachable();
        let (charm, _) = charm(&workload);
        let charm = Arc::new(charm);
        let inputs = inputs(&[("log-level", "info")]);

        let (a, b) = tokio::join!(charm.reconcile(&inputs), charm.reconcile(&inputs));
        assert!(a.status().is_active());
        assert!(b.status().is_active());
        assert!(!workload.overlapped());
        assert_eq!(workload.calls().len(), 4);
    }

    #[test]
    fn defer_delay_backs_off() {
        let workload = MockWorkload::reachable();
        let (charm, _) = charm(&workload);
        for (n, upper) in [(0, 2), (1, 4), (3, 16), (7, 256), (20, 256)] {
            let delay = charm.defer_delay(n);
            assert!(delay >= Duration::from_millis(upper * 500), "{n}: {delay:?}");
            assert!(delay < Duration::from_secs(upper), "{n}: {delay:?}");
        }
    }
}
