use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use futures::future::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, watch};
use tracing::{event, Level};

use crate::reconciler::{Inputs, Outcome, Reconcile};
use crate::status::Status;

/// A lifecycle event delivered by the hosting runtime. Every trigger leads
/// to the same reconcile pass; the variant only shows up in logs and in
/// deferral bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Trigger {
    Install,
    Start,
    ConfigChanged,
    WorkloadReady,
    RelationChanged(String),
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Install => f.write_str("install"),
            Trigger::Start => f.write_str("start"),
            Trigger::ConfigChanged => f.write_str("config-changed"),
            Trigger::WorkloadReady => f.write_str("workload-ready"),
            Trigger::RelationChanged(name) => write!(f, "{name}-relation-changed"),
        }
    }
}

/// Sending half used to deliver [`Trigger`]s to a [`Controller`].
#[derive(Clone, Debug)]
pub struct TriggerSender(mpsc::UnboundedSender<Trigger>);

impl TriggerSender {
    /// Queues `trigger`. Returns `false` once the controller has stopped.
    pub fn send(&self, trigger: Trigger) -> bool {
        self.0.send(trigger).is_ok()
    }
}

/// The [`Controller`] delivers triggers for one managed unit to its
/// [`Reconcile`] implementation, one pass at a time, and publishes the
/// resulting [`Status`].
pub struct Controller<R: Reconcile> {
    reconciler: R,
    inputs: watch::Receiver<Inputs>,
    triggers: mpsc::UnboundedReceiver<Trigger>,
    status: watch::Sender<Status>,
}

impl<R> Controller<R>
where
    R: Reconcile + Send + Sync + 'static,
{
    /// Creates a controller reading a fresh snapshot of `inputs` at the start
    /// of every pass. Triggers are fed through the returned [`TriggerSender`].
    pub fn new(reconciler: R, inputs: watch::Receiver<Inputs>) -> (Self, TriggerSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(Status::default());
        let controller = Self {
            reconciler,
            inputs,
            triggers: rx,
            status,
        };
        (controller, TriggerSender(tx))
    }

    /// Subscribes to the status published after every pass.
    pub fn status(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    /// Runs the controller until every [`TriggerSender`] is dropped and no
    /// deferred trigger is left waiting.
    ///
    /// A pass ending in [`Outcome::Deferred`] puts its trigger back on a
    /// timer given by [`Reconcile::defer_delay`]. A trigger already waiting
    /// there is not queued a second time.
    pub async fn run(self) {
        let Self {
            reconciler,
            inputs,
            mut triggers,
            status,
        } = self;
        let mut deferred = FuturesUnordered::new();
        let mut waiting = BTreeSet::new();
        let mut deferrals: BTreeMap<Trigger, u32> = BTreeMap::new();
        let mut open = true;

        loop {
            let trigger = tokio::select! {
                trigger = triggers.recv(), if open => match trigger {
                    Some(trigger) => trigger,
                    None => {
                        open = false;
                        continue;
                    }
                },
                Some(trigger) = deferred.next(), if !deferred.is_empty() => {
                    waiting.remove(&trigger);
                    trigger
                },
                else => break,
            };

            event!(
                Level::INFO,
                controller = R::NAME,
                trigger = %trigger,
                "Reconciling."
            );
            let snapshot = inputs.borrow().clone();
            let outcome = reconciler.reconcile(&snapshot).await;
            event!(
                Level::INFO,
                controller = R::NAME,
                trigger = %trigger,
                status = %outcome.status(),
                "Reconcile pass finished."
            );

            match &outcome {
                Outcome::Settled(_) => {
                    deferrals.remove(&trigger);
                }
                Outcome::Deferred(_) => {
                    let consecutive = deferrals.entry(trigger.clone()).or_default();
                    let delay = reconciler.defer_delay(*consecutive);
                    *consecutive = consecutive.saturating_add(1);
                    if waiting.insert(trigger.clone()) {
                        event!(
                            Level::DEBUG,
                            controller = R::NAME,
                            trigger = %trigger,
                            delay = ?delay,
                            "Deferring trigger."
                        );
                        deferred.push(tokio::time::sleep(delay).map(move |()| trigger));
                    }
                }
            }
            status.send_replace(outcome.status().clone());
        }
    }
}
