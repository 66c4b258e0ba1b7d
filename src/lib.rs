#![allow(clippy::style)]
#![allow(clippy::complexity)]
#![allow(clippy::large_enum_variant)]
#![allow(clippy::mutable_key_type)]
#![allow(clippy::stable_sort_primitive)]
#![allow(clippy::map_entry)]
#![allow(clippy::box_default)]
#![warn(clippy::bool_comparison)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::no_effect)]
#![warn(clippy::unnecessary_unwrap)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::todo)]
#![warn(clippy::wildcard_dependencies)]
#![warn(clippy::zero_prefixed_literal)]
#![warn(clippy::borrowed_box)]
#![warn(clippy::deref_addrof)]
#![warn(clippy::double_must_use)]
#![warn(clippy::double_parens)]
#![warn(clippy::extra_unused_lifetimes)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_question_mark)]
#![warn(clippy::needless_return)]
#![warn(clippy::redundant_pattern)]
#![warn(clippy::redundant_slicing)]
#![warn(clippy::redundant_static_lifetimes)]
#![warn(clippy::single_component_path_imports)]
#![warn(clippy::unnecessary_cast)]
#![warn(clippy::useless_asref)]
#![warn(clippy::useless_conversion)]
#![warn(clippy::builtin_type_shadow)]
#![warn(clippy::duplicate_underscore_argument)]
#![warn(double_negations)]
#![warn(clippy::unnecessary_mut_passed)]
#![warn(clippy::wildcard_in_or_patterns)]
#![warn(clippy::crosspointer_transmute)]
#![warn(clippy::excessive_precision)]
#![warn(clippy::panicking_overflow_checks)]
#![warn(clippy::as_conversions)]
#![warn(clippy::match_overlapping_arm)]
#![warn(clippy::zero_divided_by_zero)]
#![warn(clippy::must_use_unit)]
#![warn(clippy::suspicious_assignment_formatting)]
#![warn(clippy::suspicious_else_formatting)]
#![warn(clippy::suspicious_unary_op_formatting)]
#![warn(clippy::mut_mutex_lock)]
#![warn(clippy::print_literal)]
#![warn(clippy::same_item_push)]
#![warn(clippy::useless_format)]
#![warn(clippy::write_literal)]
#![warn(clippy::redundant_closure)]
#![warn(clippy::redundant_closure_call)]
#![warn(clippy::unnecessary_lazy_evaluations)]
#![warn(clippy::partialeq_ne_impl)]
#![warn(clippy::redundant_field_names)]
#![warn(clippy::transmutes_expressible_as_ptr_casts)]
#![warn(clippy::unused_async)]
#![warn(clippy::disallowed_methods)]
#![warn(clippy::disallowed_macros)]
#![warn(clippy::disallowed_types)]
#![warn(clippy::from_over_into)]

//! This crate implements holistic reconciliation for a managed workload:
//! every lifecycle trigger (install, start, config-changed, relation-changed,
//! workload-ready) is collapsed onto one idempotent pass that validates the
//! unit's configuration, declares the full launch spec of the workload and
//! reports a single [`Status`].
//!
//! The pass itself is the [`Reconcile`] trait. [`Charm`] implements it over
//! two injected capabilities, a [`Workload`] control surface and a
//! [`Verbosity`] for the process's own logging:
//!
//! ```no_run
//! # use async_trait::async_trait;
//! # use holistic_controller::{
//! #     Charm, Inputs, LaunchSpec, LogLevel, Reconcile, Settings, Verbosity, Workload,
//! #     WorkloadError,
//! # };
//! struct Supervisor;
//!
//! #[async_trait]
//! impl Workload for Supervisor {
//!     async fn can_connect(&self) -> Result<bool, WorkloadError> {
//!         Ok(true)
//!     }
//!
//!     async fn replace(&self, spec: &LaunchSpec) -> Result<(), WorkloadError> {
//!         println!("declaring {:?}", spec.environment);
//!         Ok(())
//!     }
//!
//!     async fn replan(&self) -> Result<(), WorkloadError> {
//!         Ok(())
//!     }
//! }
//!
//! struct Quiet;
//!
//! impl Verbosity for Quiet {
//!     fn set_verbosity(&self, _level: LogLevel) {}
//! }
//!
//! # async fn foo() {
//! let charm = Charm::new(Settings::default(), Supervisor, Quiet);
//! let inputs = Inputs {
//!     config: [("log-level", "info")].into_iter().collect(),
//!     ..Default::default()
//! };
//! let outcome = charm.reconcile(&inputs).await;
//! assert!(outcome.status().is_active());
//! # }
//! ```
//!
//! In a cluster, a [`Controller`] delivers triggers to the reconciler one at
//! a time and redelivers deferred ones, while [`source::watch_inputs`] keeps
//! the configuration and relation data current and reports when the workload
//! comes up:
//!
//! ```no_run
//! # use k8s_openapi::api::apps::v1::Deployment;
//! # use k8s_openapi::api::core::v1::{ConfigMap, Secret};
//! # use kube::{Api, Client};
//! # use tokio::sync::watch;
//! # use holistic_controller::{
//! #     logging, source, Charm, Controller, DeploymentWorkload, Inputs, LogLevel, Settings,
//! #     Trigger,
//! # };
//! # async fn foo() -> Result<(), Box<dyn std::error::Error>> {
//! let verbosity = logging::init(LogLevel::Info)?;
//! let client = Client::try_default().await?;
//! let workload = DeploymentWorkload::new(client.clone(), "netbox", "netbox");
//! let charm = Charm::new(Settings::default(), workload, verbosity);
//!
//! let (inputs_tx, inputs_rx) = watch::channel(Inputs::default());
//! let (controller, triggers) = Controller::new(charm, inputs_rx);
//! tokio::spawn(source::watch_inputs(
//!     Api::<ConfigMap>::namespaced(client.clone(), "netbox"),
//!     "netbox-config",
//!     Api::<Secret>::namespaced(client.clone(), "netbox"),
//!     Api::<Deployment>::namespaced(client, "netbox"),
//!     "netbox",
//!     inputs_tx,
//!     triggers.clone(),
//! ));
//! triggers.send(Trigger::Install);
//! triggers.send(Trigger::Start);
//! controller.run().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod controller;
mod error;
pub mod logging;
mod reconciler;
pub mod source;
mod status;
mod workload;


pub use config::{Config, LogLevel, Settings, LOG_LEVEL_KEY, MIN_CONNECT_TIMEOUT_SECS};
pub use controller::{Controller, Trigger, TriggerSender};
pub use error::Error;
pub use logging::{FilterHandle, Verbosity};
pub use reconciler::{Charm, Inputs, Outcome, Reconcile, Relations};
pub use status::Status;
pub use workload::{
    deployment_patch, DeploymentWorkload, LaunchSpec, Startup, Workload, WorkloadError,
    FIELD_MANAGER,
};
