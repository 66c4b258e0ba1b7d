use std::sync::Arc;

use tracing::{event, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::config::LogLevel;
use crate::error::Error;

/// The capability to change how verbose this process logs.
///
/// Setting the same level repeatedly must be harmless.
pub trait Verbosity {
    fn set_verbosity(&self, level: LogLevel);
}

impl<V: Verbosity + ?Sized> Verbosity for Arc<V> {
    fn set_verbosity(&self, level: LogLevel) {
        (**self).set_verbosity(level)
    }
}

/// [`Verbosity`] backed by a reloadable [`EnvFilter`].
#[derive(Clone, Debug)]
pub struct FilterHandle(reload::Handle<EnvFilter, Registry>);

impl Verbosity for FilterHandle {
    fn set_verbosity(&self, level: LogLevel) {
        if let Err(err) = self.0.reload(EnvFilter::new(level.directive())) {
            // the subscriber is gone; nothing left to configure
            event!(Level::WARN, err = %err, "Failed to change log verbosity.");
        }
    }
}

/// A filter layer starting at `level`, together with the handle that
/// retunes it.
pub fn filter_layer(level: LogLevel) -> (reload::Layer<EnvFilter, Registry>, FilterHandle) {
    let (layer, handle) = reload::Layer::new(EnvFilter::new(level.directive()));
    (layer, FilterHandle(handle))
}

/// Installs the process-wide subscriber and returns its [`FilterHandle`].
///
/// Fails if a global subscriber is already set.
pub fn init(level: LogLevel) -> Result<FilterHandle, Error> {
    let (filter, handle) = filter_layer(level);
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_level(true)
                .with_target(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|err| Error::Logging(err.to_string()))?;
    Ok(handle)
}
