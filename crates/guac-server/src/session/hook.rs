//! Host-supplied validation of resolved connection settings.

use guac_core::ConnectionSettings;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Outcome of a validation: the (possibly rewritten) settings or a rejection reason.
pub type ValidationFuture = Pin<Box<dyn Future<Output = Result<ConnectionSettings, String>> + Send>>;

/// Invoked once per session after settings resolution and before guacd is
/// contacted. Exactly one outcome is produced per call.
///
/// Implemented for any `Fn(ConnectionSettings) -> impl Future<Output = Result<ConnectionSettings, String>>`.
pub trait SettingsValidator: Send + Sync + 'static {
    fn validate(&self, settings: ConnectionSettings) -> ValidationFuture;
}

impl<F, Fut> SettingsValidator for F
where
    F: Fn(ConnectionSettings) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ConnectionSettings, String>> + Send + 'static,
{
    fn validate(&self, settings: ConnectionSettings) -> ValidationFuture {
        Box::pin(self(settings))
    }
}

/// Validator that accepts every session unchanged.
pub fn accept_all() -> Arc<dyn SettingsValidator> {
    Arc::new(|settings: ConnectionSettings| async move { Ok::<_, String>(settings) })
}
