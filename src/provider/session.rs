//! Pass-scoped provider connection

use std::sync::Arc;

use tracing::{debug, warn};

use super::{Connection, Provider, ProviderError, ProviderResult};

/// A connected provider for the duration of one pass
///
/// Obtain one with [`Session::open`] and finish it with [`Session::close`],
/// which disconnects and folds a disconnect failure into the result. A session
/// dropped without `close` disconnects in the background.
pub struct Session {
    provider: Arc<dyn Provider>,
    connection: Connection,
    open: bool,
}

impl Session {
    /// Connect to the device
    pub async fn open(provider: Arc<dyn Provider>, connection: Connection) -> ProviderResult<Self> {
        provider.connect(&connection).await?;
        debug!(device = %connection.device, "provider session opened");
        Ok(Self {
            provider,
            connection,
            open: true,
        })
    }

    /// The connected provider
    pub fn provider(&self) -> &dyn Provider {
        self.provider.as_ref()
    }

    /// The connection this session was opened with
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Disconnect and combine the disconnect result with `outcome`
    pub async fn close<T>(mut self, outcome: ProviderResult<T>) -> ProviderResult<T> {
        self.open = false;
        let released = self.provider.disconnect(&self.connection).await;
        debug!(device = %self.connection.device, "provider session closed");
        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(err), Ok(())) => Err(err),
            (Ok(_), Err(release)) => Err(release),
            (Err(err), Err(release)) => Err(ProviderError::Aggregate {
                operation: Box::new(err),
                release: Box::new(release),
            }),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let provider = self.provider.clone();
        let connection = self.connection.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = provider.disconnect(&connection).await {
                        warn!(
                            device = %connection.device,
                            error = %e,
                            "background disconnect failed"
                        );
                    }
                });
            }
            Err(_) => {
                warn!(
                    device = %connection.device,
                    "session dropped outside a runtime, connection left open"
                );
            }
        }
    }
}
