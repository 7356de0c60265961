//! Round-robin pool of backends for one service

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::transport::{Transport, TransportOptions};
use crate::error::{Error, Result};

/// One connection bound to one announced address
#[derive(Debug, Clone)]
pub struct Backend<C> {
    address: Arc<str>,
    connection: C,
    options: Arc<TransportOptions>,
}

impl<C> Backend<C> {
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub const fn connection(&self) -> &C {
        &self.connection
    }

    #[must_use]
    pub fn into_connection(self) -> C {
        self.connection
    }

    /// Options the connection was built with
    #[must_use]
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    #[must_use]
    pub fn max_retry(&self) -> u32 {
        self.options.max_retry
    }
}

struct PoolInner<C> {
    backends: Vec<Backend<C>>,
    cursor: usize,
}

/// Backends of one named service
///
/// `add`, `remove` and `choose` share one lock, so `choose` always sees a
/// consistent backend count.
pub struct ChannelPool<C> {
    service: String,
    inner: Mutex<PoolInner<C>>,
}

impl<C: Clone> ChannelPool<C> {
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            inner: Mutex::new(PoolInner {
                backends: Vec::new(),
                cursor: 0,
            }),
        }
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Connect to `address` and append it to the rotation
    ///
    /// An address already in the pool is left as is. If the transport
    /// rejects the address the pool is unchanged.
    pub fn add<T>(&self, transport: &T, address: &str, options: &TransportOptions) -> Result<()>
    where
        T: Transport<Connection = C>,
    {
        if self.contains(address) {
            debug!(service = %self.service, address = %address, "Backend already present");
            return Ok(());
        }

        // Connection setup happens outside the lock
        let connection = transport.connect(address, options).map_err(|e| {
            error!(service = %self.service, address = %address, error = %e, "Failed to initialize channel");
            e
        })?;

        let mut inner = self.inner.lock();
        if inner.backends.iter().any(|b| b.address() == address) {
            debug!(service = %self.service, address = %address, "Backend added concurrently");
            return Ok(());
        }
        inner.backends.push(Backend {
            address: Arc::from(address),
            connection,
            options: Arc::new(options.clone()),
        });

        info!(
            service = %self.service,
            address = %address,
            backends = inner.backends.len(),
            "Backend added"
        );
        Ok(())
    }

    /// Drop the backend bound to `address`
    pub fn remove(&self, address: &str) -> Result<()> {
        let mut inner = self.inner.lock();

        let Some(index) = inner.backends.iter().position(|b| b.address() == address) else {
            warn!(service = %self.service, address = %address, "Backend to remove not found");
            return Err(Error::UnknownAddress {
                service: self.service.clone(),
                address: address.to_string(),
            });
        };

        inner.backends.remove(index);
        info!(
            service = %self.service,
            address = %address,
            backends = inner.backends.len(),
            "Backend removed"
        );
        Ok(())
    }

    /// Next backend in rotation, `None` if the pool is empty
    pub fn choose(&self) -> Option<Backend<C>> {
        let mut inner = self.inner.lock();

        if inner.backends.is_empty() {
            error!(service = %self.service, "No backend to choose from");
            return None;
        }

        let index = inner.cursor % inner.backends.len();
        inner.cursor = inner.cursor.wrapping_add(1);
        Some(inner.backends[index].clone())
    }

    #[must_use]
    pub fn contains(&self, address: &str) -> bool {
        self.inner.lock().backends.iter().any(|b| b.address() == address)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().backends.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().backends.is_empty()
    }

    /// Addresses in rotation order
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        self.inner
            .lock()
            .backends
            .iter()
            .map(|b| b.address().to_string())
            .collect()
    }
}
