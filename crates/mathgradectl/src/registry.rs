//! Connection registry - the reusable default connection
//!
//! Created explicitly and handed to whoever needs a connection. A closed or
//! invalidated connection is never handed out; the next `acquire` reopens.

use crate::rpc_client::{Connection, ConnectionState};
use mathgrade_shared::config::ClientConfig;
use mathgrade_shared::{EndpointAddress, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct ConnectionRegistry {
    addr: EndpointAddress,
    config: ClientConfig,
    slot: Mutex<Option<Arc<Connection>>>,
    connecting: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new(addr: EndpointAddress, config: ClientConfig) -> Self {
        Self {
            addr,
            config,
            slot: Mutex::new(None),
            connecting: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.addr
    }

    pub fn client_config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn state(&self) -> ConnectionState {
        if self.connecting.load(Ordering::SeqCst) {
            return ConnectionState::Connecting;
        }
        match self.slot.lock().await.as_ref() {
            Some(conn) => conn.state().await,
            None => ConnectionState::Disconnected,
        }
    }

    /// The open default connection, opening one if needed.
    ///
    /// Makes up to `connect_attempts` attempts, waiting `retry_delay_ms`
    /// between them, and returns the last error if all fail.
    pub async fn acquire(&self) -> Result<Arc<Connection>, TransportError> {
        let mut slot = self.slot.lock().await;
        if let Some(conn) = slot.as_ref() {
            if conn.is_open().await {
                return Ok(Arc::clone(conn));
            }
        }
        *slot = None;

        self.connecting.store(true, Ordering::SeqCst);
        let attempts = self.config.connect_attempts.max(1);
        let mut outcome = Err(TransportError::Closed);
        for attempt in 1..=attempts {
            outcome = Connection::open(self.addr.clone(), &self.config).await;
            match &outcome {
                Ok(_) => break,
                Err(e) if attempt < attempts => {
                    warn!(attempt, attempts, "connect to {} failed: {}", self.addr, e);
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
                Err(_) => {}
            }
        }
        self.connecting.store(false, Ordering::SeqCst);

        let conn = Arc::new(outcome?);
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Drop the default connection after it misbehaved
    pub async fn invalidate(&self) {
        if let Some(conn) = self.slot.lock().await.take() {
            warn!("invalidating connection to {}", self.addr);
            conn.close().await;
        }
    }

    /// Close the default connection. Safe to call repeatedly.
    pub async fn close(&self) {
        if let Some(conn) = self.slot.lock().await.take() {
            info!("closing connection to {}", self.addr);
            conn.close().await;
        }
    }
}
