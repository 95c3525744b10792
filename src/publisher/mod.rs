//! Publisher module for IPC communication
//!
//! Ships each broadcast item to the host process over a Unix socket as
//! length-prefixed MessagePack. Registered as one broadcast handler;
//! publish failures are absorbed so a dead consumer never stalls the
//! broadcast stage.

use futures_util::future::BoxFuture;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{FeedError, Result};
use crate::pipeline::{BroadcastHandler, Outbound};

/// Publisher for sending chain payloads and signals via Unix socket
pub struct Publisher {
    socket_path: String,
    stream: Mutex<Option<UnixStream>>,
}

impl Publisher {
    /// Create a new publisher
    pub async fn new(socket_path: &str) -> Result<Self> {
        let publisher = Self {
            socket_path: socket_path.to_string(),
            stream: Mutex::new(None),
        };

        // Try initial connection (may fail if the consumer isn't ready)
        if let Err(e) = publisher.connect().await {
            warn!(error = %e, "Initial IPC connection failed, will retry on publish");
        }

        Ok(publisher)
    }

    /// Connect to the Unix socket
    async fn connect(&self) -> Result<()> {
        let path = Path::new(&self.socket_path);

        if !path.exists() {
            return Err(FeedError::Ipc(format!(
                "socket path does not exist: {}",
                self.socket_path
            )));
        }

        let stream = UnixStream::connect(path).await.map_err(|e| {
            FeedError::Ipc(format!("failed to connect to {}: {}", self.socket_path, e))
        })?;

        let mut guard = self.stream.lock().await;
        *guard = Some(stream);

        info!(path = %self.socket_path, "Connected to IPC socket");
        Ok(())
    }

    /// Publish one broadcast item
    pub async fn publish(&self, item: &Outbound) -> Result<()> {
        let data = rmp_serde::to_vec_named(item)
            .map_err(|e| FeedError::Serialization(format!("failed to serialize: {}", e)))?;

        // Length-prefixed frame
        let len = (data.len() as u32).to_be_bytes();
        let mut message = Vec::with_capacity(4 + data.len());
        message.extend_from_slice(&len);
        message.extend_from_slice(&data);

        let mut guard = self.stream.lock().await;

        if guard.is_none() {
            drop(guard);
            if let Err(e) = self.connect().await {
                debug!(error = %e, "Failed to reconnect to IPC socket");
                return Ok(()); // Don't fail the broadcast stage on publish errors
            }
            guard = self.stream.lock().await;
        }

        if let Some(stream) = guard.as_mut() {
            match stream.write_all(&message).await {
                Ok(_) => {
                    debug!(bytes = message.len(), "Published broadcast item");
                }
                Err(e) => {
                    warn!(error = %e, "Failed to write to IPC socket");
                    *guard = None; // Mark as disconnected
                }
            }
        }

        Ok(())
    }
}

impl BroadcastHandler for Publisher {
    fn name(&self) -> &str {
        "ipc_publisher"
    }

    fn deliver<'a>(&'a self, item: &'a Outbound) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.publish(item))
    }
}
