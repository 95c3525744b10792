//! Feed session manager
//!
//! Owns the reconnect loop, re-subscribes the last-known active key set
//! after a reconnect, drains subscription commands from the window
//! manager, and hands every binary frame to the pipeline without ever
//! blocking the socket reader.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::client::{FeedClient, FeedEvent};
use crate::broker::SharedTokenGate;
use crate::chain::{ChainManager, SubscriptionDiff};
use crate::config::Config;
use crate::error::{FeedError, Result};
use crate::pipeline::IngestionPipeline;

/// Maximum backoff delay in milliseconds (60 seconds)
const MAX_BACKOFF_CAP_MS: u64 = 60_000;
/// Cooldown period after which reconnect attempts are reset (5 minutes)
const RECONNECT_COOLDOWN_SECS: u64 = 300;

/// Subscription change requested by the window manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

/// Sender half used by the batch compute loops
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    tx: mpsc::Sender<SubscriptionCommand>,
}

impl SubscriptionHandle {
    /// Wrap an existing command channel, for hosts that route
    /// subscription intents themselves
    pub fn from_sender(tx: mpsc::Sender<SubscriptionCommand>) -> Self {
        Self { tx }
    }

    /// Issue a rebalance diff, unsubscribes first
    pub async fn apply_diff(&self, diff: SubscriptionDiff) {
        if !diff.to_unsubscribe.is_empty() {
            if let Err(e) = self
                .tx
                .send(SubscriptionCommand::Unsubscribe(diff.to_unsubscribe))
                .await
            {
                warn!(error = %e, "Subscription command channel closed");
                return;
            }
        }
        if !diff.to_subscribe.is_empty() {
            if let Err(e) = self
                .tx
                .send(SubscriptionCommand::Subscribe(diff.to_subscribe))
                .await
            {
                warn!(error = %e, "Subscription command channel closed");
            }
        }
    }
}

/// Manages the feed connection with automatic reconnection
pub struct FeedManager {
    config: Arc<Config>,
    pipeline: Arc<IngestionPipeline>,
    chains: Arc<ChainManager>,
    token: Arc<SharedTokenGate>,
    client: FeedClient,
    commands: mpsc::Receiver<SubscriptionCommand>,
    reconnect_attempts: u32,
    last_successful_connection: Option<Instant>,
}

impl FeedManager {
    pub fn new(
        config: Arc<Config>,
        pipeline: Arc<IngestionPipeline>,
        chains: Arc<ChainManager>,
        token: Arc<SharedTokenGate>,
    ) -> (Self, SubscriptionHandle) {
        let client = FeedClient::new(&config.ws_endpoint);
        let (tx, commands) = mpsc::channel(64);
        (
            Self {
                config,
                pipeline,
                chains,
                token,
                client,
                commands,
                reconnect_attempts: 0,
                last_successful_connection: None,
            },
            SubscriptionHandle { tx },
        )
    }

    /// Run until shutdown, reconnecting with capped exponential backoff
    ///
    /// Only `AuthRequired` escapes: the host must re-authenticate before
    /// the feed can make progress.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Starting feed manager");

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            // Reset reconnect attempts after a stable stretch
            if let Some(last_success) = self.last_successful_connection {
                if last_success.elapsed() > Duration::from_secs(RECONNECT_COOLDOWN_SECS)
                    && self.reconnect_attempts > 0
                {
                    info!(
                        previous_attempts = self.reconnect_attempts,
                        "Resetting reconnect counter after cooldown period"
                    );
                    self.reconnect_attempts = 0;
                }
            }

            match self.connect_and_process(&mut shutdown).await {
                Ok(()) => return Ok(()),
                Err(FeedError::AuthRequired(reason)) => {
                    error!(reason = %reason, "Feed authentication failed");
                    return Err(FeedError::AuthRequired(reason));
                }
                Err(e) => {
                    error!(error = %e, "Feed error");
                    self.reconnect_attempts += 1;

                    let base_delay = self.config.reconnect_delay_ms
                        * 2u64.pow(self.reconnect_attempts.min(6));
                    let cap = self.config.max_backoff_ms.min(MAX_BACKOFF_CAP_MS);
                    let delay = Duration::from_millis(base_delay.min(cap));

                    warn!(
                        attempt = self.reconnect_attempts,
                        delay_secs = delay.as_secs(),
                        "Reconnecting after error..."
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// One connection lifetime: connect, resubscribe, drain frames
    async fn connect_and_process(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let token = self.token.valid_token().await?;
        self.client.connect(&token).await?;

        self.last_successful_connection = Some(Instant::now());
        self.reconnect_attempts = 0;

        // Re-subscribe everything the chains were holding before the drop
        let active = self.chains.all_active_keys().await;
        if !active.is_empty() {
            info!(keys = active.len(), "Re-subscribing active instrument set");
            self.client.subscribe(&active).await?;
        }

        let recv_timeout = Duration::from_secs(self.config.ws_read_timeout_secs);
        let mut last_frame = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.client.close().await;
                        return Ok(());
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(SubscriptionCommand::Subscribe(keys)) => {
                            debug!(count = keys.len(), "Subscribing instruments");
                            self.client.subscribe(&keys).await?;
                        }
                        Some(SubscriptionCommand::Unsubscribe(keys)) => {
                            debug!(count = keys.len(), "Unsubscribing instruments");
                            self.client.unsubscribe(&keys).await?;
                        }
                        None => {
                            // All senders gone; nothing left to manage
                            self.client.close().await;
                            return Ok(());
                        }
                    }
                }
                event = timeout(recv_timeout, self.client.recv()) => {
                    match event {
                        Ok(Ok(FeedEvent::Frame(data))) => {
                            last_frame = Instant::now();
                            // Non-blocking: a full queue sheds, the reader never stalls
                            self.pipeline.ingest_raw(data);
                        }
                        Ok(Ok(FeedEvent::Control)) => {}
                        Ok(Err(e)) => return Err(e),
                        Err(_) => {
                            warn!(
                                last_frame_secs = last_frame.elapsed().as_secs(),
                                "No frame within read timeout, sending keepalive"
                            );
                            if let Err(e) = self.client.ping().await {
                                warn!(error = %e, "Keepalive failed, reconnecting");
                                return Err(FeedError::ConnectionTimeout);
                            }
                        }
                    }
                }
            }
        }
    }
}
