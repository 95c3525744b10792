//! WebSocket client for the broker binary feed
//!
//! Handles connection, subscription control frames, and frame reception.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::client::IntoClientRequest,
    tungstenite::http::header::AUTHORIZATION,
    tungstenite::http::HeaderValue,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::error::{FeedError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What one receive call produced
#[derive(Debug)]
pub enum FeedEvent {
    /// A binary market-data frame
    Frame(Bytes),
    /// Ping/pong or a broker control acknowledgement
    Control,
}

/// WebSocket client for a single feed connection
pub struct FeedClient {
    stream: Option<WsStream>,
    endpoint: String,
}

impl FeedClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            stream: None,
            endpoint: endpoint.to_string(),
        }
    }

    /// Connect with a bearer token
    pub async fn connect(&mut self, token: &str) -> Result<()> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| FeedError::Transport(format!("invalid endpoint: {}", e)))?;
        let header = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| FeedError::Transport(format!("invalid token header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        info!(endpoint = %self.endpoint, "Connecting to broker feed");

        let (ws_stream, response) = connect_async(request)
            .await
            .map_err(|e| FeedError::Transport(format!("failed to connect: {}", e)))?;

        info!(status = ?response.status(), "Feed connected");
        self.stream = Some(ws_stream);

        Ok(())
    }

    /// Receive the next event
    pub async fn recv(&mut self) -> Result<FeedEvent> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| FeedError::Transport("not connected".to_string()))?;

        match stream.next().await {
            Some(Ok(Message::Binary(data))) => Ok(FeedEvent::Frame(Bytes::from(data))),
            Some(Ok(Message::Text(text))) => {
                // Subscription acks and other broker notices
                debug!(msg = %text, "Control message");
                Ok(FeedEvent::Control)
            }
            Some(Ok(Message::Ping(data))) => {
                debug!("Received ping, sending pong");
                if let Some(stream) = self.stream.as_mut() {
                    let _ = stream.send(Message::Pong(data)).await;
                }
                Ok(FeedEvent::Control)
            }
            Some(Ok(Message::Pong(_))) => Ok(FeedEvent::Control),
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "Received close frame");
                self.stream = None;
                Err(FeedError::Transport("connection closed".to_string()))
            }
            Some(Ok(Message::Frame(_))) => Ok(FeedEvent::Control),
            Some(Err(e)) => {
                error!(error = %e, "WebSocket error");
                self.stream = None;
                Err(FeedError::Transport(e.to_string()))
            }
            None => {
                warn!("WebSocket stream ended");
                self.stream = None;
                Err(FeedError::Transport("stream ended".to_string()))
            }
        }
    }

    /// Subscribe to a set of instrument keys
    pub async fn subscribe(&mut self, instrument_keys: &[String]) -> Result<()> {
        if instrument_keys.is_empty() {
            return Ok(());
        }
        self.send_control(json!({
            "action": "subscribe",
            "instrument_keys": instrument_keys,
        }))
        .await
    }

    /// Unsubscribe from a set of instrument keys
    pub async fn unsubscribe(&mut self, instrument_keys: &[String]) -> Result<()> {
        if instrument_keys.is_empty() {
            return Ok(());
        }
        self.send_control(json!({
            "action": "unsubscribe",
            "instrument_keys": instrument_keys,
        }))
        .await
    }

    async fn send_control(&mut self, payload: serde_json::Value) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| FeedError::Transport("not connected".to_string()))?;
        stream
            .send(Message::Text(payload.to_string()))
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))
    }

    /// Send a ping to keep the connection alive
    pub async fn ping(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            stream
                .send(Message::Ping(vec![]))
                .await
                .map_err(|e| FeedError::Transport(e.to_string()))?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}
