//! Exchange websocket client.
//!
//! One `run` call is one connection lifetime. Transport failures surface as
//! the distinguished `Restart` error so the supervisor can reconnect with
//! backoff; handler failures (storage, exhausted REST retries) are fatal
//! and take the crash path. A command channel carries the control plane's
//! mid-session subscribe/unsubscribe frames and the drained-shutdown stop.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::handler::StreamEventHandler;

#[derive(Debug, Error)]
pub enum StreamError {
    /// Connection-level failure: reconnect with backoff.
    #[error("websocket restart: {0}")]
    Restart(String),
    /// Unrecoverable failure: take the crash path.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// Control-plane messages for a live connection.
#[derive(Debug)]
pub enum StreamCommand {
    /// Send a raw frame (subscribe/unsubscribe delta).
    Send(Value),
    /// Close the connection and return cleanly.
    Stop,
}

/// The initial and delta subscription frames for the `full` channel.
pub fn subscribe_frame(product_ids: &[String], subscribe: bool) -> Value {
    json!({
        "type": if subscribe { "subscribe" } else { "unsubscribe" },
        "product_ids": product_ids,
        "channels": ["full"],
    })
}

pub struct StreamClient {
    url: String,
    subscribe_message: Value,
    handler: Arc<StreamEventHandler>,
}

impl StreamClient {
    pub fn new(url: &str, subscribe_message: Value, handler: Arc<StreamEventHandler>) -> Self {
        Self {
            url: url.to_string(),
            subscribe_message,
            handler,
        }
    }

    /// Run one connection to completion. `Ok(())` only on a commanded stop.
    pub async fn run(
        &self,
        commands: &mut UnboundedReceiver<StreamCommand>,
    ) -> Result<(), StreamError> {
        let (ws, _) = connect_async(&self.url)
            .await
            .map_err(|e| StreamError::Restart(format!("connect failed: {e}")))?;
        info!(url = %self.url, "websocket connected");

        let (mut write, mut read) = ws.split();
        write
            .send(Message::Text(self.subscribe_message.to_string()))
            .await
            .map_err(|e| StreamError::Restart(format!("subscribe send failed: {e}")))?;

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Value>(&text) {
                            Ok(event) => self.handler.on_event(event).await?,
                            Err(e) => warn!(error = %e, "undecodable frame dropped"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Err(StreamError::Restart(format!("server close: {frame:?}")));
                    }
                    Some(Err(e)) => {
                        return Err(StreamError::Restart(format!("transport error: {e}")));
                    }
                    None => {
                        return Err(StreamError::Restart("stream ended".to_string()));
                    }
                    _ => {}
                },
                cmd = commands.recv() => match cmd {
                    Some(StreamCommand::Send(frame)) => {
                        write
                            .send(Message::Text(frame.to_string()))
                            .await
                            .map_err(|e| StreamError::Restart(format!("frame send failed: {e}")))?;
                        info!(frame = %frame, "control frame sent");
                    }
                    Some(StreamCommand::Stop) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        info!("websocket stopped by command");
                        return Ok(());
                    }
                }
            }
        }
    }
}
