//! Relay connection over WebSocket.
//!
//! [`RelayConnection::connect`] spawns a writer task fed by an outgoing
//! queue and a reader task that parses frames into [`RelayEvent`]s. When the
//! socket closes the event receiver ends; callers reconnect and reconcile
//! through the REST API.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use parley_shared::constants::RELAY_QUEUE_DEPTH;
use parley_shared::protocol::{CommandEnvelope, RelayEvent};

use crate::config::ClientConfig;
use crate::controller::CommandSink;
use crate::error::ClientError;

#[derive(Clone)]
pub struct RelayConnection {
    outgoing: mpsc::Sender<String>,
}

impl RelayConnection {
    /// Open the gateway socket, authenticating with the configured token.
    pub async fn connect(
        config: &ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<RelayEvent>), ClientError> {
        let url = config.ws_url()?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        info!(server = %config.server_url, "Relay connection established");

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(RELAY_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::channel::<RelayEvent>(RELAY_QUEUE_DEPTH);

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_writer.send(WsMessage::text(text)).await {
                    warn!("Relay write failed: {e}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match RelayEvent::from_json(text.as_str()) {
                        Ok(event) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Unparseable relay frame: {e}"),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Relay read failed: {e}");
                        break;
                    }
                }
            }
            debug!("Relay connection closed");
        });

        Ok((Self { outgoing: out_tx }, event_rx))
    }

    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }
}

impl CommandSink for RelayConnection {
    fn submit(&self, envelope: CommandEnvelope) -> Result<(), ClientError> {
        let text = envelope.to_json()?;
        self.outgoing
            .try_send(text)
            .map_err(|_| ClientError::Disconnected)
    }
}
