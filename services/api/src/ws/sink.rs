//! Outbound half of a client connection.

use super::protocol::ServerMessage;
use anyhow::Result;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, stream::SplitSink};
use tokio::sync::Mutex;
use uuid::Uuid;
use zipo_core::{Command, presentation::PresentationEmitter};

/// Anything server events can be written to. Sends are serialized per sink.
#[async_trait]
pub trait ClientSink: Send + Sync {
    async fn send(&self, msg: ServerMessage) -> Result<()>;
}

pub struct WsSink {
    socket_tx: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsSink {
    pub fn new(socket_tx: SplitSink<WebSocket, Message>) -> Self {
        Self {
            socket_tx: Mutex::new(socket_tx),
        }
    }
}

#[async_trait]
impl ClientSink for WsSink {
    async fn send(&self, msg: ServerMessage) -> Result<()> {
        send_msg(&mut *self.socket_tx.lock().await, msg).await
    }
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}

/// Emits finished presentations as `command_stream_received`.
pub struct CommandEmitter<'a> {
    sink: &'a dyn ClientSink,
}

impl<'a> CommandEmitter<'a> {
    pub fn new(sink: &'a dyn ClientSink) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl PresentationEmitter for CommandEmitter<'_> {
    async fn emit_commands(&self, session_id: Uuid, commands: Vec<Command>) -> Result<()> {
        self.sink
            .send(ServerMessage::CommandStreamReceived {
                session_id,
                commands,
            })
            .await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;

    #[tokio::test]
    async fn emitter_wraps_commands_for_the_session() {
        let sink = RecordingSink::default();
        let session_id = Uuid::new_v4();
        CommandEmitter::new(&sink)
            .emit_commands(session_id, vec![Command::session_end()])
            .await
            .unwrap();
        assert_eq!(
            sink.sent(),
            vec![ServerMessage::CommandStreamReceived {
                session_id,
                commands: vec![Command::session_end()],
            }]
        );
    }
}
