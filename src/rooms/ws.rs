use axum::{
    debug_handler,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::{
    sync::mpsc,
    time::{timeout, Duration},
};
use tracing::{debug, warn};

use crate::{
    protocol::{ClientEvent, DecodeError, ServerEvent},
    registry::{ConnectionHandle, Payload},
    relay::{encode, RelayError},
    rooms::msg::SendMessageQuery,
    SharedRelay,
};

const FLUSH_GRACE: Duration = Duration::from_secs(2);
const INCOMPLETE_SEND: &str = "send-message needs senderId, receiverId and message";

#[debug_handler(state = crate::AppState)]
pub async fn relay_ws(State(relay): State<SharedRelay>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |stream| serve_socket(relay, stream))
}

async fn serve_socket(relay: SharedRelay, stream: WebSocket) {
    let (conn, outbox) = relay.open_connection();
    let (sender, mut receiver) = stream.split();

    let mut writer = tokio::spawn(pump(outbox, sender));

    // frames are handled one at a time, so a client's sends keep their order
    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(connection = %conn.id(), error = %err, "socket read failed");
                break;
            }
        };

        let decoded = match &frame {
            Message::Text(text) => ClientEvent::decode(text.as_str().as_bytes()),
            Message::Binary(bytes) => ClientEvent::decode(bytes),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        let event = match decoded {
            Ok(event) => event,
            Err(DecodeError::Incomplete { event }) if event == "send-message" => {
                reply(&conn, ServerEvent::error(RelayError::Validation(INCOMPLETE_SEND)));
                continue;
            }
            Err(err) => {
                debug!(connection = %conn.id(), error = %err, "skipping frame");
                continue;
            }
        };

        handle_event(&relay, &conn, event).await;
    }

    relay.disconnect(&conn).await;

    // the registry no longer holds the handle, so dropping ours closes the outbox
    drop(conn);
    if timeout(FLUSH_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
}

/// Writes queued frames until every handle to the outbox is gone.
async fn pump<S>(mut outbox: mpsc::Receiver<Payload>, mut sink: S)
where
    S: Sink<Message> + Unpin,
{
    while let Some(payload) = outbox.recv().await {
        if sink.send(Message::Text(payload.to_string().into())).await.is_err() {
            break;
        }
    }
}

async fn handle_event(relay: &SharedRelay, conn: &ConnectionHandle, event: ClientEvent) {
    match event {
        ClientEvent::JoinRoom { user_id, receiver_id } => {
            relay.join(conn, &user_id, &receiver_id).await;
        }
        ClientEvent::SendMessage { sender_id, receiver_id, message } => {
            let query = SendMessageQuery { sender_id, receiver_id, message };
            match relay.send(query).await {
                Ok(_) => {}
                Err(err @ RelayError::Validation(_)) => reply(conn, ServerEvent::error(err)),
                Err(_) => reply(conn, ServerEvent::error("message could not be sent")),
            }
        }
    }
}

fn reply(conn: &ConnectionHandle, event: ServerEvent) {
    let result = encode(&event)
        .map_err(|err| err.to_string())
        .and_then(|payload| conn.deliver(payload).map_err(|err| err.to_string()));
    if let Err(err) = result {
        warn!(connection = %conn.id(), error = %err, "could not reply");
    }
}
