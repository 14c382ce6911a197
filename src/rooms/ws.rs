use std::{sync::Arc, time::Duration};

use axum::{
    debug_handler,
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{connection::Connection, hub::Hub, ids::Participant};
use crate::{config::Config, session::Identity};

#[debug_handler(state = crate::AppState)]
pub async fn room_ws(
    State(hub): State<Arc<Hub>>,
    State(config): State<Arc<Config>>,
    Identity(participant): Identity,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, hub, participant, config))
}

/// Pumps one socket: a writer task drains the outbox with a per-write
/// timeout while this task feeds inbound frames to the [`Connection`].
async fn serve_socket(socket: WebSocket, hub: Arc<Hub>, participant: Participant, config: Arc<Config>) {
    let (mut conn, mut outbox) = Connection::open(hub, participant, config.outbox_capacity);
    let eviction = outbox.eviction();
    let write_timeout = config.write_timeout;
    let connection = conn.id();
    info!(%connection, user = %conn.participant().user_id, "socket connected");

    let (mut sender, mut receiver) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            match timeout(write_timeout, sender.send(WsMessage::Text(frame.to_json().into()))).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(%connection, %err, "socket write failed");
                    break;
                }
                Err(_) => {
                    warn!(%connection, timeout = ?write_timeout, "socket write timed out");
                    break;
                }
            }
        }
        let _ = timeout(Duration::from_secs(1), sender.close()).await;
    });

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => conn.handle_text(text.as_str()).await,
                Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => conn.handle_text(text).await,
                    Err(err) => debug!(%connection, %err, "ignoring non-utf8 binary frame"),
                },
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    debug!(%connection, %err, "socket read failed");
                    break;
                }
            },
            _ = &mut writer => break,
            _ = eviction.notified() => {
                warn!(%connection, "closing socket that fell behind");
                break;
            }
        }
    }

    conn.close().await;
    writer.abort();
    info!(%connection, "socket disconnected");
}
