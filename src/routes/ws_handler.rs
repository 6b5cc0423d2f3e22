use axum::extract::ws::{Message, WebSocket};
use tracing::{error, info, warn};

use crate::state::app_state::AppState;

/// Each websocket message is one transport fragment, fed to the
/// reassembler in arrival order. The stream ends when the server shuts
/// down, before the open batch is flushed.
pub async fn handle_ws_fragments(mut socket: WebSocket, state: AppState) {
    info!("Fragment stream opened");
    let mut fragments: u64 = 0;

    loop {
        let message = tokio::select! {
            message = socket.recv() => match message {
                Some(Ok(m)) => m,
                Some(Err(e)) => {
                    warn!("Fragment stream receive failed: {}", e);
                    break;
                }
                None => break,
            },
            _ = state.shutdown.cancelled() => {
                info!("Closing fragment stream for shutdown");
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        };

        let result = match &message {
            Message::Binary(bytes) => state.ingest_fragment(bytes).await,
            Message::Text(text) => state.ingest_fragment(text.as_str().as_bytes()).await,
            Message::Close(_) => break,
            _ => continue,
        };
        fragments += 1;

        if let Err(e) = result {
            error!("Fragment ingest failed: {}", e);
        }
    }

    info!("Fragment stream closed after {} fragments", fragments);
}
