use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::api::{self, ApiState};
use crate::error::DbResult;

/// End of transmission: terminates each message.
const END_OF_MESSAGE: u8 = 0x04;
/// Record separator: splits rid, target and payload within a message.
const MSG_DELIMITER: char = '\x1e';

/// Accept loop. One reader task per connection; each frame is handled in
/// its own task and responses are serialized through the connection's
/// writer mutex, so concurrent responses never interleave.
pub async fn serve(state: ApiState, port: &str) -> DbResult<()> {
    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!("server started on port {}", port);

    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    state.connections.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("new connection: {}", addr);
                    if let Err(e) = handle_connection(state.clone(), socket).await {
                        tracing::debug!("connection {} closed: {}", addr, e);
                    }
                    state.connections.fetch_sub(1, Ordering::Relaxed);
                });
            }
            Err(e) => {
                tracing::error!("failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_connection(state: ApiState, socket: TcpStream) -> DbResult<()> {
    let (reader, writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));

    loop {
        let mut frame = Vec::new();
        let n = reader.read_until(END_OF_MESSAGE, &mut frame).await?;
        if n == 0 {
            // Clean EOF; no half-close handshake.
            return Ok(());
        }
        if frame.last() == Some(&END_OF_MESSAGE) {
            frame.pop();
        }

        let message = String::from_utf8_lossy(&frame).into_owned();
        let state = state.clone();
        let writer = writer.clone();
        tokio::spawn(async move {
            handle_frame(state, writer, message).await;
        });
    }
}

async fn handle_frame(state: ApiState, writer: Arc<Mutex<OwnedWriteHalf>>, message: String) {
    let mut fields = message.splitn(3, MSG_DELIMITER);
    let (rid, target, payload) = match (fields.next(), fields.next(), fields.next()) {
        (Some(rid), Some(target), Some(payload)) => {
            (rid.to_string(), target.to_string(), payload.to_string())
        }
        _ => {
            tracing::warn!("invalid message format: {}", message);
            let body = format!(
                "{{\"error\":\"invalid message format, expected: RID{}target{}data\",\"data\":null}}",
                MSG_DELIMITER, MSG_DELIMITER
            );
            write_frame(&writer, body).await;
            return;
        }
    };

    tracing::debug!("request {} -> {}", rid, target);
    let response = api::handle_request(state, target.clone(), payload).await;

    // Echo rid and target so clients can correlate out-of-order replies.
    let frame = format!("{}{}{}{}{}", rid, MSG_DELIMITER, target, MSG_DELIMITER, response);
    write_frame(&writer, frame).await;
}

async fn write_frame(writer: &Arc<Mutex<OwnedWriteHalf>>, mut frame: String) {
    frame.push(END_OF_MESSAGE as char);
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write_all(frame.as_bytes()).await {
        tracing::warn!("write failed: {}", e);
    }
}
