//! WebSocket bridge to the INDI-server
//!
//! Each upgraded WebSocket gets its own TCP connection to the local
//! INDI-server. Server chunks are reassembled into elements and pushed to
//! the browser as JSON text messages; inbound JSON messages are turned
//! back into XML and written to the socket. The bridge lives until either
//! direction fails or the agent shuts down.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use indihub_core::limits::MAX_LOCAL_READ;
use indihub_core::xml::XmlFlattener;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bridge one WebSocket to one fresh INDI-server connection.
pub async fn run(socket: WebSocket, indi_server_addr: String, shutdown: CancellationToken) {
    let conn = match TcpStream::connect(&indi_server_addr).await {
        Ok(conn) => conn,
        Err(err) => {
            warn!("bridge could not connect to INDI-server: {err}");
            return;
        }
    };
    let (mut tcp_read, mut tcp_write) = conn.into_split();
    let (mut ws_sink, mut ws_stream) = socket.split();

    // INDI-server to WebSocket, element by element
    let tcp_to_ws_shutdown = shutdown.clone();
    let tcp_to_ws = tokio::spawn(async move {
        let mut flattener = XmlFlattener::new();
        let mut buf = vec![0u8; MAX_LOCAL_READ];
        loop {
            let res = tokio::select! {
                _ = tcp_to_ws_shutdown.cancelled() => break,
                res = tcp_read.read(&mut buf) => res,
            };
            let n = match res {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for doc in flattener.xml_chunk_to_json(&buf[..n]) {
                let Ok(text) = String::from_utf8(doc) else {
                    continue;
                };
                if ws_sink.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
        }
        let _ = ws_sink.close().await;
    });

    // WebSocket to INDI-server
    let flattener = XmlFlattener::new();
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = ws_stream.next() => msg,
        };
        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                debug!("bridge websocket error: {err}");
                break;
            }
        };

        let xml = match flattener.json_to_xml(text.as_bytes()) {
            Ok(xml) => xml,
            Err(err) => {
                warn!("could not convert json '{text}' to xml: {err}");
                continue;
            }
        };
        if let Err(err) = tcp_write.write_all(&xml).await {
            warn!("bridge could not write to INDI-server: {err}");
            break;
        }
    }

    tcp_to_ws.abort();
}
