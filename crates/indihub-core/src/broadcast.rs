//! Broadcast-mode proxy
//!
//! Guests connect straight to a local listener and talk to the INDI-server
//! through it; a copy of every byte in both directions goes to the cloud
//! so the relay can mirror the session. The guests' `<getProperties`
//! frames travel in that copy, which is how the relay correlates guest
//! sessions with the numbered connections.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::limits::MAX_LOCAL_READ;
use crate::protocol::Response;
use crate::proxy::PublicServerAddr;
use crate::tunnel::Tunnel;

pub struct BroadcastProxy<T> {
    name: String,
    addr: String,
    tunnel: Arc<T>,
    cancel: CancellationToken,
}

impl<T: Tunnel + 'static> BroadcastProxy<T> {
    /// `addr` is the local INDI-server the guests end up talking to.
    pub fn new(name: impl Into<String>, addr: impl Into<String>, tunnel: Arc<T>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            tunnel,
            cancel: CancellationToken::new(),
        }
    }

    /// Listen on `listen_addr` and serve guests until closed. The first
    /// tunnel frame carries the public broadcast address, handed out on
    /// `pub_addr_tx`.
    pub async fn start(
        self: Arc<Self>,
        pub_addr_tx: mpsc::Sender<PublicServerAddr>,
        session_id: u64,
        session_token: String,
        listen_addr: String,
    ) {
        info!(
            "starting INDI-server for INDIHUB in broadcast mode on {listen_addr}..."
        );
        let listener = match TcpListener::bind(&listen_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!("could not start INDI-server in broadcast mode: {err}");
                return;
            }
        };
        info!("...OK");

        match self.tunnel.recv().await {
            Ok(Some(req)) => {
                let addr = PublicServerAddr {
                    name: self.name.clone(),
                    addr: String::from_utf8_lossy(&req.data).into_owned(),
                };
                let _ = pub_addr_tx.send(addr).await;
            }
            Ok(None) => {
                info!("exiting, got EOF from {} tunnel", self.name);
                return;
            }
            Err(err) => {
                error!("exiting, failed to receive from {} tunnel: {err}", self.name);
                return;
            }
        }

        let mut conn_cnt: u32 = 0;
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (guest, peer) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("{} accept error: {err}", self.name);
                    break;
                }
            };

            let server = match TcpStream::connect(&self.addr).await {
                Ok(server) => server,
                Err(err) => {
                    warn!("{} could not connect to INDI-server: {err}", self.name);
                    continue; // guest socket drops here
                }
            };

            conn_cnt += 1;
            info!("guest {peer} connected to {} as connection {conn_cnt}", self.name);

            let (guest_read, guest_write) = guest.into_split();
            let (server_read, server_write) = server.into_split();
            let pair_cancel = self.cancel.child_token();

            tokio::spawn(copy_requests(
                self.clone(),
                guest_read,
                server_write,
                conn_cnt,
                session_id,
                session_token.clone(),
                pair_cancel.clone(),
            ));
            tokio::spawn(copy_responses(
                self.clone(),
                server_read,
                guest_write,
                conn_cnt,
                session_id,
                session_token.clone(),
                pair_cancel,
            ));
        }
    }

    /// Stop accepting and tear every guest pair down. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Err(err) = self.tunnel.close_send().await {
            warn!("closing {} tunnel send side: {err}", self.name);
        }
    }

    async fn tee(&self, conn: u32, data: &[u8], session_id: u64, session_token: &str) {
        let resp = Response {
            conn,
            data: data.to_vec(),
            session_id,
            session_token: session_token.to_string(),
        };
        if let Err(err) = self.tunnel.send(resp).await {
            warn!("failed to broadcast to {} tunnel: {err}", self.name);
        }
    }
}

/// Guest to server copy; every chunk is also sent to the cloud.
async fn copy_requests<T: Tunnel + 'static>(
    proxy: Arc<BroadcastProxy<T>>,
    mut guest_read: OwnedReadHalf,
    mut server_write: OwnedWriteHalf,
    conn: u32,
    session_id: u64,
    session_token: String,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_LOCAL_READ];
    loop {
        let res = tokio::select! {
            _ = cancel.cancelled() => break,
            res = guest_read.read(&mut buf) => res,
        };
        let n = match res {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!("could not read from INDI-client: {err}");
                break;
            }
        };

        proxy.tee(conn, &buf[..n], session_id, &session_token).await;

        if let Err(err) = server_write.write_all(&buf[..n]).await {
            warn!("could not write to INDI-server: {err}");
            break;
        }
    }
    cancel.cancel(); // take the other direction down too
}

/// Server to guest copy; every chunk is also sent to the cloud.
async fn copy_responses<T: Tunnel + 'static>(
    proxy: Arc<BroadcastProxy<T>>,
    mut server_read: OwnedReadHalf,
    mut guest_write: OwnedWriteHalf,
    conn: u32,
    session_id: u64,
    session_token: String,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_LOCAL_READ];
    loop {
        let res = tokio::select! {
            _ = cancel.cancelled() => break,
            res = server_read.read(&mut buf) => res,
        };
        let n = match res {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!("could not read from INDI-server: {err}");
                break;
            }
        };

        if let Err(err) = guest_write.write_all(&buf[..n]).await {
            warn!("could not write to INDI-client: {err}");
            break;
        }

        proxy.tee(conn, &buf[..n], session_id, &session_token).await;
    }
    cancel.cancel();
}
