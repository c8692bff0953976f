//! Share-mode TCP proxy
//!
//! One proxy binds one local TCP service (the INDI-server or PHD2) to one
//! cloud tunnel and multiplexes any number of guest connections over it.
//! Each guest is a numbered channel: cloud chunks are reassembled into
//! whole elements per channel, filtered, and written to that channel's own
//! local connection; local replies flow back through a single bounded
//! queue drained by one sender task.
//!
//! Local sockets come and go independently of the tunnel: a dial failure
//! or EOF gets exactly one immediate reconnect before the operation gives
//! up for that round.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::filter::IndiFilter;
use crate::limits::{MAX_LOCAL_READ, RECONNECT_PAUSE, RESPONSE_QUEUE_SIZE};
use crate::protocol::Response;
use crate::tunnel::Tunnel;
use crate::xml::XmlFlattener;

/// One local TCP connection owned by a channel. The read half belongs to
/// the channel's reader task, the write half to the proxy main loop; the
/// token unblocks a pending read when the channel is torn down.
struct LocalConn {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    cancel: CancellationToken,
}

impl LocalConn {
    fn new(stream: TcpStream, cancel: CancellationToken) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            cancel,
        }
    }
}

/// A public endpoint the cloud assigned to a proxied service.
#[derive(Debug, Clone, Serialize)]
pub struct PublicServerAddr {
    pub name: String,
    pub addr: String,
}

pub struct TcpProxy<T> {
    name: String,
    addr: String,
    tunnel: Arc<T>,
    conn_map: Mutex<HashMap<u32, Arc<LocalConn>>>,
    filter: Option<IndiFilter>,
    cancel: CancellationToken,
}

impl<T: Tunnel + 'static> TcpProxy<T> {
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        tunnel: Arc<T>,
        filter: Option<IndiFilter>,
    ) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            tunnel,
            conn_map: Mutex::new(HashMap::new()),
            filter,
            cancel: CancellationToken::new(),
        }
    }

    /// Number of currently open guest channels.
    pub async fn open_channels(&self) -> usize {
        self.conn_map.lock().await.len()
    }

    /// Run the proxy until the tunnel ends or [`TcpProxy::close`] is called.
    ///
    /// The first frame on the tunnel carries the public endpoint the cloud
    /// assigned; it is handed out on `pub_addr_tx` before any traffic flows.
    pub async fn start(
        self: Arc<Self>,
        pub_addr_tx: mpsc::Sender<PublicServerAddr>,
        session_id: u64,
        session_token: String,
    ) {
        let (resp_tx, resp_rx) = mpsc::channel(RESPONSE_QUEUE_SIZE);
        let sender = tokio::spawn(send_responses(
            self.tunnel.clone(),
            resp_rx,
            self.name.clone(),
        ));

        let mut addr_received = false;
        let mut flatteners: HashMap<u32, XmlFlattener> = HashMap::new();

        loop {
            let req = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = self.tunnel.recv() => match res {
                    Ok(Some(req)) => req,
                    Ok(None) => {
                        info!("exiting, got EOF from {} tunnel", self.name);
                        break;
                    }
                    Err(err) => {
                        error!("exiting, failed to receive from {} tunnel: {err}", self.name);
                        break;
                    }
                },
            };

            // the first conn-0 frame is the public address, later ones are noise
            if req.conn == 0 {
                if !addr_received {
                    addr_received = true;
                    let addr = PublicServerAddr {
                        name: self.name.clone(),
                        addr: String::from_utf8_lossy(&req.data).into_owned(),
                    };
                    if pub_addr_tx.send(addr).await.is_err() {
                        debug!("public address receiver dropped");
                    }
                }
                continue;
            }

            let mut elements = flatteners.entry(req.conn).or_default().feed(&req.data);
            if let Some(filter) = &self.filter {
                elements = filter.filter_incoming(elements);
            }

            let (conn, is_new) = match self.connect(req.conn).await {
                Ok(pair) => pair,
                Err(_) => match self.reconnect(req.conn).await {
                    Ok(conn) => (conn, true),
                    Err(err) => {
                        warn!("failed to reach local {}: {err}", self.name);
                        tokio::time::sleep(RECONNECT_PAUSE).await;
                        continue;
                    }
                },
            };

            if req.closed {
                info!(
                    "guest closed connection {} to the cloud, closing it to local {} too",
                    req.conn, self.name
                );
                self.close_conn(req.conn).await;
                flatteners.remove(&req.conn);
                continue;
            }

            if is_new {
                let proxy = self.clone();
                let reader_conn = conn.clone();
                let tx = resp_tx.clone();
                let token = session_token.clone();
                let conn_id = req.conn;
                tokio::spawn(async move {
                    proxy
                        .run_reader(reader_conn, conn_id, session_id, token, tx)
                        .await;
                });
            }

            self.write_elements(conn, req.conn, &elements).await;
        }

        // tear down channels so reader tasks drain and the sender can finish
        self.close().await;
        drop(resp_tx);
        let _ = sender.await;
    }

    /// Close every channel and half-close the tunnel. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        let drained: Vec<_> = {
            let mut map = self.conn_map.lock().await;
            map.drain().collect()
        };
        for (_, conn) in drained {
            conn.cancel.cancel();
        }
        if let Err(err) = self.tunnel.close_send().await {
            debug!("closing {} tunnel send side: {err}", self.name);
        }
    }

    /// Look up the channel's local connection, dialing one when absent.
    /// I/O happens outside the map lock.
    async fn connect(&self, conn_id: u32) -> Result<(Arc<LocalConn>, bool)> {
        if let Some(conn) = self.conn_map.lock().await.get(&conn_id) {
            return Ok((conn.clone(), false));
        }

        info!("connecting to local {} on {}", self.name, self.addr);
        let stream = TcpStream::connect(&self.addr).await?;
        let conn = Arc::new(LocalConn::new(stream, self.cancel.child_token()));
        self.conn_map.lock().await.insert(conn_id, conn.clone());
        Ok((conn, true))
    }

    /// Dial a fresh local connection for the channel, replacing any stale
    /// map entry. The displaced connection is left to its owner task.
    async fn reconnect(&self, conn_id: u32) -> Result<Arc<LocalConn>> {
        info!("re-connecting to local {} on {}", self.name, self.addr);
        let stream = TcpStream::connect(&self.addr).await?;
        let conn = Arc::new(LocalConn::new(stream, self.cancel.child_token()));
        self.conn_map.lock().await.insert(conn_id, conn.clone());
        Ok(conn)
    }

    async fn close_conn(&self, conn_id: u32) {
        if let Some(conn) = self.conn_map.lock().await.remove(&conn_id) {
            conn.cancel.cancel();
        }
    }

    /// Write a batch sequentially; a failed write gets one reconnect and
    /// one retry of the same element before the batch is abandoned.
    async fn write_elements(&self, conn: Arc<LocalConn>, conn_id: u32, elements: &[Vec<u8>]) {
        let mut conn = conn;
        for element in elements {
            if write_element(&conn, element).await.is_ok() {
                continue;
            }
            match self.reconnect(conn_id).await {
                Ok(fresh) => {
                    conn = fresh;
                    if let Err(err) = write_element(&conn, element).await {
                        warn!("failed to send a request to {}: {err}", self.name);
                        tokio::time::sleep(RECONNECT_PAUSE).await;
                        return;
                    }
                }
                Err(err) => {
                    warn!("failed to send a request to {}: {err}", self.name);
                    tokio::time::sleep(RECONNECT_PAUSE).await;
                    return;
                }
            }
        }
    }

    /// Per-channel reader: local socket to response queue. EOF gets one
    /// reconnect and one follow-up read; anything else ends the task.
    async fn run_reader(
        self: Arc<Self>,
        mut conn: Arc<LocalConn>,
        conn_id: u32,
        session_id: u64,
        session_token: String,
        resp_tx: mpsc::Sender<Response>,
    ) {
        let mut buf = vec![0u8; MAX_LOCAL_READ];
        loop {
            let Some(res) = read_chunk(&conn, &mut buf).await else {
                break; // channel torn down
            };

            let n = match res {
                Ok(0) => {
                    let fresh = match self.reconnect(conn_id).await {
                        Ok(fresh) => fresh,
                        Err(err) => {
                            warn!("failed to re-connect to {}: {err}", self.name);
                            break;
                        }
                    };
                    conn = fresh;
                    match read_chunk(&conn, &mut buf).await {
                        None | Some(Ok(0)) => break,
                        Some(Ok(n)) => n,
                        Some(Err(err)) => {
                            warn!("failed to receive a response from {}: {err}", self.name);
                            break;
                        }
                    }
                }
                Ok(n) => n,
                Err(err) => {
                    warn!("failed to receive a response from {}: {err}", self.name);
                    break;
                }
            };

            let resp = Response {
                conn: conn_id,
                data: buf[..n].to_vec(),
                session_id,
                session_token: session_token.clone(),
            };
            if resp_tx.send(resp).await.is_err() {
                break; // proxy shut down
            }
        }
    }
}

/// Read into `buf`, unblocking when the channel is cancelled.
async fn read_chunk(conn: &LocalConn, buf: &mut [u8]) -> Option<std::io::Result<usize>> {
    tokio::select! {
        _ = conn.cancel.cancelled() => None,
        res = async { conn.reader.lock().await.read(buf).await } => Some(res),
    }
}

async fn write_element(conn: &LocalConn, element: &[u8]) -> std::io::Result<()> {
    let mut writer = conn.writer.lock().await;
    writer.write_all(element).await
}

/// Single drain of the response queue; the only caller of `tunnel.send`.
async fn send_responses<T: Tunnel>(tunnel: Arc<T>, mut rx: mpsc::Receiver<Response>, name: String) {
    while let Some(resp) = rx.recv().await {
        if let Err(err) = tunnel.send(resp).await {
            warn!("failed to send a response to {name} tunnel: {err}");
        }
    }
}
