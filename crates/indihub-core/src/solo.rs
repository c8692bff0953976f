//! Solo-mode agent
//!
//! Passively watches the local INDI-server property stream, discovers
//! imaging devices from their `CCD_EXPOSURE` property definitions and
//! uploads their image frames to the cloud. BLOB traffic never travels on
//! the main connection: every discovered device gets its own sideband
//! connection with `enableBLOB Only`, while the main connection gets
//! `enableBLOB Never` for that device.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::limits::{MAX_LOCAL_READ, RESPONSE_QUEUE_SIZE};
use crate::protocol::{IndiElement, Response, SoloSummary};
use crate::tunnel::SoloTunnel;
use crate::xml::XmlFlattener;

const GET_PROPERTIES: &[u8] = b"<getProperties version='1.7'/>";

fn get_device_properties(device: &str) -> Vec<u8> {
    format!("<getProperties device='{device}' version='1.7'/>").into_bytes()
}

fn enable_blob_never(device: &str) -> Vec<u8> {
    format!("<enableBLOB device='{device}'>Never</enableBLOB>").into_bytes()
}

fn enable_blob_only(device: &str) -> Vec<u8> {
    format!("<enableBLOB device='{device}'>Only</enableBLOB>").into_bytes()
}

pub struct SoloAgent<T> {
    indi_server_addr: String,
    tunnel: Arc<T>,
    /// Discovered imaging devices, device name to sideband conn id.
    device_map: Mutex<HashMap<String, u32>>,
    cancel: CancellationToken,
}

impl<T: SoloTunnel + 'static> SoloAgent<T> {
    pub fn new(indi_server_addr: impl Into<String>, tunnel: Arc<T>) -> Self {
        Self {
            indi_server_addr: indi_server_addr.into(),
            tunnel,
            device_map: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Names of the devices currently owning a sideband.
    pub async fn devices(&self) -> Vec<String> {
        self.device_map.lock().await.keys().cloned().collect()
    }

    /// Run the agent until the main connection dies or [`SoloAgent::close`]
    /// is called, then collect the relay's session summary.
    pub async fn start(
        self: Arc<Self>,
        session_id: u64,
        session_token: String,
    ) -> Result<SoloSummary> {
        let mut main_conn = self.connect_to_indi().await.map_err(|err| {
            error!("could not connect to INDI-server in solo mode: {err}");
            err
        })?;

        let (resp_tx, resp_rx) = mpsc::channel(RESPONSE_QUEUE_SIZE);
        let sender = tokio::spawn(send_responses(self.tunnel.clone(), resp_rx));

        let mut buf = vec![0u8; MAX_LOCAL_READ];
        let mut flattener = XmlFlattener::new();
        let mut device_tasks = JoinSet::new();
        let mut conn_counter: u32 = 0;

        loop {
            let Some(res) = self.read_chunk(&mut main_conn, &mut buf).await else {
                break; // close() was called
            };

            let n = match res {
                Ok(0) => {
                    // main connection EOF: one redial, one follow-up read
                    main_conn = match self.connect_to_indi().await {
                        Ok(conn) => conn,
                        Err(err) => {
                            warn!("failed to re-connect to INDI-server in solo mode: {err}");
                            break;
                        }
                    };
                    match self.read_chunk(&mut main_conn, &mut buf).await {
                        None | Some(Ok(0)) => break,
                        Some(Ok(n)) => n,
                        Some(Err(err)) => {
                            warn!("could not read from INDI-server in solo mode: {err}");
                            break;
                        }
                    }
                }
                Ok(n) => n,
                Err(err) => {
                    warn!("could not read from INDI-server in solo mode: {err}");
                    break;
                }
            };

            for element in flattener.feed(&buf[..n]) {
                let IndiElement::DefNumberVector { device, name } =
                    IndiElement::classify(&element)
                else {
                    continue;
                };
                if name != "CCD_EXPOSURE" || device.is_empty() {
                    continue;
                }
                {
                    let mut devices = self.device_map.lock().await;
                    if devices.contains_key(&device) {
                        continue;
                    }
                    conn_counter += 1;
                    devices.insert(device.clone(), conn_counter);
                }
                info!("discovered imaging device {device}");

                // keep its BLOBs off the main connection
                if let Err(err) = main_conn.write_all(&enable_blob_never(&device)).await {
                    warn!("could not write to INDI-server in solo mode: {err}");
                }

                let agent = self.clone();
                let tx = resp_tx.clone();
                let token = session_token.clone();
                let conn_id = conn_counter;
                device_tasks.spawn(async move {
                    agent
                        .run_device(device, conn_id, session_id, token, tx)
                        .await;
                });
            }
        }

        self.cancel.cancel();
        while device_tasks.join_next().await.is_some() {}
        drop(resp_tx);
        let _ = sender.await;

        self.tunnel.close_and_recv().await
    }

    /// Stop the agent: sidebands and the main connection unblock and the
    /// read loop winds down.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Dial the main connection and subscribe to properties, with BLOBs
    /// disabled for every device already discovered.
    async fn connect_to_indi(&self) -> Result<TcpStream> {
        info!("connecting to INDI-server in solo mode...");
        let mut conn = TcpStream::connect(&self.indi_server_addr).await?;
        conn.write_all(GET_PROPERTIES).await?;
        for device in self.devices().await {
            if let Err(err) = conn.write_all(&enable_blob_never(&device)).await {
                warn!("could not write to INDI-server in solo mode: {err}");
            }
        }
        info!("...OK");
        Ok(conn)
    }

    /// Dial a sideband for one device: properties for that device only and
    /// nothing but BLOBs on the wire.
    async fn connect_to_device(&self, device: &str) -> Result<TcpStream> {
        info!("connecting to INDI-device: {device}");
        let mut conn = TcpStream::connect(&self.indi_server_addr).await?;
        conn.write_all(&get_device_properties(device)).await?;
        conn.write_all(&enable_blob_only(device)).await?;
        info!("...OK");
        Ok(conn)
    }

    /// Sideband reader: forwards every chunk as a response labelled with
    /// the device's own conn id. EOF gets one redial and one follow-up
    /// read; anything else ends the task.
    async fn run_device(
        self: Arc<Self>,
        device: String,
        conn_id: u32,
        session_id: u64,
        session_token: String,
        resp_tx: mpsc::Sender<Response>,
    ) {
        let mut conn = match self.connect_to_device(&device).await {
            Ok(conn) => conn,
            Err(err) => {
                warn!("could not connect to INDI-server for device {device}: {err}");
                return;
            }
        };

        let mut buf = vec![0u8; MAX_LOCAL_READ];
        loop {
            let Some(res) = self.read_chunk(&mut conn, &mut buf).await else {
                break;
            };

            let n = match res {
                Ok(0) => {
                    conn = match self.connect_to_device(&device).await {
                        Ok(conn) => conn,
                        Err(err) => {
                            warn!("failed to re-connect to INDI-server for {device}: {err}");
                            break;
                        }
                    };
                    match self.read_chunk(&mut conn, &mut buf).await {
                        None | Some(Ok(0)) => break,
                        Some(Ok(n)) => n,
                        Some(Err(err)) => {
                            warn!("could not read from INDI-server for {device}: {err}");
                            break;
                        }
                    }
                }
                Ok(n) => n,
                Err(err) => {
                    warn!("could not read from INDI-server for {device}: {err}");
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
                break;
            }
        }
    }

    /// Read one chunk, unblocking when the agent is closed.
    async fn read_chunk(
        &self,
        conn: &mut TcpStream,
        buf: &mut [u8],
    ) -> Option<std::io::Result<usize>> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            res = conn.read(buf) => Some(res),
        }
    }
}

async fn send_responses<T: SoloTunnel>(tunnel: Arc<T>, mut rx: mpsc::Receiver<Response>) {
    while let Some(resp) = rx.recv().await {
        if let Err(err) = tunnel.send(resp).await {
            warn!("failed to send a response to tunnel in solo mode: {err}");
        }
    }
}
