//! Cloud relay tunnels
//!
//! A tunnel is one bidirectional stream to the indihub.space relay over
//! which many logical guest connections are multiplexed. Frames are JSON
//! text messages over WebSocket with base64 payloads, optionally gzipped.
//! Registration is a plain HTTPS call made before any tunnel opens.
//!
//! `send` and `recv` are each driven by a single task (the response sender
//! and the proxy main loop); the sink and stream halves serialize access
//! internally so `close_send` may race either of them safely.

use std::io::{Read, Write};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use crate::error::{AgentError, Result};
use crate::limits::RELAY_MAX_FRAME;
use crate::protocol::{HostInfo, RegisterInfo, Request, Response, SoloSummary};

/// Default relay endpoint (TLS).
pub const RELAY_ADDR: &str = "relay.indihub.io:7668";
/// Relay endpoint used in dev mode (plaintext).
pub const RELAY_ADDR_DEV: &str = "localhost:7667";

/// A bidirectional stream to the relay.
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Send one response frame. Serialized internally.
    async fn send(&self, resp: Response) -> Result<()>;

    /// Receive the next request frame. `Ok(None)` is a clean EOF.
    async fn recv(&self) -> Result<Option<Request>>;

    /// Half-close the outbound direction.
    async fn close_send(&self) -> Result<()>;
}

/// The publish-only stream used by solo mode.
#[async_trait]
pub trait SoloTunnel: Send + Sync {
    async fn send(&self, resp: Response) -> Result<()>;

    /// Close the upload direction and wait for the relay's session summary.
    async fn close_and_recv(&self) -> Result<SoloSummary>;
}

/// Wire frames exchanged with the relay.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RelayFrame {
    Request {
        conn: u32,
        #[serde(default)]
        data: String,
        #[serde(default)]
        closed: bool,
    },
    Response {
        conn: u32,
        data: String,
        session_id: u64,
        session_token: String,
    },
    Summary {
        images_num: u64,
    },
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket-backed tunnel. Implements both the duplex [`Tunnel`] and the
/// publish-only [`SoloTunnel`] contracts.
pub struct WsTunnel {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    compress: bool,
}

impl WsTunnel {
    fn new(ws: WsStream, compress: bool) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            compress,
        }
    }

    async fn send_frame(&self, frame: &RelayFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }
}

#[async_trait]
impl Tunnel for WsTunnel {
    async fn send(&self, resp: Response) -> Result<()> {
        let frame = RelayFrame::Response {
            conn: resp.conn,
            data: encode_payload(&resp.data, self.compress)?,
            session_id: resp.session_id,
            session_token: resp.session_token,
        };
        self.send_frame(&frame).await
    }

    async fn recv(&self) -> Result<Option<Request>> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                None => return Ok(None),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<RelayFrame>(&text) {
                        Ok(RelayFrame::Request { conn, data, closed }) => {
                            let data = match decode_payload(&data, self.compress) {
                                Ok(data) => data,
                                Err(err) => {
                                    warn!("dropping undecodable relay frame: {err}");
                                    continue;
                                }
                            };
                            return Ok(Some(Request { conn, data, closed }));
                        }
                        Ok(_) => continue,
                        Err(err) => {
                            warn!("dropping unparsable relay frame: {err}");
                            continue;
                        }
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }

    async fn close_send(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        match sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl SoloTunnel for WsTunnel {
    async fn send(&self, resp: Response) -> Result<()> {
        Tunnel::send(self, resp).await
    }

    async fn close_and_recv(&self) -> Result<SoloSummary> {
        Tunnel::close_send(self).await?;
        let mut stream = self.stream.lock().await;
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Ok(RelayFrame::Summary { images_num }) =
                        serde_json::from_str::<RelayFrame>(&text)
                    {
                        return Ok(SoloSummary { images_num });
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(AgentError::TunnelClosed)
    }
}

/// How to reach the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub addr: String,
    /// Plaintext transport and the dev relay endpoint.
    pub dev: bool,
    /// Gzip frame payloads in both directions.
    pub compress: bool,
}

impl RelayConfig {
    pub fn new(dev: bool, compress: bool) -> Self {
        let addr = if dev { RELAY_ADDR_DEV } else { RELAY_ADDR };
        Self {
            addr: addr.to_string(),
            dev,
            compress,
        }
    }

    fn http_base(&self) -> String {
        let scheme = if self.dev { "http" } else { "https" };
        format!("{scheme}://{}", self.addr)
    }

    fn ws_base(&self) -> String {
        let scheme = if self.dev { "ws" } else { "wss" };
        format!("{scheme}://{}", self.addr)
    }
}

/// Client for the indihub.space relay: registration plus one tunnel per
/// service.
pub struct RelayClient {
    http: reqwest::Client,
    config: RelayConfig,
}

impl RelayClient {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Register this host and obtain session identifiers.
    pub async fn register_host(&self, host: &HostInfo) -> Result<RegisterInfo> {
        let resp = self
            .http
            .post(format!("{}/api/host/register", self.config.http_base()))
            .json(host)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AgentError::Registration(format!(
                "relay replied with status {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    /// Tunnel carrying guest INDI traffic in share and robotic modes.
    pub async fn indi_server(&self, reg: &RegisterInfo) -> Result<WsTunnel> {
        self.open_tunnel("indiserver", reg).await
    }

    /// Tunnel carrying guest PHD2 traffic.
    pub async fn phd2_server(&self, reg: &RegisterInfo) -> Result<WsTunnel> {
        self.open_tunnel("phd2server", reg).await
    }

    /// Publish-only tunnel for solo mode image uploads.
    pub async fn solo_mode(&self, reg: &RegisterInfo) -> Result<WsTunnel> {
        self.open_tunnel("solo", reg).await
    }

    /// Tunnel receiving the broadcast tee.
    pub async fn broadcast(&self, reg: &RegisterInfo) -> Result<WsTunnel> {
        self.open_tunnel("broadcast", reg).await
    }

    async fn open_tunnel(&self, service: &str, reg: &RegisterInfo) -> Result<WsTunnel> {
        let url = format!(
            "{}/tunnel/{service}?session_id={}&token={}&compress={}",
            self.config.ws_base(),
            reg.session_id,
            reg.token,
            self.config.compress,
        );
        info!("opening {service} tunnel to {}", self.config.addr);
        let ws_config = WebSocketConfig {
            max_message_size: Some(RELAY_MAX_FRAME),
            max_frame_size: Some(RELAY_MAX_FRAME),
            ..Default::default()
        };
        let (ws, _) = connect_async_with_config(url, Some(ws_config), false).await?;
        Ok(WsTunnel::new(ws, self.config.compress))
    }
}

fn encode_payload(data: &[u8], compress: bool) -> Result<String> {
    if !compress {
        return Ok(BASE64.encode(data));
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(AgentError::Io)?;
    let gz = encoder.finish().map_err(AgentError::Io)?;
    Ok(BASE64.encode(gz))
}

fn decode_payload(data: &str, compress: bool) -> Result<Vec<u8>> {
    let raw = BASE64
        .decode(data)
        .map_err(|err| AgentError::Tunnel(format!("bad base64 payload: {err}")))?;
    if !compress {
        return Ok(raw);
    }
    let mut decoder = GzDecoder::new(raw.as_slice());
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(AgentError::Io)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trip_plain() {
        let data = b"<getProperties version='1.7'/>";
        let encoded = encode_payload(data, false).unwrap();
        assert_eq!(decode_payload(&encoded, false).unwrap(), data);
    }

    #[test]
    fn test_payload_round_trip_gzip() {
        let data = vec![0x42u8; 8192];
        let encoded = encode_payload(&data, true).unwrap();
        // gzip actually shrinks the run of identical bytes
        assert!(encoded.len() < data.len());
        assert_eq!(decode_payload(&encoded, true).unwrap(), data);
    }

    #[test]
    fn test_bad_base64_is_an_error() {
        assert!(decode_payload("@@not-base64@@", false).is_err());
    }

    #[test]
    fn test_frame_serde() {
        let json = r#"{"type":"request","conn":3,"data":"","closed":true}"#;
        let frame: RelayFrame = serde_json::from_str(json).unwrap();
        match frame {
            RelayFrame::Request { conn, closed, .. } => {
                assert_eq!(conn, 3);
                assert!(closed);
            }
            _ => panic!("wrong frame variant"),
        }

        let frame = RelayFrame::Response {
            conn: 1,
            data: "QUJD".to_string(),
            session_id: 7,
            session_token: "tok".to_string(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"response\""));
        assert!(json.contains("\"session_id\":7"));
    }

    #[tokio::test]
    async fn test_ws_tunnel_loopback() {
        use tokio_tungstenite::accept_async;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // relay side: send one request, echo back the first response frame
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let frame = RelayFrame::Request {
                conn: 1,
                data: BASE64.encode(b"<a/>"),
                closed: false,
            };
            ws.send(Message::Text(serde_json::to_string(&frame).unwrap()))
                .await
                .unwrap();

            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => serde_json::from_str::<RelayFrame>(&text).unwrap(),
                other => panic!("unexpected message {other:?}"),
            }
        });

        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        let tunnel = WsTunnel::new(ws, false);

        let req = Tunnel::recv(&tunnel).await.unwrap().unwrap();
        assert_eq!(req.conn, 1);
        assert_eq!(req.data, b"<a/>");
        assert!(!req.closed);

        Tunnel::send(
            &tunnel,
            Response {
                conn: 1,
                data: b"<b/>".to_vec(),
                session_id: 9,
                session_token: "tok".to_string(),
            },
        )
        .await
        .unwrap();

        match server.await.unwrap() {
            RelayFrame::Response {
                conn,
                data,
                session_id,
                session_token,
            } => {
                assert_eq!(conn, 1);
                assert_eq!(BASE64.decode(data).unwrap(), b"<b/>");
                assert_eq!(session_id, 9);
                assert_eq!(session_token, "tok");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
