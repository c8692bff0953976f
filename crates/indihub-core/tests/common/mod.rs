//! Shared test doubles: channel-backed tunnels standing in for the cloud
//! relay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use indihub_core::error::{AgentError, Result};
use indihub_core::protocol::{Request, Response, SoloSummary};
use indihub_core::tunnel::{SoloTunnel, Tunnel};
use tokio::sync::{mpsc, Mutex};

/// Test-side handle for driving a [`MockTunnel`].
pub struct MockTunnelHandle {
    pub req_tx: mpsc::UnboundedSender<Request>,
    pub resp_rx: mpsc::UnboundedReceiver<Response>,
}

/// In-memory tunnel: requests flow in from the test, responses flow back
/// out to it. Dropping `req_tx` looks like a clean EOF from the relay.
pub struct MockTunnel {
    req_rx: Mutex<mpsc::UnboundedReceiver<Request>>,
    resp_tx: mpsc::UnboundedSender<Response>,
    send_closed: AtomicBool,
}

pub fn mock_tunnel() -> (Arc<MockTunnel>, MockTunnelHandle) {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (resp_tx, resp_rx) = mpsc::unbounded_channel();
    (
        Arc::new(MockTunnel {
            req_rx: Mutex::new(req_rx),
            resp_tx,
            send_closed: AtomicBool::new(false),
        }),
        MockTunnelHandle { req_tx, resp_rx },
    )
}

impl MockTunnel {
    pub fn send_side_closed(&self) -> bool {
        self.send_closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tunnel for MockTunnel {
    async fn send(&self, resp: Response) -> Result<()> {
        self.resp_tx
            .send(resp)
            .map_err(|_| AgentError::Tunnel("mock receiver dropped".to_string()))
    }

    async fn recv(&self) -> Result<Option<Request>> {
        Ok(self.req_rx.lock().await.recv().await)
    }

    async fn close_send(&self) -> Result<()> {
        self.send_closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Publish-only tunnel double: counts the responses it swallows and hands
/// the count back as the session summary.
pub struct MockSoloTunnel {
    pub responses: Mutex<Vec<Response>>,
    notify: mpsc::UnboundedSender<Response>,
}

pub fn mock_solo_tunnel() -> (Arc<MockSoloTunnel>, mpsc::UnboundedReceiver<Response>) {
    let (notify, notify_rx) = mpsc::unbounded_channel();
    (
        Arc::new(MockSoloTunnel {
            responses: Mutex::new(Vec::new()),
            notify,
        }),
        notify_rx,
    )
}

#[async_trait]
impl SoloTunnel for MockSoloTunnel {
    async fn send(&self, resp: Response) -> Result<()> {
        self.responses.lock().await.push(resp.clone());
        let _ = self.notify.send(resp);
        Ok(())
    }

    async fn close_and_recv(&self) -> Result<SoloSummary> {
        let images_num = self.responses.lock().await.len() as u64;
        Ok(SoloSummary { images_num })
    }
}
