//! Agent modes and their supervisor
//!
//! Each operating mode wraps one of the core pipelines behind a uniform
//! start/stop/status lifecycle. The supervisor owns the mode set, tracks
//! which one is active and serializes transitions; the control API calls
//! into it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indihub_core::broadcast::BroadcastProxy;
use indihub_core::error::{AgentError, Result};
use indihub_core::filter::{FilterConfig, IndiFilter};
use indihub_core::limits::MODE_SETTLE;
use indihub_core::protocol::RegisterInfo;
use indihub_core::proxy::{PublicServerAddr, TcpProxy};
use indihub_core::solo::SoloAgent;
use indihub_core::tunnel::{RelayClient, WsTunnel};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::banner;

pub const MODE_SOLO: &str = "solo";
pub const MODE_SHARE: &str = "share";
pub const MODE_ROBOTIC: &str = "robotic";
pub const MODE_BROADCAST: &str = "broadcast";

/// How long a freshly started proxy gets to learn its public address.
const ADDR_WAIT: Duration = Duration::from_secs(10);

/// Uniform lifecycle every agent mode implements.
///
/// `start` returns once the mode's background tasks are up; the work
/// itself keeps running until `stop`. Status is advisory.
#[async_trait]
pub trait AgentMode: Send + Sync {
    async fn start(&self);
    async fn stop(&self);
    async fn status(&self) -> Value;
}

// ---------------------------------------------------------------------------
// share / robotic
// ---------------------------------------------------------------------------

pub struct ShareMode {
    relay: Arc<RelayClient>,
    reg: RegisterInfo,
    indi_server_addr: String,
    phd2_server_addr: Option<String>,
    robotic: bool,
    filter_config: FilterConfig,
    state: Mutex<ShareState>,
}

#[derive(Default)]
struct ShareState {
    proxies: Vec<Arc<TcpProxy<WsTunnel>>>,
    addr_data: Vec<PublicServerAddr>,
    status: String,
}

impl ShareMode {
    pub fn new(
        relay: Arc<RelayClient>,
        reg: RegisterInfo,
        indi_server_addr: String,
        phd2_server_addr: Option<String>,
        robotic: bool,
        filter_config: FilterConfig,
    ) -> Self {
        Self {
            relay,
            reg,
            indi_server_addr,
            phd2_server_addr,
            robotic,
            filter_config,
            state: Mutex::new(ShareState::default()),
        }
    }
}

#[async_trait]
impl AgentMode for ShareMode {
    async fn start(&self) {
        let mut state = self.state.lock().await;
        if self.robotic {
            info!("your session is in robotic mode, equipment is driven by INDIHUB");
        }

        info!("starting INDI-Server in the cloud...");
        let tunnel = match self.relay.indi_server(&self.reg).await {
            Ok(tunnel) => Arc::new(tunnel),
            Err(err) => {
                error!("could not open INDI-Server tunnel: {err}");
                state.status = "error".to_string();
                return;
            }
        };
        info!("...OK");

        let filter = IndiFilter::new(self.filter_config.clone());
        let (pub_tx, mut pub_rx) = mpsc::channel(3);
        let mut expected_addrs = 1;

        let indi_proxy = Arc::new(TcpProxy::new(
            "INDI-Server",
            self.indi_server_addr.clone(),
            tunnel,
            Some(filter),
        ));
        tokio::spawn(indi_proxy.clone().start(
            pub_tx.clone(),
            self.reg.session_id,
            self.reg.session_id_public.clone(),
        ));
        state.proxies.push(indi_proxy);

        if let Some(phd2_addr) = &self.phd2_server_addr {
            info!("starting PHD2-Server in the cloud...");
            match self.relay.phd2_server(&self.reg).await {
                Ok(tunnel) => {
                    info!("...OK");
                    let phd2_proxy = Arc::new(TcpProxy::new(
                        "PHD2-Server",
                        phd2_addr.clone(),
                        Arc::new(tunnel),
                        None,
                    ));
                    tokio::spawn(phd2_proxy.clone().start(
                        pub_tx.clone(),
                        self.reg.session_id,
                        self.reg.session_id_public.clone(),
                    ));
                    state.proxies.push(phd2_proxy);
                    expected_addrs = 2;
                }
                Err(err) => error!("could not open PHD2-Server tunnel: {err}"),
            }
        }
        drop(pub_tx);

        for _ in 0..expected_addrs {
            match timeout(ADDR_WAIT, pub_rx.recv()).await {
                Ok(Some(addr)) => state.addr_data.push(addr),
                Ok(None) | Err(_) => {
                    warn!("public address was not announced in time");
                    break;
                }
            }
        }

        if self.robotic {
            banner::robotic_session_started();
        } else {
            banner::public_address_list(&state.addr_data);
        }
        state.status = "running".to_string();
    }

    async fn stop(&self) {
        let mut state = self.state.lock().await;
        let mode = if self.robotic { MODE_ROBOTIC } else { MODE_SHARE };
        info!("closing {mode} session");
        for proxy in state.proxies.drain(..) {
            proxy.close().await;
        }
        banner::session_finished(&state.addr_data, self.robotic);
        state.addr_data.clear();
        state.status = "stopped".to_string();
    }

    async fn status(&self) -> Value {
        let state = self.state.lock().await;
        json!({
            "status": state.status,
            "publicEndpoints": state.addr_data,
        })
    }
}

// ---------------------------------------------------------------------------
// solo
// ---------------------------------------------------------------------------

pub struct SoloMode {
    relay: Arc<RelayClient>,
    reg: RegisterInfo,
    indi_server_addr: String,
    state: Mutex<SoloState>,
}

#[derive(Default)]
struct SoloState {
    agent: Option<Arc<SoloAgent<WsTunnel>>>,
    status: String,
}

impl SoloMode {
    pub fn new(relay: Arc<RelayClient>, reg: RegisterInfo, indi_server_addr: String) -> Self {
        Self {
            relay,
            reg,
            indi_server_addr,
            state: Mutex::new(SoloState::default()),
        }
    }
}

#[async_trait]
impl AgentMode for SoloMode {
    async fn start(&self) {
        let mut state = self.state.lock().await;
        info!("your session is in solo mode, equipment sharing is not available");
        info!("starting INDIHUB agent in solo mode!");

        let tunnel = match self.relay.solo_mode(&self.reg).await {
            Ok(tunnel) => Arc::new(tunnel),
            Err(err) => {
                error!("could not start agent in solo mode: {err}");
                state.status = "error".to_string();
                return;
            }
        };

        let agent = Arc::new(SoloAgent::new(self.indi_server_addr.clone(), tunnel));
        state.agent = Some(agent.clone());

        let session_id = self.reg.session_id;
        let session_token = self.reg.session_id_public.clone();
        tokio::spawn(async move {
            match agent.start(session_id, session_token).await {
                Ok(summary) => banner::solo_session_finished(summary.images_num),
                Err(err) => warn!("solo session ended: {err}"),
            }
        });
        state.status = "running".to_string();
    }

    async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(agent) = state.agent.take() {
            info!("closing INDIHUB solo session");
            agent.close();
        }
        state.status = "stopped".to_string();
    }

    async fn status(&self) -> Value {
        let state = self.state.lock().await;
        json!({ "status": state.status })
    }
}

// ---------------------------------------------------------------------------
// broadcast
// ---------------------------------------------------------------------------

pub struct BroadcastMode {
    relay: Arc<RelayClient>,
    reg: RegisterInfo,
    indi_server_addr: String,
    listen_addr: String,
    state: Mutex<BroadcastState>,
}

#[derive(Default)]
struct BroadcastState {
    proxy: Option<Arc<BroadcastProxy<WsTunnel>>>,
    addr_data: Vec<PublicServerAddr>,
    status: String,
}

impl BroadcastMode {
    pub fn new(
        relay: Arc<RelayClient>,
        reg: RegisterInfo,
        indi_server_addr: String,
        listen_addr: String,
    ) -> Self {
        Self {
            relay,
            reg,
            indi_server_addr,
            listen_addr,
            state: Mutex::new(BroadcastState::default()),
        }
    }
}

#[async_trait]
impl AgentMode for BroadcastMode {
    async fn start(&self) {
        let mut state = self.state.lock().await;
        info!("starting INDIHUB agent in broadcast mode!");

        let tunnel = match self.relay.broadcast(&self.reg).await {
            Ok(tunnel) => Arc::new(tunnel),
            Err(err) => {
                error!("could not start agent in broadcast mode: {err}");
                state.status = "error".to_string();
                return;
            }
        };

        let proxy = Arc::new(BroadcastProxy::new(
            "INDI-Server",
            self.indi_server_addr.clone(),
            tunnel,
        ));
        let (pub_tx, mut pub_rx) = mpsc::channel(1);
        tokio::spawn(proxy.clone().start(
            pub_tx,
            self.reg.session_id,
            self.reg.session_id_public.clone(),
            self.listen_addr.clone(),
        ));
        state.proxy = Some(proxy);

        match timeout(ADDR_WAIT, pub_rx.recv()).await {
            Ok(Some(addr)) => {
                banner::broadcast_address(&addr.addr);
                state.addr_data.push(addr);
            }
            Ok(None) | Err(_) => warn!("broadcast address was not announced in time"),
        }
        state.status = "running".to_string();
    }

    async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(proxy) = state.proxy.take() {
            info!("closing INDIHUB broadcast session");
            proxy.close().await;
        }
        state.addr_data.clear();
        state.status = "stopped".to_string();
    }

    async fn status(&self) -> Value {
        let state = self.state.lock().await;
        json!({
            "status": state.status,
            "publicEndpoints": state.addr_data,
        })
    }
}

// ---------------------------------------------------------------------------
// supervisor
// ---------------------------------------------------------------------------

/// Owns the mode set and the single active mode. All transitions pass
/// through one lock, so only one can be in flight.
pub struct ModeSupervisor {
    version: String,
    indi_profile: String,
    indi_server_addr: String,
    phd2_server_addr: Option<String>,
    modes: HashMap<String, Arc<dyn AgentMode>>,
    current: RwLock<String>,
    transition: Mutex<()>,
}

impl ModeSupervisor {
    pub fn new(
        version: impl Into<String>,
        indi_profile: impl Into<String>,
        indi_server_addr: impl Into<String>,
        phd2_server_addr: Option<String>,
        modes: HashMap<String, Arc<dyn AgentMode>>,
        initial_mode: impl Into<String>,
    ) -> Self {
        Self {
            version: version.into(),
            indi_profile: indi_profile.into(),
            indi_server_addr: indi_server_addr.into(),
            phd2_server_addr,
            modes,
            current: RwLock::new(initial_mode.into()),
            transition: Mutex::new(()),
        }
    }

    pub async fn current_mode(&self) -> String {
        self.current.read().await.clone()
    }

    /// Start the active mode (used at boot).
    pub async fn start_current(&self) {
        let _guard = self.transition.lock().await;
        let current = self.current.read().await.clone();
        if let Some(mode) = self.modes.get(&current) {
            mode.start().await;
        }
    }

    /// Stop the active mode (used at shutdown).
    pub async fn stop_current(&self) {
        let _guard = self.transition.lock().await;
        let current = self.current.read().await.clone();
        if let Some(mode) = self.modes.get(&current) {
            mode.stop().await;
        }
    }

    /// Stop and start the active mode with a settle pause in between.
    pub async fn restart(&self) -> Value {
        let _guard = self.transition.lock().await;
        let current = self.current.read().await.clone();
        if let Some(mode) = self.modes.get(&current) {
            mode.stop().await;
            tokio::time::sleep(MODE_SETTLE).await;
            mode.start().await;
        }
        self.status().await
    }

    /// Switch to `new_mode`. A no-op when it is already active; unknown
    /// names are an error and change nothing.
    pub async fn change_mode(&self, new_mode: &str) -> Result<Value> {
        let _guard = self.transition.lock().await;
        let current = self.current.read().await.clone();
        if new_mode == current {
            return Ok(self.status().await);
        }
        let Some(next) = self.modes.get(new_mode) else {
            return Err(AgentError::UnknownMode(new_mode.to_string()));
        };

        if let Some(mode) = self.modes.get(&current) {
            mode.stop().await;
        }
        tokio::time::sleep(MODE_SETTLE).await;
        *self.current.write().await = new_mode.to_string();
        next.start().await;

        Ok(self.status().await)
    }

    /// Flat status document: agent facts plus the active mode's own
    /// status fields.
    pub async fn status(&self) -> Value {
        let current = self.current.read().await.clone();
        let mut supported: Vec<&String> = self.modes.keys().collect();
        supported.sort();

        let mut status = json!({
            "version": self.version,
            "mode": current,
            "indiProfile": self.indi_profile,
            "indiServer": self.indi_server_addr,
            "phd2Server": self.phd2_server_addr.clone().unwrap_or_default(),
            "supportedModes": supported,
        });

        if let Some(mode) = self.modes.get(&current) {
            if let (Some(map), Value::Object(extra)) =
                (status.as_object_mut(), mode.status().await)
            {
                for (key, value) in extra {
                    map.insert(key, value);
                }
            }
        }
        status
    }
}
