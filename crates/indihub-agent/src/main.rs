//! INDIHUB Agent
//!
//! Binds a local INDI-server to the indihub.space cloud. The agent talks
//! to the INDI-server manager to bring the right profile up, registers
//! the host with the relay, then runs one of four modes (solo, share,
//! robotic, broadcast) under a supervisor that the local control API can
//! drive.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use indihub_core::config::AgentConfig;
use indihub_core::error::{AgentError, Result};
use indihub_core::filter::FilterConfig;
use indihub_core::manager::ManagerClient;
use indihub_core::protocol::HostInfo;
use indihub_core::tunnel::{RelayClient, RelayConfig};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod banner;
mod modes;

use modes::{
    AgentMode, BroadcastMode, ModeSupervisor, ShareMode, SoloMode, MODE_BROADCAST, MODE_ROBOTIC,
    MODE_SHARE, MODE_SOLO,
};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// INDIHUB agent - share your astro-equipment with the world.
#[derive(Parser, Debug)]
#[command(name = "indihub-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// INDI-server Manager address (host:port)
    #[arg(long = "indi-server-manager", default_value = "raspberrypi.local:8624")]
    indi_server_manager: String,

    /// Name of the INDI-profile to share via indihub
    #[arg(long = "indi-profile")]
    indi_profile: String,

    /// Agent mode: solo, share, robotic or broadcast
    #[arg(long, default_value = MODE_SOLO)]
    mode: String,

    /// Token - can be requested at https://indihub.space/token
    #[arg(long, default_value = "")]
    token: String,

    /// Agent config file path
    #[arg(long, default_value = "indihub.json")]
    conf: String,

    /// PHD2-server address (host:port), enables guiding in share mode
    #[arg(long = "phd2-server", default_value = "")]
    phd2_server: String,

    /// Address to serve guests on in broadcast mode (host:port)
    #[arg(long = "broadcast-indi-server", default_value = "localhost:7624")]
    broadcast_indi_server: String,

    /// Gzip-compress relay traffic
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    compress: bool,

    /// Port for the local HTTP/WS control API
    #[arg(long = "api-port", default_value_t = 2020)]
    api_port: u16,

    /// Serve the control API over TLS with a self-signed certificate
    #[arg(long = "api-tls", default_value_t = false)]
    api_tls: bool,

    /// Comma-separated extra origins allowed to use the control API
    #[arg(long = "api-origins", default_value = "")]
    api_origins: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let dev = std::env::var("INDIHUB_DEV").is_ok();

    match run(args, dev).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, dev: bool) -> Result<()> {
    if ![MODE_SOLO, MODE_SHARE, MODE_ROBOTIC, MODE_BROADCAST].contains(&args.mode.as_str()) {
        return Err(AgentError::UnknownMode(args.mode.clone()));
    }
    if args.indi_profile.is_empty() {
        return Err(AgentError::Config(
            "'indi-profile' parameter is required".to_string(),
        ));
    }
    let Some((indi_host, _)) = args.indi_server_manager.rsplit_once(':') else {
        return Err(AgentError::Config(
            "bad syntax for 'indi-server-manager', the 'host:port' format is expected".to_string(),
        ));
    };

    // token from the flag, falling back to a previously saved config
    let token = if args.token.is_empty() {
        AgentConfig::read(&args.conf)
            .map(|conf| conf.token)
            .unwrap_or_default()
    } else {
        args.token.clone()
    };

    // bring the requested profile up through the manager
    info!(
        "connecting to local INDI-Server Manager on {}...",
        args.indi_server_manager
    );
    let manager = ManagerClient::new(args.indi_server_manager.clone());
    let (running, current_profile) = manager.get_status().await?;
    info!("...OK");

    if !running || current_profile != args.indi_profile {
        info!("setting active INDI-profile to '{}'", args.indi_profile);
        manager.stop_server().await?;
        manager.start_profile(&args.indi_profile).await?;
    } else {
        info!(
            "INDI-server is running with active INDI-profile '{}'",
            args.indi_profile
        );
    }

    let profile = manager.get_profile(&args.indi_profile).await?;
    let indi_server_addr = format!("{indi_host}:{}", profile.port);

    let drivers = manager.get_drivers().await?;
    info!("INDI-drivers:");
    for driver in &drivers {
        info!("  {} ({}, {})", driver.label, driver.family, driver.version);
    }

    // make sure the instrument side is actually reachable before
    // involving the cloud
    info!("test connection to local INDI-Server on {indi_server_addr}...");
    TcpStream::connect(&indi_server_addr).await?;
    info!("...OK");

    let phd2_server_addr = (!args.phd2_server.is_empty()).then(|| args.phd2_server.clone());
    if let Some(phd2_addr) = &phd2_server_addr {
        info!("test connection to local PHD2-Server on {phd2_addr}...");
        TcpStream::connect(phd2_addr).await?;
        info!("...OK");
    }

    let host_info = HostInfo {
        token: token.clone(),
        profile: profile.clone(),
        drivers,
        solo_mode: args.mode == MODE_SOLO,
        is_phd2: phd2_server_addr.is_some(),
        is_robotic: args.mode == MODE_ROBOTIC,
        is_broadcast: args.mode == MODE_BROADCAST,
        agent_version: AGENT_VERSION.to_string(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
    };

    info!("connecting to the indihub.space cloud...");
    let relay = Arc::new(RelayClient::new(RelayConfig::new(dev, args.compress)));
    let reg = relay.register_host(&host_info).await?;
    info!("...OK");

    info!("current agent version: {AGENT_VERSION}");
    info!("latest agent version: {}", reg.agent_version);
    banner::version_check(AGENT_VERSION, &reg.agent_version);

    info!("access token: {}", reg.token);
    info!("host session token: {}", reg.session_id_public);

    // first registration: keep the issued token for next time
    if args.token.is_empty() && token.is_empty() {
        let conf = AgentConfig {
            token: reg.token.clone(),
        };
        if let Err(err) = conf.write(&args.conf) {
            warn!("could not create config file {}: {err}", args.conf);
        }
    }

    let mut mode_set: HashMap<String, Arc<dyn AgentMode>> = HashMap::new();
    mode_set.insert(
        MODE_SOLO.to_string(),
        Arc::new(SoloMode::new(
            relay.clone(),
            reg.clone(),
            indi_server_addr.clone(),
        )),
    );
    mode_set.insert(
        MODE_SHARE.to_string(),
        Arc::new(ShareMode::new(
            relay.clone(),
            reg.clone(),
            indi_server_addr.clone(),
            phd2_server_addr.clone(),
            false,
            FilterConfig::default(),
        )),
    );
    mode_set.insert(
        MODE_ROBOTIC.to_string(),
        Arc::new(ShareMode::new(
            relay.clone(),
            reg.clone(),
            indi_server_addr.clone(),
            phd2_server_addr.clone(),
            true,
            FilterConfig::default(),
        )),
    );
    mode_set.insert(
        MODE_BROADCAST.to_string(),
        Arc::new(BroadcastMode::new(
            relay.clone(),
            reg.clone(),
            indi_server_addr.clone(),
            args.broadcast_indi_server.clone(),
        )),
    );

    let supervisor = Arc::new(ModeSupervisor::new(
        AGENT_VERSION,
        args.indi_profile.clone(),
        indi_server_addr.clone(),
        phd2_server_addr.clone(),
        mode_set,
        args.mode.clone(),
    ));
    supervisor.start_current().await;

    let extras: Vec<String> = args
        .api_origins
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let state = Arc::new(api::ApiState {
        token: reg.token.clone(),
        indi_server_addr,
        supervisor: supervisor.clone(),
        origins: api::OriginPolicy::new(&extras, dev),
        shutdown: CancellationToken::new(),
    });

    let api_state = state.clone();
    tokio::spawn(async move {
        if let Err(err) = api::serve(api_state, args.api_port, args.api_tls, dev).await {
            error!("API-server error: {err}");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down...");

    state.shutdown.cancel();
    supervisor.stop_current().await;
    tokio::time::sleep(indihub_core::limits::MODE_SETTLE).await;

    Ok(())
}
