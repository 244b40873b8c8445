use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vox_core::config::VoxConfig;
use vox_gateway::app;
use vox_db::Database;
use vox_guardian::{bus::spawn_command_listener, GuardianSupervisor};
use vox_providers::SessionFactory;
use vox_sip::stack::NullSipStack;
use vox_sip::SipSessionController;
use vox_webrtc::heartbeat::spawn_heartbeat;
use vox_webrtc::room::UnavailableRoomClient;
use vox_webrtc::BrokerClaimService;

#[derive(Parser)]
#[command(name = "vox-gateway", about = "VoxNexus session core gateway")]
struct Cli {
    /// Path to voxnexus.toml (falls back to VOX_CONFIG, then ./voxnexus.toml)
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vox_gateway=info,vox_sip=info,vox_guardian=info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = VoxConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        VoxConfig::default()
    });

    let db = Arc::new(Database::open(&config.database.path)?);
    let broker = vox_broker::connect(&config.broker.url).await?;
    let cancel = CancellationToken::new();

    let supervisor = Arc::new(GuardianSupervisor::new(
        broker.clone(),
        db.clone(),
        config.guardian.clone(),
    ));
    spawn_command_listener(broker.clone(), supervisor.clone(), cancel.clone());

    let worker_id = format!("vox-gateway-{}", uuid::Uuid::new_v4());
    spawn_heartbeat(broker.clone(), worker_id, cancel.clone());

    let factory = Arc::new(SessionFactory::new(config.providers.clone(), db.clone()));

    // The native SIP UA and SFU bindings are linked by the deployment build;
    // the stand-ins keep the admin surface and guardian running without them.
    let (sip_controller, sip_handle) = SipSessionController::new(
        Arc::new(NullSipStack),
        db.clone(),
        broker.clone(),
        supervisor.clone(),
        factory,
        Arc::new(UnavailableRoomClient),
        config.sip.clone(),
    );
    let (_sip_event_tx, sip_event_rx) = tokio::sync::mpsc::channel(256);
    tokio::spawn(sip_controller.run(sip_event_rx, cancel.clone()));

    let state = Arc::new(app::AppState {
        claims: Arc::new(BrokerClaimService::new(broker.clone())),
        config: config.clone(),
        db,
        broker,
        supervisor,
        sip: sip_handle,
    });
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    info!("VoxNexus gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        })
        .await?;

    Ok(())
}
