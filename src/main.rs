use consumption_calc::bus::mqtt::{self, MqttBus};
use consumption_calc::bus::{registration_fields, BusAddress};
use consumption_calc::config::Config;
use consumption_calc::discovery::wait_for_all;
use consumption_calc::engine::{ConsumptionEngine, PowerInputs};
use consumption_calc::power::Phase;
use consumption_calc::scheduler::Scheduler;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// One thread drives the bus connection and the update timer.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("{}", "=".repeat(60));
    info!("Starting Consumption Calculator Service");
    info!("{}", "=".repeat(60));

    let cfg_path = std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.yaml".into());
    let cfg = Config::load(&cfg_path).inspect_err(|e| error!("Fatal error: {e}"))?;
    info!(path = %cfg_path, "loaded config");

    run(cfg).await.inspect_err(|e| error!("Fatal error: {e}"))?;
    Ok(())
}

async fn run(cfg: Config) -> consumption_calc::Result<()> {
    let address = BusAddress::select(&cfg.mqtt)?;
    info!(scope = ?address.scope, host = %address.host, port = address.port, "using bus");

    let bus = MqttBus::connect(mqtt::build_options(&address, &cfg.mqtt), cfg.bus.root.clone());
    let grid = cfg.sources.grid.as_str();
    let pv = cfg.sources.pv.as_str();
    bus.watch(grid).await?;
    bus.watch(pv).await?;

    wait_for_all(&bus, &[grid, pv], cfg.discovery.policy()).await?;

    let inputs = PowerInputs {
        grid_total: bus.import(grid, Phase::Total.path()),
        grid_l1: bus.import(grid, Phase::L1.path()),
        pv_total: bus.import(pv, Phase::Total.path()),
        pv_l1: bus.import(pv, Phase::L1.path()),
    };
    let engine = ConsumptionEngine::new(
        inputs,
        bus.service(&cfg.service.name),
        &registration_fields(&cfg.service),
    )?;

    let scheduler = Scheduler::new(cfg.update_interval());
    info!("Consumption calculator initialized");
    info!("  Grid service: {grid}");
    info!("  PV service: {pv}");
    info!("  Update interval: {}ms", scheduler.period().as_millis());
    info!("Calculation: Consumption = Grid (import) + PV Production");
    info!("{}", "-".repeat(60));

    let ticks = scheduler.run(|| engine.update(), shutdown_signal()).await;
    info!(ticks, "shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("shutdown requested"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
