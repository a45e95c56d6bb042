use anyhow::{Context, Result};
use discovery_client::{connect, DiscoveryMetrics, Registrar, RegistrarConfig};
use discovery_core::DiscoveryConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting service-registrar...");

    let config = DiscoveryConfig::load().context("failed to load discovery configuration")?;
    let service = config
        .service
        .clone()
        .context("no service configured; set SERVICE_NAME and SERVICE_ADDR")?;

    let client = connect(&config)
        .await
        .context("failed to open coordination session")?;
    let metrics = DiscoveryMetrics::new()?;
    let registrar = Registrar::new(client, RegistrarConfig::from(&config)).with_metrics(metrics);

    // An instance that cannot announce itself must not start serving
    let registration = registrar
        .register(service.to_record(), config.ttl_secs)
        .await
        .with_context(|| format!("failed to register {} at {}", service.name, service.addr))?;
    info!(
        service = %service.name,
        addr = %service.addr,
        key = %registration.key(),
        "Service announced, press Ctrl-C to unregister"
    );

    let mut state = registration.subscribe_state();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                info!(state = ?current, "Registration state changed");
            }
        }
    }

    info!("Unregistering {}", service.name);
    registration.close().await;
    info!("service-registrar stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("DISCOVERY_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
