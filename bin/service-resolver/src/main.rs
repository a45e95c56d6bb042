use anyhow::{Context, Result};
use discovery_client::{
    connect, DiscoveryMetrics, Registrar, RegistrarConfig, Resolver, ResolverConfig,
};
use discovery_core::DiscoveryConfig;
use http_body_util::Full;
use hyper::{
    body::Bytes,
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::tokio::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod router;

use router::RouteTable;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8081";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting service-resolver...");

    let config = DiscoveryConfig::load().context("failed to load discovery configuration")?;
    if config.targets.is_empty() {
        warn!("No targets configured; set DISCOVERY_TARGETS to resolve services");
    }

    let client = connect(&config)
        .await
        .context("failed to open coordination session")?;
    let metrics = DiscoveryMetrics::new()?;

    // Announce ourselves too when a service is configured
    let registration = match &config.service {
        Some(service) => {
            let registrar = Registrar::new(client.clone(), RegistrarConfig::from(&config))
                .with_metrics(metrics.clone());
            let registration = registrar
                .register(service.to_record(), config.ttl_secs)
                .await
                .with_context(|| {
                    format!("failed to register {} at {}", service.name, service.addr)
                })?;
            info!(service = %service.name, key = %registration.key(), "Service announced");
            Some(registration)
        }
        None => None,
    };

    let resolver =
        Resolver::new(client, ResolverConfig::from(&config)).with_metrics(metrics.clone());
    let routes = Arc::new(RouteTable::new());

    let mut handles = Vec::with_capacity(config.targets.len());
    for target in &config.targets {
        let handle = resolver
            .open(target)
            .await
            .with_context(|| format!("failed to resolve {target}"))?;
        info!(service = %target, addresses = ?handle.addresses(), "Resolving service");
        tokio::spawn(router::follow(target.clone(), handle.subscribe(), routes.clone()));
        handles.push(handle);
    }

    let listen_addr: SocketAddr = config
        .listen_addr
        .as_deref()
        .unwrap_or(DEFAULT_LISTEN_ADDR)
        .parse()
        .context("invalid listen address")?;
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Status server listening on {}", listen_addr);

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
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let routes = routes.clone();
                let metrics = metrics.clone();

                tokio::task::spawn(async move {
                    let service = service_fn(move |req| {
                        handle_request(req, routes.clone(), metrics.clone())
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
                    }
                });
            }
        }
    }

    info!("Shutting down...");
    for handle in &mut handles {
        handle.close().await;
    }
    if let Some(registration) = registration {
        registration.close().await;
    }
    info!("service-resolver stopped");
    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    routes: Arc<RouteTable>,
    metrics: DiscoveryMetrics,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    debug!("{} {}", req.method(), path);

    if req.method() != Method::GET {
        return Ok(text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n"));
    }

    if path == "/healthz" {
        return Ok(text(StatusCode::OK, "OK\n"));
    }

    if path == "/metrics" {
        let response = match metrics.gather() {
            Ok(body) => {
                let mut response = text(StatusCode::OK, body);
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics\n")
            }
        };
        return Ok(response);
    }

    if path == "/services" {
        return Ok(json(&routes.services().await));
    }

    if let Some(service) = path.strip_prefix("/addresses/") {
        let response = match routes.addresses(service).await {
            Some(addresses) => json(&addresses),
            None => text(StatusCode::NOT_FOUND, "Unknown service\n"),
        };
        return Ok(response);
    }

    if let Some(service) = path.strip_prefix("/route/") {
        let response = match routes.select(service).await {
            Some(addr) => text(StatusCode::OK, format!("{addr}\n")),
            None => text(StatusCode::SERVICE_UNAVAILABLE, "No instances available\n"),
        };
        return Ok(response);
    }

    Ok(text(StatusCode::NOT_FOUND, "Not Found\n"))
}

fn json(value: &[String]) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = text(StatusCode::OK, body);
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            warn!("Failed to encode response: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n")
        }
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
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
