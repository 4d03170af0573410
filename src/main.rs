use crate::{
    catalog::Catalog,
    config::CliArgs,
    error::{Error, HttpServerBind, HttpServerRun},
    helm::client::HelmReleaseClient,
    k8s::K8sClient,
    metrics::MetricsService,
    rest::{middleware::Cors, AppState},
};
use actix_web::{middleware, web, App, HttpServer};
use snafu::ResultExt;
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod catalog;
mod config;
mod error;
mod helm;
mod k8s;
mod macros;
mod metrics;
mod rest;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_logging();
    let args = CliArgs::args();

    let k8s = K8sClient::new(args.namespace().as_str(), args.kubeconfig().as_deref()).await?;

    let helm = HelmReleaseClient::builder()
        .with_namespace(args.namespace())
        .with_storage_driver(args.helm_driver())
        .with_kubeconfig(k8s.kubeconfig().map(Path::to_path_buf))
        .with_timeout(args.helm_timeout())
        .build(&k8s)
        .await?;

    let catalog = Catalog::load(args.chart_config().as_path())?;

    // Warm the repository cache in the background so the server starts serving immediately.
    // Per-install resolution falls back to its own sync pass if this one has not landed yet.
    let sync_client = helm.clone();
    let charts = catalog.charts().to_vec();
    tokio::spawn(async move {
        info!("Starting initial helm repository sync");
        match sync_client.sync_repositories(charts.as_slice()).await {
            Ok(()) => info!("Initial helm repository sync complete"),
            Err(error) => warn!(%error, "Initial helm repository sync failed"),
        }
    });

    let state = web::Data::new(AppState {
        catalog,
        helm,
        k8s: k8s.clone(),
        metrics: MetricsService::new(k8s.client()),
    });

    let addr = format!("0.0.0.0:{}", args.port());
    info!(%addr, namespace = %args.namespace(), "Starting app-store API server");

    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .wrap(Cors)
            .app_data(state.clone())
            .configure(rest::configure)
    })
    .bind(addr.as_str())
    .context(HttpServerBind { addr: addr.clone() })?
    .run()
    .await
    .context(HttpServerRun)
}
