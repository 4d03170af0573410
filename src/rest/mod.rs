use crate::{
    catalog::Catalog, helm::client::HelmReleaseClient, k8s::K8sClient, metrics::MetricsService,
};
use actix_web::web;

/// Contains the CORS middleware.
pub(crate) mod middleware;

/// Contains the route handlers.
pub(crate) mod service;

/// Shared handler state. One instance is built at startup and handed to every worker.
pub(crate) struct AppState {
    pub(crate) catalog: Catalog,
    pub(crate) helm: HelmReleaseClient,
    pub(crate) k8s: K8sClient,
    pub(crate) metrics: MetricsService,
}

/// Registers all routes: the bare health probe and the /api surface.
pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(service::health).service(
        web::scope("/api")
            .service(service::list_charts)
            .service(service::install_chart)
            .service(service::list_releases)
            .service(service::release_status)
            .service(service::uninstall_release)
            .service(service::metrics_stream),
    );
}
