use crate::{error::Error, rest::AppState};
use actix_web::{delete, get, http::header, post, web, HttpResponse};
use futures::stream;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::time::interval;
use tracing::warn;

/// Delay between cluster metrics frames on the event stream.
const STREAM_PERIOD: Duration = Duration::from_millis(200);

/// Optional body of an install request. Absent, empty or unparseable bodies fall back to the
/// defaults rather than rejecting the request.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct InstallRequest {
    #[serde(default)]
    release_name: Option<String>,
    #[serde(default)]
    values: Option<Map<String, Value>>,
}

fn parse_install_request(body: &[u8]) -> InstallRequest {
    if body.is_empty() {
        return InstallRequest::default();
    }
    match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(error) => {
            warn!(%error, "Ignoring unparseable install request body");
            InstallRequest::default()
        }
    }
}

/// Liveness probe.
#[get("/health")]
pub(crate) async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "UP" }))
}

/// Returns the configured chart catalog.
#[get("/charts")]
pub(crate) async fn list_charts(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.catalog.charts())
}

/// Installs a catalog chart as a helm release.
#[post("/charts/{chart_name}/install")]
pub(crate) async fn install_chart(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Bytes,
) -> Result<HttpResponse, Error> {
    let chart_name = path.into_inner();
    let request = parse_install_request(body.as_ref());

    let chart = state.catalog.chart_by_name(chart_name.as_str())?.clone();
    let release = state
        .helm
        .install_chart(&chart, request.release_name, request.values.as_ref())
        .await?;

    Ok(HttpResponse::Ok().json(json!({
        "message": format!(
            "Chart '{chart_name}' installed successfully as release '{}'",
            release.name
        ),
        "release": {
            "name": release.name,
            "namespace": release.namespace,
            "version": release.version,
            "status": release.info.status,
        }
    })))
}

/// Lists all releases in the managed namespace, with their externally reachable ports.
#[get("/releases")]
pub(crate) async fn list_releases(state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    let releases = state.helm.list_releases(&state.k8s).await?;
    Ok(HttpResponse::Ok().json(releases))
}

/// Returns the full helm status payload for one release.
#[get("/releases/{release_name}/status")]
pub(crate) async fn release_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, Error> {
    let status = state.helm.release_status(path.into_inner().as_str()).await?;
    Ok(HttpResponse::Ok().json(status))
}

/// Uninstalls a release from the managed namespace.
#[delete("/releases/{release_name}")]
pub(crate) async fn uninstall_release(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, Error> {
    let release_name = path.into_inner();
    state.helm.uninstall_release(release_name.as_str()).await?;
    Ok(HttpResponse::Ok().json(json!({
        "message": format!("Release '{release_name}' uninstalled successfully.")
    })))
}

/// Streams cluster metrics snapshots as server-sent events, one frame per tick. A failed
/// snapshot is logged and its tick skipped, so transient apiserver trouble stalls the stream
/// instead of terminating it.
#[get("/metrics/stream")]
pub(crate) async fn metrics_stream(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.clone();
    let stream = stream::unfold(
        (metrics, interval(STREAM_PERIOD)),
        |(metrics, mut ticker)| async move {
            loop {
                ticker.tick().await;
                let snapshot = match metrics.snapshot().await {
                    Ok(snapshot) => snapshot,
                    Err(error) => {
                        warn!(%error, "Skipping metrics stream tick");
                        continue;
                    }
                };
                match serde_json::to_string(&snapshot) {
                    Ok(payload) => {
                        let frame = web::Bytes::from(format!("data: {payload}\n\n"));
                        return Some((Ok::<_, actix_web::Error>(frame), (metrics, ticker)));
                    }
                    Err(error) => {
                        warn!(%error, "Failed to serialize metrics snapshot");
                    }
                }
            }
        },
    );

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{
        test::{call_service, init_service, read_body_json, TestRequest},
        App,
    };

    #[actix_web::test]
    async fn health_endpoint_reports_up() {
        let app = init_service(App::new().service(health)).await;

        let response =
            call_service(&app, TestRequest::get().uri("/health").to_request()).await;
        assert!(response.status().is_success());

        let body: Value = read_body_json(response).await;
        assert_eq!(body, json!({ "status": "UP" }));
    }

    #[test]
    fn empty_install_body_falls_back_to_defaults() {
        let request = parse_install_request(&[]);
        assert!(request.release_name.is_none());
        assert!(request.values.is_none());
    }

    #[test]
    fn unparseable_install_body_falls_back_to_defaults() {
        let request = parse_install_request(b"{not json");
        assert!(request.release_name.is_none());
        assert!(request.values.is_none());
    }

    #[test]
    fn install_body_parses_release_name_and_values() {
        let request = parse_install_request(
            br#"{"release_name": "my-nginx", "values": {"replicaCount": 2}}"#,
        );
        assert_eq!(request.release_name.as_deref(), Some("my-nginx"));
        assert_eq!(
            request
                .values
                .as_ref()
                .and_then(|values| values.get("replicaCount")),
            Some(&json!(2))
        );
    }
}
