//! HTTP control surface.
//!
//! Serves the graph (JSON, dot or mermaid per Accept), layer lifecycle
//! commands, tuple export with long-polling, worker telemetry intake,
//! autocompletion and time-series queries. All state lives in the
//! supervisor; handlers are thin.

pub mod dto;
pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post, put};
use axum::{Extension, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

use crate::error::{Result, WeirError};
use crate::supervisor::Supervisor;

use self::handlers::{
    compile_all, compile_layer, complete_fields, complete_nodes, export_get, export_post,
    get_graph, get_graph_layer, put_graph, put_report, run_all, run_layer, stop_all, stop_layer,
    timeseries,
};

pub fn router(sup: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/graph", get(get_graph).put(put_graph))
        .route("/graph/:layer", get(get_graph_layer))
        .route("/compile", get(compile_all))
        .route("/compile/:layer", get(compile_layer))
        .route("/run", get(run_all))
        .route("/run/:layer", get(run_layer))
        .route("/start", get(run_all))
        .route("/start/:layer", get(run_layer))
        .route("/stop", get(stop_all))
        .route("/stop/:layer", get(stop_layer))
        .route("/export/:layer/:node", get(export_get).post(export_post))
        .route("/report/:layer/:node", put(put_report))
        .route("/complete/nodes", post(complete_nodes))
        .route("/complete/fields", post(complete_fields))
        .route("/timeseries", post(timeseries))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(RequestBodyLimitLayer::new(4 * 1024 * 1024))
        .layer(Extension(sup))
}

/// Run the control API and the supervisor's periodic duties until the
/// process is told to stop.
pub async fn serve(sup: Arc<Supervisor>) -> Result<()> {
    let addr = sup.config.http.listen.clone();
    let check_period = Duration::from_secs(sup.config.runtime.timeout_check_secs.max(1));

    {
        let sup = Arc::clone(&sup);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(check_period);
            loop {
                tick.tick().await;
                sup.reap_children();
                sup.timeout_layers();
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| WeirError::fatal(format!("cannot bind {addr}: {e}")))?;
    info!(%addr, "control API listening");
    axum::serve(listener, router(sup))
        .await
        .map_err(|e| WeirError::fatal(format!("http server failed: {e}")))?;
    Ok(())
}
