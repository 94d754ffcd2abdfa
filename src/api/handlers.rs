//! Route handlers of the control API.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};

use crate::api::dto::{
    value_to_json, CompleteRequest, CompleteResponse, ExportRequest, ExportResponse,
    ExportedTuple, GraphDto, LayerDto, TimeseriesRequest, TimeseriesResponse,
};
use crate::error::WeirError;
use crate::supervisor::{LayerDef, Supervisor};

/// Engine errors mapped onto HTTP statuses.
pub struct ApiError(pub WeirError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            WeirError::Syntax { .. }
            | WeirError::InvalidCommand { .. }
            | WeirError::AlreadyRunning { .. }
            | WeirError::NotRunning { .. }
            | WeirError::DependencyLoop { .. } => StatusCode::BAD_REQUEST,
            WeirError::NotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

impl From<WeirError> for ApiError {
    fn from(e: WeirError) -> Self {
        ApiError(e)
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn render_graph(sup: &Supervisor, headers: &HeaderMap, layer: Option<&str>) -> ApiResult<Response> {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");
    sup.with_graph(|g| {
        if let Some(l) = layer {
            g.layer(l)?;
        }
        let rendered = if accept.contains("graphviz") || accept.contains("dot") {
            ([(header::CONTENT_TYPE, "text/vnd.graphviz")], g.to_dot()).into_response()
        } else if accept.contains("mermaid") {
            ([(header::CONTENT_TYPE, "text/x-mermaid")], g.to_mermaid()).into_response()
        } else {
            match layer {
                Some(l) => Json(LayerDto::of(g.layer(l)?)).into_response(),
                None => Json(GraphDto::of(g)).into_response(),
            }
        };
        Ok(rendered)
    })
}

pub async fn get_graph(
    Extension(sup): Extension<Arc<Supervisor>>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    render_graph(&sup, &headers, None)
}

pub async fn get_graph_layer(
    Extension(sup): Extension<Arc<Supervisor>>,
    Path(layer): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    render_graph(&sup, &headers, Some(&layer))
}

pub async fn put_graph(
    Extension(sup): Extension<Arc<Supervisor>>,
    Json(def): Json<LayerDef>,
) -> ApiResult<StatusCode> {
    sup.create_layer(def)?;
    Ok(StatusCode::CREATED)
}

pub async fn compile_all(Extension(sup): Extension<Arc<Supervisor>>) -> ApiResult<StatusCode> {
    sup.compile_all()?;
    Ok(StatusCode::OK)
}

pub async fn compile_layer(
    Extension(sup): Extension<Arc<Supervisor>>,
    Path(layer): Path<String>,
) -> ApiResult<StatusCode> {
    sup.compile(&layer)?;
    Ok(StatusCode::OK)
}

pub async fn run_all(Extension(sup): Extension<Arc<Supervisor>>) -> ApiResult<StatusCode> {
    let layers: Vec<String> = sup.with_graph(|g| g.layers.keys().cloned().collect());
    for l in layers {
        sup.run(&l)?;
    }
    Ok(StatusCode::OK)
}

pub async fn run_layer(
    Extension(sup): Extension<Arc<Supervisor>>,
    Path(layer): Path<String>,
) -> ApiResult<StatusCode> {
    sup.run(&layer)?;
    Ok(StatusCode::OK)
}

pub async fn stop_all(Extension(sup): Extension<Arc<Supervisor>>) -> ApiResult<StatusCode> {
    let layers: Vec<String> = sup.with_graph(|g| g.layers.keys().cloned().collect());
    for l in layers {
        match sup.stop(&l) {
            Ok(()) | Err(WeirError::NotRunning { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(StatusCode::OK)
}

pub async fn stop_layer(
    Extension(sup): Extension<Arc<Supervisor>>,
    Path(layer): Path<String>,
) -> ApiResult<StatusCode> {
    sup.stop(&layer)?;
    Ok(StatusCode::OK)
}

async fn export_common(
    sup: Arc<Supervisor>,
    layer: String,
    node: String,
    req: ExportRequest,
) -> ApiResult<Json<ExportResponse>> {
    let fq = format!("{layer}/{node}");
    let schema = sup.export.schema(&fq)?;
    let deadline = req
        .wait_up_to
        .map(|s| std::time::Instant::now() + Duration::from_secs_f64(s.max(0.0)));
    let rows = loop {
        let rows = sup.export.fold_tuples(&fq, req.since, req.max_results)?;
        if !rows.is_empty() {
            break rows;
        }
        match deadline {
            Some(d) if std::time::Instant::now() < d => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            _ => break rows,
        }
    };
    let last_seq = rows.last().map(|(s, _)| *s).or(sup.export.last_seq(&fq));
    Ok(Json(ExportResponse {
        fields: schema.field_names().map(str::to_string).collect(),
        tuples: rows
            .into_iter()
            .map(|(seq, t)| ExportedTuple {
                seq,
                values: t.iter().map(value_to_json).collect(),
            })
            .collect(),
        last_seq,
    }))
}

pub async fn export_get(
    Extension(sup): Extension<Arc<Supervisor>>,
    Path((layer, node)): Path<(String, String)>,
    Query(req): Query<ExportRequest>,
) -> ApiResult<Json<ExportResponse>> {
    export_common(sup, layer, node, req).await
}

pub async fn export_post(
    Extension(sup): Extension<Arc<Supervisor>>,
    Path((layer, node)): Path<(String, String)>,
    Json(req): Json<ExportRequest>,
) -> ApiResult<Json<ExportResponse>> {
    export_common(sup, layer, node, req).await
}

pub async fn put_report(
    Extension(sup): Extension<Arc<Supervisor>>,
    Path((layer, node)): Path<(String, String)>,
    body: axum::body::Bytes,
) -> ApiResult<StatusCode> {
    let parsed: serde_json::Value = serde_json::from_slice(&body)
        .unwrap_or_else(|_| serde_json::json!({ "raw": String::from_utf8_lossy(&body) }));
    sup.report(&layer, &node, parsed)?;
    Ok(StatusCode::OK)
}

pub async fn complete_nodes(
    Extension(sup): Extension<Arc<Supervisor>>,
    Json(req): Json<CompleteRequest>,
) -> Json<CompleteResponse> {
    Json(CompleteResponse {
        completions: sup.complete_nodes(&req.prefix),
    })
}

pub async fn complete_fields(
    Extension(sup): Extension<Arc<Supervisor>>,
    Json(req): Json<CompleteRequest>,
) -> Json<CompleteResponse> {
    Json(CompleteResponse {
        completions: sup.complete_fields(req.node.as_deref(), &req.prefix),
    })
}

pub async fn timeseries(
    Extension(sup): Extension<Arc<Supervisor>>,
    Json(req): Json<TimeseriesRequest>,
) -> ApiResult<Json<TimeseriesResponse>> {
    let points = sup.export.build_timeseries(
        &req.node,
        &req.data_field,
        req.max_points,
        req.from,
        req.to,
        req.consolidation,
    )?;
    Ok(Json(TimeseriesResponse { points }))
}
