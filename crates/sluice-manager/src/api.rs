//! The HTTP control surface.
//!
//! JSON in, JSON out (except `GET /graph`, which also renders dot or
//! mermaid depending on `Accept`). Errors come back as
//! [`ErrorResponse`](sluice_types::error::ErrorResponse) bodies with
//! the status mapping of [`ManagerError`].

use crate::error::ManagerError;
use crate::exports::ExportStore;
use crate::supervisor::{LayerSpec, Supervisor};
use actix_web::http::header;
use actix_web::{get, post, put, web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use sluice::export::Consolidation;
use sluice_types::graph::NodeRef;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use utoipa::{IntoParams, OpenApi, ToSchema};

pub struct ServerState {
    pub supervisor: Arc<Mutex<Supervisor>>,
    pub exports: Arc<ExportStore>,
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Sluice API",
        description = "Declare, compile and run operator graphs; inspect their output."
    ),
    paths(
        get_graph,
        get_graph_layer,
        put_graph,
        compile_all,
        compile_layer,
        run_all,
        run_layer,
        start_all,
        start_layer,
        stop_all,
        stop_layer,
        export_get,
        export_post,
        put_report,
        complete_nodes,
        complete_fields,
        timeseries,
    )
)]
pub struct ApiDoc;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route(
        "/openapi.json",
        web::get().to(|| async { HttpResponse::Ok().json(ApiDoc::openapi()) }),
    )
    .service(get_graph)
        .service(get_graph_layer)
        .service(put_graph)
        .service(compile_all)
        .service(compile_layer)
        .service(run_all)
        .service(run_layer)
        .service(start_all)
        .service(start_layer)
        .service(stop_all)
        .service(stop_layer)
        .service(export_get)
        .service(export_post)
        .service(put_report)
        .service(complete_nodes)
        .service(complete_fields)
        .service(timeseries);
}

fn parse_node_ref(layer: &str, node: &str) -> NodeRef {
    NodeRef::new(layer, node)
}

/// Render the graph per the Accept header.
async fn render_graph(
    req: &HttpRequest,
    state: &ServerState,
    layer: Option<&str>,
) -> Result<HttpResponse, ManagerError> {
    let accept = req
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");
    let sup = state.supervisor.lock().await;
    if let Some(name) = layer {
        if !sup.graph().layers.contains_key(name) {
            return Err(ManagerError::UnknownLayer { name: name.into() });
        }
    }
    if accept.contains("text/vnd.graphviz") || accept.contains("text/dot") {
        Ok(HttpResponse::Ok()
            .content_type("text/vnd.graphviz")
            .body(sup.to_dot(layer)))
    } else if accept.contains("mermaid") {
        Ok(HttpResponse::Ok()
            .content_type("text/x-mermaid")
            .body(sup.to_mermaid(layer)))
    } else if accept.contains("application/json") || accept.contains("*/*") {
        match layer {
            None => Ok(HttpResponse::Ok().json(sup.graph())),
            Some(name) => Ok(HttpResponse::Ok().json(&sup.graph().layers[name])),
        }
    } else {
        Err(ManagerError::UnknownAccept {
            accept: accept.to_string(),
        })
    }
}

/// Return the whole graph (JSON, dot or mermaid per Accept).
#[utoipa::path(responses((status = OK, description = "The graph.")))]
#[get("/graph")]
async fn get_graph(
    req: HttpRequest,
    state: web::Data<ServerState>,
) -> Result<HttpResponse, ManagerError> {
    render_graph(&req, &state, None).await
}

/// Return one layer (JSON, dot or mermaid per Accept).
#[utoipa::path(responses(
    (status = OK, description = "The layer."),
    (status = NOT_FOUND, description = "No such layer.")
))]
#[get("/graph/{layer}")]
async fn get_graph_layer(
    req: HttpRequest,
    state: web::Data<ServerState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ManagerError> {
    render_graph(&req, &state, Some(path.as_str())).await
}

/// Create a layer.
#[utoipa::path(
    request_body = LayerSpec,
    responses(
        (status = CREATED, description = "Layer created."),
        (status = BAD_REQUEST, description = "Parse error or broken link.")
    )
)]
#[put("/graph")]
async fn put_graph(
    state: web::Data<ServerState>,
    body: web::Json<LayerSpec>,
) -> Result<HttpResponse, ManagerError> {
    state.supervisor.lock().await.put_layer(body.into_inner())?;
    Ok(HttpResponse::Created().finish())
}

/// Type and compile every layer still in edition.
#[utoipa::path(responses((status = OK, description = "All layers compiled.")))]
#[get("/compile")]
async fn compile_all(state: web::Data<ServerState>) -> Result<HttpResponse, ManagerError> {
    state.supervisor.lock().await.compile(None)?;
    Ok(HttpResponse::Ok().finish())
}

/// Type and compile one layer.
#[utoipa::path(responses(
    (status = OK, description = "Layer compiled."),
    (status = BAD_REQUEST, description = "Type error.")
))]
#[get("/compile/{layer}")]
async fn compile_layer(
    state: web::Data<ServerState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ManagerError> {
    state.supervisor.lock().await.compile(Some(&path))?;
    Ok(HttpResponse::Ok().finish())
}

/// Start every compiled layer, parents first.
#[utoipa::path(responses((status = OK, description = "Compiled layers running.")))]
#[get("/run")]
async fn run_all(state: web::Data<ServerState>) -> Result<HttpResponse, ManagerError> {
    state.supervisor.lock().await.run_all().await?;
    Ok(HttpResponse::Ok().finish())
}

/// Start a compiled layer.
#[utoipa::path(responses((status = OK, description = "Layer running.")))]
#[get("/run/{layer}")]
async fn run_layer(
    state: web::Data<ServerState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ManagerError> {
    state.supervisor.lock().await.run(&path).await?;
    Ok(HttpResponse::Ok().finish())
}

/// Alias of `/run`.
#[utoipa::path(responses((status = OK, description = "Compiled layers running.")))]
#[get("/start")]
async fn start_all(state: web::Data<ServerState>) -> Result<HttpResponse, ManagerError> {
    state.supervisor.lock().await.run_all().await?;
    Ok(HttpResponse::Ok().finish())
}

/// Alias of `/run/{layer}`.
#[utoipa::path(responses((status = OK, description = "Layer running.")))]
#[get("/start/{layer}")]
async fn start_layer(
    state: web::Data<ServerState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ManagerError> {
    state.supervisor.lock().await.run(&path).await?;
    Ok(HttpResponse::Ok().finish())
}

/// Stop every running layer, children first.
#[utoipa::path(responses((status = OK, description = "All layers stopped.")))]
#[get("/stop")]
async fn stop_all(state: web::Data<ServerState>) -> Result<HttpResponse, ManagerError> {
    state.supervisor.lock().await.stop_all().await?;
    Ok(HttpResponse::Ok().finish())
}

/// Stop a running layer.
#[utoipa::path(responses((status = OK, description = "Layer stopped.")))]
#[get("/stop/{layer}")]
async fn stop_layer(
    state: web::Data<ServerState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ManagerError> {
    state.supervisor.lock().await.stop(&path).await?;
    Ok(HttpResponse::Ok().finish())
}

#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct ExportParams {
    /// Only tuples with a sequence number above this one.
    pub since: Option<u64>,
    pub max_results: Option<usize>,
    /// Long-poll up to this many seconds when nothing is new.
    pub wait_up_to: Option<f64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ExportResponse {
    #[schema(value_type = Vec<Object>)]
    pub tuples: Vec<serde_json::Value>,
}

async fn do_export(
    state: &ServerState,
    layer: &str,
    node: &str,
    params: ExportParams,
) -> Result<HttpResponse, ManagerError> {
    let nref = parse_node_ref(layer, node);
    {
        let sup = state.supervisor.lock().await;
        let n = sup.node(&nref)?;
        if n.operation.export().is_none() {
            return Err(ManagerError::NotExported {
                name: nref.to_string(),
            });
        }
    }
    let deadline = Instant::now()
        + Duration::from_secs_f64(params.wait_up_to.unwrap_or(0.0).clamp(0.0, 600.0));
    loop {
        let tuples = state
            .exports
            .fold(&nref, params.since, params.max_results)
            .await
            .unwrap_or_default();
        if !tuples.is_empty() || Instant::now() >= deadline {
            return Ok(HttpResponse::Ok().json(ExportResponse { tuples }));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Fetch the recent tuples of an exported node.
#[utoipa::path(params(ExportParams), responses(
    (status = OK, body = ExportResponse),
    (status = BAD_REQUEST, description = "The node does not export.")
))]
#[get("/export/{layer}/{node}")]
async fn export_get(
    state: web::Data<ServerState>,
    path: web::Path<(String, String)>,
    query: web::Query<ExportParams>,
) -> Result<HttpResponse, ManagerError> {
    let (layer, node) = path.into_inner();
    do_export(&state, &layer, &node, query.into_inner()).await
}

/// Fetch the recent tuples of an exported node (body variant).
#[utoipa::path(request_body = ExportParams, responses((status = OK, body = ExportResponse)))]
#[post("/export/{layer}/{node}")]
async fn export_post(
    state: web::Data<ServerState>,
    path: web::Path<(String, String)>,
    body: Option<web::Json<ExportParams>>,
) -> Result<HttpResponse, ManagerError> {
    let (layer, node) = path.into_inner();
    let params = body.map(|b| b.into_inner()).unwrap_or_default();
    do_export(&state, &layer, &node, params).await
}

/// Store worker telemetry on its node (opaque to the manager).
#[utoipa::path(responses((status = OK, description = "Report stored.")))]
#[put("/report/{layer}/{node}")]
async fn put_report(
    state: web::Data<ServerState>,
    path: web::Path<(String, String)>,
    body: web::Bytes,
) -> Result<HttpResponse, ManagerError> {
    let (layer, node) = path.into_inner();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap_or_else(|_| {
        serde_json::Value::String(String::from_utf8_lossy(&body).into_owned())
    });
    state
        .supervisor
        .lock()
        .await
        .report(&parse_node_ref(&layer, &node), value)?;
    Ok(HttpResponse::Ok().finish())
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CompleteNodesRequest {
    #[serde(default)]
    pub prefix: String,
}

/// Autocomplete fully qualified node names.
#[utoipa::path(request_body = CompleteNodesRequest, responses(
    (status = OK, description = "Matching node names.")
))]
#[post("/complete/nodes")]
async fn complete_nodes(
    state: web::Data<ServerState>,
    body: web::Json<CompleteNodesRequest>,
) -> Result<HttpResponse, ManagerError> {
    let names = state.supervisor.lock().await.complete_nodes(&body.prefix);
    Ok(HttpResponse::Ok().json(names))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CompleteFieldsRequest {
    /// `layer/node`.
    pub node: String,
    #[serde(default)]
    pub prefix: String,
}

/// Autocomplete output field names of one node.
#[utoipa::path(request_body = CompleteFieldsRequest, responses(
    (status = OK, description = "Matching field names.")
))]
#[post("/complete/fields")]
async fn complete_fields(
    state: web::Data<ServerState>,
    body: web::Json<CompleteFieldsRequest>,
) -> Result<HttpResponse, ManagerError> {
    let nref: NodeRef = body
        .node
        .parse()
        .map_err(|error| ManagerError::InvalidLayerSpec { error })?;
    let fields = state
        .supervisor
        .lock()
        .await
        .complete_fields(&nref, &body.prefix)?;
    Ok(HttpResponse::Ok().json(fields))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TimeseriesRequest {
    /// `layer/node`; the node must EXPORT with event-time info.
    pub node: String,
    pub data_field: String,
    pub from: f64,
    pub to: f64,
    #[serde(default = "default_max_points")]
    pub max_points: usize,
    /// `min`, `max` or `avg`.
    #[serde(default = "default_consolidation")]
    #[schema(value_type = String)]
    pub consolidation: Consolidation,
}

fn default_max_points() -> usize {
    100
}

fn default_consolidation() -> Consolidation {
    Consolidation::Avg
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TimeseriesResponse {
    /// `[time, value|null]` pairs, one per bucket.
    #[schema(value_type = Vec<Object>)]
    pub points: Vec<(f64, Option<f64>)>,
}

/// Slice an exported node's recent tuples into a time series.
#[utoipa::path(request_body = TimeseriesRequest, responses(
    (status = OK, body = TimeseriesResponse),
    (status = BAD_REQUEST, description = "No event-time info on this node.")
))]
#[post("/timeseries")]
async fn timeseries(
    state: web::Data<ServerState>,
    body: web::Json<TimeseriesRequest>,
) -> Result<HttpResponse, ManagerError> {
    let nref: NodeRef = body
        .node
        .parse()
        .map_err(|error| ManagerError::InvalidLayerSpec { error })?;
    let points = state
        .exports
        .timeseries(
            &nref,
            &body.data_field,
            body.from,
            body.to,
            body.max_points,
            body.consolidation,
        )
        .await?;
    Ok(HttpResponse::Ok().json(TimeseriesResponse { points }))
}
