use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    extract::rejection::JsonRejection,
    routing::{get, post},
};

use crate::{
    api::ApiState,
    error::Error,
    resources::machine::{
        MachineConfig, MachineRecord, MachineStatusResponse, RunRequest, RunResponse,
    },
};

pub fn router() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/machines", post(create_machine).get(list_machines))
        .route("/machines/{id}", get(get_machine).delete(delete_machine))
        .route("/machines/{id}/wait", get(wait_for_machine))
        .route("/machines/{id}/start", get(start_machine))
        .route("/machines/{id}/stop", get(stop_machine))
        .route("/machines/{id}/run", post(run_code))
}

async fn create_machine(
    State(state): State<Arc<ApiState>>,
    config: Option<Json<MachineConfig>>,
) -> Result<Json<MachineRecord>, Error> {
    let config = config.map(|Json(config)| config);
    let record = state.orchestrator.create(config).await?;
    Ok(Json(record))
}

async fn get_machine(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<MachineRecord>, Error> {
    let record = state.orchestrator.get(&id).await?;
    Ok(Json(record))
}

async fn wait_for_machine(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<MachineStatusResponse>, Error> {
    let record = state.orchestrator.wait(&id).await?;
    Ok(Json(MachineStatusResponse {
        id: record.id,
        status: record.status,
    }))
}

async fn list_machines(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<MachineRecord>>, Error> {
    let records = state.orchestrator.list().await?;
    Ok(Json(records))
}

async fn start_machine(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<&'static str>, Error> {
    state.orchestrator.start(&id).await?;
    Ok(Json("Machine restarted!"))
}

async fn stop_machine(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<&'static str>, Error> {
    state.orchestrator.stop(&id).await?;
    Ok(Json("Machine stopped!"))
}

async fn delete_machine(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<&'static str>, Error> {
    state.orchestrator.delete(&id).await?;
    Ok(Json("Machine deleted!"))
}

async fn run_code(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    body: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Json<RunResponse>, Error> {
    let Json(request) = body.map_err(|e| Error::invalid_request(e.to_string()))?;
    let response = state.orchestrator.run(&id, request).await?;
    Ok(Json(response))
}
