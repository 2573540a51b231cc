pub mod machines;

use std::sync::Arc;

use axum::{
    Json, Router,
    response::{IntoResponse, Response},
};
use hyper::StatusCode;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::{error::Error, machines::MachineOrchestrator};

pub struct ApiState {
    pub orchestrator: Arc<MachineOrchestrator>,
}

pub struct ApiServerConfig {
    pub host: String,
    pub port: u16,
}

pub struct ApiServer {
    state: Arc<ApiState>,
    config: ApiServerConfig,
}

impl ApiServer {
    pub fn new(orchestrator: Arc<MachineOrchestrator>, config: ApiServerConfig) -> Self {
        Self {
            state: Arc::new(ApiState { orchestrator }),
            config,
        }
    }

    pub async fn start(self) -> crate::error::Result<()> {
        let app = Router::new()
            .merge(machines::router())
            .with_state(self.state);

        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("starting api server on {}", addr);

        let listener = TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Client mistakes get a generic message; everything else is logged in full
/// and surfaced as an opaque server error.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "Machine not found"),
            Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "Invalid request"),
            _ => {
                error!("request failed: {}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
