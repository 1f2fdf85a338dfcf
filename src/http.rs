//! HTTP surface: start, status, delete, and health endpoints.
//!
//! The status endpoint only reads the state store and always answers 200;
//! problems are reported in-band through the `failed` status.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::backend::CloudClient;
use crate::identifier::Identifier;
use crate::orchestrator::{BotSettings, FeatureFlags, ProvisioningRequest};
use crate::probe::ArtifactProbe;
use crate::registry::InstanceRecord;
use crate::session::CommandRunner;
use crate::state::{ProvisioningState, ProvisioningStatus};
use crate::supervisor::{StartOutcome, Supervisor, SupervisorError};

/// Feature toggles in a create request.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeaturesBody {
    /// Appointment booking.
    pub appointments: bool,
    /// Product catalogue.
    pub catalog: bool,
    /// Hand-off to a human operator.
    pub human_handoff: bool,
}

/// Body of `POST /instance/create`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceBody {
    /// Phone-style identifier.
    pub identifier: String,
    /// Name shown by the bot; defaults to the company name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Company name.
    pub company_name: String,
    /// Postal address.
    #[serde(default)]
    pub address: String,
    /// Feature toggles.
    #[serde(default)]
    pub features: FeaturesBody,
}

/// Body of `DELETE /instance/delete`.
#[derive(Clone, Debug, Deserialize)]
pub struct DeleteInstanceBody {
    /// Phone-style identifier.
    pub identifier: String,
}

/// Response of the create and delete endpoints.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    /// Whether the request was accepted.
    pub success: bool,
    /// Registry record when the identifier is already provisioned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_info: Option<InstanceRecord>,
    /// Failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResponse {
    fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    fn error(status: StatusCode, message: impl Into<String>) -> Response {
        let body = Self {
            success: false,
            instance_info: None,
            error: Some(message.into()),
        };
        (status, Json(body)).into_response()
    }
}

impl CreateInstanceBody {
    /// Validates the body into a [`ProvisioningRequest`].
    ///
    /// # Errors
    ///
    /// Returns a message suitable for a 400 response.
    pub fn into_request(self) -> Result<ProvisioningRequest, String> {
        let identifier = Identifier::parse(&self.identifier).map_err(|err| err.to_string())?;
        let settings = BotSettings {
            company_name: self.company_name,
            address: self.address,
            features: FeatureFlags {
                appointments: self.features.appointments,
                catalog: self.features.catalog,
                human_handoff: self.features.human_handoff,
            },
        };
        ProvisioningRequest::new(identifier, self.display_name, settings)
            .map_err(|err| err.to_string())
    }
}

/// Builds the API router.
pub fn router<C, R, P>(supervisor: Arc<Supervisor<C, R, P>>) -> Router
where
    C: CloudClient + 'static,
    R: CommandRunner + 'static,
    P: ArtifactProbe + 'static,
{
    Router::new()
        .route("/health", get(health))
        .route("/instance/status/{id}", get(status::<C, R, P>))
        .route("/instance/create", post(create::<C, R, P>))
        .route("/instance/delete", delete(remove::<C, R, P>))
        .layer(TraceLayer::new_for_http())
        .with_state(supervisor)
}

/// Serves `app` on `listener` until Ctrl-C.
///
/// # Errors
///
/// Returns the I/O error that stopped the server.
pub async fn serve(listener: TcpListener, app: Router) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("received shutdown signal");
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn status<C, R, P>(
    State(supervisor): State<Arc<Supervisor<C, R, P>>>,
    Path(raw): Path<String>,
) -> Json<ProvisioningState>
where
    C: CloudClient + 'static,
    R: CommandRunner + 'static,
    P: ArtifactProbe + 'static,
{
    let state = match Identifier::parse(&raw) {
        Ok(identifier) => supervisor
            .orchestrator()
            .store()
            .get(&identifier)
            .unwrap_or_else(ProvisioningState::not_started),
        Err(err) => ProvisioningState {
            status: ProvisioningStatus::Failed,
            progress: 0,
            error: Some(err.to_string()),
            instance_info: None,
        },
    };
    Json(state)
}

async fn create<C, R, P>(
    State(supervisor): State<Arc<Supervisor<C, R, P>>>,
    body: Result<Json<CreateInstanceBody>, JsonRejection>,
) -> Response
where
    C: CloudClient + 'static,
    R: CommandRunner + 'static,
    P: ArtifactProbe + 'static,
{
    let request = match body {
        Ok(Json(body)) => match body.into_request() {
            Ok(request) => request,
            Err(message) => return ActionResponse::error(StatusCode::BAD_REQUEST, message),
        },
        Err(rejection) => {
            return ActionResponse::error(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    match supervisor.start(request).await {
        Ok(StartOutcome::Started) => Json(ActionResponse::ok()).into_response(),
        Ok(StartOutcome::AlreadyProvisioned(record)) => Json(ActionResponse {
            success: true,
            instance_info: Some(record),
            error: None,
        })
        .into_response(),
        Err(err @ SupervisorError::AlreadyRunning { .. }) => {
            ActionResponse::error(StatusCode::CONFLICT, err.to_string())
        }
        Err(err @ SupervisorError::Teardown { .. }) => {
            ActionResponse::error(StatusCode::BAD_GATEWAY, err.to_string())
        }
        Err(err @ SupervisorError::Registry(_)) => {
            ActionResponse::error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn remove<C, R, P>(
    State(supervisor): State<Arc<Supervisor<C, R, P>>>,
    body: Result<Json<DeleteInstanceBody>, JsonRejection>,
) -> Response
where
    C: CloudClient + 'static,
    R: CommandRunner + 'static,
    P: ArtifactProbe + 'static,
{
    let identifier = match body {
        Ok(Json(body)) => match Identifier::parse(&body.identifier) {
            Ok(identifier) => identifier,
            Err(err) => return ActionResponse::error(StatusCode::BAD_REQUEST, err.to_string()),
        },
        Err(rejection) => {
            return ActionResponse::error(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    match supervisor.reset(&identifier).await {
        Ok(()) => Json(ActionResponse::ok()).into_response(),
        Err(err @ SupervisorError::Teardown { .. }) => {
            ActionResponse::error(StatusCode::BAD_GATEWAY, err.to_string())
        }
        Err(err) => ActionResponse::error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}
