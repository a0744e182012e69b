// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Agent RPC surface: authenticated JSON `POST` endpoints under `/agent_api/`.
//!
//! Handlers hold no state of their own; they unwrap the request, call the
//! mutator or the reader and wrap the result in an [`AgentResponse`].

use std::sync::Arc;

use axum::{
	extract::{FromRequest, Request, State},
	http::StatusCode,
	middleware::{self, Next},
	response::{IntoResponse, Response},
	routing::post,
	Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use wgfleet_common_secret::SecretString;
use wgfleet_proto::{
	AgentResponse, ClientConfig, ClientConfigRequest, ClientDetail, ClientDetailRequest, CreateClientRequest,
	CreateInterfaceRequest, CreatedClient, CreatedInterface, DashboardRequest, DashboardStats, DeleteClientRequest,
	DeleteInterfaceRequest, DeletedInterface, Empty, ErrorCode, HealthInfo, HealthRequest, Operation, SyncReport,
	SyncRequest, TrafficDump, TrafficDumpRequest, UpdateClientRequest, UpdateInterfaceRequest, API_KEY_HEADER,
};

use crate::config::AgentConfig;
use crate::daemon::TunnelDaemon;
use crate::error::AgentError;
use crate::mutator::LocalConfigMutator;
use crate::reader::NodeReader;
use crate::store::{interface_name, LocalStore};

#[derive(Clone)]
pub struct AgentState {
	api_key: SecretString,
	mutator: Arc<LocalConfigMutator>,
	reader: Arc<NodeReader>,
}

impl AgentState {
	pub fn new(config: Arc<AgentConfig>, store: LocalStore, daemon: Arc<dyn TunnelDaemon>) -> Self {
		Self {
			api_key: config.api_key.clone(),
			mutator: Arc::new(LocalConfigMutator::new(config.clone(), store.clone(), daemon.clone())),
			reader: Arc::new(NodeReader::new(config, store, daemon)),
		}
	}
}

type RpcResult<T> = Result<Json<AgentResponse<T>>, AgentError>;

fn ok<T>(message: impl Into<String>, data: T) -> RpcResult<T> {
	Ok(Json(AgentResponse::success(message, data)))
}

impl IntoResponse for AgentError {
	fn into_response(self) -> Response {
		let status = self.status();
		if status.is_server_error() {
			error!(error = %self, "agent request failed");
		}
		(status, Json(AgentResponse::<()>::failure(self.code(), self.to_string()))).into_response()
	}
}

/// `Json` whose rejections become a `bad_request` envelope.
pub struct AgentJson<T>(pub T);

impl<T, S> FromRequest<S> for AgentJson<T>
where
	T: DeserializeOwned,
	S: Send + Sync,
{
	type Rejection = AgentError;

	async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
		match Json::<T>::from_request(req, state).await {
			Ok(Json(value)) => Ok(Self(value)),
			Err(rejection) => Err(AgentError::BadRequest(rejection.body_text())),
		}
	}
}

fn unauthorized() -> Response {
	(
		StatusCode::UNAUTHORIZED,
		Json(AgentResponse::<()>::failure(ErrorCode::Unauthorized, "unauthorized")),
	)
		.into_response()
}

/// Compares `X-API-Key` with the configured key in constant time.
pub async fn require_api_key(State(state): State<AgentState>, request: Request, next: Next) -> Response {
	let Some(presented) = request
		.headers()
		.get(API_KEY_HEADER)
		.and_then(|h| h.to_str().ok())
	else {
		warn!(path = %request.uri().path(), "agent auth failed: missing API key header");
		return unauthorized();
	};

	let expected = state.api_key.expose().as_bytes();
	let presented = presented.as_bytes();
	if expected.len() != presented.len() || !bool::from(expected.ct_eq(presented)) {
		warn!(path = %request.uri().path(), "agent auth failed: invalid API key");
		return unauthorized();
	}

	next.run(request).await
}

pub fn router(state: AgentState) -> Router {
	Router::new()
		.route(Operation::Health.path(), post(health))
		.route(Operation::Dashboard.path(), post(dashboard))
		.route(Operation::TrafficDump.path(), post(traffic_dump))
		.route(Operation::Sync.path(), post(sync))
		.route(Operation::InterfaceCreate.path(), post(create_interface))
		.route(Operation::InterfaceUpdate.path(), post(update_interface))
		.route(Operation::InterfaceDelete.path(), post(delete_interface))
		.route(Operation::ClientCreate.path(), post(create_client))
		.route(Operation::ClientUpdate.path(), post(update_client))
		.route(Operation::ClientDelete.path(), post(delete_client))
		.route(Operation::ClientConfig.path(), post(client_config))
		.route(Operation::ClientDetail.path(), post(client_detail))
		.fallback(not_found)
		.layer(middleware::from_fn_with_state(state.clone(), require_api_key))
		.layer(TraceLayer::new_for_http())
		.with_state(state)
}

async fn not_found() -> AgentError {
	AgentError::NotFound("operation".to_string())
}

async fn health(State(state): State<AgentState>, AgentJson(_): AgentJson<HealthRequest>) -> RpcResult<HealthInfo> {
	ok("healthy", state.reader.health().await?)
}

async fn dashboard(
	State(state): State<AgentState>,
	AgentJson(_): AgentJson<DashboardRequest>,
) -> RpcResult<DashboardStats> {
	ok("dashboard", state.reader.dashboard().await?)
}

async fn traffic_dump(
	State(state): State<AgentState>,
	AgentJson(_): AgentJson<TrafficDumpRequest>,
) -> RpcResult<TrafficDump> {
	ok("traffic", state.reader.traffic_dump().await?)
}

async fn sync(State(state): State<AgentState>, AgentJson(req): AgentJson<SyncRequest>) -> RpcResult<SyncReport> {
	ok("synced", state.mutator.sync(req.reload_interfaces, req.backup).await?)
}

async fn create_interface(
	State(state): State<AgentState>,
	AgentJson(req): AgentJson<CreateInterfaceRequest>,
) -> RpcResult<CreatedInterface> {
	let created = state.mutator.create_interface(req.address_range, req.port).await?;
	ok(
		format!("interface {} created", interface_name(created.index)),
		CreatedInterface {
			index: created.index,
			public_key: *created.key_pair.public_key(),
		},
	)
}

async fn update_interface(
	State(state): State<AgentState>,
	AgentJson(req): AgentJson<UpdateInterfaceRequest>,
) -> RpcResult<Empty> {
	state.mutator.update_interface(&req).await?;
	ok(format!("interface {} updated", interface_name(req.index)), Empty {})
}

async fn delete_interface(
	State(state): State<AgentState>,
	AgentJson(req): AgentJson<DeleteInterfaceRequest>,
) -> RpcResult<DeletedInterface> {
	let removed_clients = state.mutator.delete_interface(req.index).await?;
	ok(
		format!("interface {} deleted", interface_name(req.index)),
		DeletedInterface { removed_clients },
	)
}

async fn create_client(
	State(state): State<AgentState>,
	AgentJson(req): AgentJson<CreateClientRequest>,
) -> RpcResult<CreatedClient> {
	let created = state.mutator.create_client(&req).await?;
	ok(
		format!("client {} created", created.name),
		CreatedClient {
			name: created.name,
			public_key: created.public_key,
			address: created.address,
			config: created.config,
		},
	)
}

async fn update_client(
	State(state): State<AgentState>,
	AgentJson(req): AgentJson<UpdateClientRequest>,
) -> RpcResult<Empty> {
	state.mutator.update_client(&req).await?;
	ok(format!("client {} updated", req.name), Empty {})
}

async fn delete_client(
	State(state): State<AgentState>,
	AgentJson(req): AgentJson<DeleteClientRequest>,
) -> RpcResult<Empty> {
	state.mutator.delete_client(&req.name).await?;
	ok(format!("client {} deleted", req.name), Empty {})
}

async fn client_config(
	State(state): State<AgentState>,
	AgentJson(req): AgentJson<ClientConfigRequest>,
) -> RpcResult<ClientConfig> {
	let config = state.mutator.client_config(&req.name).await?;
	ok("client config", ClientConfig { config })
}

async fn client_detail(
	State(state): State<AgentState>,
	AgentJson(req): AgentJson<ClientDetailRequest>,
) -> RpcResult<ClientDetail> {
	ok("client detail", state.mutator.client_detail(&req.name).await?)
}
