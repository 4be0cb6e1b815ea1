use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use clap::Parser;
use fsic_registry_api::{
    CloseMonthResult, DeleteResult, MigrateResult, RegistryApi, RenewRequest, RenewResult,
    API_CONTRACT_VERSION,
};
use fsic_registry_core::{InspectionRecord, RecordId};
use serde::{Deserialize, Serialize};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: RegistryApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct CloseMonthRequest {
    #[serde(default)]
    month: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "fsic-registry-service")]
#[command(about = "Local HTTP service for the fire-safety inspection registry")]
struct Args {
    #[arg(long, default_value = "./fsic_registry.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn parse_record_id(raw: &str) -> Result<RecordId, ServiceError> {
    RecordId::parse(raw).ok_or_else(|| ServiceState::error(format!("invalid record id: {raw}")))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/records", post(records_add).get(records_list))
        .route("/v1/records/close-month", post(records_close_month))
        .route("/v1/records/:record_id", delete(records_delete))
        .route("/v1/renewals", post(renewals_add).get(renewals_list))
        .route("/v1/renewals/latest/:entity_key", get(renewals_latest))
        .route("/v1/renewals/:record_id", delete(renewals_delete))
        .route("/v1/archive", get(archive_months))
        .route("/v1/archive/:month", get(archive_list))
        .route("/v1/archive/:month/export", get(archive_export))
        .route("/v1/archive/:month/:record_id", delete(archive_delete))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    tracing::info!(db = %args.db.display(), bind = %args.bind, "starting registry service");

    let state = ServiceState { api: RegistryApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<fsic_registry_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result =
        state.api.migrate(request.dry_run).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn records_add(
    State(state): State<ServiceState>,
    Json(record): Json<InspectionRecord>,
) -> Result<Json<ServiceEnvelope<InspectionRecord>>, ServiceError> {
    let record =
        state.api.add_record(record).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(record)))
}

async fn records_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<InspectionRecord>>>, ServiceError> {
    let records = state.api.list_current().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(records)))
}

async fn records_delete(
    State(state): State<ServiceState>,
    Path(record_id): Path<String>,
) -> Result<Json<ServiceEnvelope<DeleteResult>>, ServiceError> {
    let id = parse_record_id(&record_id)?;
    let result =
        state.api.delete_current(&id).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn records_close_month(
    State(state): State<ServiceState>,
    Json(request): Json<CloseMonthRequest>,
) -> Result<Json<ServiceEnvelope<CloseMonthResult>>, ServiceError> {
    let result =
        state.api.close_month(request.month).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn renewals_add(
    State(state): State<ServiceState>,
    Json(request): Json<RenewRequest>,
) -> Result<Json<ServiceEnvelope<RenewResult>>, ServiceError> {
    let result = state.api.renew(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn renewals_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<InspectionRecord>>>, ServiceError> {
    let records =
        state.api.list_all_renewed().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(records)))
}

async fn renewals_latest(
    State(state): State<ServiceState>,
    Path(entity_key): Path<String>,
) -> Result<Json<ServiceEnvelope<Option<InspectionRecord>>>, ServiceError> {
    let record = state
        .api
        .latest_renewed(&entity_key)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(record)))
}

async fn renewals_delete(
    State(state): State<ServiceState>,
    Path(record_id): Path<String>,
) -> Result<Json<ServiceEnvelope<DeleteResult>>, ServiceError> {
    let id = parse_record_id(&record_id)?;
    let result =
        state.api.delete_renewed(&id).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn archive_months(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<String>>>, ServiceError> {
    let months = state.api.archive_months().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(months)))
}

async fn archive_list(
    State(state): State<ServiceState>,
    Path(month): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<InspectionRecord>>>, ServiceError> {
    let records =
        state.api.list_archive(&month).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(records)))
}

async fn archive_export(
    State(state): State<ServiceState>,
    Path(month): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<InspectionRecord>>>, ServiceError> {
    let records =
        state.api.export_month(&month).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(records)))
}

async fn archive_delete(
    State(state): State<ServiceState>,
    Path((month, record_id)): Path<(String, String)>,
) -> Result<Json<ServiceEnvelope<DeleteResult>>, ServiceError> {
    let id = parse_record_id(&record_id)?;
    let result = state
        .api
        .delete_archived(&month, &id)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}
