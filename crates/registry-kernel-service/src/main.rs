use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use registry_kernel_api::{
    AccessCheck, AmendReceipt, AmendRequest, ApiError, DelegateReceipt, DelegateRequest,
    GrantLookup, InscribeReceipt, InscribeRequest, MigrateResult, RegistryKernelApi,
    API_CONTRACT_VERSION,
};
use registry_kernel_core::{ErrorKind, Record, RecordId, RecordTable};
use registry_kernel_store_sqlite::{LedgerStatus, SchemaStatus};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: RegistryKernelApi,
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
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error_kind: &'static str,
    error_code: Option<u32>,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct AccessCheckRequest {
    record_id: RecordId,
    principal: String,
    #[serde(default)]
    at_height: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "registry-kernel-service")]
#[command(about = "Local HTTP service for the Registry Kernel")]
struct Args {
    /// YAML file with `db`, `bind` and `log_filter` keys; flags override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    bind: Option<SocketAddr>,
    #[arg(long)]
    log_filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServiceConfig {
    db: PathBuf,
    bind: SocketAddr,
    log_filter: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db: PathBuf::from("./registry_kernel.sqlite3"),
            bind: SocketAddr::from(([127, 0, 0, 1], 4010)),
            log_filter: "info".to_string(),
        }
    }
}

impl ServiceConfig {
    fn resolve(args: Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?
            }
            None => Self::default(),
        };
        if let Some(db) = args.db {
            config.db = db;
        }
        if let Some(bind) = args.bind {
            config.bind = bind;
        }
        if let Some(log_filter) = args.log_filter {
            config.log_filter = log_filter;
        }
        Ok(config)
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error_kind: "invalid_request",
            error_code: None,
            error: message.into(),
        }
    }
}

impl From<ApiError> for ServiceError {
    fn from(value: ApiError) -> Self {
        match value.kind() {
            Some(kind) => Self {
                status: status_for(kind),
                service_contract_version: SERVICE_CONTRACT_VERSION,
                error_kind: kind.as_str(),
                error_code: Some(kind.code()),
                error: value.to_string(),
            },
            None => {
                error!(error = %format!("{value:#}"), "internal service failure");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    service_contract_version: SERVICE_CONTRACT_VERSION,
                    error_kind: "internal",
                    error_code: None,
                    error: value.to_string(),
                }
            }
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::AccessDenied | ErrorKind::AuthorizationLacking => StatusCode::FORBIDDEN,
        ErrorKind::RecordMissing => StatusCode::NOT_FOUND,
        ErrorKind::DuplicateEntry => StatusCode::CONFLICT,
        ErrorKind::ParameterError
        | ErrorKind::DescriptorProblem
        | ErrorKind::TimeframeInvalid
        | ErrorKind::ClearanceMismatch
        | ErrorKind::ClassificationError => StatusCode::BAD_REQUEST,
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

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/records/inscribe", post(records_inscribe))
        .route("/v1/records/amend", post(records_amend))
        .route("/v1/records/:table/:record_id", get(records_show))
        .route("/v1/delegations/grant", post(delegations_grant))
        .route("/v1/delegations/:record_id/:recipient", get(delegations_show))
        .route("/v1/access/check", post(access_check))
        .route("/v1/ledger/status", get(ledger_status))
        .with_state(state)
}

fn init_tracing(filter: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter)
            .with_context(|| format!("invalid log filter `{filter}`"))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::resolve(Args::parse())?;
    init_tracing(&config.log_filter)?;

    let state = ServiceState { api: RegistryKernelApi::new(config.db.clone()) };
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(bind = %config.bind, db = %config.db.display(), "registry kernel service listening");
    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to install ctrl-c handler");
    }
    info!("shutting down registry kernel service");
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status()?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run)?;
    Ok(Json(envelope(result)))
}

async fn records_inscribe(
    State(state): State<ServiceState>,
    Json(request): Json<InscribeRequest>,
) -> Result<Json<ServiceEnvelope<InscribeReceipt>>, ServiceError> {
    let receipt = state.api.inscribe(request)?;
    Ok(Json(envelope(receipt)))
}

async fn records_amend(
    State(state): State<ServiceState>,
    Json(request): Json<AmendRequest>,
) -> Result<Json<ServiceEnvelope<AmendReceipt>>, ServiceError> {
    let receipt = state.api.amend(request)?;
    Ok(Json(envelope(receipt)))
}

async fn records_show(
    State(state): State<ServiceState>,
    Path((table, record_id)): Path<(String, u64)>,
) -> Result<Json<ServiceEnvelope<Record>>, ServiceError> {
    let Some(table) = RecordTable::parse(&table) else {
        return Err(ServiceError::invalid_request(format!(
            "unknown record table `{table}`; expected primary or optimized"
        )));
    };
    let record = state.api.record_show(table, RecordId(record_id))?;
    Ok(Json(envelope(record)))
}

async fn delegations_grant(
    State(state): State<ServiceState>,
    Json(request): Json<DelegateRequest>,
) -> Result<Json<ServiceEnvelope<DelegateReceipt>>, ServiceError> {
    let receipt = state.api.delegate(request)?;
    Ok(Json(envelope(receipt)))
}

async fn delegations_show(
    State(state): State<ServiceState>,
    Path((record_id, recipient)): Path<(u64, String)>,
) -> Result<Json<ServiceEnvelope<GrantLookup>>, ServiceError> {
    let lookup = state.api.grant_show(RecordId(record_id), &recipient)?;
    Ok(Json(envelope(lookup)))
}

async fn access_check(
    State(state): State<ServiceState>,
    Json(request): Json<AccessCheckRequest>,
) -> Result<Json<ServiceEnvelope<AccessCheck>>, ServiceError> {
    let check = state.api.access_check(request.record_id, &request.principal, request.at_height)?;
    Ok(Json(envelope(check)))
}

async fn ledger_status(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<LedgerStatus>>, ServiceError> {
    let status = state.api.ledger_status()?;
    Ok(Json(envelope(status)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("registrykernel-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_router(db_path: &std::path::Path) -> Router {
        app(ServiceState { api: RegistryKernelApi::new(db_path.to_path_buf()) })
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body.to_string())),
            None => builder.body(axum::body::Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        let response = match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        let status = response.status();
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => (status, value),
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn doc_a(actor: &str) -> serde_json::Value {
        serde_json::json!({
            "actor": actor,
            "designation": "doc-A",
            "seal": "f".repeat(64),
            "descriptor": "first record",
            "classification": "public",
            "taxonomy": ["alpha"]
        })
    }

    fn amend_payload(actor: &str, descriptor: &str) -> serde_json::Value {
        serde_json::json!({
            "actor": actor,
            "record_id": 1,
            "designation": "doc-A",
            "seal": "f".repeat(64),
            "descriptor": descriptor,
            "taxonomy": ["alpha"]
        })
    }

    fn field(value: &serde_json::Value, pointer: &str) -> serde_json::Value {
        value
            .pointer(pointer)
            .cloned()
            .unwrap_or_else(|| panic!("missing {pointer} in response: {value}"))
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = test_router(&unique_temp_db_path());
        let (status, value) = send(&router, "GET", "/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(field(&value, "/service_contract_version"), SERVICE_CONTRACT_VERSION);
        assert_eq!(field(&value, "/data/status"), "ok");
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let router = test_router(&unique_temp_db_path());
        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/openapi")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/records/inscribe"));
        assert!(body.contains("/v1/delegations/grant"));
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn inscribe_amend_and_show_round_trip() {
        let db_path = unique_temp_db_path();
        let router = test_router(&db_path);

        let (status, value) = send(&router, "POST", "/v1/records/inscribe", Some(doc_a("alice"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(field(&value, "/api_contract_version"), API_CONTRACT_VERSION);
        assert_eq!(field(&value, "/data/record_id"), 1);
        assert_eq!(field(&value, "/data/table"), "primary");

        let (status, value) =
            send(&router, "POST", "/v1/records/amend", Some(amend_payload("alice", "revised"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(field(&value, "/data/amended"), true);

        let (status, value) = send(&router, "GET", "/v1/records/primary/1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(field(&value, "/data/descriptor"), "revised");
        assert_eq!(field(&value, "/data/owner"), "alice");
        assert_eq!(field(&value, "/data/created_at"), 1);
        assert_eq!(field(&value, "/data/updated_at"), 2);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn typed_rejections_map_to_http_statuses() {
        let db_path = unique_temp_db_path();
        let router = test_router(&db_path);
        let (status, _) = send(&router, "POST", "/v1/records/inscribe", Some(doc_a("alice"))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, value) =
            send(&router, "POST", "/v1/records/amend", Some(amend_payload("mallory", "hijacked"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(field(&value, "/error_kind"), "access_denied");
        assert_eq!(field(&value, "/error_code"), 100);

        let (status, value) = send(&router, "GET", "/v1/records/optimized/1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(field(&value, "/error_kind"), "record_missing");

        let mut invalid = doc_a("alice");
        invalid["taxonomy"] = serde_json::json!([]);
        let (status, value) = send(&router, "POST", "/v1/records/inscribe", Some(invalid)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(field(&value, "/error_kind"), "descriptor_problem");
        assert_eq!(field(&value, "/error_code"), 104);

        let (status, value) = send(&router, "GET", "/v1/records/archive/1", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(field(&value, "/error_kind"), "invalid_request");

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn delegation_grant_show_and_access_check() {
        let db_path = unique_temp_db_path();
        let router = test_router(&db_path);
        let (status, _) = send(&router, "POST", "/v1/records/inscribe", Some(doc_a("alice"))).await;
        assert_eq!(status, StatusCode::OK);

        let grant = serde_json::json!({
            "actor": "alice",
            "record_id": 1,
            "recipient": "bob",
            "clearance": "enhanced",
            "span": 10
        });
        let (status, value) = send(&router, "POST", "/v1/delegations/grant", Some(grant.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(field(&value, "/data/grant/sunset_at"), 12);
        assert_eq!(field(&value, "/data/grant/mutation_permitted"), false);

        let mut too_long = grant;
        too_long["span"] = serde_json::json!(52_561);
        let (status, value) = send(&router, "POST", "/v1/delegations/grant", Some(too_long)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(field(&value, "/error_kind"), "timeframe_invalid");

        let (status, value) = send(&router, "GET", "/v1/delegations/1/bob", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(field(&value, "/data/active"), true);
        assert_eq!(field(&value, "/data/grant/clearance"), "enhanced");

        let check = serde_json::json!({ "record_id": 1, "principal": "bob", "at_height": 12 });
        let (status, value) = send(&router, "POST", "/v1/access/check", Some(check)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(field(&value, "/data/access/access"), "expired");

        let (status, value) = send(&router, "GET", "/v1/ledger/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(field(&value, "/data/last_record_id"), 1);
        assert_eq!(field(&value, "/data/ledger_height"), 2);
        assert_eq!(field(&value, "/data/access_grants"), 1);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-006
    #[test]
    fn config_file_values_yield_to_flags() -> Result<()> {
        let config_path =
            std::env::temp_dir().join(format!("registrykernel-service-{}.yaml", ulid::Ulid::new()));
        std::fs::write(
            &config_path,
            "db: /var/lib/registry/ledger.sqlite3\nbind: 0.0.0.0:5000\nlog_filter: debug\n",
        )?;
        let config_arg = config_path.display().to_string();

        let from_file = ServiceConfig::resolve(Args::try_parse_from([
            "registry-kernel-service",
            "--config",
            config_arg.as_str(),
        ])?)?;
        assert_eq!(from_file.db, PathBuf::from("/var/lib/registry/ledger.sqlite3"));
        assert_eq!(from_file.bind, SocketAddr::from(([0, 0, 0, 0], 5000)));
        assert_eq!(from_file.log_filter, "debug");

        let overridden = ServiceConfig::resolve(Args::try_parse_from([
            "registry-kernel-service",
            "--config",
            config_arg.as_str(),
            "--bind",
            "127.0.0.1:4999",
        ])?)?;
        assert_eq!(overridden.bind, SocketAddr::from(([127, 0, 0, 1], 4999)));
        assert_eq!(overridden.db, from_file.db);

        let defaults = ServiceConfig::resolve(Args::try_parse_from(["registry-kernel-service"])?)?;
        assert_eq!(defaults, ServiceConfig::default());

        std::fs::remove_file(&config_path)?;
        Ok(())
    }
}
