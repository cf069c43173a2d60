//! Route handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use tracing::info;

use faythe_manager::ManagerState;
use faythe_model::{
    key_path, CloudProvider, HealerRule, ScalerRule, Silence, CLOUD_PREFIX, HEALER_PREFIX,
    SCALER_PREFIX, SILENCE_PREFIX,
};

use crate::ApiState;

/// Response wrapper for a consistent envelope.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> axum::response::Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

// ── Health & metrics ───────────────────────────────────────────

/// GET /healthz
pub async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    let all_active = state
        .managers
        .iter()
        .all(|m| m.status() == ManagerState::Active);
    if all_active {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "managers not active")
    }
}

/// GET /metrics
pub async fn metrics() -> impl IntoResponse {
    faythe_exporter::text()
}

// ── Clouds ─────────────────────────────────────────────────────

/// POST /clouds
pub async fn create_cloud(
    State(state): State<ApiState>,
    Json(mut cloud): Json<CloudProvider>,
) -> axum::response::Response {
    if let Err(e) = cloud.validate() {
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST);
    }
    let key = key_path(&[CLOUD_PREFIX, &cloud.id]);
    if state.kv.check_key(&key).await {
        return error_response("provider already registered", StatusCode::CONFLICT);
    }
    let raw = match serde_json::to_string(&cloud) {
        Ok(raw) => raw,
        Err(e) => return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    };
    match state.kv.do_put(&key, &raw).await {
        Ok(()) => {
            info!(id = %cloud.id, provider = %cloud.provider, "cloud provider registered");
            (StatusCode::CREATED, ApiResponse::ok(cloud)).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// GET /clouds
pub async fn list_clouds(State(state): State<ApiState>) -> axum::response::Response {
    list_prefix::<CloudProvider>(&state, &format!("{CLOUD_PREFIX}/")).await
}

/// DELETE /clouds/{id}
pub async fn delete_cloud(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    delete_key(&state, &key_path(&[CLOUD_PREFIX, &id])).await
}

// ── Scalers ────────────────────────────────────────────────────

/// POST /scalers/{provider_id}
pub async fn create_scaler(
    State(state): State<ApiState>,
    Path(provider_id): Path<String>,
    Json(mut rule): Json<ScalerRule>,
) -> axum::response::Response {
    if let Err(e) = rule.validate() {
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST);
    }
    create_rule(&state, SCALER_PREFIX, &provider_id, &rule.id, &rule).await
}

/// PUT /scalers/{provider_id}/{id}
pub async fn update_scaler(
    State(state): State<ApiState>,
    Path((provider_id, id)): Path<(String, String)>,
    Json(mut rule): Json<ScalerRule>,
) -> axum::response::Response {
    if let Err(e) = rule.validate() {
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST);
    }
    update_rule(&state, SCALER_PREFIX, &provider_id, &id, &rule).await
}

/// GET /scalers/{provider_id}
pub async fn list_scalers(
    State(state): State<ApiState>,
    Path(provider_id): Path<String>,
) -> axum::response::Response {
    list_prefix::<ScalerRule>(&state, &(key_path(&[SCALER_PREFIX, &provider_id]) + "/")).await
}

/// DELETE /scalers/{provider_id}/{id}
pub async fn delete_scaler(
    State(state): State<ApiState>,
    Path((provider_id, id)): Path<(String, String)>,
) -> axum::response::Response {
    delete_key(&state, &key_path(&[SCALER_PREFIX, &provider_id, &id])).await
}

// ── Healers ────────────────────────────────────────────────────

/// POST /healers/{provider_id}
pub async fn create_healer(
    State(state): State<ApiState>,
    Path(provider_id): Path<String>,
    Json(mut rule): Json<HealerRule>,
) -> axum::response::Response {
    if let Err(e) = rule.validate() {
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST);
    }
    create_rule(&state, HEALER_PREFIX, &provider_id, &rule.id, &rule).await
}

/// PUT /healers/{provider_id}/{id}
pub async fn update_healer(
    State(state): State<ApiState>,
    Path((provider_id, id)): Path<(String, String)>,
    Json(mut rule): Json<HealerRule>,
) -> axum::response::Response {
    if let Err(e) = rule.validate() {
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST);
    }
    update_rule(&state, HEALER_PREFIX, &provider_id, &id, &rule).await
}

/// GET /healers/{provider_id}
pub async fn list_healers(
    State(state): State<ApiState>,
    Path(provider_id): Path<String>,
) -> axum::response::Response {
    list_prefix::<HealerRule>(&state, &(key_path(&[HEALER_PREFIX, &provider_id]) + "/")).await
}

/// DELETE /healers/{provider_id}/{id}
pub async fn delete_healer(
    State(state): State<ApiState>,
    Path((provider_id, id)): Path<(String, String)>,
) -> axum::response::Response {
    delete_key(&state, &key_path(&[HEALER_PREFIX, &provider_id, &id])).await
}

// ── Silences ───────────────────────────────────────────────────

/// POST /silences/{provider_id}
pub async fn create_silence(
    State(state): State<ApiState>,
    Path(provider_id): Path<String>,
    Json(mut silence): Json<Silence>,
) -> axum::response::Response {
    if let Err(e) = silence.validate(Utc::now()) {
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST);
    }
    create_rule(&state, SILENCE_PREFIX, &provider_id, &silence.id, &silence).await
}

/// GET /silences/{provider_id}
pub async fn list_silences(
    State(state): State<ApiState>,
    Path(provider_id): Path<String>,
) -> axum::response::Response {
    list_prefix::<Silence>(&state, &(key_path(&[SILENCE_PREFIX, &provider_id]) + "/")).await
}

/// DELETE /silences/{provider_id}/{id}
pub async fn delete_silence(
    State(state): State<ApiState>,
    Path((provider_id, id)): Path<(String, String)>,
) -> axum::response::Response {
    delete_key(&state, &key_path(&[SILENCE_PREFIX, &provider_id, &id])).await
}

// ── Shared keyspace plumbing ───────────────────────────────────

/// Create a record under `/prefix/provider/id`: 400 when the provider
/// is unknown, 409 on ID collision, 201 on success.
async fn create_rule<T: serde::Serialize>(
    state: &ApiState,
    prefix: &str,
    provider_id: &str,
    id: &str,
    record: &T,
) -> axum::response::Response {
    if !state
        .kv
        .check_key(&key_path(&[CLOUD_PREFIX, provider_id]))
        .await
    {
        return error_response(
            &format!("unknown provider {provider_id}"),
            StatusCode::BAD_REQUEST,
        );
    }
    let key = key_path(&[prefix, provider_id, id]);
    if state.kv.check_key(&key).await {
        return error_response("record already exists", StatusCode::CONFLICT);
    }
    let raw = match serde_json::to_string(record) {
        Ok(raw) => raw,
        Err(e) => return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    };
    match state.kv.do_put(&key, &raw).await {
        Ok(()) => {
            info!(%key, "record created");
            (StatusCode::CREATED, ApiResponse::ok(record)).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Overwrite an existing record at `/prefix/provider/id`, 404 if absent.
async fn update_rule<T: serde::Serialize>(
    state: &ApiState,
    prefix: &str,
    provider_id: &str,
    id: &str,
    record: &T,
) -> axum::response::Response {
    let key = key_path(&[prefix, provider_id, id]);
    if !state.kv.check_key(&key).await {
        return error_response("record not found", StatusCode::NOT_FOUND);
    }
    let raw = match serde_json::to_string(record) {
        Ok(raw) => raw,
        Err(e) => return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    };
    match state.kv.do_put(&key, &raw).await {
        Ok(()) => {
            info!(%key, "record updated");
            ApiResponse::ok(record).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// List records under a prefix as a key → record object.
async fn list_prefix<T: serde::de::DeserializeOwned + serde::Serialize>(
    state: &ApiState,
    prefix: &str,
) -> axum::response::Response {
    match state.kv.do_get_prefix(prefix).await {
        Ok(kvs) => {
            let mut out = serde_json::Map::new();
            for kv in kvs {
                match serde_json::from_slice::<T>(&kv.value) {
                    Ok(record) => {
                        if let Ok(value) = serde_json::to_value(record) {
                            out.insert(kv.key, value);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(key = %kv.key, error = %e, "skipping unparsable record");
                    }
                }
            }
            ApiResponse::ok(serde_json::Value::Object(out)).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Delete a single key: 204 when it existed, 404 otherwise.
async fn delete_key(state: &ApiState, key: &str) -> axum::response::Response {
    match state.kv.do_delete(key, false).await {
        Ok(0) => error_response("record not found", StatusCode::NOT_FOUND),
        Ok(_) => {
            info!(%key, "record deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}
