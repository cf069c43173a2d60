//! faythe-api — HTTP surface for rule and provider management.
//!
//! Every write validates before it touches the keyspace; invalid
//! payloads never reach the managers.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/clouds` | Register a cloud provider |
//! | GET | `/clouds` | List providers |
//! | DELETE | `/clouds/{id}` | Remove a provider |
//! | POST | `/scalers/{provider_id}` | Create a scaler rule |
//! | GET | `/scalers/{provider_id}` | List scaler rules |
//! | PUT | `/scalers/{provider_id}/{id}` | Update a scaler rule |
//! | DELETE | `/scalers/{provider_id}/{id}` | Delete a scaler rule |
//! | POST/GET/PUT/DELETE | `/healers/...` | Mirror set for healers |
//! | POST/GET/DELETE | `/silences/...` | Mirror set for silences |
//! | GET | `/healthz` | 200 when every manager is Active |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;

use std::sync::Arc;

use axum::routing::{delete, get, post, put};
use axum::Router;

use faythe_kv::KvClient;
use faythe_manager::Manager;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub kv: KvClient,
    /// Managers whose states back `/healthz`.
    pub managers: Vec<Arc<Manager>>,
}

/// Build the full router.
pub fn build_router(kv: KvClient, managers: Vec<Arc<Manager>>) -> Router {
    let state = ApiState { kv, managers };
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/clouds", post(handlers::create_cloud).get(handlers::list_clouds))
        .route("/clouds/{id}", delete(handlers::delete_cloud))
        .route(
            "/scalers/{provider_id}",
            post(handlers::create_scaler).get(handlers::list_scalers),
        )
        .route(
            "/scalers/{provider_id}/{id}",
            put(handlers::update_scaler).delete(handlers::delete_scaler),
        )
        .route(
            "/healers/{provider_id}",
            post(handlers::create_healer).get(handlers::list_healers),
        )
        .route(
            "/healers/{provider_id}/{id}",
            put(handlers::update_healer).delete(handlers::delete_healer),
        )
        .route(
            "/silences/{provider_id}",
            post(handlers::create_silence).get(handlers::list_silences),
        )
        .route(
            "/silences/{provider_id}/{id}",
            delete(handlers::delete_silence),
        )
        .with_state(state)
}
