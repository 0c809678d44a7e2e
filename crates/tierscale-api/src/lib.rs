//! tierscale-api — HTTP surface of the tierscale control plane.
//!
//! Accepts the inbound metrics and readiness feeds, serves endpoint
//! resolution to whatever routes traffic, and exposes the few operator
//! interventions the control plane needs (clearing a halt, terminating an
//! instance or ordinal).
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/v1/metrics` | Record a utilization sample |
//! | POST | `/v1/readiness` | Report instance readiness |
//! | GET | `/v1/services` | List services with their scaling state |
//! | GET | `/v1/services/{name}/endpoints` | Resolve endpoints (`?mode=pooled\|ordered`) |
//! | GET | `/v1/services/{name}/instances` | List instances or replicas |
//! | GET | `/v1/services/{name}/policy` | Get the scaling policy |
//! | GET | `/v1/services/{name}/bindings` | List storage bindings of a stateful service |
//! | GET | `/v1/policies` | List every persisted scaling policy |
//! | POST | `/v1/services/{name}/resume` | Clear a creation halt, startup stall or teardown halt |
//! | DELETE | `/v1/services/{name}/ordinals/{ordinal}` | Terminate a stateful ordinal |
//! | DELETE | `/v1/instances/{id}` | Terminate a stateless instance |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};

use tierscale_directory::ServiceDirectory;
use tierscale_lifecycle::LifecycleManager;
use tierscale_metrics::MetricsCollector;
use tierscale_state::{StateStore, Tier};
use tierscale_stateful::IdentityAllocator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub metrics: Arc<MetricsCollector>,
    pub directory: Arc<ServiceDirectory>,
    pub lifecycle: LifecycleManager,
    /// Stateful service name → its allocator.
    pub allocators: Arc<HashMap<String, Arc<IdentityAllocator>>>,
}

impl ApiState {
    /// Tier of a known service, or `None`.
    pub async fn tier_of(&self, service: &str) -> Option<Tier> {
        if self.allocators.contains_key(service) {
            return Some(Tier::Stateful);
        }
        if self.lifecycle.desired_count(service).await.is_some() {
            return Some(Tier::Stateless);
        }
        None
    }

    /// All known services, sorted.
    pub async fn services(&self) -> Vec<(String, Tier)> {
        let mut services: Vec<(String, Tier)> = self
            .lifecycle
            .tiers()
            .await
            .into_iter()
            .map(|name| (name, Tier::Stateless))
            .chain(self.allocators.keys().map(|name| (name.clone(), Tier::Stateful)))
            .collect();
        services.sort_by(|a, b| a.0.cmp(&b.0));
        services
    }
}

/// Build the complete API router (REST + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/metrics", post(handlers::record_metric))
        .route("/readiness", post(handlers::report_readiness))
        .route("/services", get(handlers::list_services))
        .route("/services/{name}/endpoints", get(handlers::resolve_endpoints))
        .route("/services/{name}/instances", get(handlers::list_instances))
        .route("/services/{name}/policy", get(handlers::get_policy))
        .route("/services/{name}/bindings", get(handlers::list_bindings))
        .route("/policies", get(handlers::list_policies))
        .route("/services/{name}/resume", post(handlers::resume_service))
        .route(
            "/services/{name}/ordinals/{ordinal}",
            delete(handlers::terminate_ordinal),
        )
        .route("/instances/{id}", delete(handlers::terminate_instance))
        .with_state(state.clone());

    Router::new()
        .nest("/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
