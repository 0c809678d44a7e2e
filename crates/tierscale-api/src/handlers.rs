//! REST API handlers.
//!
//! Feeds write into the metrics collector and the owning instance manager;
//! queries read from the directory and the managers. Every JSON response
//! uses the same `{success, data, error}` envelope.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tierscale_directory::ResolveMode;
use tierscale_lifecycle::LifecycleError;
use tierscale_metrics::{TierReport, render_prometheus};
use tierscale_state::{ScalingPolicy, Tier, Timestamp, epoch_secs};
use tierscale_stateful::AllocatorError;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn unknown_service(name: &str) -> axum::response::Response {
    error_response(&format!("service not found: {name}"), StatusCode::NOT_FOUND).into_response()
}

// ── Feeds ──────────────────────────────────────────────────────

/// One sample from the metrics feed.
#[derive(Debug, Deserialize)]
pub struct MetricReport {
    pub instance_id: String,
    pub utilization: f64,
    /// Defaults to the time of receipt.
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

/// POST /v1/metrics
pub async fn record_metric(
    State(state): State<ApiState>,
    Json(report): Json<MetricReport>,
) -> impl IntoResponse {
    let timestamp = report.timestamp.unwrap_or_else(epoch_secs);
    match state
        .metrics
        .record(&report.instance_id, report.utilization, timestamp)
        .await
    {
        Ok(()) => (StatusCode::ACCEPTED, ApiResponse::ok("recorded")).into_response(),
        Err(e) => {
            debug!(instance = %report.instance_id, error = %e, "sample rejected");
            error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response()
        }
    }
}

/// One report from the readiness feed.
#[derive(Debug, Deserialize)]
pub struct ReadinessReport {
    pub instance_id: String,
    pub ready: bool,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

/// POST /v1/readiness
///
/// Routed to whichever manager owns the instance.
pub async fn report_readiness(
    State(state): State<ApiState>,
    Json(report): Json<ReadinessReport>,
) -> impl IntoResponse {
    let timestamp = report.timestamp.unwrap_or_else(epoch_secs);

    if state.lifecycle.is_known(&report.instance_id).await {
        return match state
            .lifecycle
            .report_readiness(&report.instance_id, report.ready, timestamp)
            .await
        {
            Ok(()) => ApiResponse::ok("applied").into_response(),
            Err(LifecycleError::NotFound(_)) => {
                error_response("instance not found", StatusCode::NOT_FOUND).into_response()
            }
            Err(e) => {
                error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
            }
        };
    }

    for allocator in state.allocators.values() {
        if allocator.is_known(&report.instance_id).await {
            return match allocator
                .report_readiness(&report.instance_id, report.ready, timestamp)
                .await
            {
                Ok(()) => ApiResponse::ok("applied").into_response(),
                Err(AllocatorError::InstanceNotFound(_)) => {
                    error_response("instance not found", StatusCode::NOT_FOUND).into_response()
                }
                Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                    .into_response(),
            };
        }
    }

    error_response("instance not found", StatusCode::NOT_FOUND).into_response()
}

// ── Services ───────────────────────────────────────────────────

/// Scaling state of one service.
#[derive(Debug, Serialize)]
pub struct ServiceSummary {
    pub name: String,
    pub tier: Tier,
    pub desired: Option<u32>,
    pub ready: u32,
    pub halted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utilization: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commanded: Option<u32>,
}

async fn summarize(state: &ApiState, name: &str, tier: Tier) -> ServiceSummary {
    let (desired, ready, halted) = match tier {
        Tier::Stateless => (
            state.lifecycle.desired_count(name).await,
            state.lifecycle.ready_count(name).await,
            state.lifecycle.is_halted(name).await,
        ),
        Tier::Stateful => match state.allocators.get(name) {
            Some(allocator) => (
                Some(allocator.desired().await),
                allocator.ready_ordinals().await.len() as u32,
                allocator.is_halted().await,
            ),
            None => (None, 0, false),
        },
    };
    ServiceSummary {
        name: name.to_string(),
        tier,
        desired,
        ready,
        halted,
        utilization: state.metrics.aggregate(name).await.ok().map(|u| u.mean),
        commanded: state
            .store
            .get_checkpoint(name)
            .ok()
            .flatten()
            .map(|c| c.last_commanded),
    }
}

/// GET /v1/services
pub async fn list_services(State(state): State<ApiState>) -> impl IntoResponse {
    let mut summaries = Vec::new();
    for (name, tier) in state.services().await {
        summaries.push(summarize(&state, &name, tier).await);
    }
    ApiResponse::ok(summaries)
}

/// Query string of the resolve endpoint.
#[derive(Debug, Deserialize)]
pub struct ResolveParams {
    pub mode: Option<ResolveMode>,
}

/// GET /v1/services/{name}/endpoints
///
/// Defaults to pooled resolution for stateless services and ordered
/// resolution for stateful ones.
pub async fn resolve_endpoints(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(params): Query<ResolveParams>,
) -> impl IntoResponse {
    let Some(tier) = state.tier_of(&name).await else {
        return unknown_service(&name);
    };
    let mode = params.mode.unwrap_or(match tier {
        Tier::Stateless => ResolveMode::Pooled,
        Tier::Stateful => ResolveMode::Ordered,
    });
    ApiResponse::ok(state.directory.resolve(&name, mode)).into_response()
}

/// GET /v1/services/{name}/instances
pub async fn list_instances(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if let Some(allocator) = state.allocators.get(&name) {
        return ApiResponse::ok(allocator.replicas().await).into_response();
    }
    match state.lifecycle.instances(&name).await {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(LifecycleError::UnknownTier(_)) => unknown_service(&name),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /v1/services/{name}/policy
pub async fn get_policy(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.store.get_policy(&name) {
        Ok(Some(policy)) => ApiResponse::ok(policy).into_response(),
        Ok(None) => error_response("no scaling policy for service", StatusCode::NOT_FOUND)
            .into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// Scaling policy of one service.
#[derive(Debug, Serialize)]
pub struct PolicyEntry {
    pub service: String,
    pub policy: ScalingPolicy,
}

/// GET /v1/policies
pub async fn list_policies(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_policies() {
        Ok(policies) => ApiResponse::ok(
            policies
                .into_iter()
                .map(|(service, policy)| PolicyEntry { service, policy })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /v1/services/{name}/bindings
pub async fn list_bindings(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let Some(allocator) = state.allocators.get(&name) else {
        return unknown_service(&name);
    };
    match allocator.bindings().await {
        Ok(bindings) => ApiResponse::ok(bindings).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Operator actions ───────────────────────────────────────────

/// POST /v1/services/{name}/resume
///
/// Clears a creation-timeout halt (stateless) or overrides a startup stall
/// (stateful).
pub async fn resume_service(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if let Some(allocator) = state.allocators.get(&name) {
        let ordinal = allocator.override_stall(epoch_secs()).await;
        info!(service = %name, ?ordinal, "resume requested");
        return ApiResponse::ok(serde_json::json!({
            "service": name,
            "stalled_ordinal": ordinal,
        }))
        .into_response();
    }
    match state.lifecycle.clear_halt(&name).await {
        Ok(()) => {
            info!(service = %name, "resume requested");
            ApiResponse::ok(serde_json::json!({ "service": name })).into_response()
        }
        Err(LifecycleError::UnknownTier(_)) => unknown_service(&name),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// DELETE /v1/services/{name}/ordinals/{ordinal}
pub async fn terminate_ordinal(
    State(state): State<ApiState>,
    Path((name, ordinal)): Path<(String, u32)>,
) -> impl IntoResponse {
    let Some(allocator) = state.allocators.get(&name) else {
        return unknown_service(&name);
    };
    match allocator.terminate_ordinal(ordinal).await {
        Ok(()) => ApiResponse::ok(serde_json::json!({
            "service": name,
            "ordinal": ordinal,
            "status": "gone",
        }))
        .into_response(),
        Err(e @ AllocatorError::OutOfOrder { .. }) => {
            error_response(&e.to_string(), StatusCode::CONFLICT).into_response()
        }
        Err(e @ AllocatorError::OrdinalNotFound { .. }) => {
            error_response(&e.to_string(), StatusCode::NOT_FOUND).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// DELETE /v1/instances/{id}
pub async fn terminate_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.lifecycle.terminate(&id).await {
        Ok(()) => ApiResponse::ok("terminated").into_response(),
        Err(LifecycleError::NotFound(_)) => {
            error_response("instance not found", StatusCode::NOT_FOUND).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let mut reports = Vec::new();
    for (name, tier) in state.services().await {
        let summary = summarize(&state, &name, tier).await;
        reports.push(TierReport {
            tier: summary.name,
            utilization: summary.utilization,
            ready_instances: summary.ready,
            commanded: summary.commanded,
        });
    }

    let body = render_prometheus(&reports);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tierscale_directory::ServiceDirectory;
    use tierscale_lifecycle::{LifecycleManager, Provisioner};
    use tierscale_metrics::MetricsCollector;
    use tierscale_state::{EventBus, StateStore};
    use tierscale_stateful::{IdentityAllocator, StorageProvider, Transition};

    struct FakeProvisioner;

    #[async_trait]
    impl Provisioner for FakeProvisioner {
        async fn create(
            &self,
            _service: &str,
            _tier: Tier,
            instance_id: &str,
            _ordinal: Option<u32>,
        ) -> anyhow::Result<String> {
            Ok(format!("{instance_id}.internal:80"))
        }

        async fn terminate(&self, _instance_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FakeStorage;

    #[async_trait]
    impl StorageProvider for FakeStorage {
        async fn bind(&self, service: &str, ordinal: u32) -> anyhow::Result<String> {
            Ok(format!("vol-{service}-{ordinal}"))
        }

        async fn release(&self, _service: &str, _ordinal: u32, _binding: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        let events = EventBus::new(64);
        let lifecycle = LifecycleManager::new(
            Arc::new(FakeProvisioner),
            events.clone(),
            Duration::from_secs(60),
        );
        lifecycle.register_tier("web").await;
        let allocator = Arc::new(IdentityAllocator::new(
            "db",
            Arc::new(FakeProvisioner),
            Arc::new(FakeStorage),
            store.clone(),
            events,
            Duration::from_secs(60),
        ));
        ApiState {
            store,
            metrics: Arc::new(MetricsCollector::new(Duration::from_secs(60))),
            directory: Arc::new(ServiceDirectory::default()),
            lifecycle,
            allocators: Arc::new(HashMap::from([("db".to_string(), allocator)])),
        }
    }

    /// Start ordinals of `allocator` until `n` of them are Ready.
    async fn bring_up(allocator: &IdentityAllocator, n: usize) {
        for _ in 0..200 {
            if allocator.ready_ordinals().await.len() == n {
                return;
            }
            if let Transition::Started { instance_id, .. } = allocator.reconcile(1).await.unwrap() {
                allocator.report_readiness(&instance_id, true, 1).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("ordinals never became ready");
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn record_metric_accepts_and_rejects() {
        let state = test_state().await;

        let resp = record_metric(
            State(state.clone()),
            Json(MetricReport {
                instance_id: "web-1".to_string(),
                utilization: 0.4,
                timestamp: Some(100),
            }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let resp = record_metric(
            State(state),
            Json(MetricReport {
                instance_id: "web-1".to_string(),
                utilization: -1.0,
                timestamp: Some(100),
            }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn readiness_routes_to_owning_manager() {
        let state = test_state().await;
        let report = state.lifecycle.set_desired_count("web", 1).await.unwrap();
        let web = report.created[0].clone();

        state.allocators["db"].set_replicas(1).await;
        let Transition::Started { instance_id: db, .. } =
            state.allocators["db"].reconcile(1).await.unwrap()
        else {
            panic!("expected db-0 to start");
        };

        for id in [web, db.clone()] {
            let resp = report_readiness(
                State(state.clone()),
                Json(ReadinessReport {
                    instance_id: id,
                    ready: true,
                    timestamp: Some(5),
                }),
            )
            .await
            .into_response();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        // Held while Pending, applied once the creation answers.
        for _ in 0..200 {
            if !state.allocators["db"].ready_ordinals().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(state.allocators["db"].ready_ordinals().await, vec![0]);

        let resp = report_readiness(
            State(state),
            Json(ReadinessReport {
                instance_id: "ghost".to_string(),
                ready: true,
                timestamp: None,
            }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn resolve_defaults_mode_by_tier() {
        let state = test_state().await;

        let resp = resolve_endpoints(
            State(state.clone()),
            Path("web".to_string()),
            Query(ResolveParams { mode: None }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"]["mode"], "pooled");

        let resp = resolve_endpoints(
            State(state.clone()),
            Path("db".to_string()),
            Query(ResolveParams { mode: None }),
        )
        .await
        .into_response();
        assert_eq!(body_json(resp).await["data"]["mode"], "ordered");

        let resp = resolve_endpoints(
            State(state),
            Path("nope".to_string()),
            Query(ResolveParams {
                mode: Some(ResolveMode::Pooled),
            }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn policy_lookup() {
        let state = test_state().await;

        let resp = get_policy(State(state.clone()), Path("web".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let policy = ScalingPolicy {
            target_utilization: 0.5,
            min_replicas: 2,
            max_replicas: 10,
            scale_up_step_limit: 4,
            scale_down_step_limit: 1,
            stabilization_window: 3,
        };
        state.store.put_policy("web", &policy).unwrap();
        let resp = get_policy(State(state.clone()), Path("web".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["data"]["max_replicas"], 10);

        let resp = list_policies(State(state)).await.into_response();
        let body = body_json(resp).await;
        let policies = body["data"].as_array().unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0]["service"], "web");
        assert_eq!(policies[0]["policy"]["min_replicas"], 2);
    }

    #[tokio::test]
    async fn out_of_order_ordinal_termination_conflicts() {
        let state = test_state().await;
        let allocator = state.allocators["db"].clone();
        allocator.set_replicas(2).await;
        bring_up(&allocator, 2).await;
        assert_eq!(allocator.ready_ordinals().await, vec![0, 1]);

        let resp = terminate_ordinal(State(state.clone()), Path(("db".to_string(), 0)))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = terminate_ordinal(State(state.clone()), Path(("db".to_string(), 1)))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = terminate_ordinal(State(state), Path(("db".to_string(), 7)))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn terminate_unknown_instance_is_not_found() {
        let state = test_state().await;
        let resp = terminate_instance(State(state), Path("ghost".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_services_reports_both_tiers() {
        let state = test_state().await;
        state.lifecycle.set_desired_count("web", 2).await.unwrap();

        let resp = list_services(State(state)).await.into_response();
        let body = body_json(resp).await;
        let services = body["data"].as_array().unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0]["name"], "db");
        assert_eq!(services[0]["tier"], "stateful");
        assert_eq!(services[1]["name"], "web");
        assert_eq!(services[1]["desired"], 2);
    }

    #[tokio::test]
    async fn prometheus_exposition() {
        let state = test_state().await;
        let resp = prometheus_metrics(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()["content-type"],
            "text/plain; version=0.0.4; charset=utf-8"
        );
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("tierscale_ready_instances{tier=\"web\"} 0"));
        assert!(text.contains("tierscale_ready_instances{tier=\"db\"} 0"));
    }
}
