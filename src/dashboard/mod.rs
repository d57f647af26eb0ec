use std::net::SocketAddr;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::bus::{NodeId, TaskId};
use crate::fleet::FleetView;

#[derive(Serialize)]
struct NodeResponse {
    id: NodeId,
    name: String,
    capacity: u32,
    total_time: f64,
    tasks: Vec<TaskId>,
    phase: String,
    partner: Option<NodeId>,
    rounds: u32,
    unchanged_rounds: u32,
}

#[derive(Serialize)]
struct TaskResponse {
    id: TaskId,
    complexity: u32,
    phase: String,
    assigned_node: Option<NodeId>,
    bid_round: u64,
    evictions: u32,
}

/// Read-only status API over a running fleet.
pub fn router(view: FleetView) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/nodes", get(list_nodes_handler))
        .route("/api/tasks", get(list_tasks_handler))
        .route("/api/fleet", get(fleet_handler))
        .layer(cors)
        .with_state(view)
}

pub async fn run_dashboard(addr: SocketAddr, view: FleetView, shutdown: CancellationToken) {
    let app = router(view);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    let stopped = async move { shutdown.cancelled().await };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(stopped)
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn list_nodes_handler(State(view): State<FleetView>) -> impl IntoResponse {
    let nodes: Vec<NodeResponse> = view
        .node_reports()
        .into_iter()
        .map(|node| NodeResponse {
            id: node.id,
            name: node.name,
            capacity: node.capacity,
            total_time: node.total_time,
            tasks: node.tasks.into_iter().map(|t| t.id).collect(),
            phase: node.phase.to_string(),
            partner: node.partner,
            rounds: node.rounds,
            unchanged_rounds: node.unchanged_rounds,
        })
        .collect();

    Json(nodes)
}

async fn list_tasks_handler(State(view): State<FleetView>) -> impl IntoResponse {
    let tasks: Vec<TaskResponse> = view
        .task_reports()
        .into_iter()
        .map(|task| TaskResponse {
            id: task.id,
            complexity: task.complexity,
            phase: task.phase.to_string(),
            assigned_node: task.assigned_node,
            bid_round: task.bid_round,
            evictions: task.evictions,
        })
        .collect();

    Json(tasks)
}

async fn fleet_handler(State(view): State<FleetView>) -> impl IntoResponse {
    Json(view.summary())
}
