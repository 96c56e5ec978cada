// Jackson Coxson
// Read-only JSON view of a running engine

use std::{net::SocketAddr, sync::Arc};

use axum::{Json, Router, extract::State, routing::get};
use serde_json::json;
use tracing::info;

use crate::GandalfError;
use crate::engine::Engine;

pub fn app(engine: Arc<Engine>) -> Router {
    Router::new().route("/", get(status)).with_state(engine)
}

// The key spellings below are contract; scripts parse them.
async fn status(State(engine): State<Arc<Engine>>) -> Json<serde_json::Value> {
    let status = engine.status().await;
    let status_data: Vec<serde_json::Value> = status
        .devices
        .iter()
        .map(|device| {
            json!({
                "Nickname": device.name.clone().unwrap_or_else(|| "<Unnamed>".to_string()),
                "Usbmuxd assigned iDevice ID": device.device_id,
                "iDevice UDID": device.udid,
                "Tunnels": device
                    .tunnels
                    .iter()
                    .map(|tunnel| {
                        json!({
                            "Local Port": tunnel.local_port,
                            "Device Port": tunnel.device_port,
                        })
                    })
                    .collect::<Vec<_>>(),
            })
        })
        .collect();

    Json(json!({
        "uptime": status.uptime,
        "async_exceptions_count": status.lazy_exceptions,
        "tunnels_created_count": status.tunnels_created,
        "tunnel_timeouts": status.tunnel_timeouts,
        "mappings_file": status.mappings_file,
        "status_data": status_data,
    }))
}

/// Serves the status route on `127.0.0.1:<port>` until the process
/// exits.
pub async fn serve(engine: Arc<Engine>, port: u16) -> Result<(), GandalfError> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("status server running at http://{addr}/");
    hyper::Server::try_bind(&addr)?
        .serve(app(engine).into_make_service())
        .await?;
    Ok(())
}
