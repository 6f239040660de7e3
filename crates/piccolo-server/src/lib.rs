//! JSON-RPC-over-HTTP transport adapter.
//!
//! Translates HTTP requests into [`piccolo_core::dispatcher::Command`]s and
//! back into JSON, and exposes the message bus to remote subscribers. Owns
//! no orchestration state itself — every request is forwarded to a
//! [`DispatcherHandle`] registered as one client of a running
//! [`piccolo_core::dispatcher::Dispatcher`].

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use piccolo_core::dispatcher::{Command, DispatcherHandle, Response as DispatchResponse};
use piccolo_core::message::MessageBus;

/// Shared server state: a single dispatcher client, serialized through a
/// mutex the same way the command protocol itself serializes access to
/// components.
struct AppState {
    dispatcher: Mutex<DispatcherHandle>,
    bus: MessageBus,
}

#[derive(Deserialize)]
struct CommandRequest {
    /// Absent for the dispatcher's own control verbs (`stop`, `components`).
    component: Option<String>,
    command: String,
    #[serde(default)]
    kwargs: HashMap<String, Value>,
}

#[derive(Serialize)]
struct CommandResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

fn render_response(resp: DispatchResponse) -> (StatusCode, Json<CommandResponse>) {
    match resp {
        DispatchResponse::Ok(v) => (
            StatusCode::OK,
            Json(CommandResponse {
                status: "ok",
                value: Some(v),
                message: None,
            }),
        ),
        DispatchResponse::Nok(msg) => (
            StatusCode::BAD_REQUEST,
            Json(CommandResponse {
                status: "nok",
                value: None,
                message: Some(msg),
            }),
        ),
    }
}

/// `POST /api/command`: the single entry point for every component/control
/// verb the dispatcher recognises, carrying a `(command, component, kwargs)`
/// triple.
async fn handle_command(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CommandRequest>,
) -> (StatusCode, Json<CommandResponse>) {
    let cmd = match req.component {
        Some(component) => Command {
            name: req.command,
            component: Some(component),
            kwargs: req.kwargs,
        },
        None => Command {
            name: req.command,
            component: None,
            kwargs: req.kwargs,
        },
    };
    let dispatcher = state.dispatcher.lock().await;
    render_response(dispatcher.send(cmd))
}

#[derive(Serialize)]
struct NewListenerResponse {
    listener_id: u64,
}

/// `POST /api/listener`: allocate a message-bus cursor for a new remote
/// subscriber.
async fn handle_new_listener(State(state): State<Arc<AppState>>) -> Json<NewListenerResponse> {
    let listener_id = state.bus.new_listener();
    Json(NewListenerResponse { listener_id })
}

/// `DELETE /api/listener/:id`: drop a subscriber's cursor.
async fn handle_remove_listener(State(state): State<Arc<AppState>>, Path(id): Path<u64>) -> StatusCode {
    state.bus.remove_listener(id);
    StatusCode::NO_CONTENT
}

#[derive(Serialize)]
struct ListenerStatusResponse {
    has_pending: bool,
}

/// `GET /api/listener/:id/status`: whether the listener has unconsumed
/// messages, without consuming one.
async fn handle_listener_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Json<ListenerStatusResponse> {
    Json(ListenerStatusResponse {
        has_pending: state.bus.status(id),
    })
}

#[derive(Serialize)]
struct ListenerMessageResponse {
    message: Option<String>,
}

/// `GET /api/listener/:id/message`: pop the oldest unconsumed message for
/// this listener, or `null` if none is pending.
async fn handle_listener_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Json<ListenerMessageResponse> {
    Json(ListenerMessageResponse {
        message: state.bus.get_message(id),
    })
}

#[derive(Serialize)]
struct ComponentsResponse {
    components: Vec<Value>,
}

/// `GET /api/components`: list every component name registered with the
/// dispatcher, a thin wrapper around the `components` control verb.
async fn handle_components(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let dispatcher = state.dispatcher.lock().await;
    match dispatcher.send(Command::control("components")) {
        DispatchResponse::Ok(v) => (StatusCode::OK, Json(v)),
        DispatchResponse::Nok(msg) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(Value::String(msg)),
        ),
    }
}

async fn handle_index() -> &'static str {
    "piccolo JSON-RPC-over-HTTP transport adapter"
}

/// Build the axum router, wiring one dispatcher client and the shared
/// message bus into every handler's state.
pub fn build_router(dispatcher: DispatcherHandle, bus: MessageBus) -> Router {
    let state = Arc::new(AppState {
        dispatcher: Mutex::new(dispatcher),
        bus,
    });

    Router::new()
        .route("/", get(handle_index))
        .route("/api/command", post(handle_command))
        .route("/api/components", get(handle_components))
        .route("/api/listener", post(handle_new_listener))
        .route(
            "/api/listener/:id",
            get(handle_listener_status).delete(handle_remove_listener),
        )
        .route("/api/listener/:id/message", get(handle_listener_message))
        .with_state(state)
}

/// Run the JSON-RPC-over-HTTP transport adapter. The `jsonrpc.url` config
/// key names the listen address; this crate binds host/port directly,
/// leaving URL parsing to the caller.
pub async fn run_server(dispatcher: DispatcherHandle, bus: MessageBus, host: &str, port: u16) {
    let app = build_router(dispatcher, bus);
    let addr = format!("{host}:{port}");
    log::info!("JSON-RPC-over-HTTP transport adapter listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use piccolo_core::dispatcher::Dispatcher;

    #[test]
    fn unknown_component_maps_to_nok() {
        let mut dispatcher = Dispatcher::new();
        let handle = dispatcher.register_client();
        let bus = MessageBus::spawn();
        dispatcher.set_message_bus(bus.clone());
        dispatcher.spawn();

        let resp = handle.send(Command::new("nonexistent", "ping"));
        assert!(matches!(resp, DispatchResponse::Nok(_)));
        let _ = handle.send(Command::control("stop"));
    }

    #[test]
    fn listener_status_reflects_pending_messages() {
        let bus = MessageBus::spawn();
        let id = bus.new_listener();
        assert!(!bus.status(id));
        bus.add_message("hello");
        assert!(bus.status(id));
        assert_eq!(bus.get_message(id), Some("hello".to_string()));
        assert!(!bus.status(id));
        bus.stop();
    }
}
