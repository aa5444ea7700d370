//! Single HTTP ingress for the platform bot and every tenant.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use serde_json::Value;
use tenant_plugin::{OutboundAction, TenantEvent};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::lifecycle::{LifecycleManager, RuntimeHandle};
use crate::logger::Telemetry;
use crate::provider::{InlineButton, Keyboard, MessagingProvider, OutboundMessage, Update};

/// Receives updates addressed to the platform's own bot.
#[async_trait]
pub trait IncomingHandler: Send + Sync {
    async fn handle_incoming(&self, update: Update);
}

#[derive(Clone)]
pub struct WebhookState {
    /// Route identity reserved for the platform bot.
    pub platform_route: String,
    pub control_plane: Arc<dyn IncomingHandler>,
    pub lifecycle: Arc<LifecycleManager>,
    pub provider: Arc<dyn MessagingProvider>,
    pub telemetry: Telemetry,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/bot/:identity", post(receive))
        .route("/health", get(health))
        .route("/", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<WebhookState>) -> String {
    format!("OK - {} bots running", state.lifecycle.running_count())
}

async fn receive(
    State(state): State<WebhookState>,
    Path(identity): Path<String>,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!(route = %identity, "malformed update body: {e}");
            return (StatusCode::BAD_REQUEST, "malformed update");
        }
    };
    state.telemetry.webhook_events.add(1, &[]);

    if identity == state.platform_route {
        match serde_json::from_value::<Update>(payload) {
            Ok(update) => hand_to_control_plane(&state, update),
            Err(e) => warn!("platform update ignored: {e}"),
        }
        return (StatusCode::OK, "OK");
    }

    let Some(handle) = state.lifecycle.route(&identity) else {
        state.telemetry.dropped_events.add(1, &[]);
        debug!(route = %identity, "no live runtime, update dropped");
        return (StatusCode::OK, "OK");
    };

    let event = TenantEvent::new(identity.clone(), payload);
    let task = tokio::spawn(dispatch(state.clone(), handle, event));
    if let Err(e) = task.await {
        error!(route = %identity, "tenant dispatch task failed: {e}");
    }
    (StatusCode::OK, "OK")
}

/// Conversations can wait on the AI service for a minute; the provider must
/// get its 200 long before that.
fn hand_to_control_plane(state: &WebhookState, update: Update) {
    let handler = state.control_plane.clone();
    let work = tokio::spawn(async move { handler.handle_incoming(update).await });
    tokio::spawn(async move {
        if let Err(e) = work.await {
            error!("control plane task failed: {e}");
        }
    });
}

async fn dispatch(state: WebhookState, handle: Arc<RuntimeHandle>, event: TenantEvent) {
    let route = handle.route_id.clone();
    let result = state
        .telemetry
        .instrument_dispatch(&route, handle.unit.deliver(event))
        .await;

    if let Ok(actions) = result {
        for action in actions {
            send_action(state.provider.as_ref(), &handle.token, action, &route).await;
        }
    }

    if let Err(e) = state.lifecycle.registry().increment_event_count(&handle.token).await {
        warn!(%route, "event counter not updated: {e}");
    }
}

/// Deliver one tenant action with the tenant's own credential.
async fn send_action(
    provider: &dyn MessagingProvider,
    token: &str,
    action: OutboundAction,
    route: &str,
) {
    let result = match action {
        OutboundAction::Reply { chat_id, text } => {
            provider
                .send_message(token, OutboundMessage::text(chat_id, text))
                .await
        }
        OutboundAction::ReplyWithButtons { chat_id, text, buttons } => {
            let rows = buttons
                .into_iter()
                .map(|label| vec![InlineButton::new(label.clone(), label)])
                .collect();
            let msg = OutboundMessage::text(chat_id, text).with_keyboard(Keyboard::Inline(rows));
            provider.send_message(token, msg).await
        }
        OutboundAction::AnswerCallback { callback_id, text } => {
            provider.answer_callback(token, &callback_id, text.as_deref()).await
        }
    };
    if let Err(e) = result {
        warn!(%route, "tenant action not delivered: {e}");
    }
}
