//! Provider webhook endpoint.
//!
//! One POST route. Authentication and body failures answer 404 with an empty
//! body, the same as an unknown route. Request-level routing failures answer
//! 406 with a short diagnostic. Everything else answers `200 ok` once the jobs
//! are queued; delivery happens afterwards.

pub mod payload;

use std::sync::Arc;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::error::RouteError;
use crate::outbound::Dispatcher;
use crate::pipeline::Resolver;
use crate::signature::SignatureValidator;

pub use payload::{AttachmentLimits, WebhookPayload};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub validator: Arc<SignatureValidator>,
    pub resolver: Arc<Resolver>,
    pub dispatcher: Dispatcher,
    pub limits: AttachmentLimits,
    /// Keep attachments in memory instead of spooling them to disk.
    pub in_memory: bool,
}

/// Build the Axum router serving the webhook at `endpoint`.
pub fn webhook_routes(state: AppState, endpoint: &str) -> Router {
    let body_limit = state.limits.body_limit();

    Router::new()
        .route(endpoint, post(receive_mail).fallback(not_found))
        .fallback(not_found)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .with_state(state)
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn receive_mail(State(state): State<AppState>, request: Request) -> Response {
    let payload = match payload::parse_request(
        request,
        &state.limits,
        state.in_memory,
        &state.validator,
    )
    .await
    {
        Ok(payload) => payload,
        Err(e) => {
            debug!(error = %e, "Rejected webhook body");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    if state.validator.verify(payload.signed_fields()).is_err() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let mail = match payload.into_inbound() {
        Ok(mail) => mail,
        Err(e) => {
            debug!(error = %e, "Rejected webhook body");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let jobs = match state.resolver.resolve(&mail) {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(error = %e, "Rejected inbound mail");
            return (StatusCode::NOT_ACCEPTABLE, diagnostic(&e)).into_response();
        }
    };

    info!(
        jobs = jobs.len(),
        attachments = mail.attachments.len(),
        "Accepted inbound mail"
    );
    for job in jobs {
        if let Err(e) = state.dispatcher.submit(job) {
            error!(error = %e, "Could not queue send job");
        }
    }

    (StatusCode::OK, "ok").into_response()
}

fn diagnostic(error: &RouteError) -> &'static str {
    match error {
        RouteError::HardWrap(_) => "Sender address cannot be relayed",
        RouteError::ThreadToken(_) => "In-Reply-To could not be verified",
        RouteError::MessageIdEncode(_) => "Message-Id could not be encoded",
    }
}
