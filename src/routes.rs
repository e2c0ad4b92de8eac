use log::{debug, warn};
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::error::AppError;
use crate::events::{EventSubscription, FeedItem};
use crate::service::{
    CONFIGURE_CONTEXT, CommandService, ConfigureRequest, MONITOR_CONTEXT, MonitorRequest,
    PWM_CONTEXT, PwmRequest, WRITE_CONTEXT, WriteRequest,
};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CommandService>,
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    mut feed: EventSubscription,
) {
    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        return;
                    }
                    Ok(Message::Text(_))
                    | Ok(Message::Binary(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Continuation(_))
                    | Ok(Message::Nop) => {}
                    Err(_) => break,
                }
            }
            item = feed.next() => {
                let Some(item) = item else { break; };

                if let FeedItem::Heartbeat { .. } = item {
                    debug!("event feed heartbeat");
                }
                match serde_json::to_string(&item) {
                    Ok(text) => {
                        if session.text(text).await.is_err() {
                            warn!("WebSocket client disconnected");
                            return;
                        }
                    }
                    Err(e) => warn!("failed to encode feed item: {e}"),
                }
            }
        }
    }

    let _ = session.close(None).await;
}

impl AppState {
    pub fn new(service: Arc<CommandService>) -> Self {
        Self { service }
    }

    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(
                web::resource("/pins")
                    .route(web::get().to(list_pins))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/mode")
                    .route(web::post().to(set_mode))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/write")
                    .route(web::post().to(write_pin))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/pwm")
                    .route(web::post().to(control_pwm))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/monitor")
                    .route(web::post().to(toggle_monitor))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/reset")
                    .route(web::post().to(reset_pins))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/events")
                    .route(web::get().to(events_ws))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
    }
}

fn success() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "success": true }))
}

async fn list_pins(state: web::Data<AppState>) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.service.overview()))
}

async fn set_mode(
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let req: ConfigureRequest = parse_command(&state, CONFIGURE_CONTEXT, &body)?;
    state.service.configure(&req)?;

    Ok(success())
}

async fn write_pin(
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let req: WriteRequest = parse_command(&state, WRITE_CONTEXT, &body)?;

    // pulses sleep between toggles, keep them off the async workers
    let service = state.service.clone();
    web::block(move || service.write(&req))
        .await
        .map_err(|e| AppError::Internal(format!("write task failed: {e}")))??;

    Ok(success())
}

async fn control_pwm(
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let req: PwmRequest = parse_command(&state, PWM_CONTEXT, &body)?;
    state.service.pwm(&req)?;

    Ok(success())
}

async fn toggle_monitor(
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let req: MonitorRequest = parse_command(&state, MONITOR_CONTEXT, &body)?;
    let monitoring = state.service.monitor(&req)?;

    Ok(HttpResponse::Ok().json(json!({ "success": true, "monitoring": monitoring })))
}

async fn reset_pins(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    state.service.reset()?;

    Ok(success())
}

async fn events_ws(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let feed = state.service.subscribe();
    let (response, session, client_stream) = actix_ws::handle(&req, stream)
        .map_err(|e| AppError::Internal(format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, feed).await;
    });

    Ok(response)
}

/// Parses a command body; a rejected body is published like any other
/// failed command.
fn parse_command<T: DeserializeOwned>(
    state: &AppState,
    context: &str,
    body: &[u8],
) -> Result<T, AppError> {
    parse_json_payload(body).map_err(|e| state.service.reject(context, e))
}

fn parse_json_payload<T: DeserializeOwned>(body: &[u8]) -> Result<T, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue("Empty payload".into()));
    }

    serde_json::from_slice(body)
        .map_err(|e| AppError::InvalidValue(format!("Invalid payload: {e}")))
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
