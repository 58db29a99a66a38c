use actix_cors::Cors;
use actix_web::{get, post, web, App, HttpResponse, HttpServer, Responder, Result as ActixResult};
use actix_ws::Message;
use flowruntime::{FlowRuntime, NodeRegistry, RuntimeConfig};
use flowserver::engine::{CANCEL_EXECUTION, EXECUTE_NODE};
use flowserver::{
    register_engine_handlers, spawn_event_bridge, ChannelResponse, ChannelServer,
    ValidationMiddleware,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
struct AppState {
    channel: Arc<ChannelServer>,
}

/// Health check endpoint
#[get("/health")]
async fn health_check(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "flowengine",
        "channel": data.channel.name(),
        "methods": data.channel.methods(),
    }))
}

/// Channel call: the path names the method, the body carries its arguments
#[post("/api/channel/{method}")]
async fn channel_call(
    data: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Bytes,
) -> ActixResult<impl Responder> {
    let method = path.into_inner();

    let args = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(args) => args,
            Err(e) => {
                return Ok(HttpResponse::BadRequest().json(ChannelResponse::Failure {
                    error: format!("Invalid JSON body: {}", e),
                    channel_error: false,
                }))
            }
        }
    };

    let response = data.channel.dispatch(&method, args).await;
    let reply = match &response {
        ChannelResponse::Success { .. } => HttpResponse::Ok().json(&response),
        ChannelResponse::Failure {
            channel_error: true,
            ..
        } => HttpResponse::NotFound().json(&response),
        ChannelResponse::Failure { .. } => HttpResponse::InternalServerError().json(&response),
    };
    Ok(reply)
}

/// WebSocket observer connection receiving channel broadcasts
#[get("/api/events")]
async fn websocket_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket observer connected");

    let mut observer = data.channel.connect();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                message = observer.recv() => {
                    let Some(message) = message else { break };
                    match serde_json::to_string(&message) {
                        Ok(json) => {
                            if session.text(json).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to serialize broadcast: {}", e),
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        // Dropping `observer` deregisters it on the next broadcast.
        info!("WebSocket observer disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Flow Engine Server");

    let registry = Arc::new(NodeRegistry::new());
    flownodes::register_all(&registry);

    let config = RuntimeConfig::from_env();
    info!("Runtime config: {:?}", config);
    let runtime = Arc::new(FlowRuntime::with_registry(registry, config));

    let channel_name = std::env::var("FLOW_CHANNEL").unwrap_or_else(|_| "flow-engine".to_string());
    let channel = Arc::new(ChannelServer::new(channel_name));
    channel.use_middleware(
        ValidationMiddleware::new()
            .require_fields(EXECUTE_NODE, &["node.id", "node.type"])
            .require_fields(CANCEL_EXECUTION, &["executionId"]),
    );
    register_engine_handlers(&channel, runtime.clone());
    let bridge = spawn_event_bridge(channel.clone(), &runtime);

    info!(
        "Channel '{}' ready with methods: {}",
        channel.name(),
        channel.methods().join(", ")
    );

    let app_state = web::Data::new(AppState { channel });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .service(health_check)
            .service(channel_call)
            .service(websocket_events)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    bridge.abort();
    Ok(())
}
