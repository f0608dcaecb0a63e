use axum::routing::get;
use axum::{Json, Router};
use gatehouse_gateway::{Provider, token_tail};
use gatehouse_server::auth::{self, AppState, AuthUser};
use gatehouse_server::config::ServerConfig;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = ServerConfig::from_env().expect("failed to load configuration");
    tracing::info!("Loaded configuration");

    let provider_config = config
        .provider
        .build()
        .expect("invalid provider configuration");
    let provider = Provider::new(provider_config).expect("failed to build provider");

    let state = AppState {
        provider,
        secure_cookies: config.secure_cookies,
    };

    let protected = Router::new()
        .route("/whoami", get(whoami))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    let app = auth::router(state)
        .merge(protected)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind to address");

    tracing::info!("listening on http://{}", config.listen_addr);

    axum::serve(listener, app.into_make_service())
        .await
        .expect("server error");
}

/// Minimal protected route: reports who the gateway thinks you are.
async fn whoami(user: AuthUser) -> Json<serde_json::Value> {
    Json(json!({
        "username": user.username,
        "token_tail": token_tail(&user.access_token),
    }))
}
