use std::sync::Arc;

use realtime::auth::AuthValidator;
use realtime::config::{Config, PRESENCE_TTL};
use realtime::push::LoggingPushNotifier;
use realtime::rate_limit::RateLimiters;
use realtime::state::AppState;
use secureconnect_bus::{Presence, RedisBus};
use secureconnect_protocol::limits::{CALL_INITIATE_RATE_PER_USER, MESSAGE_RATE_PER_SENDER_PER_CONV};
use secureconnect_store::{db, PgCallStore, PgMembershipStore, PgMessageStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(&config.log_level)).init();

    info!("connecting to database...");
    let pool = db::create_pool(&config.database_url).await.expect("failed to connect to database");
    db::run_migrations(&pool).await.expect("failed to run migrations");
    info!("migrations applied");

    info!("connecting to redis...");
    let bus = Arc::new(
        RedisBus::connect(&config.redis_url)
            .await
            .expect("failed to connect to redis"),
    );
    let presence = Arc::new(Presence::new(bus.connection_manager(), PRESENCE_TTL));

    let membership = Arc::new(PgMembershipStore::new(pool.clone()));
    let messages = Arc::new(PgMessageStore::new(pool.clone()));
    let calls = Arc::new(PgCallStore::new(pool));

    let auth = AuthValidator::new(&config.jwt_secret);
    let message_rate_limiters = Arc::new(RateLimiters::new(MESSAGE_RATE_PER_SENDER_PER_CONV));
    let call_rate_limiters = Arc::new(RateLimiters::new(CALL_INITIATE_RATE_PER_USER));
    let push = Arc::new(LoggingPushNotifier);

    let state = AppState::new(
        auth,
        bus,
        presence,
        membership,
        messages,
        calls,
        push,
        message_rate_limiters,
        call_rate_limiters,
        config.max_connections,
    );

    let router = realtime::build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await.expect("failed to bind");
    info!(addr = %config.bind_addr, "realtime service listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
    info!("realtime service shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
