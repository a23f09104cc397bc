//! Server entry point.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 model load
//! error, 3 transport bind error, 10 unexpected panic.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dhwani_config::{load_settings, DomainConfig};
use dhwani_server::{create_router, AppState};

fn main() {
    // A panic escaping the runtime is a bug; make it visible in the exit
    // status rather than unwinding quietly.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        eprintln!("unexpected panic, exiting");
        std::process::exit(10);
    }));

    let code = run();
    std::process::exit(code);
}

fn run() -> i32 {
    let env = std::env::var("DHWANI_ENV").ok();
    let settings = match load_settings(env.as_deref()) {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            eprintln!("configuration error: {e}");
            return e.exit_code();
        }
    };

    init_tracing();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        env = env.as_deref().unwrap_or("default"),
        "starting dhwani server"
    );

    let domain = match DomainConfig::load(&settings.domain_dir) {
        Ok(domain) => Arc::new(domain),
        Err(e) => {
            tracing::error!("domain configuration error: {e}");
            return e.exit_code();
        }
    };
    tracing::info!(
        branches = domain.branches.len(),
        intents = domain.intents.len(),
        stages = domain.stages.len(),
        "domain configuration loaded"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("runtime init failed: {e}");
            return 10;
        }
    };

    runtime.block_on(serve(settings, domain))
}

async fn serve(settings: Arc<dhwani_config::Settings>, domain: Arc<DomainConfig>) -> i32 {
    let metrics_handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!("metrics recorder unavailable: {e}");
            None
        }
    };

    let mut state = match AppState::build(settings.clone(), domain) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("startup failed: {e}");
            return e.exit_code();
        }
    };
    if let Some(handle) = metrics_handle {
        // Arc is still unshared at this point.
        if let Some(inner) = Arc::get_mut(&mut state) {
            inner.metrics_handle = Some(handle);
        }
    }

    state.sessions.spawn_reaper();

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%addr, "transport bind failed: {e}");
            return 3;
        }
    };
    tracing::info!(%addr, "listening");

    let router = create_router(state);
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await;

    match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("server error: {e}");
            3
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
