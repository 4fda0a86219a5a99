use axum::{routing::get, Router};
use clap::Parser;
use http::HeaderValue;
use std::{env, path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod client;
mod config;
mod engine;
mod models;
mod policy;
mod qr;
mod routes;
mod supervisor;

use crate::{
    client::ChaoxingClient,
    config::{HttpSettings, Settings},
    supervisor::{LogConsumer, Supervisor},
};

#[derive(Parser, Debug)]
#[command(name = "autosign-runtime", about = "Signs enrolled courses in automatically")]
struct Args {
    /// Config file (TOML or JSON)
    #[arg(short, long, env = "AUTOSIGN_CONFIG", default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "autosign_runtime=info,tower_http=info".into())
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let settings = Settings::load(&args.config)?;
    let client = ChaoxingClient::new(settings.remote.clone())?;
    let supervisor = Supervisor::build(&settings, Arc::new(client))?;

    let handle = supervisor.start(LogConsumer);
    let shutdown = handle.cancellation_token();

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(routes::router(handle.registry()))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(settings.http.request_timeout))
        .layer(cors(&settings.http));

    let addr = format!("{}:{}", settings.http.host, settings.http.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("listening on http://{}", addr);

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    wait_for_signal().await;
    tracing::info!("shutting down");
    handle.shutdown().await;
    server.await??;
    Ok(())
}

fn cors(http: &HttpSettings) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if http.allow_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = http
        .allow_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid cors origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl-c handler failed");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
