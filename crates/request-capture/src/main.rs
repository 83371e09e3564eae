use anyhow::Context;
use clap::Parser;
use futures::FutureExt;
use tracing_subscriber::prelude::*;

/// request-capture-server is a demonstration service whose routes are wrapped
/// with request capture. Diagnostic reports of failed requests are written
/// to stdout as lines of JSON, and its own logs are written to stderr.
#[derive(clap::Parser, Debug)]
struct Args {
    /// Port to listen on.
    #[clap(long, env, default_value = "8766")]
    pub api_port: u16,
    /// Customer identifier attached to every report.
    #[clap(long, env)]
    pub customer_id: String,
    /// Codebase identifier attached to every report.
    #[clap(long, env)]
    pub codebase_id: String,
    /// Environment attached to every report.
    #[clap(long, env, default_value = request_capture::DEFAULT_ENVIRONMENT)]
    pub environment: String,
    /// Never buffer or report request bodies.
    #[clap(long, env)]
    pub exclude_request_body: bool,
    /// Maximum number of request and response body bytes buffered for a report.
    #[clap(long, env, default_value = "1048576")]
    pub max_body_bytes: usize,
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    // Structured logs go to stderr, and request output is also captured into reports.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_filter(tracing_subscriber::EnvFilter::from_default_env());
    let registry = tracing_subscriber::registry()
        .with(request_capture::OutputLayer::new())
        .with(fmt_layer);
    tracing::subscriber::set_global_default(registry).context("setting tracing default failed")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    tracing::info!(?args, "started!");

    let task = runtime.spawn(async move { async_main(args).await });
    let result = runtime.block_on(task);

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result?
}

async fn async_main(
    Args {
        api_port,
        customer_id,
        codebase_id,
        environment,
        exclude_request_body,
        max_body_bytes,
    }: Args,
) -> anyhow::Result<()> {
    let config = request_capture::Config {
        customer_id,
        codebase_id,
        environment,
        exclude_request_body,
        max_body_bytes,
        ..request_capture::Config::new("", "")
    };
    // An invalid Config doesn't prevent serving, but nothing will be captured.
    if let Err(err) = config.validate() {
        tracing::warn!(%err, "request capture is misconfigured and will be bypassed");
    }

    let dispatcher = request_capture::JsonWriteDispatcher::new(std::io::stdout());
    let engine = request_capture::Engine::new(config, dispatcher);

    let api_listener = tokio::net::TcpListener::bind(format!("[::]:{api_port}"))
        .await
        .context("failed to bind server port")?;

    // Share-able future which completes when the server should exit.
    let shutdown = tokio::signal::ctrl_c().map(|_| ()).shared();

    let app = request_capture::server::router(&engine)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    axum::serve(api_listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
