use anyhow::Context;
use clap::{Parser, Subcommand};
use config::BrowserArgs;
use payload::RenderRequest;
use std::{fs, net::SocketAddr, path::PathBuf, sync::Arc};
use tracing_error::ErrorLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod browser;
mod config;
mod error;
mod lambda;
mod payload;
mod render;
mod smoke;

/// Renders HTML, web pages and PDFs through a headless browser.
#[derive(Debug, Parser)]
#[command(name = "pagecap", version)]
struct Options {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the render endpoint over HTTP
    Serve {
        #[arg(long, env = "PAGECAP_LISTEN", default_value = "127.0.0.1:8787")]
        listen: SocketAddr,
        /// Largest accepted request body, in bytes
        #[arg(
            long = "max-body-bytes",
            env = "PAGECAP_MAX_BODY_BYTES",
            default_value_t = lambda::DEFAULT_BODY_LIMIT
        )]
        max_body_bytes: usize,
        #[command(flatten)]
        browser: BrowserArgs,
    },
    /// Render one payload file without starting a server
    Render {
        /// JSON payload, same shape as the HTTP request body
        payload: PathBuf,
        /// Write the decoded document here instead of printing the envelope
        #[arg(long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        browser: BrowserArgs,
    },
    /// Run the smoke suite against a running server
    Smoke(smoke::SmokeArgs),
}

async fn serve(
    listen: SocketAddr,
    max_body_bytes: usize,
    browser: BrowserArgs,
) -> anyhow::Result<()> {
    let app = lambda::router(Arc::new(browser.dispatcher()), max_body_bytes);

    tracing::info!(endpoint = ?browser.endpoint(), "listening on {}", listen);
    axum::Server::bind(&listen)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn render(
    payload: PathBuf,
    output: Option<PathBuf>,
    browser: BrowserArgs,
) -> anyhow::Result<()> {
    let input = fs::read(&payload)
        .with_context(|| format!("failed to read {}", payload.display()))?;
    let request: RenderRequest = serde_json::from_slice(&input)
        .with_context(|| format!("{} is not a render payload", payload.display()))?;

    let envelope = browser.dispatcher().dispatch(&request).await?;

    match output {
        Some(path) => {
            let bytes = envelope.decode_body()?;
            fs::write(&path, &bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!("wrote {} bytes to {}", bytes.len(), path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&envelope)?),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pagecap=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(ErrorLayer::default())
        .init();

    let opts = Options::parse();
    match opts.command {
        Command::Serve {
            listen,
            max_body_bytes,
            browser,
        } => serve(listen, max_body_bytes, browser).await,
        Command::Render {
            payload,
            output,
            browser,
        } => render(payload, output, browser).await,
        Command::Smoke(args) => smoke::run(args).await,
    }
}
