use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use browserless_client::BrowserlessClient;
use chatscan_common::{parsing_result_schema, Config};
use chatscan_discovery::{ChatPage, Orchestrator, SessionRegistry, STREAMING_KEY};

#[derive(Parser)]
#[command(name = "chatscan", about = "Discover every chat visible to a logged-in web messaging session")]
struct Cli {
    /// Navigate here before discovery (overrides CHATSCAN_TARGET_URL)
    #[arg(long)]
    url: Option<String>,

    /// Session id to register the browser page under
    #[arg(long, default_value = "default")]
    session: String,

    /// Print only the terminal result
    #[arg(long)]
    final_only: bool,

    /// Print the JSON schema of a parsing result and exit
    #[arg(long)]
    schema: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.schema {
        println!("{}", serde_json::to_string_pretty(&parsing_result_schema())?);
        return Ok(());
    }

    // Logs go to stderr; stdout carries results.
    let filter = EnvFilter::from_default_env().add_directive("chatscan=info".parse()?);
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f == "json") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    info!("chatscan starting...");

    let config = Config::from_env()?;
    config.log_redacted();

    let client = BrowserlessClient::new(&config.browserless_url, config.browserless_token.as_deref())?;
    let browser = client.connect().await?;
    let page = browser
        .page()
        .await?
        .with_settle(config.navigation_settle);

    if let Some(url) = cli.url.as_deref().or(config.target_url.as_deref()) {
        info!(url, "Navigating");
        page.goto_and_wait_stable(url).await?;
    }

    let registry = SessionRegistry::new();
    let page: Arc<dyn ChatPage> = Arc::new(page);
    registry.register(cli.session.clone(), page).await;

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing current batch");
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    let orchestrator = Orchestrator::new(config.discovery.clone()).with_cancel_flag(cancel);
    let mut results = orchestrator.parse_session_streaming(registry.clone(), cli.session.clone());

    let stdout = std::io::stdout();
    let mut failed = false;
    while let Some(result) = results.next().await {
        let terminal = !result.metadata.contains_key(STREAMING_KEY);
        if terminal {
            failed = result.metadata.get("error").is_some_and(|e| e == true);
        } else if cli.final_only {
            continue;
        }
        let mut out = stdout.lock();
        writeln!(out, "{}", serde_json::to_string(&result)?)?;
        out.flush()?;
    }

    registry.remove(&cli.session).await;
    drop(browser);

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
