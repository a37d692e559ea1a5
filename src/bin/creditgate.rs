use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use creditgate::config::{CreditgateConfig, Env, Secrets};
use creditgate::http::{AppState, router};
use creditgate::poller::{GatewayStatusClient, PollOutcome, PollSettings, TaskPoller};
use creditgate::provider::validate_task_id;
use creditgate::{Clock, ComputeProvider, HttpComputeProvider, LedgerStore, MemoryStore, SystemClock};
use tokio_util::sync::CancellationToken;

/// Credit-metered task gateway.
#[derive(Parser)]
#[command(name = "creditgate", version, about = "Credit-metered task gateway")]
struct Cli {
    /// TOML config file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Optional .env file layered over the process environment
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway
    Serve {
        /// Listen address, overrides `server.listen`
        #[arg(long)]
        listen: Option<String>,
        /// Mark visitor cookies `Secure`
        #[arg(long)]
        secure_cookies: bool,
        /// Export spans over OTLP/HTTP (requires the `otel` feature)
        #[arg(long)]
        otel: bool,
        #[arg(long)]
        otel_endpoint: Option<String>,
    },

    /// Poll a running gateway until every listed task settles
    Watch {
        /// One or more task ids, e.g. every task of a batch submission
        #[arg(required = true)]
        task_ids: Vec<String>,
        /// Gateway base URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,
        /// Session token sent as a bearer credential
        #[arg(long)]
        bearer: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => CreditgateConfig::load(path)?,
        None => CreditgateConfig::default(),
    };
    let env = match &cli.dotenv {
        Some(path) => Env::load_dotenv(path)?,
        None => Env::default(),
    };
    let json_logs = cli.json_logs || config.server.json_logs;

    match cli.command {
        Commands::Serve {
            listen,
            secure_cookies,
            otel,
            otel_endpoint,
        } => {
            let _otel_guard = init_logging(json_logs, otel, otel_endpoint.as_deref())?;
            serve(config, env, listen, secure_cookies).await
        }
        Commands::Watch {
            task_ids,
            server,
            bearer,
        } => {
            creditgate::logging::init_tracing(json_logs)?;
            watch(&config, &task_ids, server, bearer).await
        }
    }
}

async fn serve(
    config: CreditgateConfig,
    env: Env,
    listen: Option<String>,
    secure_cookies: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let secrets = Secrets::resolve(&config, &env)?;
    let store = open_store(&config).await?;
    let provider: Arc<dyn ComputeProvider> = Arc::new(HttpComputeProvider::new(
        config.provider.base_url.clone(),
        secrets.provider_api_key.clone(),
        Duration::from_secs(config.provider.timeout_secs),
    )?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let state = AppState::from_config(&config, &secrets, store, provider, clock)
        .with_secure_cookies(secure_cookies);
    let app = router(state);

    let listen = listen.unwrap_or_else(|| config.server.listen.clone());
    let addr: SocketAddr = listen.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "creditgate listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;
    Ok(())
}

async fn open_store(
    config: &CreditgateConfig,
) -> Result<Arc<dyn LedgerStore>, Box<dyn std::error::Error>> {
    match &config.server.sqlite_path {
        #[cfg(feature = "store-sqlite")]
        Some(path) => {
            let store = creditgate::SqliteStore::new(path.clone());
            store.init().await?;
            tracing::info!(path = %path.display(), "using sqlite ledger store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "store-sqlite"))]
        Some(_) => Err("server.sqlite_path requires `--features store-sqlite`".into()),
        None => {
            tracing::warn!("no sqlite_path configured; balances live in memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn watch(
    config: &CreditgateConfig,
    task_ids: &[String],
    server: String,
    bearer: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    for task_id in task_ids {
        validate_task_id(task_id)?;
    }
    let settings = PollSettings::from(&config.poller);
    let mut client =
        GatewayStatusClient::new(server, Duration::from_secs(config.provider.timeout_secs))?;
    if let Some(token) = bearer {
        client = client.with_bearer(token);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let poller = TaskPoller::new(settings);
    let (poller, client, cancel) = (&poller, &client, &cancel);
    let runs = task_ids.iter().map(|task_id| async move {
        let outcome = poller
            .run(client, task_id, cancel, |update| {
                println!(
                    "{task_id}: {:?} status={:?} progress={}% failures={}",
                    update.state, update.status, update.progress_pct, update.consecutive_failures
                );
            })
            .await;
        (task_id, outcome)
    });

    let mut failures = Vec::new();
    for (task_id, outcome) in join_all(runs).await {
        match outcome {
            PollOutcome::Succeeded { snapshot } => match snapshot.result_url {
                Some(url) => println!("{task_id}: succeeded: {url}"),
                None => println!("{task_id}: succeeded"),
            },
            PollOutcome::Failed(failure) => failures.push(format!("{task_id} failed: {failure:?}")),
            PollOutcome::TimedOut { elapsed } => {
                failures.push(format!("{task_id}: gave up after {}s", elapsed.as_secs()))
            }
            PollOutcome::Cancelled => println!("{task_id}: cancelled"),
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; ").into())
    }
}

#[cfg(feature = "otel")]
fn init_logging(
    json_logs: bool,
    otel: bool,
    endpoint: Option<&str>,
) -> Result<Option<creditgate::otel::OtelGuard>, Box<dyn std::error::Error>> {
    if otel {
        return Ok(Some(creditgate::otel::init_tracing("creditgate", endpoint, json_logs)?));
    }
    creditgate::logging::init_tracing(json_logs)?;
    Ok(None)
}

#[cfg(not(feature = "otel"))]
fn init_logging(
    json_logs: bool,
    otel: bool,
    _endpoint: Option<&str>,
) -> Result<Option<()>, Box<dyn std::error::Error>> {
    if otel {
        return Err("otel requires `--features otel`".into());
    }
    creditgate::logging::init_tracing(json_logs)?;
    Ok(None)
}
