use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::Layer as _;

use relay_llm::gateway::monitor::SAMPLE_INTERVAL_MS;
use relay_llm::gateway::{
    AppState, GatewayMonitor, IdempotencyStore, InMemoryIdempotencyStore, InstanceClientManager,
    JsonFileInstanceStore, LoadBalancer, Metrics, RedisIdempotencyStore, SettingsFile,
};
use relay_llm::SystemClock;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let mut listen = "127.0.0.1:8080".to_string();
    let mut instances_path = "data/instances.json".to_string();
    let mut settings_path = "data/load-balancing-settings.json".to_string();
    let mut redis_url: Option<String> = None;
    let mut json_logs = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen = args.next().ok_or("missing value for --listen/--addr")?;
            }
            "--instances" => {
                instances_path = args.next().ok_or("missing value for --instances")?;
            }
            "--settings" => {
                settings_path = args.next().ok_or("missing value for --settings")?;
            }
            "--redis" => {
                redis_url = Some(args.next().ok_or("missing value for --redis")?);
            }
            "--json-logs" => {
                json_logs = true;
            }
            "--help" | "-h" => {
                println!(
                    "usage: relay-gateway [--listen HOST:PORT] [--instances FILE] \
                     [--settings FILE] [--redis URL] [--json-logs]"
                );
                return Ok(());
            }
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    init_tracing(json_logs);

    let settings_file = SettingsFile::new(&settings_path);
    let initial_settings = match settings_file.load() {
        Ok(settings) => settings,
        Err(err) => {
            tracing::warn!(path = %settings_path, error = %err, "falling back to default settings");
            None
        }
    };

    let idempotency: Arc<dyn IdempotencyStore> = match &redis_url {
        Some(url) => Arc::new(RedisIdempotencyStore::new(url)?),
        None => {
            tracing::info!("no redis url configured, using in-memory idempotency store");
            Arc::new(InMemoryIdempotencyStore::default())
        }
    };

    let clients = Arc::new(InstanceClientManager::new());
    let store = Arc::new(JsonFileInstanceStore::new(&instances_path));
    let clock = Arc::new(SystemClock);
    let balancer = LoadBalancer::new(store, Arc::clone(&clients), clock.clone(), initial_settings);

    let metrics = Arc::new(Metrics::new());
    let monitor = Arc::new(GatewayMonitor::new(
        Arc::clone(&metrics),
        Arc::clone(&balancer),
        clock.clone(),
    ));
    {
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(std::time::Duration::from_millis(SAMPLE_INTERVAL_MS as u64));
            loop {
                tick.tick().await;
                monitor.sample();
            }
        });
    }

    let state = AppState {
        balancer: Arc::clone(&balancer),
        clients: Arc::clone(&clients),
        idempotency,
        metrics,
        monitor,
        clock,
        settings_file: Some(settings_file),
    };

    let app = relay_llm::gateway::http::router(state);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(listen = %listen, "relay-gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    balancer.stop_accepting();
    clients.shutdown();
    tracing::info!("relay-gateway shut down");
    Ok(())
}

fn init_tracing(json_logs: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining");
}
