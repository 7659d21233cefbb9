use clap::Parser;
use janitor::config::{Config, ConfigHandle};
use janitor_runner::{AppState, RunnerDatabase, Watchdog};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

const EXIT_CONFIG: u8 = 1;
const EXIT_DATABASE: u8 = 2;
const EXIT_SHUTDOWN: u8 = 64;

#[derive(Parser)]
struct Args {
    #[clap(long)]
    listen_address: Option<String>,

    #[clap(long)]
    port: Option<u16>,

    #[clap(long, env = "JANITOR_CONFIG", default_value = "janitor.conf")]
    /// Path to configuration.
    config: PathBuf,

    #[clap(long)]
    /// Externally-visible base URL handed to workers.
    external_url: Option<url::Url>,

    #[clap(long)]
    /// Avoid processing runs on a host (e.g. 'salsa.debian.org')
    avoid_host: Vec<String>,

    #[clap(long)]
    /// Do not run the periodic scheduler.
    no_auto_schedule: bool,

    #[clap(flatten)]
    logging: janitor::logging::LoggingArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    args.logging.init();

    // HTTP request spans from the trace layer go through tracing, which
    // has its own subscriber next to the log facade.
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
    {
        log::debug!("Tracing subscriber already installed: {}", e);
    }

    let config_handle = match Config::read_file(&args.config) {
        Ok(config) => ConfigHandle::new(config, Some(args.config.clone())),
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config.display(), e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    // Startup wiring works from one snapshot; later ticks pick up reloads.
    let config = config_handle.get();

    let pool = match janitor::state::create_pool(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            return ExitCode::from(EXIT_DATABASE);
        }
    };
    let database = Arc::new(RunnerDatabase::new(pool));

    let redis = match &config.redis {
        Some(redis_config) => match connect_redis(&redis_config.url).await {
            Ok(redis) => Some(redis),
            Err(e) => {
                // Redis is a cache; losing it degrades to polling.
                log::warn!("Redis unavailable, events disabled: {}", e);
                None
            }
        },
        None => None,
    };

    let log_location = config.logs.location.clone().unwrap_or("logs".to_string());
    let log_manager = match janitor::logs::create_log_manager(&log_location).await {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("Failed to set up log storage at {}: {}", log_location, e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let artifact_location = config
        .artifacts
        .location
        .clone()
        .unwrap_or("artifacts".to_string());
    let artifact_manager = match janitor::artifacts::create_artifact_manager(&artifact_location)
        .await
    {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!(
                "Failed to set up artifact storage at {}: {}",
                artifact_location, e
            );
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let listen_address = args
        .listen_address
        .unwrap_or_else(|| config.runner.listen_address.clone());
    let port = args.port.unwrap_or(config.runner.port);

    let external_url = match args.external_url {
        Some(url) => url,
        None => match format!("http://{}:{}/", listen_address, port).parse() {
            Ok(url) => url,
            Err(e) => {
                eprintln!("Invalid listen address: {}", e);
                return ExitCode::from(EXIT_CONFIG);
            }
        },
    };

    let mut avoid_hosts: HashSet<String> = config.runner.avoid_hosts.iter().cloned().collect();
    avoid_hosts.extend(args.avoid_host);

    let state = Arc::new(AppState {
        database: database.clone(),
        config: config_handle.clone(),
        log_manager,
        artifact_manager,
        redis,
        external_url,
        avoid_hosts,
    });

    spawn_reload_on_hangup(config_handle.clone());

    let watchdog = Watchdog::new(database.clone(), config_handle.clone());
    tokio::spawn(async move { watchdog.start().await });

    if !args.no_auto_schedule {
        let scheduler_db = database.clone();
        let scheduler_config = config_handle.clone();
        tokio::spawn(async move {
            schedule_loop(scheduler_db, scheduler_config).await;
        });
    }

    let router = janitor_runner::web::app(state)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = format!("{}:{}", listen_address, port);
    log::info!("Listening on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Failed to bind {}: {}", addr, e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let serve = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());

    match serve.await {
        Ok(()) => {
            log::info!("Shut down on operator request");
            ExitCode::from(EXIT_SHUTDOWN)
        }
        Err(e) => {
            eprintln!("Server error: {}", e);
            ExitCode::from(EXIT_DATABASE)
        }
    }
}

async fn connect_redis(url: &str) -> Result<redis::aio::ConnectionManager, redis::RedisError> {
    let client = redis::Client::open(url)?;
    client.get_connection_manager().await
}

/// Reload configuration on SIGHUP; the new snapshot is swapped in
/// atomically behind the shared handle.
fn spawn_reload_on_hangup(config: ConfigHandle) {
    tokio::spawn(async move {
        let mut hangup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(hangup) => hangup,
                Err(e) => {
                    log::warn!("Failed to install SIGHUP handler: {}", e);
                    return;
                }
            };
        while hangup.recv().await.is_some() {
            if let Err(e) = config.reload() {
                log::error!("Config reload failed, keeping old snapshot: {}", e);
            }
        }
    });
}

/// Periodically recompute the candidate set into queue entries.
async fn schedule_loop(database: Arc<RunnerDatabase>, config: ConfigHandle) {
    let mut timer = tokio::time::interval(std::time::Duration::from_secs(
        config.get().runner.schedule_interval,
    ));
    loop {
        timer.tick().await;
        log::info!("Recomputing candidate schedule");
        let requests = match janitor::schedule::iter_schedule_requests_from_candidates(
            database.pool(),
            &config.get(),
            None,
            None,
        )
        .await
        {
            Ok(requests) => requests,
            Err(e) => {
                log::error!("Failed to read candidates: {}", e);
                continue;
            }
        };
        let count = requests.len();
        if let Err(e) = janitor::schedule::bulk_add_to_queue(
            database.pool(),
            &requests,
            false,
            janitor::schedule::DEFAULT_SCHEDULE_OFFSET,
            None,
            Some("scheduler"),
            false,
        )
        .await
        {
            log::error!("Failed to schedule candidates: {}", e);
        } else {
            log::info!("Scheduled {} candidates", count);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
