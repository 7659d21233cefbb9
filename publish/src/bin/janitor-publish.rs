use clap::Parser;
use janitor::config::{Config, ConfigHandle};
use janitor_publish::rate_limiter::{
    FixedRateLimiter, NonRateLimiter, RateLimiter, SlowStartRateLimiter,
};
use janitor_publish::AppState;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, RwLock};

const EXIT_CONFIG: u8 = 1;
const EXIT_DATABASE: u8 = 2;
const EXIT_SHUTDOWN: u8 = 64;

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum RateLimitMode {
    None,
    Fixed,
    SlowStart,
}

#[derive(Parser)]
struct Args {
    #[clap(long)]
    listen_address: Option<String>,

    #[clap(long)]
    port: Option<u16>,

    #[clap(long, env = "JANITOR_CONFIG", default_value = "janitor.conf")]
    /// Path to configuration.
    config: PathBuf,

    #[clap(long, value_enum, default_value = "fixed")]
    /// How open merge proposals are limited per bucket.
    rate_limit_mode: RateLimitMode,

    #[clap(long)]
    /// Limit pushes per cycle.
    push_limit: Option<usize>,

    #[clap(long)]
    /// Only publish on request, never from the processing loop.
    no_auto_publish: bool,

    #[clap(long)]
    /// Run one publish cycle and exit.
    once: bool,

    #[clap(flatten)]
    logging: janitor::logging::LoggingArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    args.logging.init();

    let config_handle = match Config::read_file(&args.config) {
        Ok(config) => ConfigHandle::new(config, Some(args.config.clone())),
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config.display(), e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let config = config_handle.get();

    let conn = match janitor::state::create_pool(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            return ExitCode::from(EXIT_DATABASE);
        }
    };

    let (redis, lock_manager) = match &config.redis {
        Some(redis_config) => {
            let redis = match redis::Client::open(redis_config.url.as_str()) {
                Ok(client) => match client.get_connection_manager().await {
                    Ok(manager) => Some(manager),
                    Err(e) => {
                        log::warn!("Redis unavailable, events disabled: {}", e);
                        None
                    }
                },
                Err(e) => {
                    log::warn!("Invalid redis URL: {}", e);
                    None
                }
            };
            let lock_manager = redis
                .is_some()
                .then(|| rslock::LockManager::new(vec![redis_config.url.clone()]));
            (redis, lock_manager)
        }
        None => (None, None),
    };
    if lock_manager.is_none() {
        log::warn!("Running without a distributed lock manager; do not run replicas");
    }

    // Per-bucket limits from the database override the config file.
    let mut limits = config.rate_limits.clone();
    match sqlx::query_as::<_, (String, Option<i32>)>("SELECT name, max_open FROM rate_limit_bucket")
        .fetch_all(&conn)
        .await
    {
        Ok(rows) => {
            for (name, max_open) in rows {
                if let Some(max_open) = max_open {
                    limits.per_bucket.insert(name, max_open as usize);
                }
            }
        }
        Err(e) => log::warn!("Failed to load rate limit buckets: {}", e),
    }

    let bucket_rate_limiter: Box<dyn RateLimiter> = match args.rate_limit_mode {
        RateLimitMode::None => Box::new(NonRateLimiter::new()),
        RateLimitMode::Fixed => Box::new(FixedRateLimiter::new(limits)),
        RateLimitMode::SlowStart => Box::new(SlowStartRateLimiter::new(Some(
            config.rate_limits.default_max_open,
        ))),
    };

    let state = Arc::new(AppState {
        conn,
        config: config_handle.clone(),
        bucket_rate_limiter: Mutex::new(bucket_rate_limiter),
        forge_rate_limiter: Arc::new(RwLock::new(HashMap::new())),
        forge_failure_counts: Mutex::new(HashMap::new()),
        push_limit: args.push_limit.or(config.publisher.push_limit),
        redis,
        lock_manager,
        auto_publish: !args.no_auto_publish,
    });

    if let Err(e) = janitor_publish::refresh_bucket_mp_counts(&state).await {
        eprintln!("Failed to load proposal counts: {}", e);
        return ExitCode::from(EXIT_DATABASE);
    }

    // Reload configuration on SIGHUP; the new snapshot is swapped in
    // atomically behind the shared handle.
    {
        let config_handle = config_handle.clone();
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
                if let Err(e) = config_handle.reload() {
                    log::error!("Config reload failed, keeping old snapshot: {}", e);
                }
            }
        });
    }

    if args.once {
        if let Err(e) =
            janitor_publish::queue::publish_pending_ready(state.clone(), state.push_limit).await
        {
            eprintln!("Publish cycle failed: {}", e);
            return ExitCode::from(EXIT_DATABASE);
        }
        return ExitCode::SUCCESS;
    }

    let loop_state = state.clone();
    let interval = chrono::Duration::seconds(config.publisher.interval as i64);
    tokio::spawn(async move {
        janitor_publish::queue::process_queue_loop(loop_state, interval).await;
    });

    let (_shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel(1);
    if let Some(redis_config) = &config.redis {
        let listener_state = state.clone();
        let redis_url = redis_config.url.clone();
        tokio::spawn(async move {
            if let Err(e) =
                janitor_publish::redis::listen_to_runner(listener_state, &redis_url, shutdown_rx)
                    .await
            {
                log::error!("Runner listener failed: {}", e);
            }
        });
    }

    let listen_address = args
        .listen_address
        .unwrap_or_else(|| config.publisher.listen_address.clone());
    let port = args.port.unwrap_or(config.publisher.port);
    let addr = format!("{}:{}", listen_address, port);
    log::info!("Listening on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Failed to bind {}: {}", addr, e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let router = janitor_publish::web::app(state);
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
