use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use matchmaker::config::{LoggingSettings, Settings, StoreBackend};
use matchmaker::core::scenarios::backfill_match_function;
use matchmaker::core::{Backend, GreedyEvaluator};
use matchmaker::routes::{self, handle_json_payload_error, handle_path_error, AppState};
use matchmaker::statestore::{InMemoryStateStore, RedisStateStore, StateStore};
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn config_error(e: impl std::fmt::Display) -> io::Error {
    error!("Failed to load configuration: {}", e);
    io::Error::new(io::ErrorKind::InvalidInput, format!("Configuration error: {}", e))
}

fn init_logging(logging: &LoggingSettings) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true);

    if logging.is_pretty() {
        subscriber.pretty().init();
    } else {
        subscriber.init();
    }
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    // Load .env file if present
    dotenv::dotenv().ok();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            init_logging(&LoggingSettings::default());
            return Err(config_error(e));
        }
    };
    init_logging(&settings.logging);

    info!("Starting matchmaker...");

    let profiles = Arc::new(settings.match_profiles().map_err(config_error)?);

    info!("Configuration loaded: {} match profiles", profiles.len());

    let store: Arc<dyn StateStore> = match settings.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory state store");
            Arc::new(InMemoryStateStore::new())
        }
        StoreBackend::Redis => {
            let store = RedisStateStore::new(
                &settings.store.redis_url,
                &settings.store.key_prefix,
                settings.store.page_size,
            )
            .await
            .map_err(|e| {
                error!("Failed to connect to Redis: {}", e);
                io::Error::new(io::ErrorKind::Other, "Redis connection required")
            })?;
            info!("Using Redis state store (prefix: {})", settings.store.key_prefix);
            Arc::new(store)
        }
    };

    let options = settings.backend_options();
    info!("Backend options: {:?}", options);

    let backend = Backend::new(
        store.clone(),
        Arc::new(backfill_match_function(settings.scenario.tickets_per_match)),
        Arc::new(GreedyEvaluator),
        options,
    );

    // Periodic cycles
    let shutdown = CancellationToken::new();
    let backend_loop = if settings.backend.enabled && !profiles.is_empty() {
        let backend = backend.clone();
        let profiles = profiles.clone();
        let interval = settings.cycle_interval();
        let max_cycles = settings.backend.max_concurrent_cycles;
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            backend.run_forever(profiles, interval, max_cycles, shutdown).await
        }))
    } else {
        info!("Periodic cycles disabled");
        None
    };

    let app_state = AppState {
        store,
        backend,
        profiles,
    };

    // Configure HTTP server
    let host = settings.server.host.clone();
    let port = settings.server.port;
    let workers = settings.server.workers.unwrap_or(4);

    info!("Starting HTTP server on {}:{}", host, port);

    let server = HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::JsonConfig::default().error_handler(handle_json_payload_error))
            .app_data(web::PathConfig::default().error_handler(handle_path_error))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(routes::configure_routes)
    })
    .workers(workers)
    .bind((host, port))?
    .run()
    .await;

    shutdown.cancel();
    if let Some(handle) = backend_loop {
        if let Err(e) = handle.await {
            error!("Backend loop panicked: {}", e);
        }
    }

    server
}
