use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use koi::clock::SystemClock;
use koi::config::{self, Config};
use koi::middleware::auth::OsTokenGenerator;
use koi::store::blob::{BlobStore, ObjectBlobStore};
use koi::store::memory::MemoryStore;
use koi::store::postgres::PgStore;
use koi::store::Store;
use koi::{api, bootstrap, cli, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "koi"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "koi=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::Migrate) => {
            if cfg.uses_memory_store() {
                anyhow::bail!("migrate needs a PostgreSQL DATABASE_URL");
            }
            let db = PgStore::connect(&cfg.database_url).await?;
            db.migrate().await?;
            tracing::info!("migrations applied");
            Ok(())
        }
        Some(cli::Commands::Bootstrap) => {
            let store = connect_store(&cfg).await?;
            let report = bootstrap::run(
                store.as_ref(),
                cfg.bootstrap_file.as_deref(),
                &cfg.admin_password,
            )
            .await?;
            println!(
                "roles created: {}, users created: {}, grants created: {}",
                report.roles_created, report.users_created, report.grants_created
            );
            Ok(())
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

/// Open the relational store named by `DATABASE_URL`, migrating PostgreSQL.
async fn connect_store(cfg: &Config) -> anyhow::Result<Arc<dyn Store>> {
    if cfg.uses_memory_store() {
        tracing::warn!("using the in-process store, all data is lost on exit");
        return Ok(Arc::new(MemoryStore::new()));
    }

    tracing::info!("Connecting to database...");
    let db = PgStore::connect(&cfg.database_url).await?;
    tracing::info!("Running migrations...");
    db.migrate().await?;
    Ok(Arc::new(db))
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    let store = connect_store(&cfg).await?;
    let blobs: Arc<dyn BlobStore> = Arc::new(ObjectBlobStore::from_url(&cfg.blob_store_url)?);

    bootstrap::run(
        store.as_ref(),
        cfg.bootstrap_file.as_deref(),
        &cfg.admin_password,
    )
    .await?;

    let state = Arc::new(AppState::new(
        cfg,
        store,
        blobs,
        Arc::new(SystemClock),
        Arc::new(OsTokenGenerator),
    ));

    let app = api::app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("KOI listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
