//! tx-router - Main entry point.
//!
//! Connects the configured data sources, builds the read/write router and
//! runs a short demonstration of declared transactional and routed calls
//! against a `messages` table, then prints the collected metrics.

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use tx_router::config::Config;
use tx_router::db::{
    DatabaseType, DbPool, READ_KEY, RoutingDataSource, SqlxTransactionManager, WRITE_KEY,
    current_routing_key,
};
use tx_router::{
    CallSite, Declaration, LogLevel, MetricsRegistry, OperationTable, TransactionService,
    TxInterceptor, TxResult, TxSettings,
};

const SAVE: CallSite = CallSite::new("MessageService", "save");
const LIST: CallSite = CallSite::new("MessageService", "list");
const ARCHIVE: CallSite = CallSite::new("MessageRepository", "archive");
const RECENT: CallSite = CallSite::new("MessageRepository", "recent");

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS messages (body TEXT NOT NULL)";
const SELECT_MESSAGES: &str = "SELECT body FROM messages";

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

fn insert_sql(db_type: Option<DatabaseType>) -> &'static str {
    match db_type {
        Some(DatabaseType::PostgreSQL) => "INSERT INTO messages (body) VALUES ($1)",
        _ => "INSERT INTO messages (body) VALUES (?)",
    }
}

fn operations() -> OperationTable {
    OperationTable::new()
        .register(
            SAVE,
            Declaration::TxWrite(
                TxSettings::new()
                    .with_log_level(LogLevel::All)
                    .with_instrumented(true),
            ),
        )
        .register(
            LIST,
            Declaration::TxRead(TxSettings::new().with_instrumented(true)),
        )
        .register(ARCHIVE, Declaration::Write)
        .register(RECENT, Declaration::Read)
}

async fn connect_router(config: &Config) -> TxResult<RoutingDataSource<DbPool>> {
    let sources = config.data_sources()?;
    let pool_opts = config.pool_options();
    pool_opts
        .validate()
        .map_err(tx_router::TxError::configuration)?;

    let mut builder = RoutingDataSource::builder().default_key(sources.default_key());
    for (key, url) in sources.iter() {
        info!(key = %key, "Connecting data source");
        let pool = DbPool::connect(url, &pool_opts).await?;
        builder = builder.target(key, pool);
    }
    builder.build()
}

async fn run(config: &Config, router: Arc<RoutingDataSource<DbPool>>) -> TxResult<()> {
    // Every target gets the demo table, selected through the routing key
    for key in router.keys() {
        let router = router.clone();
        tx_router::db::with_routing_key(key, async move {
            let mut session = router.acquire().await?;
            session.execute(CREATE_TABLE, &[]).await?;
            Ok::<_, tx_router::TxError>(())
        })
        .await?;
    }

    let write = Arc::new(SqlxTransactionManager::routed(router.clone(), WRITE_KEY));
    let read = Arc::new(SqlxTransactionManager::routed(router.clone(), READ_KEY));
    let service = TransactionService::new(write, read);
    let (registry, metrics) = MetricsRegistry::shared();
    let interceptor = TxInterceptor::new(service, metrics).with_table(operations());

    let message = config.message.clone();
    interceptor
        .invoke(SAVE, move |scope| {
            Box::pin(async move {
                let session = scope.session().await?;
                let sql = insert_sql(session.db_type());
                session.execute(sql, &[message.into()]).await?;
                Ok(())
            })
        })
        .await?;

    let messages = interceptor
        .invoke(LIST, |scope| {
            Box::pin(async move {
                scope
                    .session()
                    .await?
                    .fetch_strings(SELECT_MESSAGES, &[])
                    .await
            })
        })
        .await?;
    info!(count = messages.len(), "Messages read in read-only transaction");

    let archive_router = router.clone();
    let archived = format!("{} (archived)", config.message);
    interceptor
        .invoke(ARCHIVE, move |_scope| {
            Box::pin(async move {
                info!(routing_key = ?current_routing_key(), "Writing through routed pool");
                let mut session = archive_router.acquire().await?;
                let sql = insert_sql(session.db_type());
                session.execute(sql, &[archived.into()]).await
            })
        })
        .await?;

    let recent_router = router.clone();
    let recent = interceptor
        .invoke(RECENT, move |_scope| {
            Box::pin(async move {
                info!(routing_key = ?current_routing_key(), "Reading through routed pool");
                let mut session = recent_router.acquire().await?;
                session.fetch_strings(SELECT_MESSAGES, &[]).await
            })
        })
        .await?;
    for body in &recent {
        println!("{body}");
    }

    match serde_json::to_string_pretty(&registry.snapshot()) {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "Failed to serialize metrics snapshot"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    info!("Starting tx-router v{}", env!("CARGO_PKG_VERSION"));

    let router = match connect_router(&config).await {
        Ok(router) => Arc::new(router),
        Err(e) => {
            eprintln!("Error: {e}");
            if let Some(suggestion) = e.suggestion() {
                eprintln!("Suggestion: {suggestion}");
            }
            eprintln!();
            eprintln!("Examples:");
            eprintln!("  tx-router --write-url sqlite:app.db?mode=rwc --read-url sqlite:app.db");
            eprintln!(
                "  tx-router --source write=postgres://u:p@primary/app --source read=postgres://u:p@replica/app"
            );
            std::process::exit(1);
        }
    };

    let result = run(&config, router.clone()).await;

    for (_, pool) in router.targets() {
        pool.close().await;
    }

    if let Err(e) = result {
        error!(error = %e, "Demo run failed");
        return Err(e.into());
    }

    info!("Done");
    Ok(())
}
