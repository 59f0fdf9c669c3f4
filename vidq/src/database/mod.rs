//! SQLite persistence: pool setup, embedded migrations, row models and repositories.

pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite, SqliteConnection};
use tracing::{debug, info, warn};

use crate::Result;

/// Database connection pool type alias.
///
/// The pool holds exactly one connection, so durable writes are serialized.
pub type DbPool = Pool<Sqlite>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// Applied to the connection right after it opens.
const CONNECTION_PRAGMAS: &[&str] = &[
    "PRAGMA wal_autocheckpoint = 1000",
    "PRAGMA journal_size_limit = 33554432",
    "PRAGMA cache_size = -8000",
    "PRAGMA temp_store = MEMORY",
];

async fn apply_pragmas(conn: &mut SqliteConnection) -> std::result::Result<(), sqlx::Error> {
    for pragma in CONNECTION_PRAGMAS {
        sqlx::query(pragma).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Open the single-connection pool for `database_url`.
///
/// Accepts any sqlx SQLite URL, e.g. `sqlite:vidq.db` or `sqlite::memory:`. Missing database
/// files are created. The connection is never recycled, so an in-memory database lives as
/// long as the pool.
pub async fn init_pool(database_url: &str) -> Result<DbPool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .after_connect(|conn, _meta| Box::pin(async move { apply_pragmas(conn).await }))
        .connect_with(options)
        .await?;

    let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode").fetch_one(&pool).await?;
    // In-memory databases report "memory" and cannot switch to WAL.
    if mode != "wal" && mode != "memory" {
        warn!(mode = %mode, "Unexpected journal mode, switching to WAL");
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    }

    let (busy, log, checkpointed): (i32, i32, i32) =
        sqlx::query_as("PRAGMA wal_checkpoint(PASSIVE)")
            .fetch_one(&pool)
            .await?;
    debug!(busy, log, checkpointed, "Startup WAL checkpoint");

    info!(journal_mode = %mode, "Database pool initialized");
    Ok(pool)
}

/// Apply the embedded migrations. Already-applied migrations are skipped.
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    info!("Running database migrations");
    sqlx::migrate!("./migrations").run(pool).await?;
    debug!("Database migrations completed");
    Ok(())
}
