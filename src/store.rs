//! Embedded `SQLite` storage for `cirrusd`.
//!
//! This module provides a clean separation between functional core (pure
//! configuration/validation) and imperative shell (I/O) for the single
//! shared database every component persists into.
//!
//! ## Architecture
//!
//! - **Functional Core**: path/config validation, connect-option building.
//! - **Imperative Shell**: filesystem operations, `SQLite` connections,
//!   migrations, and the query helpers every component calls through.

use crate::domain_types::ConnectionPoolSize;
use nutype::nutype;
use sqlx::{Pool, Row, Sqlite, SqlitePool, migrate::Migrator};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Static migrator for embedded `SQLite` migrations.
static MIGRATOR: Migrator = sqlx::migrate!();

/// Errors surfaced by `Store` operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Underlying `SQLite` error.
    #[error("database error: {message}")]
    Database {
        /// Error message from the database operation.
        message: String,
    },

    /// A scalar/row query found nothing where the caller required a value.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// A unique/foreign-key constraint was violated.
    #[error("constraint violation: {message}")]
    Constraint {
        /// Error message from the database operation.
        message: String,
    },

    /// Filesystem I/O error while preparing the database file.
    #[error("file system error: {message}")]
    FileSystem {
        /// Error message from the filesystem operation.
        message: String,
    },

    /// Invalid store configuration.
    #[error("configuration error: {field} - {reason}")]
    Configuration {
        /// Name of the configuration field that was invalid.
        field: String,
        /// Reason why the configuration was invalid.
        reason: String,
    },

    /// Embedded migration run failed.
    #[error("migration failed: {message}")]
    Migration {
        /// Error message from the migration run.
        message: String,
    },
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => Self::NotFound {
                what: "row".to_string(),
            },
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => Self::Constraint {
                message: db_err.to_string(),
            },
            other => Self::Database {
                message: other.to_string(),
            },
        }
    }
}

/// Result type for `Store` operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A value bound to a `?` placeholder in a `Store` query.
///
/// Every owning-table method builds its SQL with placeholders and passes
/// caller values through here rather than interpolating them into the
/// statement text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    /// Bound as `TEXT`.
    Text(String),
    /// Bound as `INTEGER`.
    Int(i64),
    /// Bound as `INTEGER` (0 or 1), matching how every boolean column in
    /// this schema is stored.
    Bool(bool),
    /// Bound as `NULL`.
    Null,
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for SqlParam {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<SqlParam>> From<Option<T>> for SqlParam {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>;
type SqliteScalarQuery<'q, O> = sqlx::query::QueryScalar<'q, Sqlite, O, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_param<'q>(query: SqliteQuery<'q>, param: &'q SqlParam) -> SqliteQuery<'q> {
    match param {
        SqlParam::Text(s) => query.bind(s.as_str()),
        SqlParam::Int(i) => query.bind(*i),
        SqlParam::Bool(b) => query.bind(*b),
        SqlParam::Null => query.bind(Option::<String>::None),
    }
}

fn bind_scalar_param<'q, O>(query: SqliteScalarQuery<'q, O>, param: &'q SqlParam) -> SqliteScalarQuery<'q, O> {
    match param {
        SqlParam::Text(s) => query.bind(s.as_str()),
        SqlParam::Int(i) => query.bind(*i),
        SqlParam::Bool(b) => query.bind(*b),
        SqlParam::Null => query.bind(Option::<String>::None),
    }
}

#[nutype(
    sanitize(with = |path: PathBuf| path),
    validate(predicate = |path| !path.as_os_str().is_empty() && path.extension().is_some_and(|ext| ext == "db")),
    derive(Clone, Debug, Eq, PartialEq)
)]
pub struct StorePath(PathBuf);

impl StorePath {
    /// Create a new store path, validating the `.db` extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is empty or lacks a `.db` extension.
    pub fn new<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path_buf = path.as_ref().to_path_buf();
        Self::try_new(path_buf).map_err(|_| StoreError::Configuration {
            field: "db_path".to_string(),
            reason: "path is empty or has invalid extension (must be .db)".to_string(),
        })
    }

    /// Path as a `PathBuf`.
    #[must_use]
    pub fn as_path(&self) -> PathBuf {
        self.clone().into_inner()
    }

    /// `SQLite` connection string (functional core).
    #[must_use]
    pub fn to_connection_string(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.as_path().display())
    }

    /// Parent directory, to be created before connecting.
    #[must_use]
    pub fn parent_directory(&self) -> Option<PathBuf> {
        self.as_path().parent().map(Path::to_path_buf)
    }
}

impl std::fmt::Display for StorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_path().display())
    }
}

/// Connection pool and pragma configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    path: StorePath,
    pool_size: ConnectionPoolSize,
    enable_wal_mode: bool,
    enable_foreign_keys: bool,
}

impl StoreConfig {
    /// Default config: WAL mode and foreign keys on.
    #[must_use]
    pub fn new(path: StorePath) -> Self {
        Self {
            path,
            pool_size: ConnectionPoolSize::default(),
            enable_wal_mode: true,
            enable_foreign_keys: true,
        }
    }

    /// Config for tests: single connection, no WAL, no FK enforcement.
    ///
    /// # Panics
    ///
    /// Panics if a pool size of 1 is somehow invalid (never happens; 1 is
    /// within `ConnectionPoolSize`'s 1..=1000 range).
    #[must_use]
    pub fn for_testing(path: StorePath) -> Self {
        Self {
            path,
            pool_size: ConnectionPoolSize::try_new(1).expect("pool size 1 is always valid"),
            enable_wal_mode: false,
            enable_foreign_keys: false,
        }
    }

    #[must_use]
    /// `with_pool_size`.
    pub fn with_pool_size(mut self, pool_size: ConnectionPoolSize) -> Self {
        self.pool_size = pool_size;
        self
    }

    #[must_use]
    /// `with_wal_mode`.
    pub fn with_wal_mode(mut self, enable: bool) -> Self {
        self.enable_wal_mode = enable;
        self
    }

    #[must_use]
    /// `with_foreign_keys`.
    pub fn with_foreign_keys(mut self, enable: bool) -> Self {
        self.enable_foreign_keys = enable;
        self
    }

    #[must_use]
    /// `path`.
    pub fn path(&self) -> &StorePath {
        &self.path
    }
}

/// The shared database every component persists into.
///
/// Ownership is per-table: each table belongs to exactly one component
/// module, and cross-component reads go through the owning component's
/// API rather than raw SQL.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
    config: StoreConfig,
}

// Functional core.
impl Store {
    fn create_connect_options(config: &StoreConfig) -> sqlx::sqlite::SqliteConnectOptions {
        use sqlx::ConnectOptions;
        use sqlx::sqlite::SqliteConnectOptions;

        let mut options = SqliteConnectOptions::new()
            .filename(config.path().as_path())
            .create_if_missing(true);

        if config.enable_wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }
        if config.enable_foreign_keys {
            options = options.pragma("foreign_keys", "ON");
        }

        options.disable_statement_logging()
    }
}

// Imperative shell.
impl Store {
    /// Open (creating if needed) the database and run embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created, the
    /// connection pool cannot be established, or migrations fail.
    pub async fn initialize(config: StoreConfig) -> StoreResult<Self> {
        Self::ensure_parent_directory_exists(&config).await?;
        let pool = Self::create_connection_pool(&config).await?;
        Self::apply_pragmas(&pool).await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool, config })
    }

    async fn ensure_parent_directory_exists(config: &StoreConfig) -> StoreResult<()> {
        if let Some(parent) = config.path().parent_directory() {
            tokio::fs::create_dir_all(&parent)
                .await
                .map_err(|e| StoreError::FileSystem {
                    message: format!("failed to create directory {}: {e}", parent.display()),
                })?;
        }
        Ok(())
    }

    async fn create_connection_pool(config: &StoreConfig) -> StoreResult<Pool<Sqlite>> {
        let options = Self::create_connect_options(config);
        SqlitePool::connect_with(options)
            .await
            .map_err(|e| StoreError::Database {
                message: format!("failed to create connection pool: {e}"),
            })
    }

    async fn apply_pragmas(pool: &Pool<Sqlite>) -> StoreResult<()> {
        for pragma in [
            "PRAGMA synchronous = NORMAL",
            "PRAGMA cache_size = -65536",
            "PRAGMA temp_store = MEMORY",
            "PRAGMA mmap_size = 268435456",
            "PRAGMA optimize",
        ] {
            sqlx::query(pragma)
                .execute(pool)
                .await
                .map_err(|e| StoreError::Database {
                    message: format!("failed to apply `{pragma}`: {e}"),
                })?;
        }
        Ok(())
    }

    async fn run_migrations(pool: &Pool<Sqlite>) -> StoreResult<()> {
        info!("running embedded migrations");
        match MIGRATOR.run(pool).await {
            Ok(()) => {
                info!("migrations complete");
                Ok(())
            }
            Err(e) => {
                warn!("migration run failed: {e}");
                Err(StoreError::Migration {
                    message: e.to_string(),
                })
            }
        }
    }

    /// Execute a statement that returns no rows (INSERT/UPDATE/DELETE/DDL),
    /// binding `params` against the statement's `?` placeholders in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn exec(&self, sql: &str, params: &[SqlParam]) -> StoreResult<u64> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_param(query, param);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Execute an INSERT, binding `params`, and return the id sqlite
    /// assigned it.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub async fn exec_insert(&self, sql: &str, params: &[SqlParam]) -> StoreResult<i64> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_param(query, param);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.last_insert_rowid())
    }

    /// Run a single-column, single-row integer query, binding `params`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the query returns no rows, or a
    /// database error otherwise.
    pub async fn query_scalar_int(&self, sql: &str, params: &[SqlParam]) -> StoreResult<i64> {
        let mut query = sqlx::query_scalar::<_, i64>(sql);
        for param in params {
            query = bind_scalar_param(query, param);
        }
        query.fetch_one(&self.pool).await.map_err(StoreError::from)
    }

    /// Run a single-column, single-row text query, binding `params`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the query returns no rows, or a
    /// database error otherwise.
    pub async fn query_scalar_string(&self, sql: &str, params: &[SqlParam]) -> StoreResult<String> {
        let mut query = sqlx::query_scalar::<_, String>(sql);
        for param in params {
            query = bind_scalar_param(query, param);
        }
        query.fetch_one(&self.pool).await.map_err(StoreError::from)
    }

    /// Run a multi-column query, binding `params`, and return each row as a
    /// vector of its columns stringified.
    ///
    /// Returns structured rows directly rather than a delimited text blob,
    /// so `limit` bounds the number of rows returned rather than a buffer
    /// size: no silent truncation, and any SQL error is surfaced distinctly.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn query_rows(
        &self,
        sql: &str,
        params: &[SqlParam],
        limit: usize,
    ) -> StoreResult<Vec<Vec<String>>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_param(query, param);
        }
        let rows = query.fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len().min(limit));
        for row in rows.into_iter().take(limit) {
            let mut cols = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                let value: Option<String> = row.try_get(idx).unwrap_or(None);
                cols.push(value.unwrap_or_default());
            }
            out.push(cols);
        }
        Ok(out)
    }

    /// Access to the connection pool for component-owned typed queries.
    #[must_use]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    #[must_use]
    /// `config`.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn test_store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = StorePath::new(dir.path().join("test.db")).unwrap();
        let config = StoreConfig::for_testing(path);
        (Store::initialize(config).await.unwrap(), dir)
    }

    #[test]
    fn rejects_empty_and_non_db_paths() {
        assert!(StorePath::new("").is_err());
        assert!(StorePath::new("test.txt").is_err());
        assert!(StorePath::new("test.db").is_ok());
    }

    #[test]
    fn connection_string_has_rwc_mode() {
        let path = StorePath::new("/tmp/cirrusd.db").unwrap();
        let conn_str = path.to_connection_string();
        assert!(conn_str.starts_with("sqlite://"));
        assert!(conn_str.contains("mode=rwc"));
    }

    #[tokio::test]
    async fn initializes_and_runs_migrations() {
        let (store, _dir) = test_store().await;
        let count = store
            .query_scalar_int("SELECT COUNT(*) FROM _sqlx_migrations", &[])
            .await
            .unwrap();
        assert!(count > 0);
    }

    #[tokio::test]
    async fn exec_insert_returns_last_rowid() {
        let (store, _dir) = test_store().await;
        store
            .exec("CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT, v TEXT)", &[])
            .await
            .unwrap();
        let id = store
            .exec_insert("INSERT INTO t (v) VALUES (?)", &[SqlParam::from("a")])
            .await
            .unwrap();
        assert_eq!(id, 1);
        let id2 = store
            .exec_insert("INSERT INTO t (v) VALUES (?)", &[SqlParam::from("b")])
            .await
            .unwrap();
        assert_eq!(id2, 2);
    }

    #[tokio::test]
    async fn query_scalar_int_not_found_surfaces_distinct_error() {
        let (store, _dir) = test_store().await;
        store
            .exec("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", &[])
            .await
            .unwrap();
        let err = store
            .query_scalar_int("SELECT id FROM t WHERE v = ?", &[SqlParam::from("nope")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn query_rows_respects_limit() {
        let (store, _dir) = test_store().await;
        store
            .exec("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", &[])
            .await
            .unwrap();
        for i in 0..5i64 {
            store
                .exec(
                    "INSERT INTO t (id, v) VALUES (?, ?)",
                    &[SqlParam::from(i), SqlParam::from(format!("row{i}"))],
                )
                .await
                .unwrap();
        }
        let rows = store
            .query_rows("SELECT id, v FROM t ORDER BY id", &[], 3)
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][1], "row0");
    }

    proptest::proptest! {
        #[test]
        fn bound_text_round_trips_bit_for_bit(value in ".*") {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async {
                let (store, _dir) = test_store().await;
                store
                    .exec("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", &[])
                    .await
                    .unwrap();
                store
                    .exec_insert("INSERT INTO t (v) VALUES (?)", &[SqlParam::from(value.clone())])
                    .await
                    .unwrap();
                let fetched = store
                    .query_scalar_string("SELECT v FROM t WHERE id = 1", &[])
                    .await
                    .unwrap();
                proptest::prop_assert_eq!(fetched, value);
                Ok(())
            })?;
        }
    }

    #[tokio::test]
    async fn bound_text_with_single_quote_round_trips_without_escaping() {
        let (store, _dir) = test_store().await;
        store
            .exec("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)", &[])
            .await
            .unwrap();
        store
            .exec_insert(
                "INSERT INTO t (v) VALUES (?)",
                &[SqlParam::from("o'brien")],
            )
            .await
            .unwrap();
        let v = store
            .query_scalar_string("SELECT v FROM t WHERE v = ?", &[SqlParam::from("o'brien")])
            .await
            .unwrap();
        assert_eq!(v, "o'brien");
    }
}
