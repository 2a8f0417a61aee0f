use std::sync::{
    atomic::{AtomicBool, Ordering},
    OnceLock,
};

use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::{error::SqlState, types::ToSql, Row};
use tracing::{info, warn};

use crate::{config::DbSettings, error::StoreError};

/// All catalogue tables live in one dedicated namespace.
pub const SCHEMA: &str = "insight";

/// Declarative schema for one record family: the initial create statements
/// plus the add-column patches accumulated by later revisions. The patch list
/// is what the drift-repair path replays.
pub struct TableDdl {
    pub table: &'static str,
    pub create: &'static [&'static str],
    pub patches: &'static [&'static str],
}

/// Relational half of a dual-mode store: connection settings, the lazily
/// built pool, and the schema verification state for this process.
///
/// Schema state moves Unverified -> Verified on the first successful ensure;
/// an undefined-column error knocks it back through one repair pass before
/// the owning store retries the query.
pub struct DbHandle {
    settings: DbSettings,
    ddl: &'static TableDdl,
    pool: OnceLock<Pool>,
    verified: AtomicBool,
}

impl DbHandle {
    pub fn new(settings: DbSettings, ddl: &'static TableDdl) -> Self {
        Self {
            settings,
            ddl,
            pool: OnceLock::new(),
            verified: AtomicBool::new(false),
        }
    }

    pub fn configured(&self) -> bool {
        self.settings.configured()
    }

    /// Establish the pool and ensure the schema. Idempotent; a no-op when the
    /// store is unconfigured or already initialized. Connectivity failure
    /// here is fatal and surfaced to the caller.
    ///
    /// Returns true only when this call established the pool, so callers can
    /// run their once-only work (seeding) exactly once per process.
    pub async fn init(&self) -> Result<bool, StoreError> {
        if !self.settings.configured() || self.pool.get().is_some() {
            return Ok(false);
        }

        let pool = build_pool(&self.settings)?;
        let client = pool
            .get()
            .await
            .map_err(|err| StoreError::Connectivity(err.to_string()))?;

        // Native UUID generation is a convenience, not a requirement; ids are
        // always supplied by the application.
        if let Err(err) = client
            .batch_execute("CREATE EXTENSION IF NOT EXISTS pgcrypto")
            .await
        {
            warn!(table = self.ddl.table, error = %err, "pgcrypto extension unavailable, using application-generated ids");
        }

        self.ensure_schema(&client).await?;
        self.verified.store(true, Ordering::Release);
        let fresh = self.pool.set(pool).is_ok();
        info!(table = self.ddl.table, "postgres store initialized");
        Ok(fresh)
    }

    /// Scoped client acquisition; runs the lazy schema ensure the first time
    /// the backend is touched in this process.
    pub async fn client(&self) -> Result<Object, StoreError> {
        let pool = self.pool.get().ok_or(StoreError::NotConfigured)?;
        let client = pool.get().await?;
        if !self.verified.load(Ordering::Acquire) {
            self.ensure_schema(&client).await?;
            self.verified.store(true, Ordering::Release);
        }
        Ok(client)
    }

    /// Replay the add-column patches after an undefined-column error. The
    /// caller retries its query exactly once afterwards.
    pub async fn repair(&self, client: &Object) -> Result<(), StoreError> {
        warn!(table = self.ddl.table, "undefined column reported, repairing schema");
        for stmt in self.ddl.patches {
            run_ddl(client, stmt).await?;
        }
        self.verified.store(true, Ordering::Release);
        Ok(())
    }

    /// Query with one repair-and-retry cycle on undefined-column errors. A
    /// failure after repair is persistent drift and propagates.
    pub async fn query(
        &self,
        client: &Object,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, StoreError> {
        match client.query(sql, params).await {
            Ok(rows) => Ok(rows),
            Err(err) if is_undefined_column(&err) => {
                self.repair(client).await?;
                client.query(sql, params).await.map_err(|source| {
                    StoreError::SchemaDrift {
                        table: self.ddl.table,
                        source,
                    }
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn query_opt(
        &self,
        client: &Object,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>, StoreError> {
        match client.query_opt(sql, params).await {
            Ok(row) => Ok(row),
            Err(err) if is_undefined_column(&err) => {
                self.repair(client).await?;
                client.query_opt(sql, params).await.map_err(|source| {
                    StoreError::SchemaDrift {
                        table: self.ddl.table,
                        source,
                    }
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn query_one(
        &self,
        client: &Object,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Row, StoreError> {
        match client.query_one(sql, params).await {
            Ok(row) => Ok(row),
            Err(err) if is_undefined_column(&err) => {
                self.repair(client).await?;
                client.query_one(sql, params).await.map_err(|source| {
                    StoreError::SchemaDrift {
                        table: self.ddl.table,
                        source,
                    }
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn execute(
        &self,
        client: &Object,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, StoreError> {
        match client.execute(sql, params).await {
            Ok(count) => Ok(count),
            Err(err) if is_undefined_column(&err) => {
                self.repair(client).await?;
                client.execute(sql, params).await.map_err(|source| {
                    StoreError::SchemaDrift {
                        table: self.ddl.table,
                        source,
                    }
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn ensure_schema(&self, client: &Object) -> Result<(), StoreError> {
        run_ddl(client, &format!("CREATE SCHEMA IF NOT EXISTS {SCHEMA}")).await?;
        for stmt in self.ddl.create {
            run_ddl(client, stmt).await?;
        }
        for stmt in self.ddl.patches {
            run_ddl(client, stmt).await?;
        }
        Ok(())
    }
}

/// Execute one DDL statement, tolerating the races IF NOT EXISTS leaves open
/// when two processes create the same object simultaneously.
async fn run_ddl(client: &Object, stmt: &str) -> Result<(), StoreError> {
    match client.batch_execute(stmt).await {
        Ok(()) => Ok(()),
        Err(err) if is_duplicate_object(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn build_pool(settings: &DbSettings) -> Result<Pool, StoreError> {
    let mut pg = tokio_postgres::Config::new();
    if let Some(host) = &settings.host {
        pg.host(host);
    }
    pg.port(settings.port);
    if let Some(dbname) = &settings.dbname {
        pg.dbname(dbname);
    }
    if let Some(user) = &settings.user {
        pg.user(user);
    }
    if let Some(password) = &settings.password {
        pg.password(password);
    }

    let manager_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };

    let manager = if settings.tls {
        let connector = TlsConnector::builder()
            .build()
            .map_err(|err| StoreError::Connectivity(format!("tls setup failed: {err}")))?;
        Manager::from_config(pg, MakeTlsConnector::new(connector), manager_config)
    } else {
        Manager::from_config(pg, tokio_postgres::NoTls, manager_config)
    };

    Pool::builder(manager)
        .max_size(16)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|err| StoreError::Connectivity(err.to_string()))
}

/// SQLSTATE 42703: a query assumed a column this table predates.
pub fn is_undefined_column(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::UNDEFINED_COLUMN)
}

fn is_duplicate_object(err: &tokio_postgres::Error) -> bool {
    matches!(
        err.code(),
        Some(&SqlState::DUPLICATE_SCHEMA)
            | Some(&SqlState::DUPLICATE_TABLE)
            | Some(&SqlState::DUPLICATE_OBJECT)
            | Some(&SqlState::UNIQUE_VIOLATION)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEST_DDL: TableDdl = TableDdl {
        table: "insight.test_table",
        create: &[],
        patches: &[],
    };

    #[tokio::test]
    async fn unconfigured_init_never_reports_a_fresh_pool() {
        let handle = DbHandle::new(DbSettings::default(), &TEST_DDL);
        assert!(!handle.init().await.unwrap());
        assert!(!handle.init().await.unwrap());
    }
}
