use thiserror::Error;

/// Failures surfaced by the catalogue stores.
///
/// Not-found lookups and malformed identifier strings are not errors; they
/// come back as `None`/`false` from the store methods.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store was built without complete connection settings and a caller
    /// asked for the relational backend anyway. Routine mode selector, not a
    /// backend failure.
    #[error("store is not configured with a database backend")]
    NotConfigured,

    #[error("database connection failed: {0}")]
    Connectivity(String),

    #[error("database pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("database query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    /// An undefined-column condition survived the automatic column-patch
    /// retry; the deployed table cannot be repaired in place.
    #[error("schema repair failed for {table}: {source}")]
    SchemaDrift {
        table: &'static str,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("invalid record: {0}")]
    InvalidRecord(String),
}
