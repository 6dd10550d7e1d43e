//! Database Layer
//!
//! Postgres pool plus the durable-store statements. After startup, the only
//! steady-state writer is the store sync worker and the only steady-state
//! reader is the recovery loader; request paths never touch the pool.

pub mod store;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }
}
