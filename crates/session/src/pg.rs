use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres};

use crate::connection::{BEGIN, COMMIT, Connection, ConnectionSource, DbError, Query, ROLLBACK};

/// [`ConnectionSource`] over a sqlx Postgres pool.
#[derive(Clone)]
pub struct PgConnectionSource {
    pool: PgPool,
}

impl PgConnectionSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(
        db_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(db_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ConnectionSource for PgConnectionSource {
    type Connection = PgSessionConnection;

    async fn acquire(&self) -> Result<PgSessionConnection, DbError> {
        let conn = self.pool.acquire().await?;
        Ok(PgSessionConnection {
            conn,
            in_transaction: false,
        })
    }
}

pub struct PgSessionConnection {
    conn: PoolConnection<Postgres>,
    in_transaction: bool,
}

impl PgSessionConnection {
    /// Direct access for request logic that wants the full sqlx API.
    pub fn as_pg(&mut self) -> &mut PgConnection {
        &mut self.conn
    }
}

#[async_trait]
impl Connection for PgSessionConnection {
    type Row = PgRow;

    async fn query(&mut self, query: &Query) -> Result<Vec<PgRow>, DbError> {
        let mut statement = sqlx::query(&query.text);
        for value in &query.values {
            statement = statement.bind(value.to_sql_text());
        }
        let rows = statement.fetch_all(&mut *self.conn).await?;

        match query.text.as_str() {
            BEGIN => self.in_transaction = true,
            COMMIT | ROLLBACK => self.in_transaction = false,
            _ => {}
        }

        Ok(rows)
    }

    async fn release(self) {
        // A connection still inside a transaction must not go back to the pool.
        if self.in_transaction {
            if let Err(err) = self.conn.close().await {
                tracing::warn!(error = %err, "failed to close connection left in a transaction");
            }
        }
    }
}
