use std::future::Future;
use std::sync::Arc;

use pgctx_auth::{AuthError, JsonWebTokenVerifier, JwtOptions, TokenVerifier, authenticate};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::Instrument;
use ulid::Ulid;

use crate::connection::{BEGIN, COMMIT, Connection, ConnectionSource, DbError, Query, ROLLBACK};
use crate::settings::{PgSettingError, PgSettings, compile_settings, settings_query};

static DEFAULT_VERIFIER: JsonWebTokenVerifier = JsonWebTokenVerifier;

/// Per-request inputs. Everything except the connection source is optional.
pub struct RequestContext<'a, S> {
    pub connection_source: &'a S,
    pub bearer_token: Option<&'a str>,
    pub jwt_options: Option<&'a JwtOptions>,
    pub pg_settings: Option<&'a PgSettings>,
    pub default_role: Option<&'a str>,
    pub verifier: &'a dyn TokenVerifier,
}

impl<'a, S> RequestContext<'a, S> {
    pub fn new(connection_source: &'a S) -> Self {
        Self {
            connection_source,
            bearer_token: None,
            jwt_options: None,
            pg_settings: None,
            default_role: None,
            verifier: &DEFAULT_VERIFIER,
        }
    }
}

#[derive(Debug)]
pub enum ContextError<E> {
    /// No connection could be obtained; no transaction was opened.
    Acquire(DbError),
    Database(DbError),
    Auth(AuthError),
    Setting(PgSettingError),
    Callback(E),
}

impl<E> ContextError<E> {
    pub fn code(&self) -> &'static str {
        match self {
            ContextError::Acquire(_) => "ERR_DB_UNAVAILABLE",
            ContextError::Database(_) => "ERR_DB",
            ContextError::Auth(err) => err.code,
            ContextError::Setting(_) => "ERR_PG_SETTING",
            ContextError::Callback(_) => "ERR_CALLBACK",
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for ContextError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextError::Acquire(err) => write!(f, "failed to acquire connection: {}", err),
            ContextError::Database(err) => write!(f, "{}", err),
            ContextError::Auth(err) => write!(f, "{}", err),
            ContextError::Setting(err) => write!(f, "{}", err),
            ContextError::Callback(err) => write!(f, "{}", err),
        }
    }
}

impl<E> std::error::Error for ContextError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ContextError::Acquire(err) | ContextError::Database(err) => Some(err),
            ContextError::Auth(err) => Some(err),
            ContextError::Setting(err) => Some(err),
            ContextError::Callback(err) => Some(err),
        }
    }
}

/// The transaction's connection as seen by request logic. Every clone stops
/// working once the transaction has been committed or rolled back.
pub struct SessionHandle<C> {
    inner: Arc<Mutex<Option<C>>>,
}

impl<C> Clone for SessionHandle<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connection> SessionHandle<C> {
    fn new(conn: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(conn))),
        }
    }

    pub async fn connection(&self) -> Result<MappedMutexGuard<'_, C>, DbError> {
        let guard = self.inner.lock().await;
        MutexGuard::try_map(guard, |conn| conn.as_mut()).map_err(|_| DbError::Released)
    }

    pub async fn query(&self, query: &Query) -> Result<Vec<C::Row>, DbError> {
        let mut conn = self.connection().await?;
        conn.query(query).await
    }

    pub async fn is_released(&self) -> bool {
        self.inner.lock().await.is_none()
    }

    /// Takes the connection back, leaving every remaining clone released.
    async fn detach(self) -> Option<C> {
        self.inner.lock().await.take()
    }
}

/// Runs `callback` inside a transaction carrying the request's role and claims.
///
/// Order of events: acquire, `begin`, token check, one batched `set_config`
/// call (skipped when there is nothing to set), callback, then `commit` on
/// success or `rollback` on any failure. The connection is released last on
/// every path once acquired. Synchronous logic can return `std::future::ready(..)`.
pub async fn with_request_context<S, F, Fut, T, E>(
    ctx: RequestContext<'_, S>,
    callback: F,
) -> Result<T, ContextError<E>>
where
    S: ConnectionSource,
    F: FnOnce(SessionHandle<S::Connection>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let span = tracing::debug_span!("pgctx.context", request_id = %Ulid::new());
    run(ctx, callback).instrument(span).await
}

async fn run<S, F, Fut, T, E>(
    ctx: RequestContext<'_, S>,
    callback: F,
) -> Result<T, ContextError<E>>
where
    S: ConnectionSource,
    F: FnOnce(SessionHandle<S::Connection>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut conn = ctx
        .connection_source
        .acquire()
        .await
        .map_err(ContextError::Acquire)?;

    if let Err(err) = conn.query(&Query::new(BEGIN)).await {
        conn.release().await;
        return Err(ContextError::Database(err));
    }
    tracing::debug!("transaction started");

    let (conn, outcome) = match establish(&ctx, &mut conn).await {
        Ok(()) => {
            let handle = SessionHandle::new(conn);
            let result = callback(handle.clone()).await;
            // Clones handed to the callback cannot empty the slot; only the
            // coordinator's own handle can, and it is consumed here.
            let Some(conn) = handle.detach().await else {
                tracing::error!("connection slot emptied before finalize");
                return Err(ContextError::Database(DbError::Released));
            };
            (conn, result.map_err(ContextError::Callback))
        }
        Err(err) => (conn, Err(err)),
    };

    finish(conn, outcome).await
}

/// Commits or rolls back according to `outcome`, then releases `conn`.
async fn finish<C, T, E>(
    mut conn: C,
    outcome: Result<T, ContextError<E>>,
) -> Result<T, ContextError<E>>
where
    C: Connection,
{
    match outcome {
        Ok(value) => {
            let committed = conn.query(&Query::new(COMMIT)).await;
            conn.release().await;
            committed.map_err(ContextError::Database)?;
            tracing::debug!("transaction committed");
            Ok(value)
        }
        Err(err) => {
            match conn.query(&Query::new(ROLLBACK)).await {
                Ok(_) => tracing::debug!(code = err.code(), "transaction rolled back"),
                Err(rollback_err) => {
                    tracing::warn!(error = %rollback_err, code = err.code(), "rollback failed");
                }
            }
            conn.release().await;
            Err(err)
        }
    }
}

/// Token check, settings compilation and the settings call.
async fn establish<S, E>(
    ctx: &RequestContext<'_, S>,
    conn: &mut S::Connection,
) -> Result<(), ContextError<E>>
where
    S: ConnectionSource,
{
    let authenticated = authenticate(ctx.verifier, ctx.bearer_token, ctx.jwt_options)
        .map_err(ContextError::Auth)?;

    let settings = compile_settings(
        ctx.pg_settings,
        &authenticated.claims,
        authenticated.role.as_ref(),
        ctx.default_role,
    )
    .map_err(ContextError::Setting)?;

    if let Some(query) = settings_query(&settings) {
        let keys = settings.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>();
        tracing::debug!(count = settings.len(), keys = ?keys, "applying settings");
        conn.query(&query).await.map_err(ContextError::Database)?;
    }

    Ok(())
}
