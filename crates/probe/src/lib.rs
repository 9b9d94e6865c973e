pub mod config;

use pgctx_session::{DbError, PgSessionConnection, SessionHandle};
use serde_json::{Map, Value};
use sqlx::Row;

/// What the database sees for the current request: the effective user, the
/// `role` setting and the `jwt.claims.<name>` setting for each of `claim_names`.
/// Claims Postgres does not know about come back as `null`.
pub async fn describe_session(
    session: &SessionHandle<PgSessionConnection>,
    claim_names: &[String],
) -> Result<Value, DbError> {
    let mut conn = session.connection().await?;

    let row = sqlx::query(
        "SELECT current_user::text AS user_name, current_setting('role') AS role",
    )
    .fetch_one(conn.as_pg())
    .await?;
    let current_user: String = row.try_get("user_name")?;
    let role: String = row.try_get("role")?;

    // Placeholder settings never show up in `pg_settings`; ask for each by name.
    let mut claims = Map::new();
    for name in claim_names {
        let setting: Option<String> =
            sqlx::query_scalar("SELECT current_setting('jwt.claims.' || $1, true)")
                .bind(name)
                .fetch_one(conn.as_pg())
                .await?;
        claims.insert(name.clone(), setting.map(Value::String).unwrap_or(Value::Null));
    }

    Ok(serde_json::json!({
        "current_user": current_user,
        "role": role,
        "claims": claims,
    }))
}
