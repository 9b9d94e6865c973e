use async_trait::async_trait;

use crate::settings::SettingValue;

pub(crate) const BEGIN: &str = "begin";
pub(crate) const COMMIT: &str = "commit";
pub(crate) const ROLLBACK: &str = "rollback";

/// SQL text plus positional parameters (`$1`, `$2`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub text: String,
    pub values: Vec<SettingValue>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            values: Vec::new(),
        }
    }

    pub fn with_values(text: impl Into<String>, values: Vec<SettingValue>) -> Self {
        Self {
            text: text.into(),
            values,
        }
    }
}

#[derive(Debug)]
pub enum DbError {
    Sqlx(sqlx::Error),
    /// The session handle was used after its transaction was finalized.
    Released,
    Backend(String),
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::Sqlx(err) => write!(f, "sql error: {}", err),
            DbError::Released => write!(f, "session connection has already been released"),
            DbError::Backend(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DbError::Sqlx(err) => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(value: sqlx::Error) -> Self {
        DbError::Sqlx(value)
    }
}

/// A single database connection, exclusively owned by one request.
#[async_trait]
pub trait Connection: Send {
    type Row: Send;

    async fn query(&mut self, query: &Query) -> Result<Vec<Self::Row>, DbError>;

    /// Hands the connection back to wherever it was acquired from.
    async fn release(self);
}

#[async_trait]
pub trait ConnectionSource: Send + Sync {
    type Connection: Connection + 'static;

    async fn acquire(&self) -> Result<Self::Connection, DbError>;
}
