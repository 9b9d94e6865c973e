//! Per-request Postgres sessions: one transaction per request, with the
//! caller's role and token claims applied through `set_config` before any
//! request logic runs.

mod connection;
mod context;
mod pg;
mod settings;

pub use connection::{Connection, ConnectionSource, DbError, Query};
pub use context::{ContextError, RequestContext, SessionHandle, with_request_context};
pub use pg::{PgConnectionSource, PgSessionConnection};
pub use settings::{
    PgSettingError, PgSettingValue, PgSettings, SettingValue, ValueKind, compile_settings,
    settings_query,
};
