use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use pgctx_auth::{JwtOptions, VerifyOptions};
use pgctx_session::PgSettings;

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub db_url: String,
    pub jwt: Option<JwtOptions>,
    pub default_role: Option<String>,
    pub pg_settings: PgSettings,
    pub pool_max_connections: u32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl ProbeConfig {
    /// Process env wins over the optional `PGCTX_CONFIG_PATH` file.
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = match optional_env("PGCTX_CONFIG_PATH") {
            Some(path) => read_config_file(&path)?,
            None => HashMap::new(),
        };
        merged.extend(std::env::vars());
        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let db_url = require_nonempty(kv, "PGCTX_DB_URL")?;

        let jwt = parse_jwt_options(kv)?;

        let default_role = optional(kv, "PGCTX_DEFAULT_ROLE");

        let pg_settings = parse_pg_settings(kv.get("PGCTX_PG_SETTINGS"))?;

        let pool_max_connections: u32 = parse_num(kv, "PGCTX_POOL_MAX_CONNECTIONS", 8)?;
        if pool_max_connections == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "PGCTX_POOL_MAX_CONNECTIONS must be >= 1".to_string(),
            });
        }

        let acquire_timeout_ms: u64 = parse_num(kv, "PGCTX_ACQUIRE_TIMEOUT_MS", 2000)?;

        Ok(Self {
            db_url,
            jwt,
            default_role,
            pg_settings,
            pool_max_connections,
            acquire_timeout: Duration::from_millis(acquire_timeout_ms),
        })
    }
}

/// JWT options are only built when at least one `PGCTX_JWT_*` key is set.
/// Conflicting audience keys are accepted here and rejected per request.
fn parse_jwt_options(kv: &HashMap<String, String>) -> Result<Option<JwtOptions>, StartupError> {
    let secret = optional(kv, "PGCTX_JWT_SECRET").map(String::into_bytes);
    let audiences = parse_list(kv.get("PGCTX_JWT_AUDIENCES"));
    let audience = parse_list(kv.get("PGCTX_JWT_VERIFY_AUDIENCE"));
    let issuer = parse_list(kv.get("PGCTX_JWT_ISSUER"));
    let subject = optional(kv, "PGCTX_JWT_SUBJECT");
    let leeway_secs = parse_num(kv, "PGCTX_JWT_LEEWAY_SECS", 0)?;

    let role = match optional(kv, "PGCTX_JWT_ROLE_CLAIM") {
        None => None,
        Some(path) => {
            let segments = path.split('.').map(|s| s.trim()).collect::<Vec<_>>();
            if segments.iter().any(|s| s.is_empty()) {
                return Err(StartupError {
                    code: "ERR_INVALID_CONFIG",
                    message: "PGCTX_JWT_ROLE_CLAIM must be a dot-separated claim path"
                        .to_string(),
                });
            }
            Some(segments.into_iter().map(|s| s.to_string()).collect())
        }
    };

    if secret.is_none()
        && audiences.is_none()
        && audience.is_none()
        && issuer.is_none()
        && subject.is_none()
        && role.is_none()
    {
        return Ok(None);
    }

    Ok(Some(JwtOptions {
        secret,
        audiences,
        verify_options: VerifyOptions {
            audience,
            issuer,
            subject,
            leeway_secs,
            ..VerifyOptions::default()
        },
        role,
    }))
}

fn parse_pg_settings(value: Option<&String>) -> Result<PgSettings, StartupError> {
    let Some(raw) = value.map(|v| v.trim()).filter(|v| !v.is_empty()) else {
        return Ok(PgSettings::new());
    };

    let parsed = serde_json::from_str::<serde_json::Value>(raw).map_err(|_| StartupError {
        code: "ERR_INVALID_CONFIG",
        message: "PGCTX_PG_SETTINGS must be valid JSON".to_string(),
    })?;

    let Some(map) = parsed.as_object() else {
        return Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "PGCTX_PG_SETTINGS must be a JSON object".to_string(),
        });
    };

    Ok(PgSettings::from_json_object(map))
}

fn read_config_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|err| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("cannot read {}: {}", path, err),
    })?;
    parse_config_lines(&contents)
}

/// `KEY=VALUE` lines; blank lines and `#` comments are skipped.
fn parse_config_lines(contents: &str) -> Result<HashMap<String, String>, StartupError> {
    let parse_error = |line_no: usize| StartupError {
        code: "ERR_CONFIG_FILE_PARSE",
        message: format!("config line {} is not KEY=VALUE", line_no),
    };

    contents
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(line_no, line)| {
            let (key, value) = line.split_once('=').ok_or_else(|| parse_error(line_no))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(parse_error(line_no));
            }
            Ok((key.to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|q| value.strip_prefix(q)?.strip_suffix(q))
        .unwrap_or(value)
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn optional(kv: &HashMap<String, String>, key: &str) -> Option<String> {
    kv.get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn parse_list(value: Option<&String>) -> Option<Vec<String>> {
    let items = value?
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect::<Vec<_>>();
    (!items.is_empty()).then_some(items)
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    optional(kv, key).ok_or_else(|| StartupError {
        code: "ERR_MISSING_CONFIG",
        message: format!("missing required config key {}", key),
    })
}

fn parse_num<T: FromStr>(
    kv: &HashMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, StartupError> {
    match optional(kv, key) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a non-negative integer", key),
        }),
    }
}
