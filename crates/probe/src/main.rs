use pgctx_auth::{JsonWebTokenVerifier, authenticate};
use pgctx_probe::config::ProbeConfig;
use pgctx_probe::describe_session;
use pgctx_session::{PgConnectionSource, RequestContext, with_request_context};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = match ProbeConfig::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("ERROR {} {}", err.code, err.message);
            std::process::exit(1);
        }
    };

    let token = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PGCTX_BEARER_TOKEN").ok())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    let source = match PgConnectionSource::connect(
        &config.db_url,
        config.pool_max_connections,
        config.acquire_timeout,
    )
    .await
    {
        Ok(source) => source,
        Err(err) => {
            eprintln!("ERROR ERR_DB_UNAVAILABLE {}", err);
            std::process::exit(1);
        }
    };

    tracing::info!(
        has_token = token.is_some(),
        jwt_configured = config.jwt.is_some(),
        "pgctx-probe establishing session"
    );

    // Only used to pick which claim settings to read back; a rejected token
    // is reported by the context run itself.
    let claim_names = authenticate(
        &JsonWebTokenVerifier,
        token.as_deref(),
        config.jwt.as_ref(),
    )
    .map(|auth| auth.claims.keys().cloned().collect::<Vec<_>>())
    .unwrap_or_default();

    let ctx = RequestContext {
        bearer_token: token.as_deref(),
        jwt_options: config.jwt.as_ref(),
        pg_settings: Some(&config.pg_settings),
        default_role: config.default_role.as_deref(),
        ..RequestContext::new(&source)
    };

    let result = with_request_context(ctx, |session| async move {
        describe_session(&session, &claim_names).await
    })
    .await;

    source.close().await;

    match result {
        Ok(report) => println!("{}", report),
        Err(err) => {
            eprintln!("ERROR {} {}", err.code(), err);
            std::process::exit(1);
        }
    }
}
