use jsonwebtoken::{EncodingKey, Header, encode};
use pgctx_auth::JwtOptions;
use pgctx_probe::describe_session;
use pgctx_session::{PgConnectionSource, RequestContext, with_request_context};

fn test_db_url() -> Option<String> {
    std::env::var("PGCTX_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn report_reflects_role_and_claims() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping probe test; set PGCTX_TEST_DB_URL to enable");
        return;
    };

    let source = PgConnectionSource::new(
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&db_url)
            .await
            .expect("DB connect should succeed"),
    );

    let login_role: String = sqlx::query_scalar("SELECT current_user::text")
        .fetch_one(source.pool())
        .await
        .expect("current_user should be readable");

    let token = encode(
        &Header::default(),
        &serde_json::json!({"aud": "postgraphile", "sub": "u1", "role": login_role}),
        &EncodingKey::from_secret(b"probe"),
    )
    .expect("token encode should succeed");
    let options = JwtOptions {
        secret: Some(b"probe".to_vec()),
        ..JwtOptions::default()
    };

    let ctx = RequestContext {
        bearer_token: Some(&token),
        jwt_options: Some(&options),
        ..RequestContext::new(&source)
    };
    let claim_names = vec!["aud".to_string(), "sub".to_string(), "missing".to_string()];
    let (report, direct_sub) = with_request_context(ctx, |session| async move {
        let report = describe_session(&session, &claim_names).await?;
        let mut conn = session.connection().await?;
        let direct_sub: Option<String> =
            sqlx::query_scalar("SELECT current_setting('jwt.claims.sub', true)")
                .fetch_one(conn.as_pg())
                .await?;
        Ok::<_, pgctx_session::DbError>((report, direct_sub))
    })
    .await
    .expect("context should succeed");

    assert_eq!(report["current_user"], serde_json::json!(login_role));
    assert_eq!(report["role"], serde_json::json!(login_role));
    assert_eq!(report["claims"]["sub"], serde_json::json!("u1"));
    assert_eq!(report["claims"]["aud"], serde_json::json!("postgraphile"));
    assert_eq!(report["claims"]["missing"], serde_json::Value::Null);
    assert_eq!(direct_sub.as_deref(), Some("u1"));
    let names = report["claims"]
        .as_object()
        .expect("claims should be an object")
        .keys()
        .cloned()
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["aud", "sub", "missing"]);

    source.close().await;
}
