use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};

use crate::config::Config;
use crate::models::Result;

/// Builds the connection pool and verifies connectivity with a probe query.
/// An optional schema is applied to every pooled connection via
/// `search_path`, so all table references stay unqualified.
pub async fn connect_pool(config: &Config) -> Result<PgPool> {
    let mut options = PgPoolOptions::new().max_connections(config.max_db_connections);

    if let Some(schema) = config.db_schema.clone() {
        options = options.after_connect(move |conn, _meta| {
            let schema = schema.clone();
            Box::pin(async move {
                conn.execute(format!("SET search_path TO {}", schema).as_str())
                    .await?;
                Ok(())
            })
        });
    }

    let pool = options.connect(&config.database_url).await?;
    sqlx::query("SELECT 1").fetch_one(&pool).await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Migrations are up to date");
    Ok(())
}
