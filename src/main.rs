use std::str::FromStr;

use duologue::AppState;
use duologue::hub::{EchoPolicy, Hub};
use duologue::store::Directory;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,duologue=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url =
        dotenv::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:duologue.db".to_owned());
    let db_pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect_with(SqliteConnectOptions::from_str(&database_url)?.create_if_missing(true))
        .await?;

    let directory = Directory::new(db_pool);
    directory.migrate().await?;

    let echo = match dotenv::var("CHAT_ECHO_SELF").as_deref() {
        Ok("0") | Ok("false") => EchoPolicy::Suppress,
        _ => EchoPolicy::Echo,
    };

    let state = AppState {
        directory,
        hub: Hub::spawn(echo),
    };

    let bind_addr = dotenv::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(%bind_addr, "server started");
    axum::serve(listener, duologue::app(state)).await?;

    Ok(())
}
