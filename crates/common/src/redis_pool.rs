use redis::Client;
use redis::aio::ConnectionManager;

/// Connect to Redis and confirm the server answers `PING`.
///
/// The manager reconnects transparently and is cheap to clone, so one instance
/// is shared by the status cache and the delay queue.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let mut manager = ConnectionManager::new(client).await?;

    let pong: String = redis::cmd("PING").query_async(&mut manager).await?;
    anyhow::ensure!(pong == "PONG", "unexpected PING reply from Redis: {}", pong);

    tracing::info!("Connected to Redis");
    Ok(manager)
}
