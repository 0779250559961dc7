use crate::store::{ttl_millis, AtomicUpdate, PubSub, Store, StoreError, StoreResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, FromRedisValue};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const SCAN_BATCH: usize = 500;

/// Shared-store adapter over a single Redis endpoint.
///
/// The connection is established lazily so the service can boot while Redis
/// is down; every command is bounded by `timeout`.
pub struct RedisStore {
    client: Client,
    connection: Mutex<Option<ConnectionManager>>,
    timeout: Duration,
}

impl RedisStore {
    pub fn new(redis_url: &str, timeout: Duration) -> StoreResult<Self> {
        let client = Client::open(redis_url)?;

        Ok(Self {
            client,
            connection: Mutex::new(None),
            timeout,
        })
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        let mut guard = self.connection.lock().await;

        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .bounded("CONNECT", ConnectionManager::new(self.client.clone()))
            .await?;
        debug!("Connected to Redis");
        *guard = Some(conn.clone());

        Ok(conn)
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout {
                op,
                timeout: self.timeout,
            }),
        }
    }

    async fn query<T: FromRedisValue>(&self, op: &'static str, cmd: redis::Cmd) -> StoreResult<T> {
        let mut conn = self.connection().await?;
        self.bounded(op, async move { cmd.query_async::<_, T>(&mut conn).await })
            .await
    }
}

fn score_arg(score: i64) -> String {
    match score {
        i64::MIN => "-inf".to_string(),
        i64::MAX => "+inf".to_string(),
        s => s.to_string(),
    }
}

#[async_trait]
impl Store for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> StoreResult<()> {
        let reply: String = self.query("PING", redis::cmd("PING")).await?;
        if reply != "PONG" {
            warn!(reply = %reply, "Unexpected PING reply from Redis");
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query("GET", cmd).await
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("KEEPTTL");
        self.query("SET", cmd).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(ttl_millis(ttl));
        let _: i64 = self.query("PEXPIRE", cmd).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let _: i64 = self.query("DEL", cmd).await?;
        Ok(())
    }

    async fn update(&self, key: &str, update: &AtomicUpdate<'_>) -> StoreResult<Vec<i64>> {
        let mut invocation = update.script.key(key);
        for arg in &update.args {
            invocation.arg(arg);
        }

        let mut conn = self.connection().await?;
        self.bounded("EVALSHA", async move {
            invocation.invoke_async::<_, Vec<i64>>(&mut conn).await
        })
        .await
    }

    async fn keys_matching(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH);
            let (next, batch): (u64, Vec<String>) = self.query("SCAN", cmd).await?;
            keys.extend(batch);

            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn z_add(&self, key: &str, score: i64, member: &str) -> StoreResult<()> {
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key).arg(score).arg(member);
        let _: i64 = self.query("ZADD", cmd).await?;
        Ok(())
    }

    async fn z_count(&self, key: &str, min: i64, max: i64) -> StoreResult<u64> {
        let mut cmd = redis::cmd("ZCOUNT");
        cmd.arg(key).arg(score_arg(min)).arg(score_arg(max));
        self.query("ZCOUNT", cmd).await
    }

    async fn z_remove_range(&self, key: &str, min: i64, max: i64) -> StoreResult<()> {
        let mut cmd = redis::cmd("ZREMRANGEBYSCORE");
        cmd.arg(key).arg(score_arg(min)).arg(score_arg(max));
        let _: i64 = self.query("ZREMRANGEBYSCORE", cmd).await?;
        Ok(())
    }

    async fn z_trim_and_count(&self, key: &str, window_start: i64, now: i64) -> StoreResult<u64> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({}", window_start))
            .ignore()
            .cmd("ZCOUNT")
            .arg(key)
            .arg(window_start)
            .arg(now);

        let mut conn = self.connection().await?;
        let (count,): (u64,) = self
            .bounded("ZREMRANGEBYSCORE+ZCOUNT", async move {
                pipe.query_async::<_, (u64,)>(&mut conn).await
            })
            .await?;
        Ok(count)
    }

    async fn z_add_with_expiry(
        &self,
        key: &str,
        score: i64,
        member: &str,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .ignore();

        let mut conn = self.connection().await?;
        self.bounded("ZADD+PEXPIRE", async move {
            pipe.query_async::<_, ()>(&mut conn).await
        })
        .await
    }
}

#[async_trait]
impl PubSub for RedisStore {
    async fn publish(&self, topic: &str, message: &str) -> StoreResult<()> {
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(topic).arg(message);
        let receivers: i64 = self.query("PUBLISH", cmd).await?;
        debug!(topic = %topic, receivers = receivers, "Published message");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> StoreResult<BoxStream<'static, String>> {
        // Pub/sub needs a dedicated connection; the multiplexed manager cannot
        // enter subscriber mode.
        let conn = self
            .bounded("SUBSCRIBE", self.client.get_async_connection())
            .await?;
        let mut pubsub = conn.into_pubsub();
        self.bounded("SUBSCRIBE", pubsub.subscribe(topic)).await?;

        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload::<String>().unwrap_or_default());

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_arg_maps_infinities() {
        assert_eq!(score_arg(i64::MIN), "-inf");
        assert_eq!(score_arg(i64::MAX), "+inf");
        assert_eq!(score_arg(42), "42");
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(RedisStore::new("not a url", Duration::from_millis(10)).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_redis_reports_error() {
        // Port 1 is never a Redis server; the call must fail fast, not hang.
        let store = RedisStore::new("redis://127.0.0.1:1", Duration::from_millis(200)).unwrap();
        assert!(store.ping().await.is_err());
        assert!(store.get("anything").await.is_err());
    }
}
