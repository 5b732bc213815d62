//! Several instances sharing one sliding window.
//!
//! Uses the in-memory store by default. With the `redis` feature and
//! `REDIS_URL` set, the instances share a Redis server instead.
//!
//! Run with:
//! ```
//! cargo run --example distributed
//! REDIS_URL=redis://localhost:6379 cargo run --example distributed --features redis
//! ```

use std::sync::Arc;
use std::time::Duration;

use skp_throttle::storage::{MemoryWindowStore, WindowStore};
use skp_throttle::{DistributedConfig, DistributedWindowLimiter, KeyedLimiter, Quota};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Distributed Window Demo ===\n");
    println!("Quota: 10 requests per 2 seconds, shared by 3 instances\n");

    #[cfg(feature = "redis")]
    if let Ok(url) = std::env::var("REDIS_URL") {
        let store = skp_throttle::storage::RedisWindowStore::from_url(url).await?;
        return run(Arc::new(store)).await;
    }

    run(Arc::new(MemoryWindowStore::new())).await
}

async fn run<S: WindowStore>(store: Arc<S>) -> Result<(), Box<dyn std::error::Error>> {
    let quota = Quota::new(10, Duration::from_secs(2));
    let config = DistributedConfig::default().with_prefix("demo");

    let mut tasks = Vec::new();
    for instance in 0..3 {
        let limiter = DistributedWindowLimiter::new(store.clone(), &quota, config.clone())?;
        tasks.push(tokio::spawn(async move {
            let mut admitted = 0;
            for _ in 0..8 {
                match limiter.allow("tenant:acme").await {
                    Ok(true) => admitted += 1,
                    Ok(false) => {}
                    Err(err) => eprintln!("instance {instance}: store error: {err}"),
                }
            }
            (instance, admitted)
        }));
    }

    let mut total = 0;
    for task in tasks {
        let (instance, admitted) = task.await?;
        println!("instance {instance}: {admitted} admitted");
        total += admitted;
    }
    println!("\nTotal admitted: {total} (limit 10)");
    println!("Members in store: {}", store.cardinality("demo:tenant:acme").await?);

    Ok(())
}
