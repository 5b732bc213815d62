//! Token bucket bursts, refill and blocking waits.
//!
//! Run with:
//! ```
//! RUST_LOG=skp_throttle=debug cargo run --example token_bucket
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use skp_throttle::{AdmissionError, Limiter, Quota, TokenBucket, throttle};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let quota = Quota::per_second(5).with_burst(3);
    let bucket = Arc::new(TokenBucket::from_quota(&quota)?);

    println!("=== Token Bucket Demo ===\n");
    println!("Quota: 5 requests/second, burst: 3\n");

    print!("Burst:   ");
    for _ in 0..5 {
        print!("{}", if bucket.allow().await? { "✓" } else { "✗" });
    }
    println!("  ({:.2} tokens left)", bucket.available());

    println!("\nWaiting for 3 tokens at once...");
    let start = Instant::now();
    bucket.wait_n(3, std::future::pending()).await?;
    println!("Admitted after {:?}", start.elapsed());

    println!("\nAsking for more than the bucket holds:");
    match bucket.wait_n(10, std::future::pending()).await {
        Err(AdmissionError::Unsatisfiable { requested, capacity }) => {
            println!("Rejected: {requested} permits can never fit in {capacity}");
        }
        other => println!("Unexpected: {other:?}"),
    }

    println!("\nThrottled jobs with a 300ms deadline each:");
    for job in 1..=6 {
        let deadline = tokio::time::sleep(Duration::from_millis(300));
        match throttle(&bucket, deadline, || async move { job * job }).await {
            Ok(out) => println!("  job {job} ran -> {out}"),
            Err(err) => println!("  job {job} skipped: {err}"),
        }
    }

    Ok(())
}
