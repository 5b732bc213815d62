//! Per-client limits with idle eviction.
//!
//! Run with:
//! ```
//! RUST_LOG=skp_throttle=debug cargo run --example per_key
//! ```

use std::time::Duration;

use skp_throttle::{EvictionConfig, KeyedLimiter, PerKeyLimiter, Quota};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Per-Key Limits Demo ===\n");

    let limiter = PerKeyLimiter::sliding_windows(
        &Quota::new(3, Duration::from_secs(1)),
        EvictionConfig::new(Duration::from_millis(500), Duration::from_millis(100)),
    )?;

    for client in ["10.0.0.1", "10.0.0.2"] {
        print!("{:10} | ", client);
        for _ in 0..5 {
            print!("{}", if limiter.allow(client).await? { "✓" } else { "✗" });
        }
        println!();
    }
    println!("\nTracked clients: {}", limiter.tracked_keys());

    println!("Idling for 1 second...");
    tokio::time::sleep(Duration::from_secs(1)).await;
    println!("Tracked clients after sweep: {}", limiter.tracked_keys());

    print!("{:10} | ", "10.0.0.1");
    println!("{}", if limiter.allow("10.0.0.1").await? { "✓ (fresh window)" } else { "✗" });

    limiter.stop().await;
    Ok(())
}
