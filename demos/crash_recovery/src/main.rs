//! Crash recovery example against Redis.
//!
//! This example demonstrates:
//! - Tracking a job through the middleware while it runs
//! - A crashed peer leaving a tracked job behind
//! - Inspecting the orphan with the admin client
//! - The startup sweep resubmitting it onto the Sidekiq queue
//! - Graceful shutdown on Ctrl-C
//!
//! Prerequisites:
//! - Redis server running on localhost:6379
//!
//! Run with: `cargo run -p demo-crash-recovery`
//! Tune with the `ASSURED_JOBS_*` environment variables and `RUST_LOG`.

use assured_admin::OrphanAdmin;
use assured_core::{AssuredConfig, AssuredJobs, Backend, JobPayload, WorkerOptions};
use assured_redis::{RedisBackend, RedisEnqueuer, RedisUniqueLocks};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> assured_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("assured crash recovery example\n");

    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost".to_string());
    println!("Connecting to {}...", redis_url);

    let backend = match RedisBackend::new(&redis_url).await {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Failed to connect: {}", e);
            eprintln!("Make sure Redis is running: docker run -d -p 6379:6379 redis");
            return Err(e);
        }
    };
    println!("Connected\n");

    let config = AssuredConfig::from_env()?;
    let ns = config.namespace.clone();

    let mut assured = AssuredJobs::builder()
        .config(config)
        .enqueuer(RedisEnqueuer::with_connection(backend.connection()))
        .unique_locks(RedisUniqueLocks::with_connection(backend.connection()))
        .build_with_backend(backend.clone())?;
    let admin = OrphanAdmin::for_host(&assured);

    // Demo 1: a crashed peer
    println!("--- Demo 1: Orphan Left By A Crashed Peer ---\n");

    let crashed = format!("crashed-{}", assured.instance_id());
    let orphan = JobPayload::new("SendInvoice", format!("inv-{}", std::process::id()))
        .args(vec![serde_json::json!({"invoice_id": 42})])
        .queue("billing");
    backend
        .track_job(&ns, &crashed, &orphan.jid, &orphan.to_json()?)
        .await?;
    println!("peer {} died while running {}", crashed, orphan.jid);

    let stats = admin.stats().await?;
    println!(
        "orphans={} dead_instances={} live_instances={}\n",
        stats.total_orphaned_jobs, stats.dead_instances, stats.live_instances
    );

    // Demo 2: tracked execution
    println!("--- Demo 2: Tracked Execution ---\n");

    assured.start().await?;

    let middleware = assured.middleware();
    let job = JobPayload::new("ResizeImage", format!("img-{}", std::process::id()));
    let tracked = middleware
        .call(&WorkerOptions::assured(), &job, "default", async {
            backend
                .is_tracked_by(&ns, assured.instance_id(), &job.jid)
                .await
        })
        .await?;
    println!("[resize] tracked while running: {}", tracked);
    println!(
        "[resize] tracked after finishing: {}\n",
        backend.is_tracked_by(&ns, assured.instance_id(), &job.jid).await?
    );

    // Demo 3: startup sweep
    println!("--- Demo 3: Startup Recovery ---\n");
    println!(
        "waiting {}s for the startup sweep...",
        assured.config().startup_delay.as_secs()
    );
    tokio::time::sleep(assured.config().startup_delay + Duration::from_secs(1)).await;

    let remaining = admin.orphaned_jobs().await?;
    println!("orphans remaining: {}\n", remaining.len());

    println!("Press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.ok();

    let report = assured.shutdown().await?;
    println!("\nstopped, {} job(s) left for recovery", report.abandoned.len());

    Ok(())
}
