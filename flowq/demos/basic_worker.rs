//! Basic worker example with the in-memory store.
//!
//! Adds a handful of jobs (one flaky, one delayed, one flow), runs a worker
//! with four slots until everything settled and prints the final counts.
//!
//! Run with `RUST_LOG=flowq=debug` to see the worker's spans and events.

use std::sync::Arc;
use std::time::Duration;

use flowq::*;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

async fn process(mut ctx: JobContext<MemoryStore>) -> anyhow::Result<Value> {
    let job = ctx.job().clone();
    println!(
        "[WORKER] Processing {} (id={}, attempt {})",
        job.name,
        job.id,
        job.attempts_made + 1
    );
    match job.name.as_str() {
        "flaky" if job.attempts_made < 2 => anyhow::bail!("transient failure"),
        "assemble" => {
            let parts = ctx.queue().get_children_values(&job.id).await?;
            Ok(json!({ "parts": parts.len() }))
        }
        _ => {
            ctx.update_progress(json!(50)).await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.log(format!("done with {}", job.name)).await?;
            Ok(json!("ok"))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "flowq=info".into()))
        .init();

    println!("=== flowq Basic Worker Example ===\n");

    let store = Arc::new(MemoryStore::new());
    let queue = Queue::new("demo", store, QueueConfig::default());

    println!("1. Adding jobs...");
    for i in 0..5 {
        let handle = queue
            .add("simple", json!({ "n": i }), JobOptions::new())
            .await?;
        println!("   Added simple job {} (id={})", i, handle.id);
    }
    let flaky = queue
        .add(
            "flaky",
            json!({}),
            JobOptions::new()
                .with_attempts(3)
                .with_backoff(BackoffOptions::exponential(100)),
        )
        .await?;
    println!("   Added flaky job (id={})", flaky.id);
    let delayed = queue
        .add("delayed", json!({}), JobOptions::new().with_delay(500))
        .await?;
    println!("   Added delayed job (id={}, 500ms)", delayed.id);
    let flow = queue
        .add_flow(
            FlowNode::new("assemble", "demo", json!({}))
                .with_child(FlowNode::new("part", "demo", json!({ "n": 1 })))
                .with_child(FlowNode::new("part", "demo", json!({ "n": 2 }))),
        )
        .await?;
    println!("   Added flow (parent id={})", flow.handle.id);

    println!("\n2. Initial counts: {:?}", queue.get_job_counts().await?);

    println!("\n3. Starting worker...\n");
    let worker = Worker::new(
        queue.clone(),
        process,
        WorkerConfig::new("demo-worker").with_concurrency(4),
    )?;
    worker.start().await?;

    let total = 10;
    loop {
        let counts = queue.get_job_counts().await?;
        if counts.completed + counts.failed >= total {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    worker.close(false).await?;

    let counts = queue.get_job_counts().await?;
    println!("\n4. Final counts:");
    println!("   Completed: {}", counts.completed);
    println!("   Failed: {}", counts.failed);
    let flaky = queue.get_job(&flaky.id).await?;
    if let Some(flaky) = flaky {
        println!("   Flaky job attempts: {}", flaky.attempts_made);
    }
    let parent = queue.get_job(&flow.handle.id).await?;
    if let Some(parent) = parent {
        println!("   Flow result: {:?}", parent.return_value);
    }

    println!("\n=== Example Complete ===");
    Ok(())
}
