//! Async API demo using AsyncIndex.
//!
//! Run with: cargo run --example async_demo --features async

#[cfg(feature = "async")]
use vecgate::prelude::*;
#[cfg(feature = "async")]
use vecgate::AsyncIndex;

#[cfg(feature = "async")]
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("Async vecgate Demo\n");

    let runtime = Runtime::mock().expect("Failed to create runtime");
    let index = AsyncIndex::from_sync(
        Index::flat(&runtime, 128, MetricType::L2).expect("Failed to create index"),
    );

    println!("Adding 1000 vectors from concurrent tasks...");
    let start = std::time::Instant::now();

    let mut handles = vec![];
    for i in 0..10 {
        let index = index.clone();
        handles.push(tokio::spawn(async move {
            let vectors: Vec<f32> = (0..100 * 128)
                .map(|j| ((i * 100 * 128 + j) as f32).sin())
                .collect();
            index.add(vectors).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    println!("   [OK] Added in {:?}", start.elapsed());
    println!("   Total vectors: {}\n", index.len());

    println!("Searching...");
    let query: Vec<f32> = (0..128).map(|i| (i as f32 * 0.1).cos()).collect();
    let results = index.search(query, 5).await.unwrap();

    println!("   Top 5 results:");
    for (i, n) in results.neighbors(0).iter().enumerate() {
        println!("     {}. label {} (distance: {:.4})", i + 1, n.label, n.distance);
    }

    index.release().await.unwrap();
    println!("\nAsync demo complete!");
}

#[cfg(not(feature = "async"))]
fn main() {
    println!("Run with: cargo run --example async_demo --features async");
}
