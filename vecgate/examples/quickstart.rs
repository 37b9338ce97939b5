//! Quick start example for vecgate.
//!
//! Builds a flat index, searches it, and releases it.
//!
//! Run with: cargo run --example quickstart

use tracing_subscriber::EnvFilter;
use vecgate::prelude::*;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("vecgate Quick Start\n");

    let runtime = Runtime::from_env(EngineConfig::default())?;
    println!("Engine: {}", runtime.engine_name());

    let documents = [
        ("Introduction to Rust programming", [0.9, 0.8, 0.1, 0.0, 0.1, 0.0, 0.2, 0.1]),
        ("Advanced Rust patterns and idioms", [0.85, 0.9, 0.15, 0.05, 0.1, 0.0, 0.25, 0.15]),
        ("Python for data science", [0.1, 0.2, 0.9, 0.85, 0.0, 0.1, 0.0, 0.2]),
        ("Machine learning fundamentals", [0.2, 0.1, 0.7, 0.8, 0.6, 0.7, 0.1, 0.3]),
        ("Systems programming with Rust", [0.8, 0.7, 0.2, 0.1, 0.15, 0.05, 0.3, 0.2]),
    ];

    let mut index = Index::flat(&runtime, 8, MetricType::L2)?;
    let vectors: Vec<f32> = documents.iter().flat_map(|(_, v)| v.iter().copied()).collect();
    index.add(&vectors)?;
    println!("Index contains {} vectors\n", index.len());

    let query = [0.88, 0.85, 0.12, 0.03, 0.12, 0.02, 0.22, 0.12];
    let results = index.search(&query, 3)?;

    println!("Top 3 results for 'Rust programming':");
    println!("{:-<60}", "");
    for (rank, neighbor) in results.neighbors(0).iter().enumerate() {
        let title = documents[neighbor.label as usize].0;
        println!(
            "{}. {:<40} squared distance {:.4}",
            rank + 1,
            title,
            neighbor.distance
        );
    }

    let radius = 0.1;
    let hits = index.range_search(&query, radius)?;
    println!(
        "\n{} documents within squared distance {}",
        hits.total_results(),
        radius
    );

    index.release()?;
    println!("\nReleased: {}", index.is_released());
    Ok(())
}
