//! Generic indexes built from pipeline descriptions.
//!
//! Run with: cargo run --example pipeline_demo

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing_subscriber::EnvFilter;
use vecgate::descriptor::{recommend, Requirements, SpeedPreference};
use vecgate::prelude::*;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = EngineConfig::default().with_metrics(true);
    println!("Engine config:\n{}\n", config.to_json()?);
    let runtime = Runtime::from_env(config)?;

    let d = 32;
    let n = 2000;
    let mut rng = StdRng::seed_from_u64(42);
    let data: Vec<f32> = (0..n * d).map(|_| rng.gen_range(-1.0..1.0)).collect();

    let requirements = Requirements::default().with_speed(SpeedPreference::Fast);
    println!(
        "Requirements {} recommend {:?} for 50k vectors\n",
        serde_json::to_string(&requirements).unwrap_or_default(),
        recommend(50_000, d, &requirements)
    );

    for description in ["Flat", "PCA16,IVF16,Flat", "IDMap,Flat", "Nonsense7"] {
        let mut index = match Index::from_description(&runtime, d, description, MetricType::L2) {
            Ok(index) => index,
            Err(e) => {
                println!("{:<20} rejected: {}", description, e);
                continue;
            }
        };
        index.train(&data)?;
        index.add(&data)?;
        let results = index.search(&data[..d], 5)?;
        println!(
            "{:<20} first stage {:?}, nlist {:?}, top label {}",
            description,
            index.first_stage(),
            index.nlist(),
            results.labels()[0]
        );
        index.release()?;
    }

    let stats = vecgate::metrics::snapshot();
    println!(
        "\n{} searches, {} adds, {:?} total native time",
        stats.search.count,
        stats.add.count,
        stats.total_time()
    );
    Ok(())
}
