//! Composite ownership and persistence demonstration for vecgate.
//!
//! This example shows how to:
//! 1. Build an IVF index that owns its quantizer
//! 2. Share a quantizer between two borrowing indexes
//! 3. Save an index to disk and load it back
//!
//! Run with: RUST_LOG=vecgate_core=debug cargo run --example composite_demo

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing_subscriber::EnvFilter;
use vecgate::prelude::*;

fn random_vectors(n: usize, d: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n * d).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let d = 16;
    let nlist = 8;
    let data = random_vectors(40 * nlist, d, 7);
    let runtime = Runtime::from_env(EngineConfig::default())?;

    println!("vecgate Composite Demo\n");

    println!("Phase 1: IVF index owning its quantizer");
    {
        let quantizer = Index::flat(&runtime, d, MetricType::L2)?;
        let mut ivf = Index::ivf_flat(&quantizer, nlist, MetricType::L2, Adoption::Owned)?;
        println!("   quantizer owner: {:?}", quantizer.owner().map(|id| id.to_string()));

        if let Err(e) = ivf.add(&data) {
            println!("   add before training: {}", e);
        }
        ivf.train(&data)?;
        ivf.add(&data)?;
        ivf.set_nprobe(4)?;
        println!("   trained and added {} vectors", ivf.len());

        match quantizer.release() {
            Err(e) => println!("   releasing the quantizer directly: {}", e),
            Ok(()) => println!("   quantizer released"),
        }
        ivf.release()?;
        println!("   released tree, quantizer released: {}\n", quantizer.is_released());
    }

    println!("Phase 2: two indexes borrowing one quantizer");
    {
        let quantizer = Index::flat(&runtime, d, MetricType::L2)?;
        let a = Index::ivf_flat(&quantizer, nlist, MetricType::L2, Adoption::Borrowed)?;
        let b = Index::ivf_flat(&quantizer, nlist, MetricType::L2, Adoption::Borrowed)?;
        println!("   borrowers: {}", quantizer.borrowers());
        a.release()?;
        b.release()?;
        quantizer.release()?;
        println!("   all three released\n");
    }

    println!("Phase 3: save and reload");
    let path = std::env::temp_dir().join("vecgate_composite_demo.index");
    {
        let mut index = Index::flat(&runtime, d, MetricType::InnerProduct)?;
        index.add(&data)?;
        index.write(&path)?;
        println!("   wrote {} vectors to {}", index.len(), path.display());
    }
    {
        let index = Index::read(&runtime, &path)?;
        println!(
            "   loaded {:?} index: d={}, metric={}, {} vectors",
            index.kind(),
            index.dimension(),
            index.metric(),
            index.len()
        );
        let results = index.search(&data[..d], 3)?;
        println!("   nearest to vector 0: {:?}", results.labels());
    }
    let _ = std::fs::remove_file(&path);

    println!("\nComposite demo complete!");
    Ok(())
}
