//! Shared test utilities
//!
//! Provides engine construction against the mock segment encoder, entry
//! builders, and deterministic vector generation.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use rand::{Rng, SeedableRng};

use silt::segment::mock::{MockEncoderConfig, MockSegmentEncoder};
use silt::{Config, Engine, VectorEntry, VectorId};

/// Opt-in log output while debugging a failing test: RUST_LOG=debug
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Small-dimension config with WAL fsync disabled for test speed
pub fn test_config(dim: usize) -> Config {
    let mut config = Config::default();
    config.collection.dim = dim;
    config.wal.sync_on_append = false;
    config
}

/// Open an engine in `dir` with a fresh mock encoder
pub async fn open_engine(dir: &Path, config: Config) -> (Engine, Arc<MockSegmentEncoder>) {
    let encoder = Arc::new(
        MockSegmentEncoder::new(dir.join("segments"), MockEncoderConfig::fast()).unwrap(),
    );
    let engine = Engine::open(config, dir, encoder.clone()).await.unwrap();
    (engine, encoder)
}

/// Deterministic vector for a seed
pub fn seeded_vector(dims: usize, seed: u64) -> Vec<f32> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    (0..dims).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect()
}

/// Entry in the default test tenant/namespace
pub fn entry(name: &str, dims: usize) -> VectorEntry {
    VectorEntry::new(
        VectorId::from(name),
        seeded_vector(dims, silt::hash::identity_hash(name.as_bytes())),
        "tenant-a",
        "ns-a",
        vec![1, 2],
    )
}

/// Entry with explicit tenant/namespace/tags
pub fn entry_in(
    name: &str,
    dims: usize,
    tenant: &str,
    namespace: &str,
    tags: Vec<u32>,
) -> VectorEntry {
    VectorEntry::new(
        VectorId::from(name),
        seeded_vector(dims, 7),
        tenant,
        namespace,
        tags,
    )
}
