//! Decode a dummy late-layer vector through a sparse feature decoder.
//!
//! Resolves the decoder files in a local directory or HuggingFace
//! repository, encodes a random hidden state at the decoder's own precision,
//! and prints the strongest features.
//!
//! Usage:
//!   cargo run --release --example decode_store
//!   cargo run --release --example decode_store -- --store ./my_sae --top-n 10 --cpu

#![allow(clippy::cast_precision_loss)]

use anyhow::Result;
use candle_core::{Device, Tensor};
use clap::Parser;
use confab_rs::{FeatureAnnotations, SparseFeatureDecoder, WeightsStore};

#[derive(Parser)]
struct Args {
    /// Local directory or HuggingFace repository with decoder weights
    #[arg(long, default_value = "Codcordance/Mistral-Small-3.2-24B-Instruct-2506-SAE")]
    store: String,

    /// Sub-directory inside the store
    #[arg(long)]
    subfolder: Option<String>,

    /// Number of top features to display
    #[arg(long, default_value_t = 20)]
    top_n: usize,

    /// Optional JSON map of feature index to description
    #[arg(long)]
    annotations: Option<std::path::PathBuf>,

    /// Force CPU execution
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    println!("Device: {device:?}");

    let store = WeightsStore::resolve(&args.store, args.subfolder.as_deref());
    let decoder = SparseFeatureDecoder::load(&store, args.top_n, &device)?;
    let config = decoder.config();
    println!(
        "\nDecoder: d_in={}, d_hidden={}, dtype={:?}",
        config.d_in, config.d_hidden, config.dtype
    );

    let annotations = match &args.annotations {
        Some(path) => FeatureAnnotations::load(path)?,
        None => FeatureAnnotations::new(),
    };

    // In real use this is the last-token hidden state of the late layer.
    let hidden = Tensor::randn(0.0f32, 1.0, (config.d_in,), &device)?.to_dtype(config.dtype)?;

    let active = decoder.encode_all(&hidden)?;
    println!(
        "\nActive features: {} / {} ({:.2}% sparsity)",
        active.len(),
        config.d_hidden,
        100.0 * (1.0 - active.len() as f64 / config.d_hidden as f64)
    );

    println!("\nTop-{} features:", decoder.top_n());
    for feature in decoder.decode(&hidden)? {
        let note = annotations.get(feature.index).unwrap_or("");
        println!("  {:>7}: activation = {:.4}  {note}", feature.index, feature.activation);
    }
    Ok(())
}
