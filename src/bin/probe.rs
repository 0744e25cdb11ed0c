//! Weights Probe
//!
//! Loads a network weights file, reports its architecture, and runs a
//! sanity forward pass on an empty board encoding.

use anyhow::Context;
use caissa::nn::Network;
use caissa::nn::Plane;
use caissa::nn::Weights;
use clap::Parser;

#[derive(Parser)]
#[command(about = "Inspect a network weights file", long_about = None)]
struct Args {
    /// path to the weights file, plain text or gzipped
    weights: std::path::PathBuf,
    /// only report problems
    #[arg(long)]
    quiet: bool,
    /// skip the sanity forward pass
    #[arg(long)]
    no_forward: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    caissa::init(args.quiet);
    let weights = Weights::load(&args.weights)
        .with_context(|| format!("loading {}", args.weights.display()))?;
    log::info!(
        "format {}: {} residual blocks of {} channels",
        weights.format(),
        weights.blocks(),
        weights.channels(),
    );
    log::info!(
        "policy head: {} filters over {} moves",
        weights.policy.conv.outputs,
        weights.format().policy_outputs(),
    );
    log::info!(
        "value head: {} filters, {} hidden units",
        weights.value.conv.outputs,
        weights.value.hidden_biases.len(),
    );
    if !args.no_forward {
        let planes = vec![Plane::empty(); weights.format().input_channels()];
        let network = Network::from(weights);
        let output = network
            .forward(&planes)
            .context("sanity forward pass failed")?;
        let mass = output.policy.iter().sum::<f32>();
        log::info!(
            "forward pass ok on {}: policy mass {:.4}, winrate {:+.4}",
            network.describe(),
            mass,
            output.winrate,
        );
    }
    Ok(())
}
