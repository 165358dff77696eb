//! llm-inspect CLI: one-shot inspection of a transformer model
//!
//! Each invocation loads the model, optionally generates from `--prompt`,
//! runs one command and prints its result as JSON.

use anyhow::Result;
use clap::{Parser, Subcommand};
use llm_inspect::{GenerationSettings, Inspector, LoadOptions, DEMO_MODEL};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "llm-inspect")]
#[command(about = "Inspect and intervene on a transformer language model")]
#[command(version)]
struct Cli {
    /// Model: "demo", a local directory, or a HuggingFace model id
    #[arg(short, long, default_value = DEMO_MODEL)]
    model: String,

    /// Hub revision (branch, tag or commit)
    #[arg(long)]
    revision: Option<String>,

    /// Prompt to generate from before running the command
    #[arg(short, long)]
    prompt: Option<String>,

    /// Number of words of context for capture/override
    #[arg(short, long, default_value_t = 1, allow_negative_numbers = true)]
    timestep: i64,

    #[arg(long, default_value_t = 32)]
    max_new_tokens: usize,

    /// Sampling temperature (0 = greedy)
    #[arg(long, default_value_t = 0.0)]
    temperature: f32,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate from --prompt and print the text
    Generate,
    /// List module names in pre-order
    Layers {
        /// Include declared type and kind
        #[arg(long)]
        detailed: bool,
    },
    /// Per-module parameter names and shapes
    Architecture,
    /// Capture a module's output over the current timestep span
    Capture { layer: String },
    /// Force one unit of a module's output and report next-token predictions
    Override {
        layer: String,
        unit: usize,
        #[arg(allow_negative_numbers = true)]
        value: f32,
    },
    /// Mean and standard deviation of each unit's input weights
    InputStats { layer: String },
    /// Bias vector with its minimum and maximum
    Bias { layer: String },
    /// Overwrite one bias entry, then report the new extremes
    SetBias {
        layer: String,
        unit: usize,
        #[arg(allow_negative_numbers = true)]
        value: f32,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let options = LoadOptions {
        force_cpu: cli.cpu,
        seed: cli.seed,
        revision: cli.revision.clone(),
    };
    let mut inspector = Inspector::load(&cli.model, options)?;
    inspector.set_generation_settings(GenerationSettings {
        max_new_tokens: cli.max_new_tokens,
        temperature: cli.temperature,
    });
    inspector.set_timestep(cli.timestep);

    if let Some(prompt) = &cli.prompt {
        let output = inspector.generate(prompt)?;
        info!("Output: {:?}", output);
    }

    match cli.command {
        Command::Generate => {
            let output = inspector.session().output().unwrap_or_default();
            println!("{output}");
        }
        Command::Layers { detailed: false } => print_json(&inspector.list_layers()?)?,
        Command::Layers { detailed: true } => print_json(&inspector.describe_layers()?)?,
        Command::Architecture => print_json(&inspector.architecture()?)?,
        Command::Capture { layer } => print_json(&inspector.capture_activations(&layer)?)?,
        Command::Override { layer, unit, value } => {
            print_json(&inspector.override_unit(&layer, unit, value)?)?;
        }
        Command::InputStats { layer } => print_json(&inspector.input_stats(&layer)?)?,
        Command::Bias { layer } => print_json(&inspector.bias_extremes(&layer)?)?,
        Command::SetBias { layer, unit, value } => {
            inspector.set_bias(&layer, unit, value)?;
            print_json(&inspector.bias_extremes(&layer)?)?;
        }
    }

    Ok(())
}
