//! Probe a single MLP neuron: find its extreme bias, sweep forced values
//! and watch the next-token distribution move
//!
//! Usage:
//!   cargo run --release --example neuron_probe -- [MODEL] [LAYER]
//!
//! Defaults to the built-in demo model, which needs no download.

use anyhow::Result;
use llm_inspect::{GenerationSettings, Inspector, LoadOptions, DEMO_MODEL};

const SWEEP: [f32; 5] = [-10.0, -2.0, 0.0, 2.0, 10.0];

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let model = args.next().unwrap_or_else(|| DEMO_MODEL.to_string());
    let layer = args
        .next()
        .unwrap_or_else(|| "model.layers.0.mlp.up_proj".to_string());

    println!("Loading model {model}...");
    let mut inspector = Inspector::load(&model, LoadOptions::default())?;
    inspector.set_generation_settings(GenerationSettings {
        max_new_tokens: 12,
        temperature: 0.0,
    });

    let prompt = "The quick brown fox jumps";
    println!("\n=== Generation ===");
    println!("{:?}", inspector.generate(prompt)?);

    println!("\n=== Input weight statistics: {layer} ===");
    let stats = inspector.input_stats(&layer)?;
    for (unit, (avg, std)) in stats.avgs.iter().zip(&stats.stds).take(5).enumerate() {
        println!("  unit {unit:3}: mean {avg:+.4}  std {std:.4}");
    }

    // Pick the unit with the largest bias, falling back to unit 0
    let unit = match inspector.bias_extremes(&layer) {
        Ok(extremes) => {
            println!(
                "\nBias {}: min {:+.4} @ {}, max {:+.4} @ {}",
                extremes.param,
                extremes.min_value,
                extremes.min_index,
                extremes.max_value,
                extremes.max_index
            );
            extremes.max_index
        }
        Err(e) => {
            println!("\nNo bias on {layer} ({e}), probing unit 0");
            0
        }
    };

    let words = prompt.split_whitespace().count() as i64;
    inspector.set_timestep(words);

    let act = inspector.capture_activations(&layer)?;
    let last = act.values[0].last().map(|row| row[unit]).unwrap_or_default();
    println!("\nUnit {unit} at the last prompt token: {last:+.4}");

    println!("\n=== Override sweep ===");
    for value in SWEEP {
        let report = inspector.override_unit(&layer, unit, value)?;
        let top: Vec<String> = report
            .predictions
            .iter()
            .take(3)
            .map(|p| format!("{:?} ({:.3})", p.token, p.probability))
            .collect();
        println!("  {value:+6.1} -> {}", top.join(", "));
    }

    Ok(())
}
