// SPDX-License-Identifier: MIT OR Apache-2.0

//! Activation capture: trace two prompts, print captured shapes and the
//! model's final next-token prediction.
//!
//! ```bash
//! HOOK=model.layers.4.mlp.output CONTRAST_PROMPT="Fear" cargo run --release --bin trace
//! ```

use candle_probe::{Defaults, Env, HookPoint, LoadedModel, RunSettings, TraceReport};

fn main() -> candle_probe::Result<()> {
    candle_probe::logging::init();

    // 1. Resolve configuration
    let env = Env::process();
    let settings = RunSettings::from_source(&env, &Defaults::TRACE)?;
    let hook: HookPoint = env.string_or("HOOK", "model.layers.1.input")?.as_str().into();
    let contrast = env.string_or("CONTRAST_PROMPT", "Hate")?;

    // 2. Load model
    let model = LoadedModel::load(&settings.model)?;
    println!("{}", model.summary());
    candle_probe::trace::validate_hooks(model.model(), std::slice::from_ref(&hook))?;

    // 3. Trace both prompts
    let first = run(&model, &settings.prompt, &hook)?;
    let second = run(&model, &contrast, &hook)?;

    // 4. Report
    for (label, report) in [("1", &first), ("2", &second)] {
        let shape = report.shape_of(&hook).unwrap_or_default();
        println!("Captured {hook} ({label}, \"{}\"): {shape:?}", report.prompt);
    }
    println!("Model output logits: {:?}", second.logits_shape);
    println!("Model output: {}", second.final_token);
    Ok(())
}

/// Encode `prompt` and capture `hook` during one forward pass.
fn run(model: &LoadedModel, prompt: &str, hook: &HookPoint) -> candle_probe::Result<TraceReport> {
    let ids = model.tokenizer().encode(prompt)?;
    let input = model.input_ids(&ids)?;
    candle_probe::trace(
        model.model(),
        model.tokenizer(),
        prompt,
        &input,
        std::slice::from_ref(hook),
    )
}
