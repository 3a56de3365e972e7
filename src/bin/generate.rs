// SPDX-License-Identifier: MIT OR Apache-2.0

//! Streaming generation: load a model, sample a reply, print it as it arrives.
//!
//! ```bash
//! PROMPT="Explain RoPE in two sentences." TEMP=0.7 cargo run --release --bin generate
//! ```
//!
//! With `SYSTEM_PROMPT` set, the prompt is rendered through the model's chat
//! template.  Sampling defaults to `TEMP=1`, `TOP_P=0.9`,
//! `MAX_NEW_TOKENS=256`.

use std::io::Write;

use candle_probe::{Defaults, LoadedModel, RunSettings};

fn main() -> candle_probe::Result<()> {
    candle_probe::logging::init();

    // 1. Resolve configuration
    let settings = RunSettings::from_env(&Defaults::GENERATE)?;
    tracing::info!(
        temperature = settings.generation.temperature,
        top_p = settings.generation.top_p,
        max_new_tokens = settings.generation.max_new_tokens,
        do_sample = settings.generation.do_sample,
        "sampling parameters"
    );

    // 2. Load model, tokenizer and chat template
    let model = LoadedModel::load(&settings.model)?;

    // 3. Encode (chat-rendered when a system prompt is given)
    let prompt_ids = model.encode_prompt(&settings.prompt, settings.system_prompt.as_deref())?;

    // 4. Stream the reply, never echoing the prompt
    let mut stdout = std::io::stdout().lock();
    let result = model.generator().generate_streaming(
        &prompt_ids,
        &settings.generation,
        true,
        |text| {
            stdout.write_all(text.as_bytes())?;
            stdout.flush()?;
            Ok(())
        },
    )?;
    writeln!(stdout)?;

    tracing::info!(
        prompt_tokens = result.prompt_tokens.len(),
        generated_tokens = result.generated_tokens.len(),
        stop_reason = ?result.stop_reason,
        "done"
    );
    Ok(())
}
