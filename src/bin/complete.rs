// SPDX-License-Identifier: MIT OR Apache-2.0

//! Batch completion: decode a continuation and print only the new text.
//!
//! Decoding follows the checkpoint's `generation_config.json` (greedy when
//! it says nothing), unless `DO_SAMPLE`, `TEMP`, `TOP_P` or `SAMPLE_TOP_K`
//! are set.
//!
//! ```bash
//! MODEL=Qwen/Qwen2.5-0.5B cargo run --release --bin complete
//! ```

use candle_probe::{Defaults, Env, LoadedModel, RunSettings};

fn main() -> candle_probe::Result<()> {
    candle_probe::logging::init();

    let env = Env::process();
    let mut settings = RunSettings::from_source(&env, &Defaults::COMPLETE)?;
    let model = LoadedModel::load(&settings.model)?;
    settings.apply_generation_config(&env, model.generation_config())?;
    println!("{}", model.summary());

    // Raw prompt, no chat rendering unless SYSTEM_PROMPT is set.
    let prompt_ids = model.encode_prompt(&settings.prompt, settings.system_prompt.as_deref())?;
    let result = model
        .generator()
        .generate(&prompt_ids, &settings.generation, |_| Ok(()))?;

    println!("{}", result.generated_text);
    Ok(())
}
