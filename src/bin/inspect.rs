// SPDX-License-Identifier: MIT OR Apache-2.0

//! Next-token inspection: one forward pass, then the argmax and top-k tokens.
//!
//! ```bash
//! TOP_K=10 LOGIT_LENS=1 cargo run --release --bin inspect
//! ```

use candle_probe::inspect::format_token;
use candle_probe::{CausalLm, Defaults, Env, LoadedModel, RunSettings};

fn main() -> candle_probe::Result<()> {
    candle_probe::logging::init();

    // 1. Resolve configuration
    let env = Env::process();
    let settings = RunSettings::from_source(&env, &Defaults::INSPECT)?;
    let top_k: usize = env.parse_or("TOP_K", 5)?;
    let show_lens = env.flag("LOGIT_LENS", false)?;

    // 2. Load model
    let model = LoadedModel::load(&settings.model)?;
    println!("{}", model.summary());
    let lm = model.model();
    println!(
        "  {} layers, {} hidden, {} heads, {} vocab, device: {:?}",
        lm.num_layers(),
        lm.hidden_size(),
        lm.num_heads(),
        lm.vocab_size(),
        model.device()
    );

    // 3. Encode and run a single forward pass
    let prompt_ids = model.encode_prompt(&settings.prompt, settings.system_prompt.as_deref())?;
    let input = model.input_ids(&prompt_ids)?; // [1, seq_len]
    let report = candle_probe::inspect_next_token(model.model(), model.tokenizer(), &input, top_k)?;

    // 4. Report
    println!("Logits shape: {:?}", report.logits_shape);
    println!(
        "Last token logits shape: [1, {}]",
        report.last_logits.len()
    );
    println!("Next token ID: {}", report.argmax.token_id);
    println!("Next token text: '{}'", format_token(&report.argmax.token));

    println!("\nTop {top_k} next token predictions:");
    for (rank, pred) in report.top_k.iter().enumerate() {
        println!(
            "  {}. Token ID {}: '{}' (logit: {:.2}, p: {:.4})",
            rank + 1,
            pred.token_id,
            format_token(&pred.token),
            pred.logit,
            pred.probability
        );
    }

    // 5. Optional per-layer view
    if show_lens {
        let analysis = candle_probe::logit_lens(
            model.model(),
            model.tokenizer(),
            &settings.prompt,
            &input,
            top_k,
        )?;
        println!("\n{analysis}");
    }
    Ok(())
}
