use anyhow::{anyhow, Result};
use log::{info, warn};
use std::path::Path;

use crate::{
    shard::{read_shard, split_sequences, Meta, META_FILE, TRAIN_SHARD, VAL_SHARD},
    text::take_chars,
    tokenizer::TextEncoder,
};

/// How much of a decoded article is shown when previewing a shard.
const PREVIEW_CHARS: usize = 300;

#[derive(Clone, Debug, PartialEq)]
pub struct ShardSummary {
    pub name: String,
    pub tokens: usize,
    pub articles: usize,
    pub stray_tokens: usize,
    pub unterminated: usize,
    pub min_article_tokens: usize,
    pub mean_article_tokens: f64,
    pub max_article_tokens: usize,
}

/// Checks both shards in `data_dir` against their `meta.json` and reports on
/// their article layout. With an encoder, the first `preview` articles of each
/// shard are decoded into the log.
pub fn inspect_shards(
    data_dir: &Path,
    encoder: Option<&dyn TextEncoder>,
    preview: usize,
) -> Result<Vec<ShardSummary>> {
    let meta = Meta::load(&data_dir.join(META_FILE))?;
    info!(
        "meta.json: vocab size {}, BOS {}, EOS {}, tokenizer '{}'",
        meta.vocab_size, meta.bos_token_id, meta.eos_token_id, meta.tokenizer_model
    );

    let mut summaries = Vec::new();
    for (name, expected) in [
        (TRAIN_SHARD, meta.train_token_count),
        (VAL_SHARD, meta.val_token_count),
    ] {
        let tokens = read_shard(&data_dir.join(name))?;
        if tokens.len() != expected {
            warn!(
                "{} holds {} tokens but meta.json records {}",
                name,
                tokens.len(),
                expected
            );
        }
        if let Some(out_of_range) = tokens.iter().find(|t| **t as usize >= meta.vocab_size) {
            return Err(anyhow!(
                "{} contains token id {} outside the vocabulary of {}",
                name,
                out_of_range,
                meta.vocab_size
            ));
        }

        let layout = split_sequences(&tokens, meta.bos_token_id, meta.eos_token_id);
        let lengths: Vec<usize> = layout.articles.iter().map(|r| r.len()).collect();
        let summary = ShardSummary {
            name: name.to_string(),
            tokens: tokens.len(),
            articles: lengths.len(),
            stray_tokens: layout.stray_tokens,
            unterminated: layout.unterminated,
            min_article_tokens: lengths.iter().copied().min().unwrap_or(0),
            mean_article_tokens: if lengths.is_empty() {
                0.0
            } else {
                lengths.iter().sum::<usize>() as f64 / lengths.len() as f64
            },
            max_article_tokens: lengths.iter().copied().max().unwrap_or(0),
        };

        info!("{}: {} tokens, {} articles", name, summary.tokens, summary.articles);
        info!(
            "  article length in tokens: min {} ; mean {:.2} ; max {}",
            summary.min_article_tokens, summary.mean_article_tokens, summary.max_article_tokens
        );
        if layout.is_clean() {
            info!("  every token belongs to a BOS..EOS article.");
        } else {
            warn!(
                "  {} stray tokens and {} unterminated articles",
                layout.stray_tokens, layout.unterminated
            );
        }

        if let Some(encoder) = encoder {
            for (i, range) in layout.articles.iter().take(preview).enumerate() {
                let text = encoder.decode(&tokens[range.clone()])?;
                info!("  [{} #{}] {}", name, i, take_chars(&text, PREVIEW_CHARS));
            }
        }
        summaries.push(summary);
    }

    let total: usize = summaries.iter().map(|s| s.tokens).sum();
    if total != meta.total_tokens_in_output_including_special {
        warn!(
            "shards hold {} tokens in total but meta.json records {}",
            total, meta.total_tokens_in_output_including_special
        );
    }
    Ok(summaries)
}
