use anyhow::{anyhow, Result};
use nanocorpus::{
    inspect::inspect_shards,
    prepare::{prepare_corpus, PrepareConfig, SourceFormat, CorpusSource},
    shard::{read_shard, split_sequences, Meta, META_FILE, TRAIN_SHARD, VAL_SHARD},
    tokenizer::TextEncoder,
};
use rand::{rngs::StdRng, SeedableRng};
use std::path::Path;

const BOS: u32 = 1;
const EOS: u32 = 2;
const OFFSET: u32 = 3;

/// Byte-level encoder: every UTF-8 byte becomes its value plus an offset.
struct ByteEncoder;

impl TextEncoder for ByteEncoder {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(|b| b as u32 + OFFSET).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let bytes = ids
            .iter()
            .filter(|id| **id >= OFFSET)
            .map(|id| u8::try_from(id - OFFSET).map_err(|_| anyhow!("id {} is not a byte", id)))
            .collect::<Result<Vec<u8>>>()?;
        Ok(String::from_utf8(bytes)?)
    }

    fn id_to_token(&self, id: u32) -> Option<String> {
        match id {
            BOS => Some("<bos>".into()),
            EOS => Some("<eos>".into()),
            _ => Some(format!("<0x{:02X}>", id.checked_sub(OFFSET)?)),
        }
    }

    fn bos_id(&self) -> Option<u32> {
        Some(BOS)
    }

    fn eos_id(&self) -> Option<u32> {
        Some(EOS)
    }

    fn vocab_size(&self) -> usize {
        256 + OFFSET as usize
    }

    fn name(&self) -> &str {
        "byte-test"
    }
}

fn write_lines(path: &Path, lines: &[String]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let body: String = lines.iter().map(|l| format!("{}\n", l)).collect();
    std::fs::write(path, body).unwrap();
}

fn long_text(seed: &str) -> String {
    format!("{} {}", seed, "текст статьи ".repeat(10))
}

// Three sources, one of each format, with a mix of usable and skipped records.
fn write_sources(root: &Path) -> Vec<CorpusSource> {
    let generated = root.join("generated");
    write_lines(
        &generated.join("b.jsonl"),
        &[serde_json::json!({"number": 1, "text": format!("<think>план</think>{}", long_text("Второй"))}).to_string()],
    );
    write_lines(
        &generated.join("a.jsonl"),
        &[
            serde_json::json!({"number": 1, "text": long_text("Первый")}).to_string(),
            serde_json::json!({"number": 2, "text": "коротко"}).to_string(),
            "{broken".to_string(),
        ],
    );
    std::fs::write(generated.join("notes.txt"), "ignored").unwrap();

    let wiki = root.join("selected.jsonl");
    write_lines(
        &wiki,
        &[
            serde_json::json!({"number": 0, "text": long_text("Вики")}).to_string(),
            serde_json::json!({"number": 1}).to_string(),
        ],
    );

    let wiki_generated = root.join("wiki_generated");
    write_lines(
        &wiki_generated.join("generated_wiki_articles_pc.jsonl"),
        &[
            serde_json::json!({"generated_text": long_text("Новая"), "generation_status": "ok", "source": "wiki_generated"}).to_string(),
            serde_json::json!({"generated_text": "", "generation_status": "api_error", "source": "wiki_generated"}).to_string(),
        ],
    );

    vec![
        CorpusSource {
            path: generated.to_string_lossy().into_owned(),
            format: SourceFormat::GeneratedOriginal,
        },
        CorpusSource {
            path: wiki.to_string_lossy().into_owned(),
            format: SourceFormat::WikiOriginal,
        },
        CorpusSource {
            path: wiki_generated.to_string_lossy().into_owned(),
            format: SourceFormat::WikiGenerated,
        },
        CorpusSource {
            path: root.join("missing").to_string_lossy().into_owned(),
            format: SourceFormat::WikiOriginal,
        },
    ]
}

#[test]
fn prepare_then_inspect_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = PrepareConfig {
        sources: write_sources(dir.path()),
        output_dir: dir.path().join("corpus"),
        train_val_split: 1.0,
        ..Default::default()
    };

    let meta = prepare_corpus(&config, &ByteEncoder, &mut StdRng::seed_from_u64(42)).unwrap();
    assert_eq!(meta.total_articles_processed_attempts, 8);
    assert_eq!(meta.total_articles_successfully_processed, 4);
    assert_eq!(meta.total_articles_skipped, 4);
    assert_eq!(meta.val_token_count, 0);
    assert_eq!(meta.article_counts_by_source["generated_original"], 2);
    assert_eq!(meta.article_counts_by_source["wiki_original"], 1);
    assert_eq!(meta.article_counts_by_source["wiki_generated"], 1);

    let train = read_shard(&config.output_dir.join(TRAIN_SHARD)).unwrap();
    assert_eq!(train.len(), meta.train_token_count);
    assert!(read_shard(&config.output_dir.join(VAL_SHARD)).unwrap().is_empty());
    let layout = split_sequences(&train, BOS, EOS);
    assert!(layout.is_clean());
    assert_eq!(layout.articles.len(), 4);

    // sorted file order puts a.jsonl first, and think blocks are gone
    let first = ByteEncoder.decode(&train[layout.articles[0].clone()]).unwrap();
    assert!(first.starts_with("Первый"));
    let second = ByteEncoder.decode(&train[layout.articles[1].clone()]).unwrap();
    assert!(second.starts_with("Второй"));

    let summaries = inspect_shards(&config.output_dir, Some(&ByteEncoder as &dyn TextEncoder), 2).unwrap();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].articles, 4);
    assert_eq!(summaries[0].tokens, meta.train_token_count);
    assert_eq!(summaries[1].articles, 0);
}

#[test]
fn meta_json_keeps_its_key_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = PrepareConfig {
        sources: write_sources(dir.path()),
        output_dir: dir.path().join("corpus"),
        train_val_split: 0.0,
        ..Default::default()
    };
    let meta = prepare_corpus(&config, &ByteEncoder, &mut StdRng::seed_from_u64(1)).unwrap();
    assert_eq!(meta.train_token_count, 0);

    let text = std::fs::read_to_string(config.output_dir.join(META_FILE)).unwrap();
    let keys = [
        "vocab_size",
        "bos_token_id",
        "eos_token_id",
        "source_files",
        "train_val_split",
        "tokenizer_model",
        "total_articles_processed_attempts",
        "total_articles_successfully_processed",
        "total_articles_skipped",
        "total_tokens_in_output_including_special",
        "train_token_count",
        "val_token_count",
        "average_tokens_per_article_by_source_without_special",
        "article_counts_by_source",
        "token_counts_by_source_without_special",
        "dtype",
    ];
    let positions: Vec<usize> = keys
        .iter()
        .map(|k| text.find(&format!("\"{}\":", k)).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    assert!(text.contains("\n    \"vocab_size\": 259"));

    let loaded = Meta::load(&config.output_dir.join(META_FILE)).unwrap();
    assert_eq!(loaded.val_token_count, meta.val_token_count);
    assert_eq!(loaded.dtype, "uint32");
}

#[test]
fn split_ratio_out_of_range_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = PrepareConfig {
        sources: write_sources(dir.path()),
        output_dir: dir.path().join("corpus"),
        train_val_split: 1.5,
        ..Default::default()
    };
    assert!(prepare_corpus(&config, &ByteEncoder, &mut StdRng::seed_from_u64(1)).is_err());
    assert!(!config.output_dir.join(TRAIN_SHARD).exists());
}
