//! Binary token shards (`train.bin`, `val.bin`) and their `meta.json`.
//!
//! A shard is a flat stream of `u32` little-endian token ids. Every article is
//! stored as `[BOS] + ids + [EOS]`, so article boundaries can be recovered
//! from the stream alone.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use crate::jsonl::write_pretty_json;

pub const TRAIN_SHARD: &str = "train.bin";
pub const VAL_SHARD: &str = "val.bin";
pub const META_FILE: &str = "meta.json";

const TOKEN_BYTES: usize = std::mem::size_of::<u32>();

pub struct ShardWriter {
    writer: BufWriter<File>,
    tokens_written: usize,
    sequences_written: usize,
}

impl ShardWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("create shard {:?}", path))?;
        Ok(Self {
            writer: BufWriter::new(file),
            tokens_written: 0,
            sequences_written: 0,
        })
    }

    /// Writes one article as `[bos] + ids + [eos]` and returns the number of
    /// tokens that went into the shard.
    pub fn write_sequence(&mut self, bos: u32, ids: &[u32], eos: u32) -> Result<usize> {
        if ids.is_empty() {
            return Err(anyhow!("refusing to write an empty article to the shard"));
        }
        self.writer.write_all(&bos.to_le_bytes())?;
        for id in ids {
            self.writer.write_all(&id.to_le_bytes())?;
        }
        self.writer.write_all(&eos.to_le_bytes())?;

        let written = ids.len() + 2;
        self.tokens_written += written;
        self.sequences_written += 1;
        Ok(written)
    }

    pub fn sequences_written(&self) -> usize {
        self.sequences_written
    }

    pub fn finish(mut self) -> Result<usize> {
        self.writer.flush()?;
        Ok(self.tokens_written)
    }
}

/// Loads a whole shard into memory.
pub fn read_shard(path: &Path) -> Result<Vec<u32>> {
    let f = File::open(path).with_context(|| format!("open shard {:?}", path))?;
    let mut bf = BufReader::new(f);
    let mut bytes = Vec::new();
    bf.read_to_end(&mut bytes)?;
    if bytes.len() % TOKEN_BYTES != 0 {
        return Err(anyhow!(
            "shard {:?} is {} bytes long, which is not a whole number of u32 tokens",
            path,
            bytes.len()
        ));
    }

    Ok(bytes
        .chunks_exact(TOKEN_BYTES)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Result of walking a shard's article boundaries.
#[derive(Debug, Default, PartialEq)]
pub struct ShardLayout {
    // token ranges (exclusive of BOS/EOS) of every complete article
    pub articles: Vec<std::ops::Range<usize>>,

    // tokens found outside any BOS..EOS span
    pub stray_tokens: usize,

    // articles that opened with BOS but never reached EOS
    pub unterminated: usize,
}

impl ShardLayout {
    pub fn is_clean(&self) -> bool {
        self.stray_tokens == 0 && self.unterminated == 0
    }
}

/// Splits a token stream into `BOS ... EOS` articles.
///
/// A BOS inside an open article closes it as unterminated and starts a new one.
pub fn split_sequences(tokens: &[u32], bos: u32, eos: u32) -> ShardLayout {
    let mut layout = ShardLayout::default();
    let mut open: Option<usize> = None;
    for (i, &token) in tokens.iter().enumerate() {
        match open {
            None if token == bos => open = Some(i + 1),
            None => layout.stray_tokens += 1,
            Some(start) if token == eos => {
                layout.articles.push(start..i);
                open = None;
            }
            Some(_) if token == bos => {
                layout.unterminated += 1;
                open = Some(i + 1);
            }
            Some(_) => {}
        }
    }
    if open.is_some() {
        layout.unterminated += 1;
    }
    layout
}

/// Per source format tallies, kept in the order formats were first seen.
pub type SourceTally = Map<String, Value>;

// The metadata file written next to the shards. Field order is the key order
// in the written file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Meta {
    pub vocab_size: usize,
    pub bos_token_id: u32,
    pub eos_token_id: u32,
    pub source_files: Vec<String>,
    pub train_val_split: f64,
    pub tokenizer_model: String,
    pub total_articles_processed_attempts: usize,
    pub total_articles_successfully_processed: usize,
    pub total_articles_skipped: usize,
    pub total_tokens_in_output_including_special: usize,
    pub train_token_count: usize,
    pub val_token_count: usize,
    pub average_tokens_per_article_by_source_without_special: SourceTally,
    pub article_counts_by_source: SourceTally,
    pub token_counts_by_source_without_special: SourceTally,

    #[serde(default = "default_dtype")]
    pub dtype: String,
}

fn default_dtype() -> String {
    "uint32".to_string()
}

impl Meta {
    pub fn write(&self, path: &Path) -> Result<()> {
        write_pretty_json(path, self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let f = File::open(path).with_context(|| format!("open {:?}", path))?;
        let meta: Meta = serde_json::from_reader(BufReader::new(f))
            .with_context(|| format!("parse {:?}", path))?;
        if meta.dtype != "uint32" {
            return Err(anyhow!(
                "{:?} describes {} shards; only uint32 is supported",
                path,
                meta.dtype
            ));
        }
        Ok(meta)
    }

    pub fn dtype() -> String {
        default_dtype()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_emits_little_endian_with_markers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.bin");
        let mut writer = ShardWriter::create(&path).unwrap();
        assert_eq!(writer.write_sequence(2, &[258, 7], 1).unwrap(), 4);
        assert_eq!(writer.write_sequence(2, &[9], 1).unwrap(), 3);
        assert!(writer.write_sequence(2, &[], 1).is_err());
        assert_eq!(writer.sequences_written(), 2);
        assert_eq!(writer.finish().unwrap(), 7);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..8], &[2, 0, 0, 0, 2, 1, 0, 0]);
        assert_eq!(read_shard(&path).unwrap(), vec![2, 258, 7, 1, 2, 9, 1]);
    }

    #[test]
    fn truncated_shard_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("val.bin");
        std::fs::write(&path, [1u8, 0, 0, 0, 5]).unwrap();
        assert!(read_shard(&path).is_err());
    }

    #[test]
    fn split_finds_articles() {
        let layout = split_sequences(&[2, 10, 11, 1, 2, 12, 1], 2, 1);
        assert_eq!(layout.articles, vec![1..3, 5..6]);
        assert!(layout.is_clean());
    }

    #[test]
    fn split_reports_damage() {
        let layout = split_sequences(&[7, 2, 10, 2, 11, 1, 8, 2, 12], 2, 1);
        assert_eq!(layout.articles, vec![4..5]);
        assert_eq!(layout.stray_tokens, 2);
        assert_eq!(layout.unterminated, 2);
        assert!(!layout.is_clean());
    }

    #[test]
    fn meta_keeps_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(META_FILE);
        let mut articles = SourceTally::new();
        articles.insert("wiki_original".into(), 3.into());
        articles.insert("generated_original".into(), 1.into());
        let meta = Meta {
            vocab_size: 262145,
            bos_token_id: 2,
            eos_token_id: 1,
            source_files: vec!["a.jsonl".into()],
            train_val_split: 0.9,
            tokenizer_model: "google/gemma-3-27b-it".into(),
            total_articles_processed_attempts: 5,
            total_articles_successfully_processed: 4,
            total_articles_skipped: 1,
            total_tokens_in_output_including_special: 40,
            train_token_count: 30,
            val_token_count: 10,
            average_tokens_per_article_by_source_without_special: SourceTally::new(),
            article_counts_by_source: articles,
            token_counts_by_source_without_special: SourceTally::new(),
            dtype: Meta::dtype(),
        };
        meta.write(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("{\n    \"vocab_size\": 262145,\n    \"bos_token_id\": 2,"));
        assert!(text.find("\"wiki_original\"").unwrap() < text.find("\"generated_original\"").unwrap());
        assert!(text.trim_end().ends_with("\"dtype\": \"uint32\"\n}"));

        let loaded = Meta::load(&path).unwrap();
        assert_eq!(loaded.train_token_count + loaded.val_token_count, 40);
        assert_eq!(loaded.article_counts_by_source["wiki_original"], 3);
    }
}
