//! Merges the corpus sources, tokenizes every article and writes the
//! `train.bin`/`val.bin` shards with their `meta.json`.

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fmt,
    fs::create_dir_all,
    path::{Path, PathBuf},
    str::FromStr,
    time::Instant,
};
use thiserror::Error;

use crate::{
    jsonl::{files_with_extension, JsonlRecords, LineError},
    shard::{Meta, ShardWriter, SourceTally, META_FILE, TRAIN_SHARD, VAL_SHARD},
    text::{char_len, strip_think_tags},
    tokenizer::{require_markers, TextEncoder},
};

pub const DEFAULT_TRAIN_VAL_SPLIT: f64 = 0.9;
pub const DEFAULT_MIN_ARTICLE_CHARS: usize = 50;
pub const DEFAULT_SUCCESS_STATUS: &str = "ok";
pub const DEFAULT_OUTPUT_DIR: &str = "data/custom_corpus";

/// How the article text is stored in a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    // articles from gen-articles: `text`, may hold think blocks
    GeneratedOriginal,
    // articles picked by wiki-select: `text`
    WikiOriginal,
    // articles from gen-wiki-articles: `generated_text` gated by `generation_status`
    WikiGenerated,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::GeneratedOriginal => "generated_original",
            SourceFormat::WikiOriginal => "wiki_original",
            SourceFormat::WikiGenerated => "wiki_generated",
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "generated_original" => Ok(SourceFormat::GeneratedOriginal),
            "wiki_original" => Ok(SourceFormat::WikiOriginal),
            "wiki_generated" => Ok(SourceFormat::WikiGenerated),
            other => Err(anyhow!(
                "unknown source format '{}'; expected generated_original, wiki_original or wiki_generated",
                other
            )),
        }
    }
}

/// One input of the prepare step: a JSONL file or a directory of them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorpusSource {
    pub path: String,
    pub format: SourceFormat,
}

// parsed from `FORMAT=PATH` on the command line
impl FromStr for CorpusSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (format, path) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected FORMAT=PATH, got '{}'", s))?;
        if path.is_empty() {
            return Err(anyhow!("source '{}' has an empty path", s));
        }
        Ok(CorpusSource {
            path: path.to_string(),
            format: format.trim().parse()?,
        })
    }
}

/// The three sources of the full pipeline, relative to the training directory.
pub fn default_sources() -> Vec<CorpusSource> {
    vec![
        CorpusSource {
            path: "../myGPTdistr/generated_articles_jsonl".into(),
            format: SourceFormat::GeneratedOriginal,
        },
        CorpusSource {
            path: "../myGPTWiki/selected_wiki_jsonl/selected_wiki_articles.jsonl".into(),
            format: SourceFormat::WikiOriginal,
        },
        CorpusSource {
            path: "../myGPTWiki/generated_wiki_articles".into(),
            format: SourceFormat::WikiGenerated,
        },
    ]
}

/// Reads a sources file: a JSON array of `{"path": ..., "format": ...}`.
pub fn load_sources_file(path: &Path) -> Result<Vec<CorpusSource>> {
    let text = std::fs::read_to_string(path)?;
    let sources: Vec<CorpusSource> = serde_json::from_str(&text)?;
    if sources.is_empty() {
        return Err(anyhow!("{:?} lists no sources", path));
    }
    Ok(sources)
}

#[derive(Clone, Debug)]
pub struct PrepareConfig {
    pub sources: Vec<CorpusSource>,
    pub output_dir: PathBuf,
    pub train_val_split: f64,
    pub min_article_chars: usize,
    pub success_status: String,
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            train_val_split: DEFAULT_TRAIN_VAL_SPLIT,
            min_article_chars: DEFAULT_MIN_ARTICLE_CHARS,
            success_status: DEFAULT_SUCCESS_STATUS.to_string(),
        }
    }
}

impl PrepareConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.train_val_split) {
            return Err(anyhow!(
                "train/val split must be within [0, 1], got {}",
                self.train_val_split
            ));
        }
        if self.sources.is_empty() {
            return Err(anyhow!("no input sources were given"));
        }
        Ok(())
    }
}

/// Why a record did not make it into the shards.
#[derive(Debug, Error, PartialEq)]
pub enum SkipReason {
    #[error("{0} field missing or not a string")]
    MissingText(&'static str),
    #[error("status is {0:?}, not the success status")]
    Status(Option<String>),
    #[error("text too short after cleaning ({0} chars)")]
    TooShort(usize),
    #[error("text empty after cleaning")]
    Empty,
}

/// Pulls the cleaned article text out of a record according to its format.
pub fn extract_text(
    format: SourceFormat,
    record: &Value,
    success_status: &str,
    min_chars: usize,
) -> Result<String, SkipReason> {
    let cleaned = match format {
        SourceFormat::GeneratedOriginal => {
            let raw = record
                .get("text")
                .and_then(Value::as_str)
                .ok_or(SkipReason::MissingText("text"))?;
            strip_think_tags(raw).trim().to_string()
        }
        SourceFormat::WikiOriginal => record
            .get("text")
            .and_then(Value::as_str)
            .ok_or(SkipReason::MissingText("text"))?
            .trim()
            .to_string(),
        SourceFormat::WikiGenerated => {
            let status = record.get("generation_status").and_then(Value::as_str);
            if status != Some(success_status) {
                return Err(SkipReason::Status(status.map(str::to_string)));
            }
            let raw = record
                .get("generated_text")
                .and_then(Value::as_str)
                .ok_or(SkipReason::MissingText("generated_text"))?;
            strip_think_tags(raw).trim().to_string()
        }
    };

    if cleaned.is_empty() {
        return Err(SkipReason::Empty);
    }
    let length = char_len(&cleaned);
    if length < min_chars {
        return Err(SkipReason::TooShort(length));
    }
    Ok(cleaned)
}

/// Expands a source into the JSONL files it stands for. Unusable sources are
/// logged and yield nothing.
pub fn resolve_source_files(source: &CorpusSource) -> Vec<PathBuf> {
    let path = Path::new(&source.path);
    if path.is_dir() {
        match files_with_extension(path, "jsonl") {
            Ok(files) if files.is_empty() => {
                warn!("No .jsonl files found in {:?}; skipping the source.", path);
                Vec::new()
            }
            Ok(files) => {
                info!("  Found {} file(s) in the directory.", files.len());
                files
            }
            Err(err) => {
                error!("Could not list {:?}: {}", path, err);
                Vec::new()
            }
        }
    } else if path.is_file() && source.path.ends_with(".jsonl") {
        vec![path.to_path_buf()]
    } else {
        warn!(
            "{:?} is neither a directory nor a .jsonl file; skipping the source.",
            path
        );
        Vec::new()
    }
}

#[derive(Default)]
struct Totals {
    attempts: usize,
    written: usize,
    skipped: usize,
}

#[derive(Default)]
struct FileTotals {
    records: usize,
    written: usize,
    error_lines: usize,
}

// per format article and token counts, in the order formats first produce an article
#[derive(Default)]
struct FormatTallies(Vec<(SourceFormat, usize, usize)>);

impl FormatTallies {
    fn add(&mut self, format: SourceFormat, tokens: usize) {
        match self.0.iter_mut().find(|(f, _, _)| *f == format) {
            Some((_, articles, total)) => {
                *articles += 1;
                *total += tokens;
            }
            None => self.0.push((format, 1, tokens)),
        }
    }

    fn get(&self, format: SourceFormat) -> (usize, usize) {
        self.0
            .iter()
            .find(|(f, _, _)| *f == format)
            .map(|(_, a, t)| (*a, *t))
            .unwrap_or((0, 0))
    }
}

struct Outputs {
    train: ShardWriter,
    val: ShardWriter,
    bos: u32,
    eos: u32,
}

/// Runs the whole prepare step and returns the metadata that was written.
pub fn prepare_corpus<R: Rng>(
    config: &PrepareConfig,
    encoder: &dyn TextEncoder,
    rng: &mut R,
) -> Result<Meta> {
    config.validate()?;
    let start_time = Instant::now();

    let (bos, eos) = require_markers(encoder)?;
    let vocab_size = encoder.vocab_size();
    info!("Tokenizer: {}", encoder.name());
    info!("  Vocabulary size: {}", vocab_size);
    info!("  BOS id: {} ; EOS id: {}", bos, eos);

    create_dir_all(&config.output_dir)?;
    let train_path = config.output_dir.join(TRAIN_SHARD);
    let val_path = config.output_dir.join(VAL_SHARD);
    let mut outputs = Outputs {
        train: ShardWriter::create(&train_path)?,
        val: ShardWriter::create(&val_path)?,
        bos,
        eos,
    };
    info!("Writing shards to {:?} and {:?}", train_path, val_path);

    let mut totals = Totals::default();
    let mut tallies = FormatTallies::default();
    for source in &config.sources {
        info!("Processing source {:?} (format: {})", source.path, source.format);
        for file_path in resolve_source_files(source) {
            let records = match JsonlRecords::<Value>::open(&file_path) {
                Ok(records) => records,
                Err(err) => {
                    error!("Skipping {:?}: {}", file_path, err);
                    continue;
                }
            };
            // only the input decides to skip; shard write failures end the run
            let file_totals = process_file(
                &file_path,
                records,
                source.format,
                config,
                encoder,
                &mut outputs,
                &mut totals,
                &mut tallies,
                rng,
            )
            .with_context(|| format!("write shards while reading {:?}", file_path))?;
            info!(
                "  Finished {:?}: records: {}, written: {}, error lines: {}",
                file_path.file_name().unwrap_or_default(),
                file_totals.records,
                file_totals.written,
                file_totals.error_lines
            );
        }
    }

    let train_articles = outputs.train.sequences_written();
    let val_articles = outputs.val.sequences_written();
    let train_token_count = outputs.train.finish()?;
    let val_token_count = outputs.val.finish()?;

    let mut averages = SourceTally::new();
    info!("Average article length in tokens (without BOS/EOS) by source:");
    for source in &config.sources {
        let (articles, tokens) = tallies.get(source.format);
        if articles > 0 {
            let average = tokens as f64 / articles as f64;
            info!("  {}: {:.2} tokens/article ({} articles)", source.format, average, articles);
            averages.insert(source.format.to_string(), Value::from(average));
        } else {
            info!("  {}: no articles made it into the corpus.", source.format);
            averages.insert(source.format.to_string(), Value::from(0));
        }
    }
    let mut article_counts = SourceTally::new();
    let mut token_counts = SourceTally::new();
    for (format, articles, tokens) in &tallies.0 {
        article_counts.insert(format.to_string(), Value::from(*articles));
        token_counts.insert(format.to_string(), Value::from(*tokens));
    }

    let meta = Meta {
        vocab_size,
        bos_token_id: bos,
        eos_token_id: eos,
        source_files: config.sources.iter().map(|s| s.path.clone()).collect(),
        train_val_split: config.train_val_split,
        tokenizer_model: encoder.name().to_string(),
        total_articles_processed_attempts: totals.attempts,
        total_articles_successfully_processed: totals.written,
        total_articles_skipped: totals.skipped,
        total_tokens_in_output_including_special: train_token_count + val_token_count,
        train_token_count,
        val_token_count,
        average_tokens_per_article_by_source_without_special: averages,
        article_counts_by_source: article_counts,
        token_counts_by_source_without_special: token_counts,
        dtype: Meta::dtype(),
    };
    let meta_path = config.output_dir.join(META_FILE);
    meta.write(&meta_path)?;
    info!("Metadata saved to {:?}", meta_path);

    info!(
        "Corpus prepared in {:.2} seconds.",
        start_time.elapsed().as_secs_f32()
    );
    info!("  Records read: {}", meta.total_articles_processed_attempts);
    info!("  Articles written: {}", meta.total_articles_successfully_processed);
    info!("  Records skipped: {}", meta.total_articles_skipped);
    info!("  {}: {} articles, {} tokens", TRAIN_SHARD, train_articles, meta.train_token_count);
    info!("  {}: {} articles, {} tokens", VAL_SHARD, val_articles, meta.val_token_count);
    info!("  Total tokens: {}", meta.total_tokens_in_output_including_special);
    info!("Trainer settings for this corpus:");
    info!("  vocab_size = {}", meta.vocab_size);
    info!("  bos_token_id = {}", meta.bos_token_id);
    info!("  eos_token_id = {}", meta.eos_token_id);
    info!("  data_dir = {:?}", config.output_dir);
    info!(
        "  the sampler must decode with '{}' and stop on the EOS id.",
        meta.tokenizer_model
    );

    Ok(meta)
}

#[allow(clippy::too_many_arguments)]
fn process_file<R: Rng>(
    path: &Path,
    records: JsonlRecords<Value>,
    format: SourceFormat,
    config: &PrepareConfig,
    encoder: &dyn TextEncoder,
    outputs: &mut Outputs,
    totals: &mut Totals,
    tallies: &mut FormatTallies,
    rng: &mut R,
) -> Result<FileTotals> {
    let mut file_totals = FileTotals::default();
    for (line_number, outcome) in records {
        if let Err(LineError::Io(err)) = &outcome {
            error!("Read error in {:?} at line {}: {}", path, line_number, err);
            break;
        }
        totals.attempts += 1;
        file_totals.records += 1;

        let record = match outcome {
            Ok(record) => record,
            Err(err) => {
                debug!("{:?} line {}: {}", path, line_number, err);
                file_totals.error_lines += 1;
                totals.skipped += 1;
                continue;
            }
        };

        let text = match extract_text(
            format,
            &record,
            &config.success_status,
            config.min_article_chars,
        ) {
            Ok(text) => text,
            Err(reason) => {
                debug!("{:?} line {}: skipped, {}", path, line_number, reason);
                totals.skipped += 1;
                continue;
            }
        };

        let ids = match encoder.encode(&text) {
            Ok(ids) if ids.is_empty() => {
                debug!("{:?} line {}: skipped, no tokens", path, line_number);
                totals.skipped += 1;
                continue;
            }
            Ok(ids) => ids,
            Err(err) => {
                debug!("{:?} line {}: tokenization failed, {}", path, line_number, err);
                file_totals.error_lines += 1;
                totals.skipped += 1;
                continue;
            }
        };

        let shard = if rng.gen::<f64>() < config.train_val_split {
            &mut outputs.train
        } else {
            &mut outputs.val
        };
        shard.write_sequence(outputs.bos, &ids, outputs.eos)?;
        tallies.add(format, ids.len());
        file_totals.written += 1;
        totals.written += 1;
    }
    Ok(file_totals)
}
