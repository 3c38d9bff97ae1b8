//! Zero-shot topic classification with an NLI cross-encoder.
//!
//! Every (article, label) pair is scored as premise/hypothesis; the entailment
//! logits of one article are softmaxed across labels, so exactly one label wins.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Linear, Module, VarBuilder};
use candle_transformers::models::bert::{self, BertModel};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tokenizers::{
    PaddingParams, PaddingStrategy, Tokenizer, TruncationParams, TruncationStrategy,
};

use crate::jsonl::{load_records, JsonlWriter};

pub const DEFAULT_NLI_MODEL: &str = "cointegrated/rubert-base-cased-nli-threeway";
pub const DEFAULT_TEMPLATE: &str = "This example is {}.";
pub const DEFAULT_BATCH_SIZE: usize = 64;
pub const DEFAULT_LABELS_FILE: &str = "./classes.txt";
pub const DEFAULT_CLASSIFY_INPUT: &str = "./selected_wiki_jsonl/selected_wiki_articles.jsonl";
pub const DEFAULT_CLASSIFY_OUTPUT: &str = "./classified_wiki_jsonl/classified_wiki_results.jsonl";

/// Scores premise/hypothesis pairs.
pub trait EntailmentModel {
    /// One entailment logit per pair, in input order.
    fn entailment_logits(&self, pairs: &[(&str, &str)]) -> Result<Vec<f32>>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct LabelScore {
    pub label: String,
    pub score: f32,
}

pub struct ZeroShotClassifier<'a> {
    model: &'a dyn EntailmentModel,
    labels: Vec<String>,
    hypotheses: Vec<String>,
    batch_size: usize,
}

impl<'a> ZeroShotClassifier<'a> {
    pub fn new(
        model: &'a dyn EntailmentModel,
        labels: Vec<String>,
        template: &str,
        batch_size: usize,
    ) -> Result<Self> {
        if labels.is_empty() {
            return Err(anyhow!("no candidate labels given"));
        }
        if !template.contains("{}") {
            return Err(anyhow!("hypothesis template '{}' has no {{}} placeholder", template));
        }
        let hypotheses = labels.iter().map(|l| template.replace("{}", l)).collect();
        Ok(Self {
            model,
            labels,
            hypotheses,
            batch_size: batch_size.max(1),
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Ranked label scores for every text. Pairs are sent to the model in
    /// chunks of the batch size.
    pub fn classify(&self, texts: &[&str]) -> Result<Vec<Vec<LabelScore>>> {
        let pairs: Vec<(&str, &str)> = texts
            .iter()
            .flat_map(|t| self.hypotheses.iter().map(move |h| (*t, h.as_str())))
            .collect();

        let mut logits = Vec::with_capacity(pairs.len());
        for chunk in pairs.chunks(self.batch_size) {
            let scored = self.model.entailment_logits(chunk)?;
            if scored.len() != chunk.len() {
                return Err(anyhow!(
                    "model returned {} logits for {} pairs",
                    scored.len(),
                    chunk.len()
                ));
            }
            logits.extend(scored);
        }

        Ok(logits
            .chunks(self.labels.len())
            .map(|row| {
                let mut ranked: Vec<LabelScore> = softmax(row)
                    .into_iter()
                    .zip(&self.labels)
                    .map(|(score, label)| LabelScore {
                        label: label.clone(),
                        score,
                    })
                    .collect();
                ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
                ranked
            })
            .collect())
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[derive(Deserialize)]
struct HeadConfig {
    hidden_size: usize,
    #[serde(default = "default_max_positions")]
    max_position_embeddings: usize,
    #[serde(default)]
    id2label: HashMap<String, String>,
}

fn default_max_positions() -> usize {
    512
}

/// The class index whose label starts with "entail" (any case).
pub fn entailment_index(id2label: &HashMap<String, String>) -> Result<usize> {
    let (id, _) = id2label
        .iter()
        .find(|(_, label)| label.to_lowercase().starts_with("entail"))
        .ok_or_else(|| anyhow!("config.json has no entailment label in id2label: {:?}", id2label))?;
    id.parse()
        .with_context(|| format!("id2label key '{}' is not a class index", id))
}

struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: PathBuf,
}

impl ModelFiles {
    // a local directory wins over a hub repo of the same name
    fn resolve(source: &str) -> Result<Self> {
        let dir = Path::new(source);
        if dir.is_dir() {
            let weights = ["model.safetensors", "pytorch_model.bin"]
                .iter()
                .map(|f| dir.join(f))
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("{:?} holds neither model.safetensors nor pytorch_model.bin", dir))?;
            return Ok(Self {
                config: dir.join("config.json"),
                tokenizer: dir.join("tokenizer.json"),
                weights,
            });
        }

        info!("Fetching '{}' from the Hugging Face hub...", source);
        let api = hf_hub::api::sync::Api::new()?;
        let repo = api.model(source.to_string());
        let weights = match repo.get("model.safetensors") {
            Ok(path) => path,
            Err(_) => repo.get("pytorch_model.bin")?,
        };
        Ok(Self {
            config: repo.get("config.json")?,
            tokenizer: repo.get("tokenizer.json")?,
            weights,
        })
    }
}

/// A BERT sequence-classification checkpoint fine-tuned for NLI.
pub struct NliCrossEncoder {
    bert: BertModel,
    pooler: Linear,
    classifier: Linear,
    tokenizer: Tokenizer,
    entailment_index: usize,
    device: Device,
}

impl NliCrossEncoder {
    pub fn load(source: &str, device: &Device) -> Result<Self> {
        let files = ModelFiles::resolve(source)?;
        let config_text = std::fs::read_to_string(&files.config)
            .with_context(|| format!("read {:?}", files.config))?;
        let config: bert::Config = serde_json::from_str(&config_text)?;
        let head: HeadConfig = serde_json::from_str(&config_text)?;
        let entailment_index = entailment_index(&head.id2label)?;
        let num_labels = head.id2label.len();

        let mut tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(anyhow::Error::msg)?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: head.max_position_embeddings,
                strategy: TruncationStrategy::OnlyFirst,
                ..Default::default()
            }))
            .map_err(anyhow::Error::msg)?;

        let vb = if files.weights.extension().is_some_and(|e| e == "safetensors") {
            unsafe { VarBuilder::from_mmaped_safetensors(&[&files.weights], DType::F32, device)? }
        } else {
            VarBuilder::from_pth(&files.weights, DType::F32, device)?
        };
        let bert = BertModel::load(vb.pp("bert"), &config)?;
        let pooler = candle_nn::linear(head.hidden_size, head.hidden_size, vb.pp("bert.pooler.dense"))?;
        let classifier = candle_nn::linear(head.hidden_size, num_labels, vb.pp("classifier"))?;
        info!(
            "Loaded NLI model with {} classes; entailment is class {}.",
            num_labels, entailment_index
        );

        Ok(Self {
            bert,
            pooler,
            classifier,
            tokenizer,
            entailment_index,
            device: device.clone(),
        })
    }

    fn stack_field<F>(&self, encodings: &[tokenizers::Encoding], field: F) -> Result<Tensor>
    where
        F: Fn(&tokenizers::Encoding) -> &[u32],
    {
        let rows = encodings
            .iter()
            .map(|e| Tensor::new(field(e), &self.device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::stack(&rows, 0)?)
    }
}

impl EntailmentModel for NliCrossEncoder {
    fn entailment_logits(&self, pairs: &[(&str, &str)]) -> Result<Vec<f32>> {
        let encodings = self
            .tokenizer
            .encode_batch(pairs.to_vec(), true)
            .map_err(anyhow::Error::msg)?;
        let ids = self.stack_field(&encodings, |e| e.get_ids())?;
        let type_ids = self.stack_field(&encodings, |e| e.get_type_ids())?;
        let mask = self.stack_field(&encodings, |e| e.get_attention_mask())?;

        let hidden = self.bert.forward(&ids, &type_ids, Some(&mask))?;
        let pooled = self.pooler.forward(&hidden.i((.., 0))?)?.tanh()?;
        let logits = self.classifier.forward(&pooled)?;
        Ok(logits.i((.., self.entailment_index))?.to_vec1::<f32>()?)
    }
}

pub fn select_device() -> Result<Device> {
    #[cfg(feature = "cuda")]
    let device = Device::new_cuda(0)?;
    #[cfg(all(feature = "metal", not(feature = "cuda")))]
    let device = Device::new_metal(0)?;
    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    let device = Device::Cpu;
    Ok(device)
}

/// Trimmed, non-empty lines of a labels file.
pub fn load_labels(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read labels {:?}", path))?;
    let labels: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    if labels.is_empty() {
        return Err(anyhow!("labels file {:?} lists no categories", path));
    }
    Ok(labels)
}

#[derive(Deserialize)]
struct ArticleToClassify {
    number: Value,
    text: String,
}

/// One classification result line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedArticle {
    pub number: Value,
    pub predicted_category: String,
    pub score: f64,
}

#[derive(Clone, Debug)]
pub struct ClassifyConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub template: String,
    pub batch_size: usize,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from(DEFAULT_CLASSIFY_INPUT),
            output: PathBuf::from(DEFAULT_CLASSIFY_OUTPUT),
            template: DEFAULT_TEMPLATE.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClassifyReport {
    pub input_errors: usize,
    pub classified: usize,
    /// Category counts, most frequent first.
    pub distribution: Vec<(String, usize)>,
}

fn round4(score: f32) -> f64 {
    (score as f64 * 10_000.0).round() / 10_000.0
}

/// Classifies every `{number, text}` record of the input and writes the top
/// label of each.
pub fn classify_articles(
    config: &ClassifyConfig,
    classifier: &ZeroShotClassifier,
) -> Result<ClassifyReport> {
    let (articles, counts) = load_records::<ArticleToClassify, _>(&config.input, |_| true)?;
    info!(
        "Loaded {} articles from {:?} ({} unreadable lines).",
        counts.loaded, config.input, counts.error_lines
    );
    info!(
        "Classifying against {} labels, batch size {}.",
        classifier.labels().len(),
        config.batch_size
    );

    let mut report = ClassifyReport {
        input_errors: counts.error_lines,
        ..Default::default()
    };
    if articles.is_empty() {
        warn!("Nothing to classify.");
        return Ok(report);
    }

    let mut tally: HashMap<String, usize> = HashMap::new();
    let mut writer = JsonlWriter::create(&config.output)?;
    for chunk in articles.chunks(config.batch_size.max(1)) {
        let texts: Vec<&str> = chunk.iter().map(|a| a.text.as_str()).collect();
        let ranked = classifier.classify(&texts)?;
        for (article, scores) in chunk.iter().zip(ranked) {
            let Some(top) = scores.into_iter().next() else {
                continue;
            };
            *tally.entry(top.label.clone()).or_default() += 1;
            writer.write(&ClassifiedArticle {
                number: article.number.clone(),
                predicted_category: top.label,
                score: round4(top.score),
            })?;
            report.classified += 1;
            if report.classified % 1000 == 0 {
                info!("  Classified {}/{}", report.classified, articles.len());
            }
        }
    }
    writer.finish()?;
    info!("Wrote {} results to {:?}", report.classified, config.output);

    let mut distribution: Vec<(String, usize)> = tally.into_iter().collect();
    distribution.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    log_distribution(&distribution, report.classified);
    report.distribution = distribution;
    Ok(report)
}

/// Logs category counts with their share of `total`.
pub fn log_distribution(distribution: &[(String, usize)], total: usize) {
    info!("Distribution of {} articles by category:", total);
    for (category, count) in distribution {
        let percentage = if total > 0 {
            *count as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        info!("  '{}': {} ({:.2}%)", category, count, percentage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    // entailment is high when the hypothesis names a word of the premise
    struct KeywordModel {
        calls: Cell<usize>,
    }

    impl EntailmentModel for KeywordModel {
        fn entailment_logits(&self, pairs: &[(&str, &str)]) -> Result<Vec<f32>> {
            self.calls.set(self.calls.get() + 1);
            Ok(pairs
                .iter()
                .map(|(premise, hypothesis)| {
                    let label = hypothesis
                        .trim_start_matches("This example is ")
                        .trim_end_matches('.');
                    if premise.contains(label) {
                        3.0
                    } else {
                        0.0
                    }
                })
                .collect())
        }
    }

    fn labels() -> Vec<String> {
        vec!["sport".to_string(), "music".to_string(), "history".to_string()]
    }

    #[test]
    fn scores_are_ranked_and_sum_to_one() {
        let model = KeywordModel { calls: Cell::new(0) };
        let classifier = ZeroShotClassifier::new(&model, labels(), DEFAULT_TEMPLATE, 2).unwrap();
        let ranked = classifier.classify(&["a music festival", "the sport pages"]).unwrap();

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0][0].label, "music");
        assert_eq!(ranked[1][0].label, "sport");
        let total: f32 = ranked[0].iter().map(|s| s.score).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(ranked[0][0].score > ranked[0][1].score);
        // six pairs in chunks of two
        assert_eq!(model.calls.get(), 3);
    }

    #[test]
    fn bad_setups_are_rejected() {
        let model = KeywordModel { calls: Cell::new(0) };
        assert!(ZeroShotClassifier::new(&model, Vec::new(), DEFAULT_TEMPLATE, 8).is_err());
        assert!(ZeroShotClassifier::new(&model, labels(), "no placeholder", 8).is_err());
    }

    #[test]
    fn entailment_label_is_found_in_config() {
        let id2label: HashMap<String, String> = [
            ("0".to_string(), "CONTRADICTION".to_string()),
            ("1".to_string(), "ENTAILMENT".to_string()),
            ("2".to_string(), "NEUTRAL".to_string()),
        ]
        .into();
        assert_eq!(entailment_index(&id2label).unwrap(), 1);
        assert!(entailment_index(&HashMap::new()).is_err());
    }

    #[test]
    fn labels_file_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classes.txt");
        std::fs::write(&path, " sport \n\nmusic\n").unwrap();
        assert_eq!(load_labels(&path).unwrap(), vec!["sport", "music"]);
        std::fs::write(&path, "\n  \n").unwrap();
        assert!(load_labels(&path).is_err());
    }

    #[test]
    fn classification_run_writes_top_labels() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("selected.jsonl");
        std::fs::write(
            &input,
            concat!(
                "{\"number\": 0, \"text\": \"sport news\"}\n",
                "not json\n",
                "{\"number\": 1, \"text\": \"music and sport\"}\n",
                "{\"number\": 2, \"text\": \"old history\"}\n",
            ),
        )
        .unwrap();
        let config = ClassifyConfig {
            input,
            output: dir.path().join("out").join("classified.jsonl"),
            batch_size: 2,
            ..Default::default()
        };
        let model = KeywordModel { calls: Cell::new(0) };
        let classifier = ZeroShotClassifier::new(&model, labels(), DEFAULT_TEMPLATE, 2).unwrap();

        let report = classify_articles(&config, &classifier).unwrap();
        assert_eq!(report.classified, 3);
        assert_eq!(report.input_errors, 1);
        assert_eq!(report.distribution[0], ("sport".to_string(), 2));

        let written = std::fs::read_to_string(&config.output).unwrap();
        let rows: Vec<ClassifiedArticle> = written
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(rows[2].predicted_category, "history");
        // 4 decimal places
        assert_eq!(rows[0].score, (rows[0].score * 10_000.0).round() / 10_000.0);
    }
}
