//! Subsets of the selected wiki articles and their split across machines.

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use rand::{seq::SliceRandom, Rng};
use serde::{de::IgnoredAny, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::{
    classify::{log_distribution, ClassifiedArticle},
    generate::DescriptionSeed,
    jsonl::{load_records, write_records, JsonlWriter},
    text::{beginning_of_text, title_of},
};

pub const DEFAULT_SAMPLE_SIZE: usize = 10_000;
pub const DEFAULT_SELECTED_ARTICLES: &str = "./selected_wiki_jsonl/selected_wiki_articles.jsonl";
pub const DEFAULT_SAMPLE_OUTPUT: &str = "./random_wiki_sample_10000.jsonl";
pub const DEFAULT_TITLES_OUTPUT: &str = "./wiki_seed_titles/selected_wiki_titles.jsonl";
pub const DEFAULT_SEEDS_OUTPUT: &str = "./wiki_seeds_for_description/wiki_seeds_for_description.jsonl";
pub const DEFAULT_SPLIT_DIR: &str = "./wiki_description_seeds_split";
pub const SEED_TEXT_CHARS: usize = 1000;

/// Per-category sample sizes, in the order they are drawn.
pub fn default_quotas() -> Vec<(String, usize)> {
    [
        ("Наука", 2500),
        ("Технология", 2300),
        ("Медицина", 3100),
        ("Концепция или Теория", 5700),
        ("История", 5000),
        ("География", 3000),
        ("Общество", 2000),
        ("Политика", 1500),
        ("Культура и Искусство", 1500),
        ("Философия и Религия", 1000),
        ("Спорт", 800),
        ("Событие", 1500),
        ("Организация", 100),
        ("Персона", 100),
        ("Другое", 0),
    ]
    .into_iter()
    .map(|(c, n)| (c.to_string(), n))
    .collect()
}

/// Relative share of the seeds each machine receives.
pub fn default_weights() -> Vec<(String, f64)> {
    [
        ("3080ti_1", 1.2),
        ("3080ti_2", 1.2),
        ("3080_machine", 1.0),
        ("3070_laptop", 0.75),
    ]
    .into_iter()
    .map(|(m, w)| (m.to_string(), w))
    .collect()
}

/// Parses `KEY=VALUE`, splitting at the last `=` so keys may contain one.
pub fn parse_key_value<T>(arg: &str) -> Result<(String, T)>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let (key, value) = arg
        .rsplit_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{}'", arg))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("empty key in '{}'", arg));
    }
    let value = value
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow!("bad value in '{}': {}", arg, e))?;
    Ok((key.to_string(), value))
}

/// Reads an ordered `{key: value}` JSON object, keeping the file's key order.
pub fn load_ordered_map<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<(String, T)>> {
    let file = File::open(path).with_context(|| format!("open {:?}", path))?;
    let map: Map<String, Value> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("{:?} is not a JSON object", path))?;
    map.into_iter()
        .map(|(k, v)| {
            let parsed = serde_json::from_value(v).with_context(|| format!("value of '{}'", k))?;
            Ok((k, parsed))
        })
        .collect()
}

// article numbers are compared by their JSON text so 7 and "7" stay distinct
fn number_key(number: &Value) -> String {
    number.to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct NumberedText {
    number: Value,
    text: String,
}

/// Article texts of the selection file by number. Later duplicates win.
fn load_texts_by_number(path: &Path) -> Result<HashMap<String, String>> {
    let (articles, counts) = load_records::<NumberedText, _>(path, |a| !a.number.is_null())?;
    if counts.error_lines > 0 {
        warn!("{} unusable lines in {:?}", counts.error_lines, path);
    }
    info!("Loaded {} article texts from {:?}", counts.loaded, path);
    Ok(articles
        .into_iter()
        .map(|a| (number_key(&a.number), a.text))
        .collect())
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReservoirReport {
    pub valid_records: usize,
    pub invalid_lines: usize,
    pub written: usize,
}

/// Uniform sample of `size` valid JSON lines (Algorithm R). Lines are copied
/// verbatim; invalid lines neither enter the sample nor advance the stream.
pub fn reservoir_sample<R: Rng>(
    input: &Path,
    output: &Path,
    size: usize,
    rng: &mut R,
) -> Result<ReservoirReport> {
    let file = File::open(input).with_context(|| format!("open {:?}", input))?;
    let mut reader = BufReader::new(file);
    let mut report = ReservoirReport::default();
    let mut reservoir: Vec<String> = Vec::new();
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        if reader.read_until(b'\n', &mut buffer)? == 0 {
            break;
        }
        let line = match std::str::from_utf8(&buffer) {
            Ok(line) if serde_json::from_str::<IgnoredAny>(line).is_ok() => {
                line.trim_end_matches(&['\n', '\r'][..])
            }
            _ => {
                report.invalid_lines += 1;
                continue;
            }
        };

        report.valid_records += 1;
        if reservoir.len() < size {
            reservoir.push(line.to_string());
        } else {
            let j = rng.gen_range(0..report.valid_records);
            if j < size {
                reservoir[j] = line.to_string();
            }
        }
        if report.valid_records % 100_000 == 0 {
            info!("  Read {} records", report.valid_records);
        }
    }

    write_lines(output, &reservoir)?;
    report.written = reservoir.len();
    info!(
        "Sampled {} of {} valid records ({} invalid lines skipped) into {:?}",
        report.written, report.valid_records, report.invalid_lines, output
    );
    Ok(report)
}

fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(path).with_context(|| format!("create {:?}", path))?);
    for line in lines {
        writeln!(out, "{}", line)?;
    }
    out.flush()?;
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectedTitle {
    pub number: Value,
    pub predicted_category: String,
    pub title: String,
}

#[derive(Clone, Debug)]
pub struct CategorySampleConfig {
    pub classified: PathBuf,
    pub articles: PathBuf,
    pub output: PathBuf,
    pub quotas: Vec<(String, usize)>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CategorySampleReport {
    pub classified: usize,
    pub classified_errors: usize,
    pub desired: usize,
    pub sampled: usize,
    pub missing_texts: usize,
    /// Sampled counts, largest first.
    pub distribution: Vec<(String, usize)>,
}

/// Draws `min(quota, available)` classified articles per category, shuffles
/// the union and titles each pick with the first line of its text.
pub fn sample_categories<R: Rng>(
    config: &CategorySampleConfig,
    rng: &mut R,
) -> Result<CategorySampleReport> {
    let (classified, counts) = load_records::<ClassifiedArticle, _>(&config.classified, |c| {
        !c.number.is_null()
    })?;
    let mut report = CategorySampleReport {
        classified: counts.loaded,
        classified_errors: counts.error_lines,
        ..Default::default()
    };
    if classified.is_empty() {
        warn!("No classification results in {:?}; nothing to sample.", config.classified);
        return Ok(report);
    }

    let mut by_category: HashMap<&str, Vec<&Value>> = HashMap::new();
    for item in &classified {
        by_category
            .entry(item.predicted_category.as_str())
            .or_default()
            .push(&item.number);
    }
    let mut available: Vec<(&str, usize)> = by_category.iter().map(|(c, v)| (*c, v.len())).collect();
    available.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    info!("Available articles per category:");
    for (category, count) in &available {
        info!("  '{}': {}", category, count);
    }

    let texts = load_texts_by_number(&config.articles)?;
    if texts.is_empty() {
        warn!("No article texts in {:?}; nothing to sample.", config.articles);
        return Ok(report);
    }

    let mut picks: Vec<(Value, &str)> = Vec::new();
    let mut sampled_counts: Vec<(String, usize)> = Vec::new();
    for (category, quota) in &config.quotas {
        if *quota == 0 {
            continue;
        }
        report.desired += quota;
        let pool = by_category.get(category.as_str()).map(Vec::as_slice).unwrap_or(&[]);
        let take = (*quota).min(pool.len());
        if take < *quota {
            warn!(
                "Category '{}': wanted {} but only {} available",
                category,
                quota,
                pool.len()
            );
        }
        if take == 0 {
            continue;
        }
        for number in pool.choose_multiple(rng, take) {
            picks.push(((*number).clone(), category.as_str()));
        }
        sampled_counts.push((category.clone(), take));
    }
    picks.shuffle(rng);
    report.sampled = picks.len();
    if report.sampled < report.desired {
        warn!("Sampled {} articles out of the {} requested.", report.sampled, report.desired);
    }

    let mut titles = Vec::with_capacity(picks.len());
    for (number, category) in picks {
        let title = match texts.get(&number_key(&number)) {
            Some(text) => title_of(text),
            None => {
                report.missing_texts += 1;
                String::new()
            }
        };
        titles.push(SelectedTitle {
            number,
            predicted_category: category.to_string(),
            title,
        });
    }
    if report.missing_texts > 0 {
        warn!("{} sampled articles have no text; their titles are empty.", report.missing_texts);
    }
    write_records(&config.output, &titles)?;

    sampled_counts.sort_by(|a, b| b.1.cmp(&a.1));
    log_distribution(&sampled_counts, report.sampled);
    report.distribution = sampled_counts;
    Ok(report)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SeedsReport {
    pub titles: usize,
    pub title_errors: usize,
    pub written: usize,
    pub missing_texts: usize,
}

/// Joins sampled titles with the start of their article text.
pub fn prepare_seeds(titles_path: &Path, articles: &Path, output: &Path) -> Result<SeedsReport> {
    let (titles, counts) =
        load_records::<SelectedTitle, _>(titles_path, |t| !t.number.is_null())?;
    let mut report = SeedsReport {
        titles: counts.loaded,
        title_errors: counts.error_lines,
        ..Default::default()
    };
    if titles.is_empty() {
        warn!("No titles in {:?}; nothing to prepare.", titles_path);
        return Ok(report);
    }
    let texts = load_texts_by_number(articles)?;

    let mut writer = JsonlWriter::create(output)?;
    for item in titles {
        let beginning = match texts.get(&number_key(&item.number)) {
            Some(text) => beginning_of_text(text, SEED_TEXT_CHARS),
            None => {
                report.missing_texts += 1;
                String::new()
            }
        };
        writer.write(&DescriptionSeed {
            number: item.number,
            predicted_category: item.predicted_category,
            title: item.title,
            beginning_of_text: beginning,
        })?;
        if writer.written() % 1000 == 0 {
            info!("  Prepared {} seeds", writer.written());
        }
    }
    report.written = writer.finish()?;
    info!(
        "Wrote {} seeds to {:?} ({} without text)",
        report.written, output, report.missing_texts
    );
    Ok(report)
}

/// Item counts per machine: `floor(w / W * n)`, with the remainder going to
/// the first machine of maximal weight.
pub fn machine_shares(weights: &[(String, f64)], total_items: usize) -> Result<Vec<(String, usize)>> {
    if let Some((name, w)) = weights.iter().find(|(_, w)| !w.is_finite() || *w < 0.0) {
        return Err(anyhow!("machine '{}' has invalid weight {}", name, w));
    }
    let total_weight: f64 = weights.iter().map(|(_, w)| w).sum();
    if total_weight <= 0.0 {
        return Err(anyhow!("the machine weights sum to zero"));
    }

    let mut shares: Vec<(String, usize)> = weights
        .iter()
        .map(|(name, w)| (name.clone(), (w / total_weight * total_items as f64) as usize))
        .collect();
    let assigned: usize = shares.iter().map(|(_, n)| n).sum();
    let heaviest = weights
        .iter()
        .enumerate()
        .fold(0, |best, (i, (_, w))| if *w > weights[best].1 { i } else { best });
    shares[heaviest].1 = (shares[heaviest].1 + total_items).saturating_sub(assigned);
    Ok(shares)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SplitReport {
    pub loaded: usize,
    pub error_lines: usize,
    pub files: Vec<(PathBuf, usize)>,
}

/// Writes contiguous slices of the input to `part_<machine>.jsonl`.
pub fn split_for_machines(input: &Path, output_dir: &Path, weights: &[(String, f64)]) -> Result<SplitReport> {
    let (items, counts) = load_records::<Map<String, Value>, _>(input, |m| !m.is_empty())?;
    let mut report = SplitReport {
        loaded: counts.loaded,
        error_lines: counts.error_lines,
        ..Default::default()
    };
    if items.is_empty() {
        warn!("No records in {:?}; nothing to split.", input);
        return Ok(report);
    }

    let shares = machine_shares(weights, items.len())?;
    let mut start = 0;
    for (machine, count) in shares {
        info!("  {}: {} items", machine, count);
        if count == 0 {
            continue;
        }
        let path = output_dir.join(format!("part_{}.jsonl", machine));
        write_records(&path, &items[start..start + count])?;
        report.files.push((path, count));
        start += count;
    }
    info!("Split {} records into {} files under {:?}", items.len(), report.files.len(), output_dir);
    Ok(report)
}
