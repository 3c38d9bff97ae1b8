//! Access to a local wiki40b export and the length-based selection of
//! articles for the corpus.
//!
//! The export is laid out as `<base>/<split>/*.jsonl`, one record per article
//! with the marker text in `text`, either plain or as a Python bytes literal.

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    fs::create_dir_all,
    io::{BufRead, Write},
    path::{Path, PathBuf},
};

use crate::{
    jsonl::{files_with_extension, JsonlRecords, JsonlWriter, LineIndex},
    stats::LengthStats,
    text::{char_len, clean_wiki_markup, decode_article_text},
    viewer::{ArticleSource, ArticleView},
};

pub const DEFAULT_WIKI_DIR: &str = "./google_wiki40b_ru";
pub const DEFAULT_SPLITS: [&str; 3] = ["train", "validation", "test"];
pub const DEFAULT_MIN_CHARS: usize = 2000;
pub const DEFAULT_MAX_CHARS: usize = 7000;

const PROGRESS_EVERY: usize = 10_000;

#[derive(Deserialize)]
struct WikiRecord {
    text: String,
}

struct WikiSplit {
    name: String,
    files: Vec<LineIndex>,
    len: usize,
}

/// A wiki40b export indexed for random access by a global article number.
/// Splits are numbered one after another in the order they were opened.
pub struct WikiDataset {
    base: PathBuf,
    splits: Vec<WikiSplit>,
    total: usize,
}

/// One article fetched by global number.
#[derive(Clone, Debug, PartialEq)]
pub struct WikiArticle {
    pub split: String,
    pub index_in_split: usize,
    pub text: String,
}

impl WikiDataset {
    pub fn open(base: &Path, split_names: &[String]) -> Result<Self> {
        let mut splits = Vec::new();
        let mut total = 0;
        for name in split_names {
            let split_dir = base.join(name);
            if !split_dir.is_dir() {
                warn!("Split directory {:?} not found; skipping '{}'.", split_dir, name);
                continue;
            }
            let mut files = Vec::new();
            for path in files_with_extension(&split_dir, "jsonl")? {
                match LineIndex::build(&path) {
                    Ok(index) => files.push(index),
                    Err(err) => error!("Could not index {:?}: {}", path, err),
                }
            }
            let len: usize = files.iter().map(LineIndex::len).sum();
            info!("  Split '{}': {} articles (offset {})", name, len, total);
            total += len;
            splits.push(WikiSplit {
                name: name.clone(),
                files,
                len,
            });
        }

        if splits.is_empty() {
            return Err(anyhow!(
                "no split of {:?} could be loaded; expected sub-directories {:?} holding .jsonl files",
                base,
                split_names
            ));
        }
        info!("Articles across all splits: {}", total);
        Ok(Self {
            base: base.to_path_buf(),
            splits,
            total,
        })
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Maps a global number to its split, file and line.
    fn locate(&self, global_index: usize) -> Option<(&WikiSplit, usize, &LineIndex, usize)> {
        let mut start = 0;
        for split in &self.splits {
            if global_index < start + split.len {
                let index_in_split = global_index - start;
                let mut in_file = index_in_split;
                for file in &split.files {
                    if in_file < file.len() {
                        return Some((split, index_in_split, file, in_file));
                    }
                    in_file -= file.len();
                }
                return None;
            }
            start += split.len;
        }
        None
    }

    /// The decoded (not cleaned) text of article `global_index`.
    pub fn get(&self, global_index: usize) -> Result<WikiArticle> {
        let (split, index_in_split, file, line) = self.locate(global_index).ok_or_else(|| {
            anyhow!(
                "article {} is out of range (0 - {})",
                global_index,
                self.total.saturating_sub(1)
            )
        })?;
        let record: WikiRecord = serde_json::from_str(&file.read_line(line)?)
            .with_context(|| format!("line {} of {:?}", line + 1, file.path()))?;
        let text = decode_article_text(&record.text)?;
        Ok(WikiArticle {
            split: split.name.clone(),
            index_in_split,
            text,
        })
    }

    /// Streams the cleaned text of every article, split by split. Records that
    /// cannot be read or decoded are passed on as empty text, the same way a
    /// zero-length article would be. Returns the number of such records.
    pub fn for_each_cleaned<F: FnMut(String)>(&self, mut visit: F) -> Result<usize> {
        let mut processed = 0;
        let mut unreadable = 0;
        for split in &self.splits {
            info!("  Scanning split '{}'...", split.name);
            for file in &split.files {
                for (line_number, outcome) in JsonlRecords::<WikiRecord>::open(file.path())? {
                    let cleaned = match outcome
                        .map_err(anyhow::Error::from)
                        .and_then(|r| decode_article_text(&r.text).map_err(anyhow::Error::from))
                    {
                        Ok(decoded) => clean_wiki_markup(&decoded),
                        Err(err) => {
                            debug!("{:?} line {}: {}", file.path(), line_number, err);
                            unreadable += 1;
                            String::new()
                        }
                    };
                    visit(cleaned);
                    processed += 1;
                    if processed % PROGRESS_EVERY == 0 {
                        info!("    Processed {}/{} articles", processed, self.total);
                    }
                }
            }
        }
        if unreadable > 0 {
            warn!("{} records could not be decoded and count as empty.", unreadable);
        }
        Ok(unreadable)
    }

    fn preview_dir(&self, cleaned: bool) -> PathBuf {
        self.base
            .join(if cleaned { "previews_clean" } else { "previews" })
    }
}

/// Length statistics of every cleaned article.
pub fn wiki_length_stats(dataset: &WikiDataset) -> Result<Option<LengthStats>> {
    let mut lengths = Vec::with_capacity(dataset.len());
    dataset.for_each_cleaned(|text| lengths.push(char_len(&text)))?;
    info!("Analysed {} articles.", lengths.len());
    Ok(LengthStats::from_lengths(lengths))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectedArticle {
    pub number: usize,
    pub text: String,
}

/// Cleaned articles whose length lies within `min_chars..=max_chars`, in
/// dataset order.
pub fn select_by_length(dataset: &WikiDataset, min_chars: usize, max_chars: usize) -> Result<Vec<String>> {
    if min_chars > max_chars {
        return Err(anyhow!("minimum length {} exceeds maximum {}", min_chars, max_chars));
    }
    let mut selected = Vec::new();
    dataset.for_each_cleaned(|text| {
        let length = char_len(&text);
        if (min_chars..=max_chars).contains(&length) {
            selected.push(text);
        }
    })?;
    info!(
        "Selected {} of {} articles with {}-{} characters.",
        selected.len(),
        dataset.len(),
        min_chars,
        max_chars
    );
    Ok(selected)
}

/// Writes the selection as `{number, text}` lines numbered from zero.
pub fn write_selection(path: &Path, texts: Vec<String>) -> Result<usize> {
    let total = texts.len();
    let mut writer = JsonlWriter::create(path)?;
    for (number, text) in texts.into_iter().enumerate() {
        writer.write(&SelectedArticle { number, text })?;
        if (number + 1) % 1000 == 0 {
            info!("  Wrote {}/{} articles", number + 1, total);
        }
    }
    writer.finish()
}

/// Asks a yes/no question; only `y` (any case, surrounding blanks ignored)
/// counts as yes.
pub fn confirm<R: BufRead, W: Write>(mut input: R, mut output: W, question: &str) -> Result<bool> {
    write!(output, "{} (y/n): ", question)?;
    output.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

impl ArticleSource for WikiDataset {
    fn count(&self) -> usize {
        self.len()
    }

    fn supports_cleaning(&self) -> bool {
        true
    }

    fn fetch(&self, index: usize, cleaned: bool) -> Result<ArticleView> {
        let article = self.get(index)?;
        let body = if cleaned {
            clean_wiki_markup(&article.text)
        } else {
            article.text
        };
        Ok(ArticleView {
            heading: format!(
                "Article #{} (split '{}', index {})",
                index, article.split, article.index_in_split
            ),
            body,
        })
    }

    fn save_preview(&self, index: usize, cleaned: bool, body: &str) -> Result<PathBuf> {
        let dir = self.preview_dir(cleaned);
        create_dir_all(&dir)?;
        let path = dir.join(format!("article_{}_preview.txt", index));
        std::fs::write(&path, body)?;
        Ok(path)
    }
}
