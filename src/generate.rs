//! Synthetic article generation through a local chat model.
//!
//! Every step here walks a list of inputs, sends one prompt per input and keeps
//! going when a single request fails; failures are counted and logged.

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fs::create_dir_all,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    jsonl::{files_with_extension, write_pretty_json, JsonlRecords, JsonlWriter},
    llm::{pause, ChatModel, GenerationStatus},
    stats::LengthStats,
    text::{char_len, extract_json_span, sanitize_filename, strip_think_tags, unix_timestamp},
};

pub const DEFAULT_UNCLEAR_MARKER: &str = "НЕЯСНО";
pub const WIKI_GENERATED_SOURCE: &str = "wiki_generated";

const TITLES_PROMPT: &str = "\
Сгенерируй ровно {number} объектов в формате **чистого JSON массива**.
**Не включай никаких дополнительных символов, комментариев или блоков Markdown** (например, ```json) до или после JSON массива.

Каждый объект в массиве должен содержать следующие ключи:
1.  \"number\" (целое число): Порядковый номер элемента в списке, начиная с 1 и до {number}.
2.  \"title\" (строка): Краткий и содержательный заголовок для энциклопедической статьи по теме «{title}». Стиль: научный или популярно-научный.
3.  \"description\" (строка): Краткое описание статьи (1-3 предложения), поясняющее суть заголовка для маленькой локальной модели.

Сгенерируй ровно {number} объектов для темы «{title}».
";

const ARTICLE_RULES: &str = "\
Объём — 5–6 абзацев.
Текст должен быть полностью связанным, без списков, без подзаголовков, без маркированных или нумерованных пунктов, без ссылок на источники, без примечаний, без вставок типа \"См. также\" или \"Источники\".
Пиши нормальным литературным стилем, как в энциклопедии для широкой аудитории.
Не используй разметку, скобочные ссылки и другие формальности Википедии.
Просто цельный, аккуратный, логичный текст на русском языке.";

const DESCRIPTION_PROMPT: &str = "\
Ты — ассистент, помогающий составить краткое описание для энциклопедии.
Твоя задача: прочитать заголовок статьи и предоставленное начало оригинального текста, понять основную тему и сгенерировать краткое описание этой статьи в 1-3 предложения. Описание должно быть информативным и передавать суть статьи.

<category>Предполагаемая категория статьи (используй для общего контекста, но НЕ считай обязательным): {predicted_category}</category>

---
<title>{title}</title>

<beginning_of_text>
{beginning_of_text}
</beginning_of_text>
---

Основываясь ТОЛЬКО на содержании, представленном в <title> и <beginning_of_text>, определи тему статьи. Если это содержание недостаточно ясно или кажется бессмысленным для определения темы, ответь ТОЛЬКО словом \"{unclear_marker}\".

Генерируй ТОЛЬКО описание (1-3 предложения) или слово \"{unclear_marker}\". Не добавляй никаких других слов, вступлений или заключений.

Описание:";

pub fn titles_prompt(theme: &str, number: usize) -> String {
    TITLES_PROMPT
        .replace("{number}", &number.to_string())
        .replace("{title}", theme)
}

pub fn article_prompt(title: &str, description: &str) -> String {
    format!(
        "Напиши связный текст для энциклопедической статьи.\nЗаголовок статьи: «{}»\nВот краткое описание содержания статьи для контекста: {}\n\n{}",
        title, description, ARTICLE_RULES
    )
}

pub fn wiki_article_prompt(title: &str, description: &str) -> String {
    format!(
        "Ты — эксперт по написанию научно-популярных статей для энциклопедии.\nТвоя задача: написать связный текст для энциклопедической статьи на русском языке, основанную на предоставленных заголовке и кратком описании.\n\n<title>{}</title>\n<description>{}</description>\n\n{}\n",
        title, description, ARTICLE_RULES
    )
}

pub fn description_prompt(seed: &DescriptionSeed, unclear_marker: &str) -> String {
    DESCRIPTION_PROMPT
        .replace("{predicted_category}", &seed.predicted_category)
        .replace("{title}", &seed.title)
        .replace("{beginning_of_text}", &seed.beginning_of_text)
        .replace("{unclear_marker}", unclear_marker)
}

// strings are used as-is, anything else as its JSON text
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Themes file: one theme per line, blank lines ignored.
pub fn read_themes(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read themes {:?}", path))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

// ---------------------------------------------------------------------------
// gen-titles

#[derive(Clone, Debug)]
pub struct TitlesConfig {
    pub themes_file: PathBuf,
    pub output_dir: PathBuf,
    pub failed_dir: PathBuf,
    pub items_per_theme: usize,
    pub delay: Duration,
}

#[derive(Debug, Default, PartialEq)]
pub struct TitlesReport {
    pub themes: usize,
    pub saved: usize,
    pub empty: usize,
    pub failed_saved: usize,
    pub request_errors: usize,
}

/// What became of one theme's reply.
#[derive(Debug, PartialEq)]
pub enum TitlesOutcome {
    Items(Vec<Value>),
    EmptyArray,
    Unparsed(String),
    EmptyReply,
}

/// Interprets a model reply to the titles prompt.
pub fn parse_titles_reply(reply: &str) -> TitlesOutcome {
    let reply = reply.trim();
    if reply.is_empty() {
        return TitlesOutcome::EmptyReply;
    }
    let parsed = extract_json_span(reply).and_then(|span| match serde_json::from_str::<Value>(span) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!("titles reply is not valid JSON: {}", err);
            None
        }
    });
    match parsed {
        Some(Value::Array(items)) if items.is_empty() => TitlesOutcome::EmptyArray,
        Some(Value::Array(items)) => TitlesOutcome::Items(items),
        _ => TitlesOutcome::Unparsed(reply.to_string()),
    }
}

pub fn generate_titles(config: &TitlesConfig, chat: &dyn ChatModel) -> Result<TitlesReport> {
    create_dir_all(&config.output_dir)?;
    create_dir_all(&config.failed_dir)?;
    let themes = read_themes(&config.themes_file)?;
    info!("Read {} themes from {:?}", themes.len(), config.themes_file);

    let mut report = TitlesReport {
        themes: themes.len(),
        ..TitlesReport::default()
    };
    if themes.is_empty() {
        warn!("No themes to process.");
        return Ok(report);
    }

    for (i, theme) in themes.iter().enumerate() {
        info!("[{}/{}] Theme «{}»", i + 1, themes.len(), theme);
        let prompt = titles_prompt(theme, config.items_per_theme);

        match chat.complete(&prompt) {
            Err(err) => {
                error!("  Request for «{}» failed: {}", theme, err);
                report.request_errors += 1;
            }
            Ok(reply) => match parse_titles_reply(&reply) {
                TitlesOutcome::Items(items) => {
                    info!(
                        "  Got {} items (asked for {}).",
                        items.len(),
                        config.items_per_theme
                    );
                    let path = config.output_dir.join(sanitize_filename(theme, ".json"));
                    write_pretty_json(&path, &items)?;
                    info!("  Saved to {:?}", path);
                    report.saved += 1;
                }
                TitlesOutcome::EmptyArray => {
                    warn!("  The model returned an empty JSON array for «{}».", theme);
                    report.empty += 1;
                }
                TitlesOutcome::EmptyReply => {
                    warn!("  The model returned an empty reply for «{}».", theme);
                    report.empty += 1;
                }
                TitlesOutcome::Unparsed(raw) => {
                    let name = format!(
                        "{}_{}_failed.txt",
                        sanitize_filename(theme, ""),
                        unix_timestamp()
                    );
                    let path = config.failed_dir.join(name);
                    std::fs::write(&path, raw)?;
                    warn!("  No JSON array in the reply; raw reply saved to {:?}", path);
                    report.failed_saved += 1;
                }
            },
        }

        if i + 1 < themes.len() {
            pause(config.delay);
        }
    }

    info!(
        "Titles done: {} saved, {} empty, {} unparsed, {} request errors.",
        report.saved, report.empty, report.failed_saved, report.request_errors
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// gen-articles

#[derive(Clone, Debug)]
pub struct ArticlesConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub delay: Duration,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneratedArticle {
    pub number: Value,
    pub title: String,
    pub description: String,
    pub text: String,
}

#[derive(Debug, Default, PartialEq)]
pub struct ArticlesReport {
    pub files: usize,
    pub generated: usize,
    pub skipped_items: usize,
    pub failed: usize,
}

fn non_empty_str<'a>(item: &'a Value, key: &str) -> Option<&'a str> {
    item.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

pub fn generate_articles(config: &ArticlesConfig, chat: &dyn ChatModel) -> Result<ArticlesReport> {
    create_dir_all(&config.output_dir)?;
    let inputs = files_with_extension(&config.input_dir, "json")?;
    let mut report = ArticlesReport::default();
    if inputs.is_empty() {
        warn!("No .json title lists found in {:?}", config.input_dir);
        return Ok(report);
    }
    info!("Found {} title lists in {:?}", inputs.len(), config.input_dir);

    for (file_index, input) in inputs.iter().enumerate() {
        info!("[{}/{}] {:?}", file_index + 1, inputs.len(), input);
        let items = match load_title_list(input) {
            Ok(items) => items,
            Err(err) => {
                error!("  Skipping {:?}: {}", input, err);
                continue;
            }
        };
        if items.is_empty() {
            info!("  {:?} has no items.", input);
            continue;
        }
        report.files += 1;

        let stem = input
            .file_stem()
            .ok_or_else(|| anyhow!("no file name in {:?}", input))?;
        let output = config
            .output_dir
            .join(format!("{}.jsonl", stem.to_string_lossy()));
        let mut writer = JsonlWriter::create(&output)?;

        for (idx, item) in items.iter().enumerate() {
            let position = idx + 1;
            let number = item
                .get("number")
                .cloned()
                .unwrap_or_else(|| Value::from(position));
            let (title, description) =
                match (non_empty_str(item, "title"), non_empty_str(item, "description")) {
                    (Some(t), Some(d)) => (t, d),
                    _ => {
                        warn!("  Item {} lacks a title or description; skipping.", number);
                        report.skipped_items += 1;
                        continue;
                    }
                };

            info!("  [{}/{}] (#{}) «{}»", position, items.len(), number, title);
            match chat.complete(&article_prompt(title, description)) {
                Ok(reply) if !reply.trim().is_empty() => {
                    writer.write(&GeneratedArticle {
                        number,
                        title: title.to_string(),
                        description: description.to_string(),
                        text: reply.trim().to_string(),
                    })?;
                    report.generated += 1;
                }
                Ok(_) => {
                    warn!("  Empty reply for «{}».", title);
                    report.failed += 1;
                }
                Err(err) => {
                    error!("  Generation for «{}» failed: {}", title, err);
                    report.failed += 1;
                }
            }

            if position < items.len() {
                pause(config.delay);
            }
        }
        let written = writer.finish()?;
        info!("  Wrote {} articles to {:?}", written, output);
    }

    Ok(report)
}

fn load_title_list(path: &Path) -> Result<Vec<Value>> {
    let text = std::fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&text)? {
        Value::Array(items) => Ok(items),
        _ => Err(anyhow!("top level is not a JSON array")),
    }
}

// ---------------------------------------------------------------------------
// gen-stats

#[derive(Deserialize)]
struct TextRecord {
    text: Option<Value>,
}

/// Length statistics of the `text` field over every JSONL file in `dir`.
/// Returns the statistics (if any article was found) and the error count.
pub fn generated_length_stats(dir: &Path) -> Result<(Option<LengthStats>, usize)> {
    if !dir.is_dir() {
        return Err(anyhow!("directory {:?} does not exist", dir));
    }
    let files = files_with_extension(dir, "jsonl")?;
    if files.is_empty() {
        warn!("No .jsonl files found in {:?}", dir);
        return Ok((None, 0));
    }
    info!("Found {} .jsonl files.", files.len());

    let mut lengths = Vec::new();
    let mut errors = 0;
    for (i, file) in files.iter().enumerate() {
        info!("  [{}/{}] {:?}", i + 1, files.len(), file);
        let records = match JsonlRecords::<TextRecord>::open(file) {
            Ok(records) => records,
            Err(err) => {
                error!("  Could not read {:?}: {}", file, err);
                errors += 1;
                continue;
            }
        };
        let mut in_file = 0;
        for (line_number, outcome) in records {
            match outcome {
                Ok(TextRecord {
                    text: Some(Value::String(text)),
                }) => {
                    lengths.push(char_len(&text));
                    in_file += 1;
                }
                Ok(_) => {
                    warn!("    Line {} has no text field.", line_number);
                    errors += 1;
                }
                Err(err) => {
                    warn!("    Line {}: {}", line_number, err);
                    errors += 1;
                }
            }
        }
        info!("  Articles in file: {}", in_file);
    }

    info!(
        "Scanned {} files: {} articles, {} errors.",
        files.len(),
        lengths.len(),
        errors
    );
    Ok((LengthStats::from_lengths(lengths), errors))
}

// ---------------------------------------------------------------------------
// gen-descriptions

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DescriptionSeed {
    pub number: Value,
    pub predicted_category: String,
    pub title: String,
    pub beginning_of_text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DescribedSeed {
    pub number: Value,
    pub predicted_category: String,
    pub title: String,
    pub beginning_of_text: String,
    pub description: String,
    pub description_status: GenerationStatus,
}

#[derive(Clone, Debug)]
pub struct DescriptionsConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub unclear_marker: String,
    pub delay: Duration,
}

#[derive(Debug, Default, PartialEq)]
pub struct DescriptionsReport {
    pub seeds: usize,
    pub input_errors: usize,
    pub described: usize,
    pub unclear: usize,
    pub api_errors: usize,
    pub parse_errors: usize,
}

/// Classifies a cleaned reply as a description or the unclear marker.
pub fn interpret_description(reply: &str, unclear_marker: &str) -> (String, GenerationStatus) {
    let cleaned = strip_think_tags(reply).trim().to_string();
    if cleaned.to_uppercase() == unclear_marker.to_uppercase() {
        (String::new(), GenerationStatus::Unclear)
    } else {
        (cleaned, GenerationStatus::Ok)
    }
}

pub fn generate_descriptions(
    config: &DescriptionsConfig,
    chat: &dyn ChatModel,
) -> Result<DescriptionsReport> {
    let mut report = DescriptionsReport::default();
    let mut seeds = Vec::new();
    for (line_number, outcome) in JsonlRecords::<DescriptionSeed>::open(&config.input)? {
        match outcome {
            Ok(seed) => seeds.push(seed),
            Err(err) => {
                warn!("  Input line {} skipped: {}", line_number, err);
                report.input_errors += 1;
            }
        }
    }
    report.seeds = seeds.len();
    info!("Loaded {} seeds from {:?}", seeds.len(), config.input);
    if report.input_errors > 0 {
        info!("  Input lines with errors: {}", report.input_errors);
    }
    if seeds.is_empty() {
        info!("No seeds to describe.");
        return Ok(report);
    }

    let mut writer = JsonlWriter::create(&config.output)?;
    for (i, seed) in seeds.into_iter().enumerate() {
        let (description, status) =
            match chat.complete(&description_prompt(&seed, &config.unclear_marker)) {
                Ok(reply) => interpret_description(&reply, &config.unclear_marker),
                Err(err) => {
                    error!(
                        "  [{}/{}] request for #{} failed: {}",
                        i + 1,
                        report.seeds,
                        value_text(&seed.number),
                        err
                    );
                    (String::new(), GenerationStatus::from(&err))
                }
            };
        match status {
            GenerationStatus::Ok => report.described += 1,
            GenerationStatus::Unclear => report.unclear += 1,
            GenerationStatus::ApiError => report.api_errors += 1,
            _ => report.parse_errors += 1,
        }

        writer.write(&DescribedSeed {
            number: seed.number,
            predicted_category: seed.predicted_category,
            title: seed.title,
            beginning_of_text: seed.beginning_of_text,
            description,
            description_status: status,
        })?;

        if (i + 1) % 100 == 0 {
            info!(
                "  Processed {}/{}. API errors: {}, parse errors: {}, unclear: {}",
                i + 1,
                report.seeds,
                report.api_errors,
                report.parse_errors,
                report.unclear
            );
        }
        pause(config.delay);
    }
    writer.finish()?;

    info!("Descriptions written to {:?}", config.output);
    info!("  Described: {}", report.described);
    info!("  Answered '{}': {}", config.unclear_marker, report.unclear);
    info!("  API errors: {}", report.api_errors);
    info!("  Parse errors: {}", report.parse_errors);
    Ok(report)
}

// ---------------------------------------------------------------------------
// gen-wiki-articles

#[derive(Clone, Debug)]
pub struct WikiArticlesConfig {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub include_unclear: bool,
    pub delay: Duration,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneratedWikiArticle {
    pub original_seed_info: Value,
    pub generated_text: String,
    pub generation_status: GenerationStatus,
    pub source: String,
}

#[derive(Debug, Default, PartialEq)]
pub struct WikiArticlesReport {
    pub input_lines: usize,
    pub input_errors: usize,
    pub skipped_unclear: usize,
    pub skipped_other: usize,
    pub generated: usize,
    pub api_errors: usize,
    pub parse_errors: usize,
}

/// Machine name encoded in a `part_<machine>.jsonl` file name.
pub fn machine_name_of(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("{:?} has no usable file name", path))?;
    let machine = name
        .strip_prefix("part_")
        .and_then(|n| n.strip_suffix(".jsonl"))
        .ok_or_else(|| anyhow!("'{}' is not named part_<machine>.jsonl", name))?;
    if machine.is_empty() {
        return Err(anyhow!("'{}' has an empty machine name", name));
    }
    Ok(machine.to_string())
}

pub fn wiki_articles_output(config: &WikiArticlesConfig) -> Result<PathBuf> {
    let machine = machine_name_of(&config.input)?;
    Ok(config
        .output_dir
        .join(format!("generated_wiki_articles_{}.jsonl", machine)))
}

const SEED_KEYS: [&str; 4] = ["number", "title", "description", "description_status"];

pub fn generate_wiki_articles(
    config: &WikiArticlesConfig,
    chat: &dyn ChatModel,
) -> Result<WikiArticlesReport> {
    let output = wiki_articles_output(config)?;
    info!("Output for this machine: {:?}", output);

    let mut report = WikiArticlesReport::default();
    let mut seeds = Vec::new();
    for (line_number, outcome) in JsonlRecords::<Value>::open(&config.input)? {
        report.input_lines += 1;
        let seed = match outcome {
            Ok(seed) => seed,
            Err(err) => {
                warn!("  Input line {} skipped: {}", line_number, err);
                report.input_errors += 1;
                continue;
            }
        };
        if !SEED_KEYS.iter().all(|k| seed.get(k).is_some()) {
            warn!("  Input line {} lacks one of {:?}", line_number, SEED_KEYS);
            report.skipped_other += 1;
            continue;
        }
        let status = seed.get("description_status").and_then(Value::as_str);
        if !config.include_unclear && status != Some("ok") {
            if status == Some("unclear") {
                report.skipped_unclear += 1;
            } else {
                report.skipped_other += 1;
            }
            continue;
        }
        seeds.push(seed);
    }

    info!("Input lines: {}", report.input_lines);
    info!("  Seeds to generate: {}", seeds.len());
    info!("  Skipped as unclear: {}", report.skipped_unclear);
    info!("  Skipped for other statuses: {}", report.skipped_other);
    if report.input_errors > 0 {
        info!("  Input lines with errors: {}", report.input_errors);
    }
    if seeds.is_empty() {
        info!("No seeds with an 'ok' description; nothing to generate.");
        return Ok(report);
    }

    chat.ping()
        .map_err(|err| anyhow!("the chat endpoint is not reachable: {}", err))?;
    info!("Chat endpoint is reachable.");

    create_dir_all(&config.output_dir)?;
    let mut writer = JsonlWriter::create(&output)?;
    let total = seeds.len();
    for (i, seed) in seeds.into_iter().enumerate() {
        let title = seed.get("title").map(value_text).unwrap_or_default();
        let description = seed.get("description").map(value_text).unwrap_or_default();
        let (generated_text, status) = match chat.complete(&wiki_article_prompt(&title, &description)) {
            Ok(reply) => {
                let cleaned = strip_think_tags(&reply).trim().to_string();
                if cleaned.is_empty() {
                    (cleaned, GenerationStatus::EmptyResponse)
                } else {
                    (cleaned, GenerationStatus::Ok)
                }
            }
            Err(err) => {
                error!(
                    "  [{}/{}] request for #{} failed: {}",
                    i + 1,
                    total,
                    seed.get("number").map(value_text).unwrap_or_default(),
                    err
                );
                (String::new(), GenerationStatus::from(&err))
            }
        };
        match status {
            GenerationStatus::Ok => report.generated += 1,
            GenerationStatus::ApiError => report.api_errors += 1,
            _ => report.parse_errors += 1,
        }

        writer.write(&GeneratedWikiArticle {
            original_seed_info: seed,
            generated_text,
            generation_status: status,
            source: WIKI_GENERATED_SOURCE.to_string(),
        })?;

        if (i + 1) % 50 == 0 {
            info!(
                "  Processed {}/{}. Generated: {}, API errors: {}, parse errors/empty: {}",
                i + 1,
                total,
                report.generated,
                report.api_errors,
                report.parse_errors
            );
        }
        pause(config.delay);
    }
    writer.finish()?;

    info!("Articles written to {:?}", output);
    info!("  Generated: {}", report.generated);
    info!("  API errors: {}", report.api_errors);
    info!("  Parse errors/empty replies: {}", report.parse_errors);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{testing::ScriptedChat, LlmError};
    use serde_json::json;

    #[test]
    fn titles_reply_outcomes() {
        let reply = "Конечно!\n[{\"number\": 1, \"title\": \"A\", \"description\": \"B\"}]\nГотово.";
        match parse_titles_reply(reply) {
            TitlesOutcome::Items(items) => assert_eq!(items[0]["title"], "A"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(parse_titles_reply("  [ ] "), TitlesOutcome::EmptyArray);
        assert_eq!(parse_titles_reply("   "), TitlesOutcome::EmptyReply);
        assert_eq!(
            parse_titles_reply("{\"number\": 1}"),
            TitlesOutcome::Unparsed("{\"number\": 1}".into())
        );
        assert_eq!(
            parse_titles_reply("[{broken"),
            TitlesOutcome::Unparsed("[{broken".into())
        );
    }

    #[test]
    fn titles_are_saved_or_kept_raw() {
        let dir = tempfile::tempdir().unwrap();
        let themes = dir.path().join("themes.txt");
        std::fs::write(&themes, "Физика\n\n  Химия  \nБиология\n").unwrap();
        let config = TitlesConfig {
            themes_file: themes,
            output_dir: dir.path().join("out"),
            failed_dir: dir.path().join("out").join("failed"),
            items_per_theme: 2,
            delay: Duration::ZERO,
        };
        let chat = ScriptedChat::new(vec![
            Ok("[{\"number\": 1, \"title\": \"Атом\", \"description\": \"d\"}]".into()),
            Ok("не JSON".into()),
            Err(LlmError::MalformedResponse("boom".into())),
        ]);
        let report = generate_titles(&config, &chat).unwrap();
        assert_eq!(
            report,
            TitlesReport { themes: 3, saved: 1, empty: 0, failed_saved: 1, request_errors: 1 }
        );
        assert!(chat.prompts.borrow()[1].contains("«Химия»"));
        assert!(chat.prompts.borrow()[0].contains("ровно 2 объектов"));

        let saved = std::fs::read_to_string(config.output_dir.join("Физика.json")).unwrap();
        assert!(saved.contains("\"title\": \"Атом\""));
        let failed: Vec<_> = std::fs::read_dir(&config.failed_dir).unwrap().collect();
        assert_eq!(failed.len(), 1);
    }

    #[test]
    fn articles_follow_title_lists() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("titles");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::write(
            input.join("Физика.json"),
            json!([
                {"title": "Атом", "description": "Про атом"},
                {"number": 7, "title": "", "description": "нет заголовка"},
                {"number": 9, "title": "Ядро", "description": "Про ядро"}
            ])
            .to_string(),
        )
        .unwrap();
        let config = ArticlesConfig {
            input_dir: input,
            output_dir: dir.path().join("articles"),
            delay: Duration::ZERO,
        };
        let chat = ScriptedChat::new(vec![Ok("  Текст про атом.  ".into()), Ok("".into())]);
        let report = generate_articles(&config, &chat).unwrap();
        assert_eq!(
            report,
            ArticlesReport { files: 1, generated: 1, skipped_items: 1, failed: 1 }
        );

        let out = std::fs::read_to_string(config.output_dir.join("Физика.jsonl")).unwrap();
        let article: GeneratedArticle = serde_json::from_str(out.lines().next().unwrap()).unwrap();
        assert_eq!(article.number, json!(1));
        assert_eq!(article.text, "Текст про атом.");
    }

    #[test]
    fn unclear_marker_is_case_insensitive() {
        assert_eq!(
            interpret_description("<think>хм</think>\n неясно ", "НЕЯСНО"),
            (String::new(), GenerationStatus::Unclear)
        );
        assert_eq!(
            interpret_description("Статья о реке.", "НЕЯСНО"),
            ("Статья о реке.".to_string(), GenerationStatus::Ok)
        );
    }

    #[test]
    fn every_seed_gets_a_description_line() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("seeds.jsonl");
        let seed = |n: u64| {
            json!({"number": n, "predicted_category": "Наука", "title": "T", "beginning_of_text": "B"})
                .to_string()
        };
        std::fs::write(&input, format!("{}\n{}\n{{\"number\": 3}}\n{}\n", seed(1), seed(2), seed(4))).unwrap();
        let config = DescriptionsConfig {
            input,
            output: dir.path().join("out").join("described.jsonl"),
            unclear_marker: DEFAULT_UNCLEAR_MARKER.into(),
            delay: Duration::ZERO,
        };
        let chat = ScriptedChat::new(vec![
            Ok("Описание.".into()),
            Ok("НЕЯСНО".into()),
            Err(LlmError::Status { status: 500, body: String::new() }),
        ]);
        let report = generate_descriptions(&config, &chat).unwrap();
        assert_eq!(report.seeds, 3);
        assert_eq!(report.input_errors, 1);
        assert_eq!((report.described, report.unclear, report.api_errors), (1, 1, 1));

        let lines: Vec<DescribedSeed> = std::fs::read_to_string(&config.output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1].description_status, GenerationStatus::Unclear);
        assert_eq!(lines[2].description_status, GenerationStatus::ApiError);
        assert!(chat.prompts.borrow()[0].contains("<category>Предполагаемая категория статьи (используй для общего контекста, но НЕ считай обязательным): Наука</category>"));
    }

    #[test]
    fn machine_names_come_from_part_files() {
        assert_eq!(machine_name_of(Path::new("dir/part_3080ti_1.jsonl")).unwrap(), "3080ti_1");
        assert!(machine_name_of(Path::new("part_.jsonl")).is_err());
        assert!(machine_name_of(Path::new("seeds.jsonl")).is_err());
    }

    #[test]
    fn wiki_articles_skip_unclear_seeds() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("part_laptop.jsonl");
        let lines = [
            json!({"number": 1, "title": "A", "description": "da", "description_status": "ok"}),
            json!({"number": 2, "title": "B", "description": "", "description_status": "unclear"}),
            json!({"number": 3, "title": "C", "description": "", "description_status": "api_error"}),
            json!({"number": 4, "title": "D", "description": "dd", "description_status": "ok"}),
            json!({"number": 5, "title": "E"}),
        ];
        let body: String = lines.iter().map(|l| format!("{}\n", l)).collect();
        std::fs::write(&input, body).unwrap();
        let config = WikiArticlesConfig {
            input,
            output_dir: dir.path().join("generated"),
            include_unclear: false,
            delay: Duration::ZERO,
        };
        let chat = ScriptedChat::new(vec![
            Ok("<think>план</think>\nСтатья A.".into()),
            Ok("<think>только мысли</think>".into()),
        ]);
        let report = generate_wiki_articles(&config, &chat).unwrap();
        assert_eq!(report.input_lines, 5);
        assert_eq!(report.skipped_unclear, 1);
        assert_eq!(report.skipped_other, 2);
        assert_eq!((report.generated, report.parse_errors), (1, 1));

        let output = dir.path().join("generated").join("generated_wiki_articles_laptop.jsonl");
        let written: Vec<GeneratedWikiArticle> = std::fs::read_to_string(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(written[0].generated_text, "Статья A.");
        assert_eq!(written[0].original_seed_info["number"], 1);
        assert_eq!(written[0].source, "wiki_generated");
        assert_eq!(written[1].generation_status, GenerationStatus::EmptyResponse);
        assert!(chat.prompts.borrow()[1].contains("<title>D</title>"));
    }

    #[test]
    fn stats_count_missing_text_as_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.jsonl"),
            "{\"text\": \"абв\"}\n{\"title\": \"no text\"}\n{\"text\": \"abcde\"}\nbroken\n",
        )
        .unwrap();
        let (stats, errors) = generated_length_stats(dir.path()).unwrap();
        let stats = stats.unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!((stats.min, stats.max), (3, 5));
        assert_eq!(errors, 2);
    }
}
