use anyhow::{anyhow, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use log::{error, info, warn};
use nanocorpus::{
    classify::{self, ClassifyConfig, NliCrossEncoder, ZeroShotClassifier},
    generate::{self, ArticlesConfig, DescriptionsConfig, TitlesConfig, WikiArticlesConfig},
    inspect::inspect_shards,
    llm::{self, ChatSettings, LmStudioClient},
    prepare::{self, PrepareConfig, CorpusSource},
    sampling::{self, CategorySampleConfig},
    shard::{Meta, META_FILE},
    stats::LengthStats,
    text::char_len,
    tokenizer::{self, HubTokenizer, TextEncoder},
    viewer::{run_browser, JsonlSource},
    wiki::{self, WikiDataset},
};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    io::{stdin, stdout},
    path::PathBuf,
    process::exit,
    time::Duration,
};

// Clap provides an easy to use way of parsing command-line options by just
// creating a struct and labelling the members with attributes to control
// the parsing behavior.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(
        long,
        global = true,
        default_value_t = 1337,
        help = "The seed to use for RNG; if 0, a random one will be used."
    )]
    seed: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tokenizes the JSONL sources into train.bin, val.bin and meta.json.
    Prepare(PrepareArgs),
    /// Checks prepared shards against meta.json.
    InspectShard(InspectArgs),
    /// Interactive check of how the tokenizer splits text.
    TestTokenizer(TokenizerArgs),
    /// Asks the chat model for article titles per theme.
    GenTitles(GenTitlesArgs),
    /// Writes one article per generated title.
    GenArticles(GenArticlesArgs),
    /// Length statistics of generated articles.
    GenStats(GenStatsArgs),
    /// Writes short descriptions for wiki seeds.
    GenDescriptions(GenDescriptionsArgs),
    /// Writes new articles from described wiki seeds.
    GenWikiArticles(GenWikiArticlesArgs),
    /// Length statistics of cleaned wiki40b articles.
    WikiStats(WikiArgs),
    /// Selects wiki40b articles by cleaned length.
    WikiSelect(WikiSelectArgs),
    /// Browses wiki40b articles in the terminal.
    ViewWiki(ViewWikiArgs),
    /// Browses any JSONL file in the terminal.
    ViewJsonl(ViewJsonlArgs),
    /// Zero-shot topic classification of selected articles.
    Classify(ClassifyArgs),
    /// Uniform random sample of a JSONL file.
    ReservoirSample(ReservoirArgs),
    /// Samples classified articles by per-category quotas.
    SampleCategories(SampleCategoriesArgs),
    /// Joins sampled titles with the start of their article.
    PrepareSeeds(PrepareSeedsArgs),
    /// Splits seeds into weighted parts, one per machine.
    SplitMachines(SplitMachinesArgs),
}

#[derive(Args, Debug)]
struct TokenizerArgs {
    #[arg(
        long,
        default_value = tokenizer::DEFAULT_TOKENIZER,
        help = "Hub name of the tokenizer, or a local tokenizer.json (or directory holding one)."
    )]
    tokenizer: String,

    #[arg(long, default_value = tokenizer::DEFAULT_BOS_TOKEN, help = "The beginning-of-sequence token.")]
    bos_token: String,

    #[arg(long, default_value = tokenizer::DEFAULT_EOS_TOKEN, help = "The end-of-sequence token.")]
    eos_token: String,
}

impl TokenizerArgs {
    fn load(&self) -> Result<HubTokenizer> {
        HubTokenizer::load(&self.tokenizer, &self.bos_token, &self.eos_token)
    }
}

#[derive(Args, Debug)]
struct PrepareArgs {
    #[command(flatten)]
    tokenizer: TokenizerArgs,

    #[arg(
        long,
        value_name = "FORMAT=PATH",
        help = "An input source; FORMAT is generated_original, wiki_original or wiki_generated. Repeatable."
    )]
    source: Vec<String>,

    #[arg(long, help = "A JSON array of {\"path\", \"format\"} sources, used instead of --source.")]
    sources_file: Option<PathBuf>,

    #[arg(long, default_value = prepare::DEFAULT_OUTPUT_DIR, help = "Where the shards and meta.json are written.")]
    output_dir: PathBuf,

    #[arg(
        long,
        default_value_t = prepare::DEFAULT_TRAIN_VAL_SPLIT,
        help = "Share of articles that go to train.bin."
    )]
    train_val_split: f64,

    #[arg(
        long,
        default_value_t = prepare::DEFAULT_MIN_ARTICLE_CHARS,
        help = "Cleaned articles shorter than this are skipped."
    )]
    min_article_chars: usize,

    #[arg(
        long,
        default_value = prepare::DEFAULT_SUCCESS_STATUS,
        help = "The generation_status a wiki_generated record needs."
    )]
    success_status: String,
}

#[derive(Args, Debug)]
struct InspectArgs {
    #[arg(long, default_value = prepare::DEFAULT_OUTPUT_DIR, help = "Directory holding the shards and meta.json.")]
    data_dir: PathBuf,

    #[arg(long, default_value_t = 3, help = "Articles per shard to decode into the log; 0 skips decoding.")]
    preview: usize,

    #[arg(long, help = "Tokenizer used for decoding instead of the one named in meta.json.")]
    tokenizer: Option<String>,
}

#[derive(Args, Debug)]
struct ChatArgs {
    #[arg(long, default_value = llm::DEFAULT_CHAT_URL, help = "The chat completions endpoint.")]
    chat_url: String,

    #[arg(long, default_value = llm::DEFAULT_CHAT_MODEL, help = "The model name sent with each request.")]
    chat_model: String,

    #[arg(long, help = "Sampling temperature; the server default when unset.")]
    temperature: Option<f64>,

    #[arg(long, help = "Reply token limit; the server default when unset.")]
    max_tokens: Option<u32>,

    #[arg(long, default_value_t = 600, help = "Request timeout in seconds.")]
    timeout_secs: u64,
}

impl ChatArgs {
    fn client(&self) -> Result<LmStudioClient> {
        let client = LmStudioClient::new(ChatSettings {
            url: self.chat_url.clone(),
            model: self.chat_model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            timeout: Duration::from_secs(self.timeout_secs),
        })?;
        info!("Using model '{}' at {}", self.chat_model, self.chat_url);
        Ok(client)
    }
}

fn delay_from_secs(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|_| anyhow!("invalid delay of {} seconds", secs))
}

#[derive(Args, Debug)]
struct GenTitlesArgs {
    #[command(flatten)]
    chat: ChatArgs,

    #[arg(long, default_value = "themes/1.txt", help = "One theme per line.")]
    themes_file: PathBuf,

    #[arg(long, default_value = "generated_content_local", help = "Where the title lists are written.")]
    output_dir: PathBuf,

    #[arg(long, help = "Where unparsable replies go; defaults to <output-dir>/failed_json_responses.")]
    failed_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 20, help = "Titles requested per theme.")]
    items_per_theme: usize,

    #[arg(long, default_value_t = 1.0, help = "Seconds to wait between themes.")]
    delay: f64,
}

#[derive(Args, Debug)]
struct GenArticlesArgs {
    #[command(flatten)]
    chat: ChatArgs,

    #[arg(long, default_value = "titles_chunk1", help = "Directory of title list .json files.")]
    input_dir: PathBuf,

    #[arg(long, default_value = "articles_chunk1", help = "Where the article .jsonl files are written.")]
    output_dir: PathBuf,

    #[arg(long, default_value_t = 1.0, help = "Seconds to wait between articles.")]
    delay: f64,
}

#[derive(Args, Debug)]
struct GenStatsArgs {
    #[arg(long, default_value = "./generated_articles_jsonl", help = "Directory of generated .jsonl files.")]
    dir: PathBuf,
}

#[derive(Args, Debug)]
struct GenDescriptionsArgs {
    #[command(flatten)]
    chat: ChatArgs,

    #[arg(long, default_value = "./wiki_description_seeds_split/part_3080_machine.jsonl")]
    input: PathBuf,

    #[arg(long, default_value = "./wiki_seeds_with_descriptions/wiki_seeds_with_descriptions.jsonl")]
    output: PathBuf,

    #[arg(
        long,
        default_value = generate::DEFAULT_UNCLEAR_MARKER,
        help = "The reply the model gives when it cannot describe a seed."
    )]
    unclear_marker: String,

    #[arg(long, default_value_t = 0.1, help = "Seconds to wait after each request.")]
    delay: f64,
}

#[derive(Args, Debug)]
struct GenWikiArticlesArgs {
    #[command(flatten)]
    chat: ChatArgs,

    #[arg(
        long,
        default_value = "./wiki_seeds_with_descriptions/part_3080.jsonl",
        help = "Described seeds; the file must be named part_<machine>.jsonl."
    )]
    input: PathBuf,

    #[arg(long, default_value = "./generated_wiki_articles")]
    output_dir: PathBuf,

    #[arg(long, action = ArgAction::SetTrue, help = "Also generate for seeds whose description is not 'ok'.")]
    include_unclear: bool,

    #[arg(long, default_value_t = 0.1, help = "Seconds to wait between articles.")]
    delay: f64,
}

#[derive(Args, Debug)]
struct WikiArgs {
    #[arg(long, default_value = wiki::DEFAULT_WIKI_DIR, help = "The wiki40b export, one sub-directory per split.")]
    wiki_dir: PathBuf,

    #[arg(long, value_delimiter = ',', default_value = "train,validation,test", help = "Splits to open, in order.")]
    splits: Vec<String>,
}

impl WikiArgs {
    fn open(&self) -> Result<WikiDataset> {
        info!("Opening wiki40b export at {:?}", self.wiki_dir);
        WikiDataset::open(&self.wiki_dir, &self.splits)
    }
}

#[derive(Args, Debug)]
struct WikiSelectArgs {
    #[command(flatten)]
    wiki: WikiArgs,

    #[arg(long, default_value_t = wiki::DEFAULT_MIN_CHARS, help = "Shortest cleaned length kept.")]
    min_chars: usize,

    #[arg(long, default_value_t = wiki::DEFAULT_MAX_CHARS, help = "Longest cleaned length kept.")]
    max_chars: usize,

    #[arg(long, default_value = sampling::DEFAULT_SELECTED_ARTICLES)]
    output: PathBuf,

    #[arg(long, action = ArgAction::SetTrue, help = "Write without asking for confirmation.")]
    yes: bool,
}

#[derive(Args, Debug)]
struct ViewWikiArgs {
    #[command(flatten)]
    wiki: WikiArgs,

    #[arg(long, default_value_t = 0, help = "The article shown first.")]
    start: usize,

    #[arg(long, action = ArgAction::SetTrue, help = "Start in cleaned mode.")]
    clean: bool,
}

#[derive(Args, Debug)]
struct ViewJsonlArgs {
    #[arg(help = "The JSONL file to browse.")]
    file: PathBuf,

    #[arg(long, default_value_t = 0, help = "The line shown first.")]
    start: usize,
}

#[derive(Args, Debug)]
struct ClassifyArgs {
    #[arg(
        long,
        default_value = classify::DEFAULT_NLI_MODEL,
        help = "Hub repo or local directory of a BERT NLI checkpoint."
    )]
    model: String,

    #[arg(long, default_value = classify::DEFAULT_LABELS_FILE, help = "One category per line.")]
    labels_file: PathBuf,

    #[arg(long, default_value = classify::DEFAULT_CLASSIFY_INPUT)]
    input: PathBuf,

    #[arg(long, default_value = classify::DEFAULT_CLASSIFY_OUTPUT)]
    output: PathBuf,

    #[arg(long, default_value = classify::DEFAULT_TEMPLATE, help = "Hypothesis template; {} is replaced by the label.")]
    template: String,

    #[arg(long, default_value_t = classify::DEFAULT_BATCH_SIZE)]
    batch_size: usize,
}

#[derive(Args, Debug)]
struct ReservoirArgs {
    #[arg(long, default_value = sampling::DEFAULT_SELECTED_ARTICLES)]
    input: PathBuf,

    #[arg(long, default_value = sampling::DEFAULT_SAMPLE_OUTPUT)]
    output: PathBuf,

    #[arg(long, default_value_t = sampling::DEFAULT_SAMPLE_SIZE)]
    size: usize,
}

#[derive(Args, Debug)]
struct SampleCategoriesArgs {
    #[arg(long, default_value = classify::DEFAULT_CLASSIFY_OUTPUT, help = "Classification results.")]
    classified: PathBuf,

    #[arg(long, default_value = sampling::DEFAULT_SELECTED_ARTICLES, help = "The selected {number, text} articles.")]
    articles: PathBuf,

    #[arg(long, default_value = sampling::DEFAULT_TITLES_OUTPUT)]
    output: PathBuf,

    #[arg(long, value_name = "CATEGORY=COUNT", help = "A category quota, in drawing order. Repeatable.")]
    quota: Vec<String>,

    #[arg(long, help = "A JSON object of category quotas, used instead of --quota.")]
    quotas_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct PrepareSeedsArgs {
    #[arg(long, default_value = sampling::DEFAULT_TITLES_OUTPUT)]
    titles: PathBuf,

    #[arg(long, default_value = sampling::DEFAULT_SELECTED_ARTICLES)]
    articles: PathBuf,

    #[arg(long, default_value = sampling::DEFAULT_SEEDS_OUTPUT)]
    output: PathBuf,
}

#[derive(Args, Debug)]
struct SplitMachinesArgs {
    #[arg(long, default_value = sampling::DEFAULT_SEEDS_OUTPUT)]
    input: PathBuf,

    #[arg(long, default_value = sampling::DEFAULT_SPLIT_DIR)]
    output_dir: PathBuf,

    #[arg(long, value_name = "MACHINE=WEIGHT", help = "A machine weight. Repeatable.")]
    weight: Vec<String>,

    #[arg(long, help = "A JSON object of machine weights, used instead of --weight.")]
    weights_file: Option<PathBuf>,
}

fn main() {
    // setup our logging interface; RUST_LOG still overrides the default level
    let mut builder = env_logger::Builder::new();
    builder.filter(None, log::LevelFilter::Info);
    builder.parse_default_env();
    builder.init();

    // parse in the command line options all derived from the Cli struct.
    let cli = Cli::parse();
    let mut rng = if cli.seed > 0 {
        StdRng::seed_from_u64(cli.seed)
    } else {
        StdRng::from_entropy()
    };

    let result = match &cli.command {
        Command::Prepare(args) => run_prepare(args, &mut rng),
        Command::InspectShard(args) => run_inspect(args),
        Command::TestTokenizer(args) => run_test_tokenizer(args),
        Command::GenTitles(args) => run_gen_titles(args),
        Command::GenArticles(args) => run_gen_articles(args),
        Command::GenStats(args) => run_gen_stats(args),
        Command::GenDescriptions(args) => run_gen_descriptions(args),
        Command::GenWikiArticles(args) => run_gen_wiki_articles(args),
        Command::WikiStats(args) => run_wiki_stats(args),
        Command::WikiSelect(args) => run_wiki_select(args),
        Command::ViewWiki(args) => args
            .wiki
            .open()
            .and_then(|dataset| run_browser(&dataset, args.start, args.clean)),
        Command::ViewJsonl(args) => {
            JsonlSource::open(&args.file).and_then(|source| run_browser(&source, args.start, false))
        }
        Command::Classify(args) => run_classify(args),
        Command::ReservoirSample(args) => {
            sampling::reservoir_sample(&args.input, &args.output, args.size, &mut rng).map(|_| ())
        }
        Command::SampleCategories(args) => run_sample_categories(args, &mut rng),
        Command::PrepareSeeds(args) => {
            sampling::prepare_seeds(&args.titles, &args.articles, &args.output).map(|_| ())
        }
        Command::SplitMachines(args) => run_split_machines(args),
    };

    if let Err(err) = result {
        error!("{err:#}");
        exit(1);
    }
}

fn run_prepare(args: &PrepareArgs, rng: &mut StdRng) -> Result<()> {
    let sources = match &args.sources_file {
        Some(path) => prepare::load_sources_file(path)?,
        None if args.source.is_empty() => prepare::default_sources(),
        None => args
            .source
            .iter()
            .map(|s| s.parse::<CorpusSource>())
            .collect::<Result<Vec<_>>>()?,
    };
    let config = PrepareConfig {
        sources,
        output_dir: args.output_dir.clone(),
        train_val_split: args.train_val_split,
        min_article_chars: args.min_article_chars,
        success_status: args.success_status.clone(),
    };
    config.validate()?;

    let tokenizer = args.tokenizer.load()?;
    prepare::prepare_corpus(&config, &tokenizer, rng)?;
    Ok(())
}

fn run_inspect(args: &InspectArgs) -> Result<()> {
    if args.preview == 0 {
        inspect_shards(&args.data_dir, None, 0)?;
        return Ok(());
    }
    let name = match &args.tokenizer {
        Some(name) => name.clone(),
        None => Meta::load(&args.data_dir.join(META_FILE))?.tokenizer_model,
    };
    let tokenizer = HubTokenizer::load(&name, tokenizer::DEFAULT_BOS_TOKEN, tokenizer::DEFAULT_EOS_TOKEN)?;
    inspect_shards(&args.data_dir, Some(&tokenizer as &dyn TextEncoder), args.preview)?;
    Ok(())
}

fn run_test_tokenizer(args: &TokenizerArgs) -> Result<()> {
    let tokenizer = args.load()?;
    tokenizer::run_tokenizer_repl(&tokenizer, stdin().lock(), stdout())
}

fn run_gen_titles(args: &GenTitlesArgs) -> Result<()> {
    let config = TitlesConfig {
        themes_file: args.themes_file.clone(),
        failed_dir: args
            .failed_dir
            .clone()
            .unwrap_or_else(|| args.output_dir.join("failed_json_responses")),
        output_dir: args.output_dir.clone(),
        items_per_theme: args.items_per_theme,
        delay: delay_from_secs(args.delay)?,
    };
    generate::generate_titles(&config, &args.chat.client()?)?;
    Ok(())
}

fn run_gen_articles(args: &GenArticlesArgs) -> Result<()> {
    let config = ArticlesConfig {
        input_dir: args.input_dir.clone(),
        output_dir: args.output_dir.clone(),
        delay: delay_from_secs(args.delay)?,
    };
    generate::generate_articles(&config, &args.chat.client()?)?;
    Ok(())
}

fn run_gen_stats(args: &GenStatsArgs) -> Result<()> {
    let (stats, errors) = generate::generated_length_stats(&args.dir)?;
    if errors > 0 {
        warn!("{} records had no usable text.", errors);
    }
    match stats {
        Some(stats) => stats.log_report("generated articles"),
        None => warn!("No article texts found under {:?}", args.dir),
    }
    Ok(())
}

fn run_gen_descriptions(args: &GenDescriptionsArgs) -> Result<()> {
    let config = DescriptionsConfig {
        input: args.input.clone(),
        output: args.output.clone(),
        unclear_marker: args.unclear_marker.clone(),
        delay: delay_from_secs(args.delay)?,
    };
    generate::generate_descriptions(&config, &args.chat.client()?)?;
    Ok(())
}

fn run_gen_wiki_articles(args: &GenWikiArticlesArgs) -> Result<()> {
    let config = WikiArticlesConfig {
        input: args.input.clone(),
        output_dir: args.output_dir.clone(),
        include_unclear: args.include_unclear,
        delay: delay_from_secs(args.delay)?,
    };
    generate::generate_wiki_articles(&config, &args.chat.client()?)?;
    Ok(())
}

fn run_wiki_stats(args: &WikiArgs) -> Result<()> {
    let dataset = args.open()?;
    match wiki::wiki_length_stats(&dataset)? {
        Some(stats) => stats.log_report("cleaned wiki articles"),
        None => warn!("The export holds no articles."),
    }
    Ok(())
}

fn run_wiki_select(args: &WikiSelectArgs) -> Result<()> {
    let dataset = args.wiki.open()?;
    let selected = wiki::select_by_length(&dataset, args.min_chars, args.max_chars)?;
    let Some(stats) = LengthStats::from_lengths(selected.iter().map(|t| char_len(t)).collect()) else {
        warn!("No article is between {} and {} characters; nothing to write.", args.min_chars, args.max_chars);
        return Ok(());
    };
    stats.log_report("selected articles");

    if !args.yes {
        let question = format!("Write {} articles to {:?}?", selected.len(), args.output);
        if !wiki::confirm(stdin().lock(), stdout(), &question)? {
            info!("Nothing written.");
            return Ok(());
        }
    }
    let written = wiki::write_selection(&args.output, selected)?;
    info!("Wrote {} articles to {:?}", written, args.output);
    Ok(())
}

fn run_classify(args: &ClassifyArgs) -> Result<()> {
    let labels = classify::load_labels(&args.labels_file)?;
    info!("Loaded {} categories: {:?}", labels.len(), labels);

    let device = classify::select_device()?;
    let model = NliCrossEncoder::load(&args.model, &device)?;
    let classifier = ZeroShotClassifier::new(&model, labels, &args.template, args.batch_size)?;
    let config = ClassifyConfig {
        input: args.input.clone(),
        output: args.output.clone(),
        template: args.template.clone(),
        batch_size: args.batch_size,
    };
    classify::classify_articles(&config, &classifier)?;
    Ok(())
}

fn run_sample_categories(args: &SampleCategoriesArgs, rng: &mut StdRng) -> Result<()> {
    let quotas = match &args.quotas_file {
        Some(path) => sampling::load_ordered_map(path)?,
        None if args.quota.is_empty() => sampling::default_quotas(),
        None => args
            .quota
            .iter()
            .map(|q| sampling::parse_key_value(q))
            .collect::<Result<Vec<_>>>()?,
    };
    let config = CategorySampleConfig {
        classified: args.classified.clone(),
        articles: args.articles.clone(),
        output: args.output.clone(),
        quotas,
    };
    sampling::sample_categories(&config, rng)?;
    Ok(())
}

fn run_split_machines(args: &SplitMachinesArgs) -> Result<()> {
    let weights = match &args.weights_file {
        Some(path) => sampling::load_ordered_map(path)?,
        None if args.weight.is_empty() => sampling::default_weights(),
        None => args
            .weight
            .iter()
            .map(|w| sampling::parse_key_value(w))
            .collect::<Result<Vec<_>>>()?,
    };
    sampling::split_for_machines(&args.input, &args.output_dir, &weights)?;
    Ok(())
}
