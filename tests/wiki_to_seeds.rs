use nanocorpus::{
    classify::ClassifiedArticle,
    generate::{machine_name_of, DescriptionSeed},
    sampling::{prepare_seeds, sample_categories, split_for_machines, CategorySampleConfig, SelectedTitle},
    wiki::{select_by_length, write_selection, SelectedArticle, WikiDataset},
};
use rand::{rngs::StdRng, SeedableRng};
use serde::de::DeserializeOwned;
use std::path::Path;

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn marked_article(title: &str, paragraphs: usize) -> String {
    format!(
        "_START_ARTICLE_\n{}\n_START_PARAGRAPH_\n{}",
        title,
        vec!["Предложение о предмете статьи."; paragraphs].join("_NEWLINE_")
    )
}

fn write_split(base: &Path, split: &str, texts: &[String]) {
    let dir = base.join(split);
    std::fs::create_dir_all(&dir).unwrap();
    let body: String = texts
        .iter()
        .map(|t| format!("{}\n", serde_json::json!({ "text": t })))
        .collect();
    std::fs::write(dir.join("part-0.jsonl"), body).unwrap();
}

#[test]
fn wiki_selection_flows_into_machine_parts() {
    let dir = tempfile::tempdir().unwrap();
    let wiki_dir = dir.path().join("wiki40b");
    write_split(
        &wiki_dir,
        "train",
        &[
            marked_article("Атом", 4),
            marked_article("Короткая", 1),
            marked_article("Река", 5),
        ],
    );
    // no validation split on purpose
    write_split(&wiki_dir, "test", &[marked_article("Город", 4)]);

    let splits: Vec<String> = ["train", "validation", "test"].iter().map(|s| s.to_string()).collect();
    let dataset = WikiDataset::open(&wiki_dir, &splits).unwrap();
    assert_eq!(dataset.len(), 4);
    assert_eq!(dataset.get(3).unwrap().split, "test");

    // 4 sentences of 30 chars plus separators clear 100; a single one does not
    let selected = select_by_length(&dataset, 100, 1000).unwrap();
    assert_eq!(selected.len(), 3);
    let articles_path = dir.path().join("selected").join("selected_wiki_articles.jsonl");
    assert_eq!(write_selection(&articles_path, selected).unwrap(), 3);
    let articles: Vec<SelectedArticle> = read_jsonl(&articles_path);
    assert_eq!(articles.iter().map(|a| a.number).collect::<Vec<_>>(), [0, 1, 2]);
    assert!(articles[1].text.starts_with("Река\n\n"));

    let classified_path = dir.path().join("classified.jsonl");
    let classified: String = ["Наука", "География", "География"]
        .iter()
        .enumerate()
        .map(|(i, category)| {
            let row = ClassifiedArticle {
                number: serde_json::json!(i),
                predicted_category: category.to_string(),
                score: 0.5,
            };
            format!("{}\n", serde_json::to_string(&row).unwrap())
        })
        .collect();
    std::fs::write(&classified_path, classified).unwrap();

    let titles_path = dir.path().join("titles.jsonl");
    let report = sample_categories(
        &CategorySampleConfig {
            classified: classified_path,
            articles: articles_path.clone(),
            output: titles_path.clone(),
            quotas: vec![("Наука".to_string(), 10), ("География".to_string(), 1)],
        },
        &mut StdRng::seed_from_u64(5),
    )
    .unwrap();
    assert_eq!(report.sampled, 2);
    let titles: Vec<SelectedTitle> = read_jsonl(&titles_path);
    let science = titles.iter().find(|t| t.predicted_category == "Наука").unwrap();
    assert_eq!(science.title, "Атом");

    let seeds_path = dir.path().join("seeds.jsonl");
    let seeds_report = prepare_seeds(&titles_path, &articles_path, &seeds_path).unwrap();
    assert_eq!(seeds_report.written, 2);
    let seeds: Vec<DescriptionSeed> = read_jsonl(&seeds_path);
    assert!(seeds.iter().all(|s| s.beginning_of_text.starts_with("Предложение")));

    let split_dir = dir.path().join("split");
    let weights = vec![("pc_one".to_string(), 1.0), ("pc_two".to_string(), 1.0)];
    let split = split_for_machines(&seeds_path, &split_dir, &weights).unwrap();
    assert_eq!(split.files.len(), 2);
    for (path, count) in &split.files {
        assert_eq!(*count, 1);
        assert!(machine_name_of(path).unwrap().starts_with("pc_"));
    }
}
