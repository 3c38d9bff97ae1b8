//! Terminal browser for article collections.

use anyhow::{anyhow, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
};
use serde_json::Value;
use std::{
    fs::create_dir_all,
    io::stdout,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{jsonl::LineIndex, text::char_len};

const PAGE_LINES: u16 = 20;

/// What the browser shows for one article.
#[derive(Clone, Debug, PartialEq)]
pub struct ArticleView {
    pub heading: String,
    pub body: String,
}

/// A numbered collection the browser can page through.
pub trait ArticleSource {
    fn count(&self) -> usize;

    fn fetch(&self, index: usize, cleaned: bool) -> Result<ArticleView>;

    /// Whether `fetch` honours the `cleaned` flag.
    fn supports_cleaning(&self) -> bool {
        false
    }

    /// Stores the shown text and returns where it went.
    fn save_preview(&self, index: usize, cleaned: bool, body: &str) -> Result<PathBuf>;
}

/// A JSONL file browsed by line number.
pub struct JsonlSource {
    index: LineIndex,
}

impl JsonlSource {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            index: LineIndex::build(path)?,
        })
    }
}

impl ArticleSource for JsonlSource {
    fn count(&self) -> usize {
        self.index.len()
    }

    fn fetch(&self, index: usize, _cleaned: bool) -> Result<ArticleView> {
        let line = self.index.read_line(index)?;
        let record: Option<Value> = serde_json::from_str(&line).ok();
        let text = record
            .as_ref()
            .and_then(|r| r.get("text"))
            .and_then(Value::as_str);
        let Some(text) = text else {
            return Ok(ArticleView {
                heading: format!("Line {} (raw record)", index),
                body: line,
            });
        };
        let heading = match record.as_ref().and_then(|r| r.get("number")) {
            Some(number) => format!("Line {} / number {}", index, number),
            None => format!("Line {}", index),
        };
        Ok(ArticleView {
            heading,
            body: text.to_string(),
        })
    }

    fn save_preview(&self, index: usize, _cleaned: bool, body: &str) -> Result<PathBuf> {
        let path = self.index.path();
        let dir = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("previews");
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "records".to_string());
        create_dir_all(&dir)?;
        let out = dir.join(format!("{}_{}_preview.txt", stem, index));
        std::fs::write(&out, body)?;
        Ok(out)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Browser state, separate from the terminal so key handling can be tested.
pub struct Browser<'a> {
    source: &'a dyn ArticleSource,
    index: usize,
    cleaned: bool,
    scroll: u16,
    typed: String,
    current: Option<ArticleView>,
    message: Option<String>,
}

impl<'a> Browser<'a> {
    pub fn new(source: &'a dyn ArticleSource, start: usize, cleaned: bool) -> Result<Self> {
        let count = source.count();
        if count == 0 {
            return Err(anyhow!("there is nothing to browse"));
        }
        let mut browser = Self {
            source,
            index: start.min(count - 1),
            cleaned: cleaned && source.supports_cleaning(),
            scroll: 0,
            typed: String::new(),
            current: None,
            message: None,
        };
        browser.load();
        Ok(browser)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn cleaned(&self) -> bool {
        self.cleaned
    }

    pub fn current(&self) -> Option<&ArticleView> {
        self.current.as_ref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    fn load(&mut self) {
        self.scroll = 0;
        match self.source.fetch(self.index, self.cleaned) {
            Ok(view) => self.current = Some(view),
            Err(err) => {
                self.current = None;
                self.message = Some(format!("Could not read article {}: {}", self.index, err));
            }
        }
    }

    fn go_to(&mut self, index: usize) {
        self.index = index;
        self.load();
    }

    pub fn handle_key(&mut self, code: KeyCode) -> Flow {
        let count = self.source.count();
        match code {
            KeyCode::Char('q') => return Flow::Quit,
            KeyCode::Esc => {
                if self.message.is_none() && self.typed.is_empty() {
                    return Flow::Quit;
                }
                self.message = None;
                self.typed.clear();
            }
            KeyCode::Char(d) if d.is_ascii_digit() => self.typed.push(d),
            KeyCode::Backspace => {
                self.typed.pop();
            }
            KeyCode::Enter => {
                let typed = std::mem::take(&mut self.typed);
                match typed.parse::<usize>() {
                    Ok(n) if n < count => self.go_to(n),
                    Ok(n) => {
                        self.message = Some(format!(
                            "Article {} is out of range (0 - {}).",
                            n,
                            count - 1
                        ))
                    }
                    Err(_) => {}
                }
            }
            KeyCode::Char('n') | KeyCode::Right => {
                if self.index + 1 < count {
                    self.go_to(self.index + 1);
                }
            }
            KeyCode::Char('p') | KeyCode::Left => {
                if self.index > 0 {
                    self.go_to(self.index - 1);
                }
            }
            KeyCode::Up => self.scroll = self.scroll.saturating_sub(1),
            KeyCode::Down => self.scroll = self.scroll.saturating_add(1),
            KeyCode::PageUp => self.scroll = self.scroll.saturating_sub(PAGE_LINES),
            KeyCode::PageDown => self.scroll = self.scroll.saturating_add(PAGE_LINES),
            KeyCode::Home => self.scroll = 0,
            KeyCode::Char('c') => {
                if self.source.supports_cleaning() {
                    self.cleaned = !self.cleaned;
                    self.load();
                } else {
                    self.message = Some("This source has no cleaned mode.".to_string());
                }
            }
            KeyCode::Char('s') => {
                if let Some(view) = self.current.as_ref() {
                    self.message = Some(
                        match self.source.save_preview(self.index, self.cleaned, &view.body) {
                            Ok(path) => format!("Saved article {} to {}", self.index, path.display()),
                            Err(err) => format!("Saving failed: {}", err),
                        },
                    );
                }
            }
            _ => {}
        }
        Flow::Continue
    }

    fn draw(&self, f: &mut Frame) {
        let area = f.size();
        let verticals = Layout::vertical([Constraint::Max(1), Constraint::Min(2), Constraint::Max(1)]);
        let [help_area, text_area, status_area] = verticals.areas(area);

        let help = if self.source.supports_cleaning() {
            "Commands: (q)uit | (n)ext | (p)revious | digits+Enter jump | (c)lean toggle | (s)ave preview"
        } else {
            "Commands: (q)uit | (n)ext | (p)revious | digits+Enter jump | (s)ave preview"
        };
        f.render_widget(Paragraph::new(help).fg(Color::Gray), help_area);

        let (title, body) = match self.current.as_ref() {
            Some(view) => (
                format!("{} ({} chars)", view.heading, char_len(&view.body)),
                view.body.as_str(),
            ),
            None => (format!("Article {}", self.index), ""),
        };
        let p = Paragraph::new(body)
            .block(Block::default().title(title.cyan().bold()).borders(Borders::ALL))
            .wrap(Wrap { trim: false })
            .scroll((self.scroll, 0));
        f.render_widget(p, text_area);

        let mode = if self.cleaned { "cleaned" } else { "raw" };
        let mut status = format!(
            "{} / {} | {} | line {}",
            self.index,
            self.source.count().saturating_sub(1),
            mode,
            self.scroll
        );
        if !self.typed.is_empty() {
            status.push_str(&format!(" | go to: {}", self.typed));
        }
        f.render_widget(Paragraph::new(status.fg(Color::Gray)), status_area);

        if let Some(msg) = self.message.as_ref() {
            let block = Block::default()
                .title("Information (Esc to close)")
                .borders(Borders::ALL);
            let area = centered_rect(50, 20, area);
            let p = Paragraph::new(msg.as_str())
                .block(block)
                .wrap(Wrap { trim: true });
            f.render_widget(Clear, area);
            f.render_widget(p, area);
        }
    }
}

/// Runs the browser until the user quits. The terminal is restored even when
/// drawing fails.
pub fn run_browser(source: &dyn ArticleSource, start: usize, cleaned: bool) -> Result<()> {
    let mut browser = Browser::new(source, start, cleaned)?;

    stdout().execute(EnterAlternateScreen)?;
    enable_raw_mode()?;
    let result = browse(&mut browser);
    stdout().execute(LeaveAlternateScreen)?;
    disable_raw_mode()?;
    result
}

fn browse(browser: &mut Browser) -> Result<()> {
    let backend = CrosstermBackend::new(stdout());
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;

    loop {
        terminal.draw(|f| browser.draw(f))?;
        if event::poll(Duration::from_millis(250))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press && browser.handle_key(key.code) == Flow::Quit {
                    return Ok(());
                }
            }
        }
    }
}

/// helper function to create a centered rect using up certain percentage of the available rect `r`
fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::vertical([
        Constraint::Percentage((100 - percent_y) / 2),
        Constraint::Percentage(percent_y),
        Constraint::Percentage((100 - percent_y) / 2),
    ])
    .split(r);

    Layout::horizontal([
        Constraint::Percentage((100 - percent_x) / 2),
        Constraint::Percentage(percent_x),
        Constraint::Percentage((100 - percent_x) / 2),
    ])
    .split(popup_layout[1])[1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Shelf {
        texts: Vec<&'static str>,
        saved: RefCell<Vec<(usize, bool, String)>>,
    }

    impl ArticleSource for Shelf {
        fn count(&self) -> usize {
            self.texts.len()
        }

        fn supports_cleaning(&self) -> bool {
            true
        }

        fn fetch(&self, index: usize, cleaned: bool) -> Result<ArticleView> {
            let text = self.texts[index];
            Ok(ArticleView {
                heading: format!("#{}", index),
                body: if cleaned { text.to_uppercase() } else { text.to_string() },
            })
        }

        fn save_preview(&self, index: usize, cleaned: bool, body: &str) -> Result<PathBuf> {
            self.saved.borrow_mut().push((index, cleaned, body.to_string()));
            Ok(PathBuf::from(format!("article_{}_preview.txt", index)))
        }
    }

    fn shelf() -> Shelf {
        Shelf {
            texts: vec!["alpha", "beta", "gamma"],
            saved: RefCell::new(Vec::new()),
        }
    }

    #[test]
    fn digits_and_enter_jump() {
        let source = shelf();
        let mut browser = Browser::new(&source, 0, false).unwrap();
        browser.handle_key(KeyCode::Char('2'));
        browser.handle_key(KeyCode::Enter);
        assert_eq!(browser.index(), 2);
        assert_eq!(browser.current().unwrap().body, "gamma");

        browser.handle_key(KeyCode::Char('9'));
        browser.handle_key(KeyCode::Enter);
        assert_eq!(browser.index(), 2);
        assert!(browser.message().unwrap().contains("out of range"));
        assert_eq!(browser.handle_key(KeyCode::Esc), Flow::Continue);
        assert_eq!(browser.handle_key(KeyCode::Esc), Flow::Quit);
    }

    #[test]
    fn paging_stops_at_both_ends() {
        let source = shelf();
        let mut browser = Browser::new(&source, 0, false).unwrap();
        browser.handle_key(KeyCode::Char('p'));
        assert_eq!(browser.index(), 0);
        for _ in 0..5 {
            browser.handle_key(KeyCode::Char('n'));
        }
        assert_eq!(browser.index(), 2);
        assert_eq!(browser.handle_key(KeyCode::Char('q')), Flow::Quit);
    }

    #[test]
    fn cleaning_toggle_and_save_use_the_shown_text() {
        let source = shelf();
        let mut browser = Browser::new(&source, 1, false).unwrap();
        browser.handle_key(KeyCode::Char('c'));
        assert!(browser.cleaned());
        assert_eq!(browser.current().unwrap().body, "BETA");
        browser.handle_key(KeyCode::Char('s'));
        assert_eq!(source.saved.borrow()[0], (1, true, "BETA".to_string()));
        assert!(browser.message().unwrap().starts_with("Saved article 1"));
    }

    #[test]
    fn jsonl_source_shows_text_or_raw_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("selected.jsonl");
        std::fs::write(
            &path,
            "{\"number\": 7, \"text\": \"Статья\"}\n{\"title\": \"no text\"}\n",
        )
        .unwrap();
        let source = JsonlSource::open(&path).unwrap();
        assert_eq!(source.count(), 2);

        let first = source.fetch(0, false).unwrap();
        assert_eq!(first.body, "Статья");
        assert!(first.heading.contains("number 7"));
        let second = source.fetch(1, false).unwrap();
        assert_eq!(second.body, "{\"title\": \"no text\"}");

        let saved = source.save_preview(0, false, &first.body).unwrap();
        assert_eq!(saved, dir.path().join("previews").join("selected_0_preview.txt"));
        assert_eq!(std::fs::read_to_string(saved).unwrap(), "Статья");
    }

    #[test]
    fn empty_sources_are_refused() {
        let source = Shelf {
            texts: Vec::new(),
            saved: RefCell::new(Vec::new()),
        };
        assert!(Browser::new(&source, 0, false).is_err());
    }
}
