//! JSON Lines plumbing shared by every pipeline step.
//!
//! Readers never abort on a bad line: each line comes back with its own
//! outcome so callers can count and skip errors the way the pipeline expects.

use anyhow::{anyhow, Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs::{create_dir_all, read_dir, File},
    io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LineError {
    #[error("line is not valid UTF-8")]
    Utf8,
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Iterates over the records of a JSONL file, yielding the 1-based line number
/// together with the parse outcome for that line. Iteration stops after an
/// I/O error.
pub struct JsonlRecords<T> {
    reader: BufReader<File>,
    line_number: usize,
    buffer: Vec<u8>,
    failed: bool,
    _record: PhantomData<T>,
}

impl<T: DeserializeOwned> JsonlRecords<T> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {:?}", path))?;
        Ok(Self {
            reader: BufReader::new(file),
            line_number: 0,
            buffer: Vec::new(),
            failed: false,
            _record: PhantomData,
        })
    }
}

impl<T: DeserializeOwned> Iterator for JsonlRecords<T> {
    type Item = (usize, Result<T, LineError>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        self.buffer.clear();
        match self.reader.read_until(b'\n', &mut self.buffer) {
            Ok(0) => None,
            Ok(_) => {
                self.line_number += 1;
                let outcome = std::str::from_utf8(&self.buffer)
                    .map_err(|_| LineError::Utf8)
                    .and_then(|line| serde_json::from_str::<T>(line).map_err(LineError::from));
                Some((self.line_number, outcome))
            }
            Err(err) => {
                self.failed = true;
                self.line_number += 1;
                Some((self.line_number, Err(LineError::Io(err))))
            }
        }
    }
}

/// Counts of what happened while loading a JSONL file.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LoadCounts {
    pub loaded: usize,
    pub error_lines: usize,
}

/// Loads every record that parses as `T` and passes `accept`. Lines that fail
/// to parse or are rejected count as error lines.
pub fn load_records<T, F>(path: &Path, mut accept: F) -> Result<(Vec<T>, LoadCounts)>
where
    T: DeserializeOwned,
    F: FnMut(&T) -> bool,
{
    let mut records = Vec::new();
    let mut counts = LoadCounts::default();
    for (line_number, outcome) in JsonlRecords::<T>::open(path)? {
        match outcome {
            Ok(record) if accept(&record) => {
                records.push(record);
                counts.loaded += 1;
            }
            Ok(_) => {
                log::debug!("{:?} line {}: incomplete record", path, line_number);
                counts.error_lines += 1;
            }
            Err(err) => {
                log::debug!("{:?} line {}: {}", path, line_number, err);
                counts.error_lines += 1;
            }
        }
    }
    Ok((records, counts))
}

/// Buffered JSONL output; parent directories are created on demand.
pub struct JsonlWriter {
    writer: BufWriter<File>,
    written: usize,
}

impl JsonlWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent)?;
            }
        }
        let file = File::create(path).with_context(|| format!("create {:?}", path))?;
        Ok(Self {
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn finish(mut self) -> Result<usize> {
        self.writer.flush()?;
        Ok(self.written)
    }
}

/// Writes a whole collection as JSONL and returns how many lines were written.
pub fn write_records<T: Serialize>(path: &Path, records: &[T]) -> Result<usize> {
    let mut writer = JsonlWriter::create(path)?;
    for (i, record) in records.iter().enumerate() {
        writer.write(record)?;
        if (i + 1) % 1000 == 0 {
            log::info!("  Wrote {}/{} records to {:?}", i + 1, records.len(), path);
        }
    }
    writer.finish()
}

/// Serializes `value` as pretty JSON with a four space indent.
pub fn write_pretty_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut ser)?;
    std::fs::write(path, out).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Lists the files in `dir` with the given extension (without the dot), sorted
/// by name.
pub fn files_with_extension(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in read_dir(dir).with_context(|| format!("list {:?}", dir))? {
        let path = entry?.path();
        if path.is_file() && path.extension().map(|e| e == extension).unwrap_or(false) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Byte offsets of every line start in a file, for random access by index.
pub struct LineIndex {
    path: PathBuf,
    offsets: Vec<u64>,
}

impl LineIndex {
    pub fn build(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {:?}", path))?;
        let mut reader = BufReader::new(file);
        let mut offsets = Vec::new();
        let mut offset = 0u64;
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 {
                break;
            }
            offsets.push(offset);
            offset += read as u64;
        }
        Ok(Self {
            path: path.to_path_buf(),
            offsets,
        })
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads line `index` without its trailing newline.
    pub fn read_line(&self, index: usize) -> Result<String> {
        let start = *self
            .offsets
            .get(index)
            .ok_or_else(|| anyhow!("line {} is out of range (0..{})", index, self.len()))?;
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(start))?;
        let mut bytes = Vec::new();
        match self.offsets.get(index + 1) {
            Some(end) => {
                bytes.resize((end - start) as usize, 0);
                file.read_exact(&mut bytes)?;
            }
            None => {
                file.read_to_end(&mut bytes)?;
            }
        }
        let mut line = String::from_utf8(bytes)?;
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, Serialize, PartialEq)]
    struct Item {
        number: u64,
        text: String,
    }

    #[test]
    fn bad_lines_are_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.jsonl");
        std::fs::write(
            &path,
            b"{\"number\": 1, \"text\": \"a\"}\nnot json\n\xff\xfe\n{\"number\": 2, \"text\": \"b\"}\n",
        )
        .unwrap();

        let outcomes: Vec<_> = JsonlRecords::<Item>::open(&path).unwrap().collect();
        assert_eq!(outcomes.len(), 4);
        assert!(matches!(outcomes[1], (2, Err(LineError::Json(_)))));
        assert!(matches!(outcomes[2], (3, Err(LineError::Utf8))));

        let (items, counts) = load_records::<Item, _>(&path, |_| true).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(counts, LoadCounts { loaded: 2, error_lines: 2 });
    }

    #[test]
    fn writer_and_index_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.jsonl");
        let items = vec![
            Item { number: 0, text: "первая".into() },
            Item { number: 1, text: "вторая".into() },
            Item { number: 2, text: "третья".into() },
        ];
        assert_eq!(write_records(&path, &items).unwrap(), 3);

        let index = LineIndex::build(&path).unwrap();
        assert_eq!(index.len(), 3);
        let line = index.read_line(1).unwrap();
        let item: Item = serde_json::from_str(&line).unwrap();
        assert_eq!(item, items[1]);
        assert!(index.read_line(3).is_err());
    }

    #[test]
    fn last_line_without_newline_is_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tail.jsonl");
        std::fs::write(&path, "{\"a\":1}\n{\"a\":2}").unwrap();
        let index = LineIndex::build(&path).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.read_line(1).unwrap(), "{\"a\":2}");
    }

    #[test]
    fn pretty_json_uses_four_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pretty.json");
        write_pretty_json(&path, &serde_json::json!({"k": "значение"})).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "{\n    \"k\": \"значение\"\n}");
    }
}
