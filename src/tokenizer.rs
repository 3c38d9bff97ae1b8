use anyhow::{anyhow, Result};
use log::info;
use std::{
    io::{BufRead, Write},
    path::Path,
};
use tokenizers::Tokenizer;

pub const DEFAULT_TOKENIZER: &str = "google/gemma-3-27b-it";
pub const DEFAULT_BOS_TOKEN: &str = "<bos>";
pub const DEFAULT_EOS_TOKEN: &str = "<eos>";

/// What the corpus tools need from a subword tokenizer. Encoding never adds
/// special tokens; article boundaries are written explicitly by the callers.
pub trait TextEncoder {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
    fn id_to_token(&self, id: u32) -> Option<String>;
    fn bos_id(&self) -> Option<u32>;
    fn eos_id(&self) -> Option<u32>;

    // size of the vocabulary including added tokens
    fn vocab_size(&self) -> usize;

    // the name recorded in meta.json
    fn name(&self) -> &str;
}

/// A `tokenizers` tokenizer loaded from the Hugging Face hub or from disk.
pub struct HubTokenizer {
    name: String,
    tokenizer: Tokenizer,
    bos_id: Option<u32>,
    eos_id: Option<u32>,
}

impl HubTokenizer {
    /// Loads `source`, which is either a `tokenizer.json` file, a directory
    /// holding one, or a hub model name. BOS/EOS ids are looked up from the
    /// given token strings.
    pub fn load(source: &str, bos_token: &str, eos_token: &str) -> Result<Self> {
        let path = Path::new(source);
        let tokenizer = if path.is_file() {
            Tokenizer::from_file(path).map_err(anyhow::Error::msg)?
        } else if path.is_dir() {
            Tokenizer::from_file(path.join("tokenizer.json")).map_err(anyhow::Error::msg)?
        } else {
            // with the `http` feature, tokenizers will pull the tokenizer down
            // from huggingface automatically.
            Tokenizer::from_pretrained(source, None).map_err(|err| {
                anyhow!(
                    "could not load the tokenizer for '{}' ({}); check network access and, for gated models, a saved Hugging Face token",
                    source,
                    err
                )
            })?
        };

        let bos_id = tokenizer.token_to_id(bos_token);
        let eos_id = tokenizer.token_to_id(eos_token);
        Ok(Self {
            name: source.to_string(),
            tokenizer,
            bos_id,
            eos_id,
        })
    }
}

impl TextEncoder for HubTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.tokenizer.encode(text, false).map_err(anyhow::Error::msg)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer.decode(ids, false).map_err(anyhow::Error::msg)
    }

    fn id_to_token(&self, id: u32) -> Option<String> {
        self.tokenizer.id_to_token(id)
    }

    fn bos_id(&self) -> Option<u32> {
        self.bos_id
    }

    fn eos_id(&self) -> Option<u32> {
        self.eos_id
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// The BOS/EOS pair an encoder must provide before any shard can be written.
pub fn require_markers(encoder: &dyn TextEncoder) -> Result<(u32, u32)> {
    let bos = encoder
        .bos_id()
        .ok_or_else(|| anyhow!("tokenizer '{}' has no BOS token", encoder.name()))?;
    let eos = encoder
        .eos_id()
        .ok_or_else(|| anyhow!("tokenizer '{}' has no EOS token", encoder.name()))?;
    Ok((bos, eos))
}

fn describe_marker(encoder: &dyn TextEncoder, id: Option<u32>) -> String {
    match id {
        Some(id) => format!(
            "{} (id {})",
            encoder.id_to_token(id).unwrap_or_else(|| "?".to_string()),
            id
        ),
        None => "none".to_string(),
    }
}

/// Interactive tokenizer check: every line read from `input` is encoded and
/// shown token by token on `output` until `quit` or end of input.
pub fn run_tokenizer_repl<R: BufRead, W: Write>(
    encoder: &dyn TextEncoder,
    input: R,
    mut output: W,
) -> Result<()> {
    info!("Tokenizer '{}' loaded.", encoder.name());
    writeln!(output, "Vocabulary size: {}", encoder.vocab_size())?;
    writeln!(output, "BOS token: {}", describe_marker(encoder, encoder.bos_id()))?;
    writeln!(output, "EOS token: {}", describe_marker(encoder, encoder.eos_id()))?;
    writeln!(output, "Type text to tokenize, or 'quit' to exit.")?;

    let mut lines = input.lines();
    loop {
        write!(output, "> ")?;
        output.flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        if line.trim().eq_ignore_ascii_case("quit") {
            break;
        }
        if line.is_empty() {
            writeln!(output, "  Empty input, try again.")?;
            continue;
        }

        // a failure on one line shouldn't end the session
        if let Err(err) = show_tokens(encoder, &line, &mut output) {
            writeln!(output, "  Tokenization failed: {}", err)?;
        }
        writeln!(output, "{}", "-".repeat(20))?;
    }

    writeln!(output, "Leaving the tokenizer tester.")?;
    Ok(())
}

fn show_tokens<W: Write>(encoder: &dyn TextEncoder, line: &str, output: &mut W) -> Result<()> {
    let ids = encoder.encode(line)?;
    let raw: Vec<String> = ids
        .iter()
        .map(|id| encoder.id_to_token(*id).unwrap_or_default())
        .collect();
    let mut pieces = Vec::with_capacity(ids.len());
    for id in &ids {
        pieces.push(encoder.decode(&[*id])?);
    }
    let decoded = encoder.decode(&ids)?;

    writeln!(output, "  Token ids: {:?}", ids)?;
    writeln!(output, "  Vocabulary tokens: {:?}", raw)?;
    writeln!(output, "  Decoded per token: {:?}", pieces)?;
    writeln!(output, "  Decoded sequence: '{}'", decoded)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Character-level encoder for tests: every char maps to its code point
    /// plus an offset past the special ids.
    pub struct CharEncoder {
        pub bos: Option<u32>,
        pub eos: Option<u32>,
    }

    impl Default for CharEncoder {
        fn default() -> Self {
            Self {
                bos: Some(2),
                eos: Some(1),
            }
        }
    }

    const OFFSET: u32 = 10;

    impl TextEncoder for CharEncoder {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.chars().map(|c| c as u32 + OFFSET).collect())
        }

        fn decode(&self, ids: &[u32]) -> Result<String> {
            ids.iter()
                .map(|id| {
                    id.checked_sub(OFFSET)
                        .and_then(char::from_u32)
                        .ok_or_else(|| anyhow!("unknown id {}", id))
                })
                .collect()
        }

        fn id_to_token(&self, id: u32) -> Option<String> {
            match id {
                1 => Some("<eos>".into()),
                2 => Some("<bos>".into()),
                _ => id.checked_sub(OFFSET).and_then(char::from_u32).map(String::from),
            }
        }

        fn bos_id(&self) -> Option<u32> {
            self.bos
        }

        fn eos_id(&self) -> Option<u32> {
            self.eos
        }

        fn vocab_size(&self) -> usize {
            0x11_0000 + OFFSET as usize
        }

        fn name(&self) -> &str {
            "char-test"
        }
    }
}
