//! Corpus building for a small Russian-language GPT: LLM-generated articles,
//! a filtered and classified wiki40b subset, and the tokenized shards the
//! nanoGPT trainer reads.

pub mod classify;
pub mod generate;
pub mod inspect;
pub mod jsonl;
pub mod llm;
pub mod prepare;
pub mod sampling;
pub mod shard;
pub mod stats;
pub mod text;
pub mod tokenizer;
pub mod viewer;
pub mod wiki;
