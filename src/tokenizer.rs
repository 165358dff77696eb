//! Text codecs: the encode/decode capability consumed by the inspector
//!
//! Two implementations:
//! - HuggingFace [`Tokenizer`] loaded from `tokenizer.json`
//! - [`ByteTokenizer`], one token per byte, used by the demo model and as
//!   a fixed fixture in tests

use anyhow::Result;
use tokenizers::Tokenizer;

/// Special tokens that end generation, tried in order
const EOS_CANDIDATES: [&str; 5] = [
    "<|im_end|>",
    "<|endoftext|>",
    "</s>",
    "<end_of_turn>",
    "<|eot_id|>",
];

/// Encoder/decoder between text and token ids
pub trait TextCodec: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Token ids that stop autoregressive generation
    fn stop_tokens(&self) -> Vec<u32> {
        Vec::new()
    }
}

impl TextCodec for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = (**self)
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        (**self)
            .decode(ids, true)
            .map_err(|e| anyhow::anyhow!("Decode error: {e}"))
    }

    fn stop_tokens(&self) -> Vec<u32> {
        let vocab = self.get_vocab(true);
        EOS_CANDIDATES
            .iter()
            .find_map(|tok| vocab.get(*tok).copied())
            .into_iter()
            .collect()
    }
}

/// Byte-level codec over a vocabulary of 256
///
/// Ids map to Latin-1 characters, so every id sequence decodes to a string
/// that encodes back to the same ids. Characters above U+00FF are encoded
/// as their UTF-8 bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const VOCAB_SIZE: usize = 256;
}

impl TextCodec for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = Vec::with_capacity(text.len());
        for c in text.chars() {
            match u8::try_from(c) {
                Ok(byte) => ids.push(u32::from(byte)),
                Err(_) => {
                    let mut buf = [0u8; 4];
                    ids.extend(c.encode_utf8(&mut buf).bytes().map(u32::from));
                }
            }
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        ids.iter()
            .map(|&id| {
                u8::try_from(id)
                    .map(char::from)
                    .map_err(|_| anyhow::anyhow!("Token {id} outside byte vocabulary"))
            })
            .collect()
    }
}

/// Load a HuggingFace tokenizer from a `tokenizer.json` path
pub fn load_tokenizer(path: &std::path::Path) -> Result<Tokenizer> {
    Tokenizer::from_file(path).map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_tokenizer_latin1() {
        let codec = ByteTokenizer;
        let ids = codec.encode("héllo").unwrap();
        assert_eq!(ids, vec![104, 0xE9, 108, 108, 111]);
        assert_eq!(codec.decode(&ids).unwrap(), "héllo");
        // outside Latin-1: UTF-8 bytes
        assert_eq!(codec.encode("€").unwrap(), vec![0xE2, 0x82, 0xAC]);
    }

    #[test]
    fn test_byte_tokenizer_ids_survive_decode() {
        let codec = ByteTokenizer;
        let ids: Vec<u32> = (0..256).collect();
        let text = codec.decode(&ids).unwrap();
        assert_eq!(codec.encode(&text).unwrap(), ids);
    }

    #[test]
    fn test_hf_tokenizer_codec() {
        let json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {"[UNK]": 0, "hello": 1, "world": 2, "</s>": 3},
                "unk_token": "[UNK]"
            }
        }"#;
        let tokenizer: Tokenizer = json.parse().unwrap();
        let codec: &dyn TextCodec = &tokenizer;
        let ids = codec.encode("hello world").unwrap();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(codec.decode(&ids).unwrap(), "hello world");
        assert_eq!(codec.stop_tokens(), vec![3]);
    }

    #[test]
    fn test_byte_tokenizer_rejects_large_ids() {
        assert!(ByteTokenizer.decode(&[300]).is_err());
        assert!(ByteTokenizer.stop_tokens().is_empty());
    }
}
