//! Byte-pair-encoding tokenizer for the text encoder.
//!
//! Reads a model directory's `vocab.txt` (`token id` per line) and
//! `merges.txt` (`left right` per line, earlier lines merge first) and turns a
//! prompt into exactly [`SEQ_LEN`] token ids: lowercase, split on whitespace,
//! merge each word's characters pairwise by rank, map sub-tokens to ids,
//! wrap in begin/end tokens, then pad or truncate.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{Result, SdError};

/// Fixed output length, matching the text encoder's position table.
pub const SEQ_LEN: usize = 77;

/// Vocabulary entry for the begin token.
pub const BOS_TOKEN: &str = "<|startoftext|>";
/// Vocabulary entry for the end token.
pub const EOS_TOKEN: &str = "<|endoftext|>";
/// Vocabulary entry for the pad token.
pub const PAD_TOKEN: &str = "<|pad|>";

/// BPE tokenizer with CLIP-style special tokens.
///
/// A special id of 0 means "not configured": the begin and end tokens are only
/// emitted when their id is non-zero. Without a pad entry the end id pads.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    vocab: HashMap<String, u32>,
    ranks: HashMap<(String, String), usize>,
    bos_id: u32,
    eos_id: u32,
    pad_id: u32,
}

impl Tokenizer {
    /// Load `vocab.txt` and `merges.txt` from a model directory.
    ///
    /// # Errors
    ///
    /// Returns `Io` if either file cannot be read and `Tokenizer` if the
    /// vocabulary has no usable entries.
    ///
    /// # Example
    /// ```no_run
    /// use sd_inference::tokenizer::Tokenizer;
    ///
    /// let tokenizer = Tokenizer::from_model_dir("models/sd")?;
    /// let ids = tokenizer.encode("a red bicycle");
    /// assert_eq!(ids.len(), 77);
    /// # Ok::<(), sd_inference::error::SdError>(())
    /// ```
    pub fn from_model_dir(model_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = model_dir.as_ref();
        Self::from_files(dir.join("vocab.txt"), dir.join("merges.txt"))
    }

    /// Load from explicit vocabulary and merges paths.
    pub fn from_files(vocab_path: impl AsRef<Path>, merges_path: impl AsRef<Path>) -> Result<Self> {
        let vocab_text = std::fs::read_to_string(vocab_path.as_ref())?;
        let merges_text = std::fs::read_to_string(merges_path.as_ref())?;
        let tokenizer = Self::from_strs(&vocab_text, &merges_text)?;
        debug!(
            vocab = tokenizer.vocab_size(),
            merges = tokenizer.ranks.len(),
            bos = tokenizer.bos_id,
            eos = tokenizer.eos_id,
            pad = tokenizer.pad_id,
            "loaded tokenizer"
        );
        Ok(tokenizer)
    }

    /// Build from in-memory file contents.
    ///
    /// Vocabulary lines that are not `token id` and merge lines that are
    /// empty, start with `#`, or lack two fields are skipped.
    pub fn from_strs(vocab_text: &str, merges_text: &str) -> Result<Self> {
        let mut vocab = HashMap::new();
        let mut skipped = 0usize;
        for line in vocab_text.lines() {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next().and_then(|s| s.parse::<u32>().ok())) {
                (Some(token), Some(id)) => {
                    vocab.insert(token.to_string(), id);
                }
                (None, _) => {}
                _ => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(skipped, "skipped malformed vocabulary lines");
        }
        if vocab.is_empty() {
            return Err(SdError::Tokenizer("vocabulary is empty".to_string()));
        }

        let mut ranks = HashMap::new();
        for line in merges_text.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            if let (Some(a), Some(b)) = (fields.next(), fields.next()) {
                let rank = ranks.len();
                ranks.entry((a.to_string(), b.to_string())).or_insert(rank);
            }
        }

        let special = |t: &str| vocab.get(t).copied().unwrap_or(0);
        let bos_id = special(BOS_TOKEN);
        let eos_id = special(EOS_TOKEN);
        let pad_id = match special(PAD_TOKEN) {
            0 => eos_id,
            id => id,
        };

        Ok(Self {
            vocab,
            ranks,
            bos_id,
            eos_id,
            pad_id,
        })
    }

    /// Tokenize `text` into exactly [`SEQ_LEN`] ids.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        self.encode_with_len(text, SEQ_LEN)
    }

    /// Tokenize `text` into exactly `len` ids.
    pub fn encode_with_len(&self, text: &str, len: usize) -> Vec<u32> {
        let mut ids = Vec::with_capacity(len);
        if self.bos_id != 0 {
            ids.push(self.bos_id);
        }

        let lowered = text.to_lowercase();
        for word in lowered.split_whitespace() {
            for piece in self.bpe(word) {
                ids.push(self.vocab.get(&piece).copied().unwrap_or(self.pad_id));
            }
        }

        if self.eos_id != 0 {
            ids.push(self.eos_id);
        }

        ids.truncate(len);
        ids.resize(len, self.pad_id);
        ids
    }

    /// Merge one word's characters by rank until no ranked pair remains.
    ///
    /// Each pass merges the single lowest-ranked adjacent pair (leftmost on ties).
    pub fn bpe(&self, word: &str) -> Vec<String> {
        let mut pieces: Vec<String> = word.chars().map(String::from).collect();

        while pieces.len() > 1 {
            let best = pieces
                .windows(2)
                .enumerate()
                .filter_map(|(i, pair)| {
                    self.ranks
                        .get(&(pair[0].clone(), pair[1].clone()))
                        .map(|&rank| (rank, i))
                })
                .min();

            let Some((_, pos)) = best else {
                break;
            };
            let right = pieces.remove(pos + 1);
            pieces[pos].push_str(&right);
        }

        pieces
    }

    /// Map ids back to vocabulary strings, space-joined, specials dropped.
    ///
    /// Ids with no vocabulary entry are skipped. Intended for debugging.
    pub fn decode(&self, ids: &[u32]) -> String {
        let by_id: HashMap<u32, &str> = self
            .vocab
            .iter()
            .map(|(token, &id)| (id, token.as_str()))
            .collect();

        ids.iter()
            .filter(|&&id| !self.is_special(id))
            .filter_map(|id| by_id.get(id).copied())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn is_special(&self, id: u32) -> bool {
        (id != 0 && (id == self.bos_id || id == self.eos_id)) || id == self.pad_id
    }

    /// Number of vocabulary entries.
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Id of a vocabulary entry.
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.vocab.get(token).copied()
    }

    /// Begin token id (0 when absent).
    pub fn bos_id(&self) -> u32 {
        self.bos_id
    }

    /// End token id (0 when absent).
    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    /// Pad token id.
    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOCAB: &str = "\
<|startoftext|> 1
<|endoftext|> 2
<|pad|> 3
a 10
c 11
t 12
ca 13
cat 14
h 15
at 16
this line is malformed
";

    const MERGES: &str = "\
#version: 0.2
c a
ca t

a t
";

    fn tokenizer() -> Tokenizer {
        Tokenizer::from_strs(VOCAB, MERGES).unwrap()
    }

    #[test]
    fn test_specials_resolved() {
        let tok = tokenizer();
        assert_eq!(tok.bos_id(), 1);
        assert_eq!(tok.eos_id(), 2);
        assert_eq!(tok.pad_id(), 3);
        assert_eq!(tok.vocab_size(), 10);
    }

    #[test]
    fn test_bpe_merges_by_rank() {
        let tok = tokenizer();
        // "c a" (rank 0) beats "a t" (rank 2), then "ca t" (rank 1)
        assert_eq!(tok.bpe("cat"), vec!["cat"]);
        assert_eq!(tok.bpe("hat"), vec!["h", "at"]);
        assert_eq!(tok.bpe("x"), vec!["x"]);
        assert!(tok.bpe("").is_empty());
    }

    #[test]
    fn test_encode_layout() {
        let tok = tokenizer();
        let ids = tok.encode("CAT  hat");
        assert_eq!(ids.len(), SEQ_LEN);
        assert_eq!(&ids[..5], &[1, 14, 15, 16, 2]);
        assert!(ids[5..].iter().all(|&id| id == 3));
    }

    #[test]
    fn test_unknown_maps_to_pad() {
        let tok = tokenizer();
        let ids = tok.encode("zz");
        assert_eq!(&ids[..4], &[1, 3, 3, 2]);
    }

    #[test]
    fn test_length_invariant() {
        let tok = tokenizer();
        assert_eq!(tok.encode("").len(), SEQ_LEN);
        assert_eq!(tok.encode("cat").len(), SEQ_LEN);
        let long = "cat ".repeat(500);
        let ids = tok.encode(&long);
        assert_eq!(ids.len(), SEQ_LEN);
        // Truncation drops the end token
        assert_eq!(ids[SEQ_LEN - 1], 14);
    }

    #[test]
    fn test_deterministic() {
        let tok = tokenizer();
        let text = "a cat hat that";
        assert_eq!(tok.encode(text), tok.encode(text));
    }

    #[test]
    fn test_pad_falls_back_to_eos() {
        let tok = Tokenizer::from_strs("<|endoftext|> 5\na 6\n", "").unwrap();
        assert_eq!(tok.bos_id(), 0);
        assert_eq!(tok.pad_id(), 5);
        let ids = tok.encode("a");
        // No begin token configured
        assert_eq!(&ids[..3], &[6, 5, 5]);
    }

    #[test]
    fn test_no_specials() {
        let tok = Tokenizer::from_strs("a 6\n", "").unwrap();
        let ids = tok.encode("a");
        assert_eq!(ids[0], 6);
        assert!(ids[1..].iter().all(|&id| id == 0));
    }

    #[test]
    fn test_empty_vocab_rejected() {
        match Tokenizer::from_strs("garbage\n\n", "").unwrap_err() {
            SdError::Tokenizer(_) => (),
            other => panic!("Expected Tokenizer error, got: {:?}", other),
        }
    }

    #[test]
    fn test_missing_files_are_io() {
        let dir = tempfile::tempdir().unwrap();
        match Tokenizer::from_model_dir(dir.path()).unwrap_err() {
            SdError::Io(_) => (),
            other => panic!("Expected IO error, got: {:?}", other),
        }
    }

    #[test]
    fn test_from_model_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vocab.txt"), VOCAB).unwrap();
        std::fs::write(dir.path().join("merges.txt"), MERGES).unwrap();
        let tok = Tokenizer::from_model_dir(dir.path()).unwrap();
        assert_eq!(tok.encode("cat")[1], 14);
    }

    #[test]
    fn test_decode_skips_specials() {
        let tok = tokenizer();
        let ids = tok.encode("cat hat");
        assert_eq!(tok.decode(&ids), "cat h at");
    }
}
