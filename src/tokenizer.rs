//! Byte-level BPE tokenizer
//!
//! Translates strings to token ids and back against a binary vocabulary
//! artifact:
//! - `u32` maximum token length
//! - `vocab_size` records of `(f32 score, i32 len, len bytes)`
//!
//! Encoding walks UTF-8 codepoints, falls back to raw bytes for anything
//! the vocabulary does not know (indices 0..=2 are reserved, so byte `b`
//! becomes token `b + 3`), then greedily merges the highest-scoring
//! adjacent pair - or, when no pair merges, triple - until no merge
//! applies. Decoding maps `<0xHH>` byte tokens back to their raw byte and
//! suppresses unprintable single-byte pieces.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{InferenciaError, Result};
use crate::tensor::{read_f32, read_i32, read_u32};

/// Beginning-of-sequence token (`<|begin_of_text|>`)
pub const BOS: u32 = 128_000;
/// End-of-text token (`<|end_of_text|>`)
pub const EOT: u32 = 128_001;
/// Header-open token (`<|start_header_id|>`)
pub const START_HEADER: u32 = 128_006;
/// Header-close token (`<|end_header_id|>`)
pub const END_HEADER: u32 = 128_007;
/// End-of-turn token (`<|eot_id|>`)
pub const END_OF_TURN: u32 = 128_009;
/// The literal piece "system"
pub const ROLE_SYSTEM: u32 = 9_125;
/// The literal piece "user"
pub const ROLE_USER: u32 = 882;
/// The literal piece "assistant"
pub const ROLE_ASSISTANT: u32 = 78_191;
/// The literal piece `"\n\n"`
pub const DOUBLE_NEWLINE: u32 = 271;

/// Ordered token-id sequence fed to the transformer
///
/// Prompt tokens are popped from the front while generated tokens push onto
/// the back.
pub type TokenQueue = VecDeque<u32>;

/// BPE encoder/decoder over a fixed vocabulary
///
/// `vocab`, `vocab_scores` and the lookup map are immutable after
/// construction; encoding is a pure function of the input text.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    vocab: Vec<String>,
    vocab_scores: Vec<f32>,
    token_to_id: HashMap<String, u32>,
    max_token_length: u32,
}

impl Tokenizer {
    /// Load the vocabulary artifact from any reader
    ///
    /// # Errors
    ///
    /// Returns `Io` on short reads and `InvalidConfig` on a negative record
    /// length.
    pub fn from_reader<R: Read>(reader: &mut R, vocab_size: usize) -> Result<Self> {
        let max_token_length = read_u32(reader)?;

        let mut vocab = Vec::with_capacity(vocab_size);
        let mut vocab_scores = Vec::with_capacity(vocab_size);
        let mut token_to_id = HashMap::with_capacity(vocab_size);

        for id in 0..vocab_size {
            let score = read_f32(reader)?;
            let len = read_i32(reader)?;
            let len = usize::try_from(len).map_err(|_| InferenciaError::InvalidConfig {
                reason: format!("negative token length {len} at vocab index {id}"),
            })?;

            let mut bytes = vec![0u8; len];
            reader.read_exact(&mut bytes)?;
            let piece = String::from_utf8_lossy(&bytes).into_owned();

            // First occurrence wins for duplicate pieces
            token_to_id.entry(piece.clone()).or_insert(id as u32);
            vocab.push(piece);
            vocab_scores.push(score);
        }

        Ok(Self {
            vocab,
            vocab_scores,
            token_to_id,
            max_token_length,
        })
    }

    /// Load the vocabulary artifact from a file on disk
    ///
    /// # Errors
    ///
    /// Returns `Io` when the file cannot be opened, plus all reader
    /// failures.
    pub fn from_file(path: &Path, vocab_size: usize) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(&mut BufReader::new(file), vocab_size)
    }

    /// Number of vocabulary entries
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Length in bytes of the longest vocabulary piece
    #[must_use]
    pub fn max_token_length(&self) -> u32 {
        self.max_token_length
    }

    /// Look up the id of an exact vocabulary piece
    #[must_use]
    pub fn lookup(&self, piece: &str) -> Option<u32> {
        self.token_to_id.get(piece).copied()
    }

    /// Encode text into a token queue
    ///
    /// Walks UTF-8 codepoints (the buffer restarts on any non-continuation
    /// byte and never grows past four bytes, which also defuses stray
    /// continuation-byte runs). Each complete codepoint either hits the
    /// vocabulary or falls back to per-byte tokens at `b + 3`. The merge
    /// loop then compacts the sequence. Unknown input never fails: byte
    /// fallback guarantees a covering encoding.
    #[must_use]
    pub fn encode(&self, text: &str, bos: bool, eos: bool) -> TokenQueue {
        let mut tokens = TokenQueue::new();
        if bos {
            tokens.push_back(BOS);
        }

        let bytes = text.as_bytes();
        let mut buf: Vec<u8> = Vec::with_capacity(4);

        for (i, &b) in bytes.iter().enumerate() {
            // A byte whose top two bits are not `10` starts a new codepoint
            if b & 0xC0 != 0x80 {
                buf.clear();
            }
            buf.push(b);

            let next_is_continuation = bytes.get(i + 1).is_some_and(|&nb| nb & 0xC0 == 0x80);
            if next_is_continuation && buf.len() < 4 {
                continue;
            }

            let id = std::str::from_utf8(&buf)
                .ok()
                .and_then(|piece| self.lookup(piece));
            match id {
                Some(id) => tokens.push_back(id),
                None => {
                    // Indices 0..=2 are reserved special symbols, so raw
                    // bytes start at 3
                    for &fb in &buf {
                        tokens.push_back(u32::from(fb) + 3);
                    }
                }
            }
            buf.clear();
        }

        self.merge(&mut tokens);

        if eos {
            tokens.push_back(EOT);
        }
        tokens
    }

    /// Greedy best-merge compaction
    ///
    /// Each round scans for the merge with the greatest vocabulary score:
    /// pairs first, triples only when no pair anywhere merges. The first
    /// occurrence wins ties. Out-of-vocabulary ids (special tokens) never
    /// participate.
    fn merge(&self, tokens: &mut TokenQueue) {
        loop {
            // (score, start, run length, merged id)
            let mut best: Option<(f32, usize, usize, u32)> = None;

            for l in 2..=3usize {
                if best.is_some() {
                    break;
                }
                for i in 0..(tokens.len() + 1).saturating_sub(l) {
                    let Some(merged) = self.join_pieces(tokens, i, l) else {
                        continue;
                    };
                    let Some(id) = self.lookup(&merged) else {
                        continue;
                    };
                    let score = self.vocab_scores[id as usize];
                    if best.is_none_or(|(best_score, ..)| score > best_score) {
                        best = Some((score, i, l, id));
                    }
                }
            }

            let Some((_, start, len, id)) = best else {
                break;
            };
            tokens[start] = id;
            for _ in 1..len {
                tokens.remove(start + 1);
            }
        }
    }

    /// Concatenate the pieces of `len` consecutive tokens starting at `i`
    ///
    /// Returns `None` when any token has no vocabulary piece.
    fn join_pieces(&self, tokens: &TokenQueue, i: usize, len: usize) -> Option<String> {
        let mut merged = String::new();
        for k in 0..len {
            merged.push_str(self.vocab.get(tokens[i + k] as usize)?);
        }
        Some(merged)
    }

    /// Decode one token into its printable piece
    ///
    /// `<0xHH>` byte tokens map to the raw byte. Returns `None` for unknown
    /// ids, empty pieces, and single bytes that are neither printable nor
    /// whitespace (these are suppressed from output).
    #[must_use]
    pub fn decode(&self, token: u32) -> Option<String> {
        let piece = self.vocab.get(token as usize)?;

        let piece = match parse_byte_token(piece) {
            Some(byte) => {
                if byte.is_ascii_graphic() || byte.is_ascii_whitespace() {
                    String::from(char::from(byte))
                } else {
                    return None;
                }
            }
            None => piece.clone(),
        };

        if piece.is_empty() {
            return None;
        }
        let bytes = piece.as_bytes();
        if bytes.len() == 1 && !(bytes[0].is_ascii_graphic() || bytes[0].is_ascii_whitespace()) {
            return None;
        }
        Some(piece)
    }
}

/// Parse a literal `<0xHH>` byte-token piece
fn parse_byte_token(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serialize a vocabulary in artifact layout and load it back
    fn tokenizer_from(entries: &[(&str, f32)]) -> Tokenizer {
        let max_len = entries.iter().map(|(s, _)| s.len()).max().unwrap_or(0);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(max_len as u32).to_le_bytes());
        for (piece, score) in entries {
            bytes.extend_from_slice(&score.to_le_bytes());
            bytes.extend_from_slice(&(piece.len() as i32).to_le_bytes());
            bytes.extend_from_slice(piece.as_bytes());
        }
        Tokenizer::from_reader(&mut bytes.as_slice(), entries.len()).unwrap()
    }

    /// Reserved symbols plus single-character pieces at their fallback slots
    fn byte_vocab(extra: &[(&str, f32)]) -> Vec<(String, f32)> {
        let mut entries: Vec<(String, f32)> = vec![
            ("<unk>".to_string(), 0.0),
            ("<s>".to_string(), 0.0),
            ("</s>".to_string(), 0.0),
        ];
        for b in 0u8..=255 {
            entries.push((format!("<0x{b:02X}>"), 0.0));
        }
        for (piece, score) in extra {
            entries.push(((*piece).to_string(), *score));
        }
        entries
    }

    #[test]
    fn test_artifact_roundtrip() {
        let tok = tokenizer_from(&[("a", 0.0), ("b", 0.5), ("ab", 1.0)]);
        assert_eq!(tok.vocab_size(), 3);
        assert_eq!(tok.max_token_length(), 2);
        assert_eq!(tok.lookup("ab"), Some(2));
        assert_eq!(tok.lookup("ba"), None);
    }

    #[test]
    fn test_encode_empty_with_eos() {
        let tok = tokenizer_from(&[("a", 0.0)]);
        let tokens = tok.encode("", false, true);
        assert_eq!(tokens, TokenQueue::from([EOT]));
    }

    #[test]
    fn test_encode_bos_first() {
        let tok = tokenizer_from(&[("H", 0.0)]);
        let tokens = tok.encode("Hello", true, false);
        assert_eq!(tokens.front(), Some(&BOS));
    }

    #[test]
    fn test_encode_byte_fallback() {
        // 'z' is not in the vocab: its raw byte is offset by the three
        // reserved symbols
        let tok = tokenizer_from(&[("a", 0.0)]);
        let tokens = tok.encode("z", false, false);
        assert_eq!(tokens, TokenQueue::from([u32::from(b'z') + 3]));
    }

    #[test]
    fn test_encode_multibyte_codepoint_fallback() {
        // U+00E9 is two bytes; neither the codepoint nor the bytes are in
        // the vocab, so both bytes fall back
        let tok = tokenizer_from(&[("a", 0.0)]);
        let tokens = tok.encode("é", false, false);
        let expected: TokenQueue = "é".bytes().map(|b| u32::from(b) + 3).collect();
        assert_eq!(tokens, expected);
    }

    #[test]
    fn test_merge_pair() {
        let tok = tokenizer_from(&[("a", 0.0), ("b", 0.0), ("ab", 1.0)]);
        let tokens = tok.encode("ab", false, false);
        assert_eq!(tokens, TokenQueue::from([2]));
    }

    #[test]
    fn test_merge_prefers_higher_score() {
        // "bc" outscores "ab"; after merging bc no pair remains
        let tok = tokenizer_from(&[
            ("a", 0.0),
            ("b", 0.0),
            ("c", 0.0),
            ("ab", 1.0),
            ("bc", 2.0),
        ]);
        let tokens = tok.encode("abc", false, false);
        assert_eq!(tokens, TokenQueue::from([0, 4]));
    }

    #[test]
    fn test_merge_triple_only_without_pairs() {
        let tok = tokenizer_from(&[("a", 0.0), ("b", 0.0), ("c", 0.0), ("abc", 1.0)]);
        let tokens = tok.encode("abc", false, false);
        assert_eq!(tokens, TokenQueue::from([3]));
    }

    #[test]
    fn test_merge_tie_first_occurrence_wins() {
        let tok = tokenizer_from(&[("a", 0.0), ("b", 0.0), ("ab", 1.0)]);
        let tokens = tok.encode("abab", false, false);
        assert_eq!(tokens, TokenQueue::from([2, 2]));
    }

    #[test]
    fn test_merge_cascades() {
        let tok = tokenizer_from(&[
            ("a", 0.0),
            ("b", 0.0),
            ("ab", 1.0),
            ("abab", 2.0),
        ]);
        let tokens = tok.encode("abab", false, false);
        assert_eq!(tokens, TokenQueue::from([3]));
    }

    #[test]
    fn test_merge_skips_special_ids() {
        // BOS has no vocabulary piece here; the merge loop must not index
        // out of the tiny vocab
        let tok = tokenizer_from(&[("a", 0.0), ("b", 0.0), ("ab", 1.0)]);
        let tokens = tok.encode("ab", true, false);
        assert_eq!(tokens, TokenQueue::from([BOS, 2]));
    }

    #[test]
    fn test_encode_deterministic() {
        let tok = tokenizer_from(&[("h", 0.0), ("i", 0.0), ("hi", 3.0)]);
        let a = tok.encode("hi hi", false, false);
        let b = tok.encode("hi hi", false, false);
        assert_eq!(a, b);
    }

    #[test]
    fn test_decode_plain_piece() {
        let tok = tokenizer_from(&[("hello", 0.0)]);
        assert_eq!(tok.decode(0), Some("hello".to_string()));
    }

    #[test]
    fn test_decode_byte_token() {
        let entries = byte_vocab(&[]);
        let refs: Vec<(&str, f32)> = entries.iter().map(|(s, v)| (s.as_str(), *v)).collect();
        let tok = tokenizer_from(&refs);

        // <0x41> is 'A'
        assert_eq!(tok.decode(3 + 0x41), Some("A".to_string()));
        // <0x0A> is newline, whitespace passes
        assert_eq!(tok.decode(3 + 0x0A), Some("\n".to_string()));
        // <0x01> is an unprintable control byte
        assert_eq!(tok.decode(3 + 0x01), None);
        // high bytes are suppressed from output
        assert_eq!(tok.decode(3 + 0xC3), None);
    }

    #[test]
    fn test_decode_suppresses_empty_and_unknown() {
        let tok = tokenizer_from(&[("", 0.0), ("ok", 0.0)]);
        assert_eq!(tok.decode(0), None);
        assert_eq!(tok.decode(999), None);
    }

    #[test]
    fn test_encode_decode_reversible_over_vocab_pieces() {
        let tok = tokenizer_from(&[("he", 0.0), ("llo", 0.0), (" wor", 0.0), ("ld", 0.0)]);
        let tokens: Vec<u32> = vec![0, 1, 2, 3];
        let joined: String = tokens.iter().filter_map(|&t| tok.decode(t)).collect();
        assert_eq!(joined, "hello world");
    }

    #[test]
    fn test_duplicate_piece_first_id_wins() {
        let tok = tokenizer_from(&[("x", 0.0), ("x", 9.0)]);
        assert_eq!(tok.lookup("x"), Some(0));
    }
}
