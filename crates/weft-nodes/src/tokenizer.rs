use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

use weft_core::traits::Tokenizer;

/// Get or initialize the shared cl100k_base encoder.
fn cl100k() -> &'static CoreBPE {
    static ENCODER: OnceLock<CoreBPE> = OnceLock::new();
    ENCODER.get_or_init(|| tiktoken_rs::cl100k_base().expect("Failed to load cl100k_base tokenizer"))
}

/// BPE token counting with the cl100k_base vocabulary.
#[derive(Debug, Clone, Copy, Default)]
pub struct TiktokenTokenizer;

impl TiktokenTokenizer {
    pub fn cl100k() -> Self {
        Self
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn name(&self) -> &str {
        "cl100k_base"
    }

    fn count_tokens(&self, text: &str) -> usize {
        cl100k().encode_ordinary(text).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_tokens() {
        let tokenizer = TiktokenTokenizer::cl100k();
        assert_eq!(tokenizer.count_tokens(""), 0);
        assert_eq!(tokenizer.count_tokens("hello"), 1);
        assert!(tokenizer.count_tokens("The quick brown fox jumps over the lazy dog") > 5);
    }
}
