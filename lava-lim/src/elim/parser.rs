//! ELIM output reader
//!
//! The probe writes batches of whitespace-separated tokens: a count N, then
//! N (name, value) pairs. Nothing marks the end of a batch except the count,
//! and pipe reads can split a token anywhere, so the parser keeps the
//! incomplete tail between reads.

use crate::error::{LimError, Result};

pub type Batch = Vec<(String, String)>;

/// Longest run of bytes accepted without a separator
pub const MAX_PENDING: usize = 8192;

/// Result of one [`ElimParser::feed`]
#[derive(Debug, Default)]
pub struct Feed {
    /// Batches completed before any error, in stream order
    pub batches: Vec<Batch>,
    pub error: Option<LimError>,
}

#[derive(Debug, Default)]
pub struct ElimParser {
    pending: Vec<u8>,
    expected: Option<usize>,
    name: Option<String>,
    batch: Batch,
}

impl ElimParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume bytes read from the pipe and return every batch they complete
    ///
    /// A protocol error stops parsing, but batches finished earlier in the
    /// same read are still returned.
    pub fn feed(&mut self, data: &[u8]) -> Feed {
        self.pending.extend_from_slice(data);
        let mut out = Feed::default();

        if let Some(pos) = self.pending.iter().rposition(u8::is_ascii_whitespace) {
            let complete: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&complete);
            for token in text.split_ascii_whitespace() {
                match self.push_token(token) {
                    Ok(Some(batch)) => out.batches.push(batch),
                    Ok(None) => {}
                    Err(e) => {
                        out.error = Some(e);
                        return out;
                    }
                }
            }
        }

        if self.pending.len() > MAX_PENDING {
            out.error = Some(LimError::Protocol(format!(
                "{} bytes without a separator",
                self.pending.len()
            )));
        }
        out
    }

    /// Bytes or pairs are outstanding; hitting EOF now is a short read
    pub fn in_batch(&self) -> bool {
        self.expected.is_some() || !self.pending.iter().all(u8::is_ascii_whitespace)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn push_token(&mut self, token: &str) -> Result<Option<Batch>> {
        let Some(expected) = self.expected else {
            let count: i64 = token
                .parse()
                .map_err(|_| LimError::Protocol(format!("count not read, got {token:?}")))?;
            if count < 0 {
                return Err(LimError::Protocol(format!("negative count {count}")));
            }
            if count == 0 {
                return Ok(Some(Vec::new()));
            }
            self.expected = Some(count as usize);
            return Ok(None);
        };

        match self.name.take() {
            None => {
                self.name = Some(token.to_string());
                Ok(None)
            }
            Some(name) => {
                self.batch.push((name, token.to_string()));
                if self.batch.len() == expected {
                    self.expected = None;
                    Ok(Some(std::mem::take(&mut self.batch)))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(name: &str, value: &str) -> (String, String) {
        (name.to_string(), value.to_string())
    }

    fn batches(parser: &mut ElimParser, data: &[u8]) -> Vec<Batch> {
        let feed = parser.feed(data);
        assert!(feed.error.is_none(), "unexpected error {:?}", feed.error);
        feed.batches
    }

    #[test]
    fn test_single_batch() {
        let mut parser = ElimParser::new();
        let got = batches(&mut parser, b"2 licA 5 scratch 12.5\n");
        assert_eq!(got, vec![vec![pair("licA", "5"), pair("scratch", "12.5")]]);
        assert!(!parser.in_batch());
    }

    #[test]
    fn test_tokens_split_across_reads() {
        let mut parser = ElimParser::new();
        assert!(batches(&mut parser, b"2 li").is_empty());
        assert!(parser.in_batch());
        assert!(batches(&mut parser, b"cA 5 scr").is_empty());
        let got = batches(&mut parser, b"atch 7\n1 licA 6\n");
        assert_eq!(
            got,
            vec![
                vec![pair("licA", "5"), pair("scratch", "7")],
                vec![pair("licA", "6")]
            ]
        );
    }

    #[test]
    fn test_empty_batch() {
        let mut parser = ElimParser::new();
        assert_eq!(batches(&mut parser, b"0\n"), vec![Vec::new()]);
    }

    #[test]
    fn test_malformed_count() {
        let mut parser = ElimParser::new();
        let feed = parser.feed(b"two licA 5\n");
        assert!(matches!(feed.error, Some(LimError::Protocol(_))));
        assert!(feed.batches.is_empty());

        let mut parser = ElimParser::new();
        assert!(matches!(parser.feed(b"-1\n").error, Some(LimError::Protocol(_))));
    }

    #[test]
    fn test_batches_before_bad_count_survive() {
        let mut parser = ElimParser::new();
        let feed = parser.feed(b"1 licA 5\nx scratch 3\n");
        assert_eq!(feed.batches, vec![vec![pair("licA", "5")]]);
        assert!(matches!(feed.error, Some(LimError::Protocol(_))));
    }

    #[test]
    fn test_unterminated_output_is_bounded() {
        let mut parser = ElimParser::new();
        assert!(parser.feed(&[b'x'; MAX_PENDING]).error.is_none());
        let feed = parser.feed(b"x");
        assert!(matches!(feed.error, Some(LimError::Protocol(_))));
    }

    #[test]
    fn test_short_batch_is_pending() {
        let mut parser = ElimParser::new();
        assert!(batches(&mut parser, b"3 a 1 b 2\n").is_empty());
        assert!(parser.in_batch());
        parser.reset();
        assert!(!parser.in_batch());
    }
}
