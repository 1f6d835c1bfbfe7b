//! Extraction of a task's logical result from raw container output.
//!
//! Commands mark their result by printing it between two delimiter lines:
//!
//! ```text
//! ===result-data===
//! 42
//! ===result-data===
//! ```
//!
//! Several marked blocks may appear in one run; they are joined with a blank
//! line. Output without any marked block falls back to its last non-empty
//! line.

use std::sync::OnceLock;

use regex::Regex;

/// Default marker bounding a result block.
pub const RESULT_DELIMITER: &str = "===result-data===";

static DEFAULT_EXTRACTOR: OnceLock<ResultExtractor> = OnceLock::new();

/// Pulls the result out of combined stdout/stderr text.
#[derive(Debug, Clone)]
pub struct ResultExtractor {
    pattern: Regex,
}

impl ResultExtractor {
    /// Builds an extractor for the given delimiter token.
    pub fn new(delimiter: &str) -> Self {
        let escaped = regex::escape(delimiter);
        let pattern = Regex::new(&format!(r"{escaped}\s*([\s\S]*?)\s*{escaped}"))
            .unwrap_or_else(|_| unreachable!("escaped delimiter always forms a valid pattern"));
        Self { pattern }
    }

    /// Returns the logical result contained in `logs`.
    pub fn extract(&self, logs: &str) -> String {
        let blocks: Vec<&str> = self
            .pattern
            .captures_iter(logs)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().trim())
            .collect();

        if !blocks.is_empty() {
            return blocks
                .into_iter()
                .filter(|block| !block.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n");
        }

        logs.lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default()
            .to_string()
    }
}

impl Default for ResultExtractor {
    fn default() -> Self {
        Self::new(RESULT_DELIMITER)
    }
}

/// Extracts using [`RESULT_DELIMITER`].
pub fn extract_result(logs: &str) -> String {
    DEFAULT_EXTRACTOR
        .get_or_init(ResultExtractor::default)
        .extract(logs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_block() {
        let logs = "Hello\n===result-data===\n42\n===result-data===\n";
        assert_eq!(extract_result(logs), "42");
    }

    #[test]
    fn test_multiple_blocks_in_order() {
        let logs = "start\n===result-data===\n  first \n===result-data===\nnoise\n\
                    ===result-data===\nsecond\nline\n===result-data===\ndone\n";
        assert_eq!(extract_result(logs), "first\n\nsecond\nline");
    }

    #[test]
    fn test_inline_block() {
        let logs = "x ===result-data=== {\"a\": 1} ===result-data=== y";
        assert_eq!(extract_result(logs), "{\"a\": 1}");
    }

    #[test]
    fn test_empty_blocks_are_dropped() {
        let logs = "===result-data===\n===result-data===\n===result-data===\nok\n===result-data===";
        assert_eq!(extract_result(logs), "ok");
    }

    #[test]
    fn test_falls_back_to_last_non_empty_line() {
        let logs = "line one\nline two\n\n   \n";
        assert_eq!(extract_result(logs), "line two");
    }

    #[test]
    fn test_unterminated_block_falls_back() {
        let logs = "===result-data===\npartial";
        assert_eq!(extract_result(logs), "partial");
    }

    #[test]
    fn test_empty_log() {
        assert_eq!(extract_result(""), "");
        assert_eq!(extract_result(" \n\t\n"), "");
    }

    #[test]
    fn test_custom_delimiter_is_escaped() {
        let extractor = ResultExtractor::new("[[out]]");
        assert_eq!(extractor.extract("a [[out]] 7 [[out]] b"), "7");
        assert_eq!(extractor.extract("[out] 7 [out]"), "[out] 7 [out]");
    }
}
