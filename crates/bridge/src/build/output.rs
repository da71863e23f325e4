//! Build server output classification.
//!
//! The live build server reports everything on its output streams: the
//! address it bound to, finished rebuilds and failed ones. Lines are cleaned
//! of ANSI escapes and the server's own tag before they are matched.

use url::Url;

use crate::config::BuildConfig;

/// Tag the build server prefixes its own messages with.
const SERVER_TAG: &str = "[sphinx-autobuild]";

/// Phrases that introduce the bound address.
const ANNOUNCEMENTS: &[&str] = &["serving on", "running on"];

/// What a single output line means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    /// The server is listening on this port.
    Serving(u16),
    /// A rebuild completed.
    Rebuilt,
    /// A rebuild failed; carries the cleaned line.
    Failed(String),
    /// Anything else.
    Other,
}

/// Matches output lines against the configured markers.
#[derive(Debug, Clone)]
pub struct OutputClassifier {
    success_markers: Vec<String>,
    error_markers: Vec<String>,
}

impl OutputClassifier {
    /// Creates a classifier from explicit marker lists.
    pub fn new(success_markers: Vec<String>, error_markers: Vec<String>) -> Self {
        Self {
            success_markers: success_markers.into_iter().filter(|m| !m.is_empty()).collect(),
            error_markers: error_markers.into_iter().filter(|m| !m.is_empty()).collect(),
        }
    }

    /// Creates a classifier from the build configuration.
    pub fn from_config(config: &BuildConfig) -> Self {
        Self::new(
            config.success_markers.clone(),
            config.error_markers.clone(),
        )
    }

    /// Classifies one raw output line.
    pub fn classify(&self, raw: &str) -> OutputLine {
        self.classify_clean(&clean_line(raw))
    }

    /// Classifies a line already passed through [`clean_line`].
    pub fn classify_clean(&self, line: &str) -> OutputLine {
        if line.is_empty() {
            return OutputLine::Other;
        }

        if let Some(port) = announced_port(line) {
            return OutputLine::Serving(port);
        }
        if self.error_markers.iter().any(|m| line.contains(m.as_str())) {
            return OutputLine::Failed(line.to_string());
        }
        if self.success_markers.iter().any(|m| line.contains(m.as_str())) {
            return OutputLine::Rebuilt;
        }
        OutputLine::Other
    }
}

/// Strips ANSI escapes, surrounding whitespace and the server tag.
pub fn clean_line(raw: &str) -> String {
    let stripped = strip_ansi(raw);
    let trimmed = stripped.trim();
    trimmed
        .strip_prefix(SERVER_TAG)
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

/// Removes ANSI escape sequences.
pub fn strip_ansi(raw: &str) -> String {
    strip_ansi_escapes::strip_str(raw)
}

/// Extracts the port from an address announcement line.
///
/// Returns `None` for other lines, for unparsable URLs and for port 0. A URL
/// without an explicit port yields `None` too.
pub fn announced_port(line: &str) -> Option<u16> {
    let lower = line.to_ascii_lowercase();
    if !ANNOUNCEMENTS.iter().any(|a| lower.contains(a)) {
        return None;
    }

    let start = lower.find("http://").or_else(|| lower.find("https://"))?;
    let token = line[start..]
        .split_whitespace()
        .next()?
        .trim_end_matches(|c: char| matches!(c, ',' | '.' | ')' | ';'));
    let port = Url::parse(token).ok()?.port()?;

    (port != 0).then_some(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> OutputClassifier {
        OutputClassifier::from_config(&BuildConfig::default())
    }

    #[test]
    fn test_serving_line() {
        assert_eq!(
            classifier().classify("[sphinx-autobuild] Serving on http://127.0.0.1:8000"),
            OutputLine::Serving(8000)
        );
    }

    #[test]
    fn test_uvicorn_line() {
        assert_eq!(
            classifier().classify("INFO:     Uvicorn running on http://127.0.0.1:41234 (Press CTRL+C to quit)"),
            OutputLine::Serving(41234)
        );
    }

    #[test]
    fn test_serving_with_trailing_slash_and_colors() {
        assert_eq!(
            classifier().classify("\u{1b}[32mServing on https://localhost:9001/\u{1b}[0m"),
            OutputLine::Serving(9001)
        );
    }

    #[test]
    fn test_port_zero_ignored() {
        assert_eq!(announced_port("Serving on http://127.0.0.1:0"), None);
        assert_eq!(
            classifier().classify("Serving on http://127.0.0.1:0"),
            OutputLine::Other
        );
    }

    #[test]
    fn test_unparsable_announcement_ignored() {
        assert_eq!(announced_port("Serving on http://127.0.0.1"), None);
        assert_eq!(announced_port("Serving on http://127.0.0.1:abc"), None);
        assert_eq!(announced_port("Serving on a unix socket"), None);
        assert_eq!(announced_port("http://127.0.0.1:8000"), None);
    }

    #[test]
    fn test_rebuilt_line() {
        assert_eq!(
            classifier().classify("build succeeded, 2 warnings."),
            OutputLine::Rebuilt
        );
        assert_eq!(
            classifier().classify("build finished with problems, 3 warnings."),
            OutputLine::Rebuilt
        );
    }

    #[test]
    fn test_error_line() {
        assert_eq!(
            classifier().classify("\u{1b}[91m/docs/index.rst:3: ERROR: Unknown directive type \"foo\".\u{1b}[39;49;00m"),
            OutputLine::Failed("/docs/index.rst:3: ERROR: Unknown directive type \"foo\".".to_string())
        );
        assert_eq!(
            classifier().classify("[sphinx-autobuild] Sphinx exited with exit code: 2"),
            OutputLine::Failed("Sphinx exited with exit code: 2".to_string())
        );
    }

    #[test]
    fn test_warning_is_other() {
        assert_eq!(
            classifier().classify("/docs/index.rst:10: WARNING: duplicate label"),
            OutputLine::Other
        );
        assert_eq!(classifier().classify(""), OutputLine::Other);
        assert_eq!(classifier().classify("   "), OutputLine::Other);
    }

    #[test]
    fn test_custom_markers() {
        let classifier = OutputClassifier::new(
            vec!["done".to_string(), String::new()],
            vec!["FAILED".to_string()],
        );
        assert_eq!(classifier.classify("all done"), OutputLine::Rebuilt);
        assert_eq!(
            classifier.classify("step FAILED"),
            OutputLine::Failed("step FAILED".to_string())
        );
        assert_eq!(classifier.classify("ERROR"), OutputLine::Other);
    }

    #[test]
    fn test_strip_ansi_sequences() {
        assert_eq!(strip_ansi("\u{1b}[1;31mred\u{1b}[0m"), "red");
        assert_eq!(strip_ansi("\u{1b}]0;title\u{07}text"), "text");
        assert_eq!(strip_ansi("\u{1b}]0;title\u{1b}\\text"), "text");
        assert_eq!(strip_ansi("\u{1b}(Bplain"), "plain");
        assert_eq!(strip_ansi("no escapes"), "no escapes");
    }

    #[test]
    fn test_charset_designation_stripped() {
        assert_eq!(strip_ansi("\u{1b}(Bplain"), "plain");
        assert_eq!(
            classifier().classify("\u{1b}[1m[sphinx-autobuild]\u{1b}(B\u{1b}[m Serving on http://127.0.0.1:8123"),
            OutputLine::Serving(8123)
        );
        assert_eq!(
            classifier().classify("\u{1b}(Bbuild succeeded."),
            OutputLine::Rebuilt
        );
    }

    #[test]
    fn test_announcement_with_trailing_punctuation() {
        assert_eq!(announced_port("Serving on http://127.0.0.1:8000."), Some(8000));
        assert_eq!(announced_port("(running on http://[::1]:5500)"), Some(5500));
    }

    #[test]
    fn test_clean_line_strips_tag() {
        assert_eq!(
            clean_line("  [sphinx-autobuild] Detected change  \r"),
            "Detected change"
        );
    }
}
