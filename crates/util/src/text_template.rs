//! Positional placeholder formatting for catalog messages.

use once_cell::sync::Lazy;
use regex::Regex;

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(\d+)\}").expect("valid placeholder regex"));

/// Replace `{0}`, `{1}`, ... with the corresponding parameter.
///
/// Placeholders without a matching parameter are left untouched so missing
/// inputs stay visible in the rendered message.
pub fn format_positional(template: &str, params: &[String]) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |captures: &regex::Captures| {
            captures[1]
                .parse::<usize>()
                .ok()
                .and_then(|index| params.get(index))
                .cloned()
                .unwrap_or_else(|| captures[0].to_string())
        })
        .into_owned()
}
