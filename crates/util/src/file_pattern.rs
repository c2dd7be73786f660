//! Wildcard file-name matching for batch inputs.
//!
//! Patterns support `*` (any run of characters) and `?` (exactly one
//! character); everything else matches literally. Matching files are returned
//! in lexical order so runs over a folder are deterministic.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;

/// Whether `pattern` contains wildcard characters.
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

/// Compile a wildcard pattern into an anchored regular expression.
pub fn wildcard_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expression = String::with_capacity(pattern.len() + 8);
    expression.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expression.push_str(".*"),
            '?' => expression.push('.'),
            other => expression.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    expression.push('$');
    Regex::new(&expression)
}

/// Files directly inside `folder` whose names match `pattern`, sorted by name.
///
/// A pattern without wildcards yields the single named file, whether or not it
/// exists; opening it reports the failure with the right path.
pub fn matching_files(folder: &Path, pattern: &str) -> io::Result<Vec<PathBuf>> {
    if !is_wildcard(pattern) {
        return Ok(vec![folder.join(pattern)]);
    }
    let matcher = wildcard_regex(pattern).map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;
    let mut files = Vec::new();
    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str()
            && matcher.is_match(name)
        {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
