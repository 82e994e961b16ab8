//! Title normalization and filesystem-safe naming.
//!
//! The relive listing, the release feed and the local file names each mangle
//! the same talk title differently. [`normalize_title`] maps all three onto one
//! comparable key; [`sanitize_filename`] produces the on-disk name for a title.

use crate::config::CollectionConfig;
use crate::models::MediaFormat;
use regex::Regex;
use std::sync::LazyLock;

/// Characters that are illegal in file names on at least one supported platform.
const FILENAME_RESERVED_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

const TRUNCATION_MARKER: &str = "...";

const UNTITLED: &str = "untitled";

/// Congress tags such as "(39c3)" or "(38C3)".
static CONGRESS_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\(\s*\d{2}c\d\s*\)").unwrap());

/// Anything that is neither a letter nor a digit, in any script.
static NON_ALNUM_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}]+").unwrap());

/// Canonicalize a raw title or file name into a comparable key.
///
/// # Rules Applied
/// 1. Strip the in-progress suffix and a known media extension
/// 2. Remove congress tags like "(39c3)"
/// 3. Collapse every run of whitespace, punctuation and filesystem-illegal
///    characters into a single space
/// 4. Lower-case and trim
///
/// # Examples
///
/// ```
/// use c3dl_core::title::normalize_title;
///
/// assert_eq!(normalize_title("Intro To Things"), "intro to things");
/// assert_eq!(normalize_title("Intro_ To  Things (39c3).mp4.part"), "intro to things");
/// ```
pub fn normalize_title(raw: &str) -> String {
    let name = strip_known_suffixes(raw);
    let name = CONGRESS_TAG.replace_all(name, " ");
    let name = NON_ALNUM_RUN.replace_all(&name, " ");
    name.trim().to_lowercase()
}

/// Build a safe file name from a title and an extension (with leading dot).
///
/// Reserved characters and a leading `.` become `_`, so no title turns into
/// a hidden file. Names longer than the byte budget are cut on a UTF-8
/// boundary and marked with `...` before the extension.
///
/// # Examples
///
/// ```
/// use c3dl_core::title::sanitize_filename;
///
/// assert_eq!(sanitize_filename("What? A/B test", ".mp4"), "What_ A_B test.mp4");
/// ```
pub fn sanitize_filename(title: &str, extension: &str) -> String {
    let mut name: String = title
        .trim()
        .chars()
        .enumerate()
        .map(|(i, c)| {
            if FILENAME_RESERVED_CHARS.contains(&c) || c.is_control() || (i == 0 && c == '.') {
                '_'
            } else {
                c
            }
        })
        .collect();

    if name.is_empty() {
        name = UNTITLED.to_string();
    }

    let budget = CollectionConfig::MAX_FILENAME_BYTES.saturating_sub(extension.len());
    if name.len() > budget {
        let mut cut = budget.saturating_sub(TRUNCATION_MARKER.len());
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
        name.push_str(TRUNCATION_MARKER);
    }

    name.push_str(extension);
    name
}

fn strip_known_suffixes(raw: &str) -> &str {
    let name = raw.strip_suffix(CollectionConfig::PART_SUFFIX).unwrap_or(raw);
    match MediaFormat::from_file_name(name) {
        Some(format) => &name[..name.len() - format.extension().len()],
        None => name,
    }
}
