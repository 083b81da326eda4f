//! Long-name mapping for the FAT backend.
//!
//! Components that are valid 8.3 names are used as-is (upper-cased). Any
//! other component gets an allocated alias `STEM~HHH.EXT` recorded in the
//! directory's index file, one `ALIAS\tlong name` line per entry. `HHH`
//! starts from a hash of the long name and steps past aliases already taken.

use alloc::{string::String, vec::Vec};
use core::fmt::Write as _;

use figurine_core::storage::StorageError;

pub(super) const SHORT_NAME_BYTES: usize = 12;
/// Index file kept in every directory that holds an alias.
pub(super) const INDEX_NAME: &str = "LONGNAME.IDX";
pub(super) const ALIAS_SLOTS: u32 = 0x1000;

pub(super) type ShortText = heapless::String<SHORT_NAME_BYTES>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct IndexEntry {
    pub alias: ShortText,
    pub long: String,
}

/// Upper-cased 8.3 text when `component` needs no alias.
pub(super) fn plain_name(component: &str) -> Result<Option<ShortText>, StorageError> {
    check_component(component)?;
    let Some((stem, ext)) = split_short(component) else {
        return Ok(None);
    };
    let mut out = ShortText::new();
    push_upper(&mut out, stem)?;
    if !ext.is_empty() {
        out.push('.').map_err(|_| StorageError::PathTooLong)?;
        push_upper(&mut out, ext)?;
    }
    Ok(Some(out))
}

/// Alias candidate number `step` for a long `component`.
pub(super) fn alias(component: &str, step: u32) -> Result<ShortText, StorageError> {
    let (stem, ext) = match component.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (component, ""),
    };

    let mut out = ShortText::new();
    for ch in stem.chars().filter_map(sanitize).take(4) {
        out.push(ch).map_err(|_| StorageError::PathTooLong)?;
    }
    if out.is_empty() {
        out.push('_').map_err(|_| StorageError::PathTooLong)?;
    }
    let slot = fnv1a(component.as_bytes()).wrapping_add(step) % ALIAS_SLOTS;
    write!(out, "~{:03X}", slot).map_err(|_| StorageError::PathTooLong)?;

    let mut ext_chars = ext.chars().filter_map(sanitize).take(3).peekable();
    if ext_chars.peek().is_some() {
        out.push('.').map_err(|_| StorageError::PathTooLong)?;
        for ch in ext_chars {
            out.push(ch).map_err(|_| StorageError::PathTooLong)?;
        }
    }
    Ok(out)
}

/// Malformed lines are skipped.
pub(super) fn parse_index(bytes: &[u8]) -> Vec<IndexEntry> {
    let Ok(text) = core::str::from_utf8(bytes) else {
        return Vec::new();
    };
    text.lines()
        .filter_map(|line| {
            let (alias, long) = line.split_once('\t')?;
            let alias = ShortText::try_from(alias).ok()?;
            (!long.is_empty()).then(|| IndexEntry {
                alias,
                long: String::from(long),
            })
        })
        .collect()
}

pub(super) fn encode_index(entries: &[IndexEntry]) -> Vec<u8> {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&entry.alias);
        out.push('\t');
        out.push_str(&entry.long);
        out.push('\n');
    }
    out.into_bytes()
}

/// Lower-cased form reported by listings for entries without a long name.
pub(super) fn display_name(base: &[u8], ext: &[u8]) -> String {
    let mut out: String = base.iter().map(|b| b.to_ascii_lowercase() as char).collect();
    if !ext.is_empty() {
        out.push('.');
        out.extend(ext.iter().map(|b| b.to_ascii_lowercase() as char));
    }
    out
}

/// Split an absolute path into parent directory and leaf name.
pub(super) fn split_path(path: &str) -> Result<(&str, &str), StorageError> {
    if !path.starts_with('/') {
        return Err(StorageError::InvalidPath);
    }
    let (parent, leaf) = path.rsplit_once('/').ok_or(StorageError::InvalidPath)?;
    check_component(leaf)?;
    let parent = if parent.is_empty() { "/" } else { parent };
    Ok((parent, leaf))
}

fn check_component(component: &str) -> Result<(), StorageError> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.chars().any(char::is_control)
        || component.eq_ignore_ascii_case(INDEX_NAME)
    {
        return Err(StorageError::InvalidPath);
    }
    Ok(())
}

fn split_short(component: &str) -> Option<(&str, &str)> {
    let (stem, ext) = component.split_once('.').unwrap_or((component, ""));
    let valid = |part: &str| part.chars().all(|ch| sanitize(ch) == Some(ch.to_ascii_uppercase()));
    (!stem.is_empty()
        && stem.len() <= 8
        && ext.len() <= 3
        && !ext.contains('.')
        && valid(stem)
        && valid(ext))
    .then_some((stem, ext))
}

fn push_upper(out: &mut ShortText, part: &str) -> Result<(), StorageError> {
    out.push_str(part).map_err(|_| StorageError::PathTooLong)?;
    out.make_ascii_uppercase();
    Ok(())
}

fn sanitize(ch: char) -> Option<char> {
    match ch {
        'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' | '~' => Some(ch.to_ascii_uppercase()),
        '.' | ' ' => None,
        _ => Some('_'),
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = 0x811C9DC5u32;
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}
