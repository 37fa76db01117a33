//! Glob Lister - Enumerates bucket objects matching a pattern under ceilings

use ::glob::{MatchOptions, Pattern};
use tracing::{debug, info};

use super::bucket::{Bucket, StorageError};
use super::{GlobOptions, RemoteObject};
use crate::error::{IngestError, Result};

const GLOB_META: &[char] = &['*', '?', '[', '{'];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Outcome of listing a pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobListing {
    pub objects: Vec<RemoteObject>,
    /// The pattern was a plain key and listing was skipped
    pub single_object: bool,
}

impl GlobListing {
    pub fn total_size(&self) -> u64 {
        self.objects.iter().map(|o| o.size).sum()
    }
}

pub fn is_glob_pattern(pattern: &str) -> bool {
    pattern.contains(GLOB_META)
}

/// Literal directory prefix of a pattern: the text before the first
/// metacharacter, cut back to the last `/`.
pub fn literal_prefix(pattern: &str) -> &str {
    let literal = match pattern.find(GLOB_META) {
        Some(idx) => &pattern[..idx],
        None => pattern,
    };
    match literal.rfind('/') {
        Some(idx) => &literal[..=idx],
        None => "",
    }
}

/// Expand `{a,b}` alternatives into separate patterns. An unclosed brace
/// is left as a literal.
pub fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };

    let mut depth = 0usize;
    let mut bounds = vec![open];
    let mut close = None;
    for (offset, c) in pattern[open..].char_indices() {
        let idx = open + offset;
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(idx);
                    break;
                }
            }
            ',' if depth == 1 => bounds.push(idx),
            _ => {}
        }
    }
    let Some(close) = close else {
        return vec![pattern.to_string()];
    };
    bounds.push(close);

    let head = &pattern[..open];
    let tail = &pattern[close + 1..];
    bounds
        .windows(2)
        .flat_map(|w| expand_braces(&format!("{head}{}{tail}", &pattern[w[0] + 1..w[1]])))
        .collect()
}

fn storage_err(key: &str, err: StorageError) -> IngestError {
    match err {
        StorageError::NotFound(_) => IngestError::NoObjectsFound {
            pattern: key.to_string(),
        },
        other => IngestError::Storage(other),
    }
}

/// List the objects matching `opts.pattern`, enforcing the configured
/// ceilings page by page.
///
/// A pattern without metacharacters is treated as a single key and resolved
/// with one attributes call.
pub async fn list_matching(bucket: &dyn Bucket, opts: &GlobOptions) -> Result<GlobListing> {
    let pattern = opts.pattern.trim_start_matches('/');

    if !is_glob_pattern(pattern) {
        let object = bucket
            .attributes(pattern)
            .await
            .map_err(|e| storage_err(pattern, e))?;
        if object.size > opts.max_total_size {
            return Err(IngestError::GlobLimitExceeded(format!(
                "size of {:?} ({} bytes) exceeds limit of {} bytes",
                object.key, object.size, opts.max_total_size
            )));
        }
        debug!(key = %object.key, size = object.size, "single object source");
        return Ok(GlobListing {
            objects: vec![object],
            single_object: true,
        });
    }

    let matchers = expand_braces(pattern)
        .iter()
        .map(|alternative| Pattern::new(alternative))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| IngestError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
    let prefix = literal_prefix(pattern);

    let mut objects = Vec::new();
    let mut total_size: u64 = 0;
    let mut listed: usize = 0;
    let mut token: Option<String> = None;

    loop {
        let page = bucket
            .list_page(prefix, token.take(), opts.page_size)
            .await
            .map_err(IngestError::Storage)?;

        listed += page.objects.len();
        if listed > opts.max_objects_listed {
            return Err(IngestError::GlobLimitExceeded(format!(
                "listed more than {} objects while matching {:?}",
                opts.max_objects_listed, pattern
            )));
        }

        for object in page.objects {
            if object.key.ends_with('/')
                || !matchers.iter().any(|m| m.matches_with(&object.key, MATCH_OPTIONS))
            {
                continue;
            }

            total_size += object.size;
            if total_size > opts.max_total_size {
                return Err(IngestError::GlobLimitExceeded(format!(
                    "matched objects exceed total size limit of {} bytes",
                    opts.max_total_size
                )));
            }

            objects.push(object);
            if objects.len() > opts.max_objects_matched {
                return Err(IngestError::GlobLimitExceeded(format!(
                    "matched more than {} objects",
                    opts.max_objects_matched
                )));
            }
        }

        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    if objects.is_empty() {
        return Err(IngestError::NoObjectsFound {
            pattern: pattern.to_string(),
        });
    }

    info!(
        pattern,
        matched = objects.len(),
        listed,
        total_size,
        "glob listing complete"
    );

    Ok(GlobListing {
        objects,
        single_object: false,
    })
}
