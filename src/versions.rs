//! Named-version service: capture, list, diff, and restore document text.
//!
//! Operates on snapshot *text* supplied by clients — independent of the
//! CRDT update log, sharing only the store. Auto-saves are deduplicated
//! against the latest version's content hash (an O(1) check that removes
//! the common case of repeated identical auto-saves without scanning
//! history) and trimmed to a bounded retention window.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::store::{Store, StoreError, Version};

/// Auto-created versions retained per room.
pub const AUTO_VERSION_KEEP: u32 = 20;

/// Version service errors.
#[derive(Debug)]
pub enum VersionError {
    /// No version with this id.
    NotFound(i64),
    /// Underlying store failure.
    Store(StoreError),
}

impl fmt::Display for VersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionError::NotFound(id) => write!(f, "version not found: {id}"),
            VersionError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for VersionError {}

impl From<StoreError> for VersionError {
    fn from(e: StoreError) -> Self {
        VersionError::Store(e)
    }
}

/// Parameters for creating a version.
#[derive(Debug, Clone, Default)]
pub struct CreateVersionParams {
    pub room_id: String,
    pub name: String,
    pub description: String,
    pub content: String,
    pub created_by: String,
    pub is_auto: bool,
}

/// Result of a create call.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub version: Version,
    /// False when an auto-save deduplicated against the latest row.
    pub created: bool,
}

/// Result of a restore call.
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub new_version: Version,
    pub restored_from: i64,
    pub room_id: String,
    /// The restored text, for the caller to drive the document with.
    pub content: String,
}

/// One line of a computed diff.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffLine {
    #[serde(rename = "type")]
    pub kind: DiffKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_line: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    Added,
    Removed,
    Unchanged,
}

/// First 16 hex digits of SHA-256 over the content.
pub fn hash_content(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Named-version CRUD and diff over the shared store.
#[derive(Clone)]
pub struct VersionService {
    store: Arc<Store>,
}

impl VersionService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Create a version, deduplicating consecutive identical auto-saves.
    pub fn create(&self, mut params: CreateVersionParams) -> Result<CreateOutcome, VersionError> {
        if params.name.is_empty() {
            let ts = Utc::now().format("%b %-d, %-I:%M %p");
            params.name = if params.is_auto {
                format!("Auto-save {ts}")
            } else {
                format!("Version {ts}")
            };
        }

        let content_hash = hash_content(&params.content);

        if params.is_auto {
            if let Some(latest) = self.store.get_latest_version(&params.room_id)? {
                if latest.content_hash == content_hash {
                    return Ok(CreateOutcome {
                        version: latest,
                        created: false,
                    });
                }
            }
        }

        let version = self.store.create_version(
            &params.room_id,
            &params.name,
            &params.description,
            &params.content,
            &content_hash,
            &params.created_by,
            params.is_auto,
        )?;

        if params.is_auto {
            if let Err(e) = self
                .store
                .trim_auto_versions(&params.room_id, AUTO_VERSION_KEEP)
            {
                log::error!("Failed to trim auto versions for room {}: {e}", params.room_id);
            }
        }

        Ok(CreateOutcome {
            version,
            created: true,
        })
    }

    /// Versions for a room, newest first, without content.
    pub fn list(
        &self,
        room_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<Version>, u64), VersionError> {
        let versions = self.store.list_versions(room_id, limit, offset)?;
        let total = self.store.count_versions(room_id)?;
        Ok((versions, total))
    }

    /// Full version row including content.
    pub fn get(&self, id: i64) -> Result<Version, VersionError> {
        self.store
            .get_version(id)?
            .ok_or(VersionError::NotFound(id))
    }

    pub fn delete(&self, id: i64) -> Result<(), VersionError> {
        self.store.delete_version(id)?;
        Ok(())
    }

    /// Line diff between two stored versions.
    pub fn diff(&self, from_id: i64, to_id: i64) -> Result<(Version, Version, Vec<DiffLine>), VersionError> {
        let from = self.get(from_id)?;
        let to = self.get(to_id)?;
        let diff = compute_diff(&from.content, &to.content);
        Ok((from, to, diff))
    }

    /// Capture the target version's content as a new non-auto version.
    ///
    /// The collaborative document itself is not mutated; the returned
    /// content is for the caller to apply.
    pub fn restore(&self, id: i64) -> Result<RestoreOutcome, VersionError> {
        let target = self.get(id)?;

        let new_version = self.store.create_version(
            &target.room_id,
            &format!("Restored from: {}", target.name),
            &format!("Restored to version {} ({})", target.id, target.name),
            &target.content,
            &target.content_hash,
            "",
            false,
        )?;

        Ok(RestoreOutcome {
            new_version,
            restored_from: target.id,
            room_id: target.room_id,
            content: target.content,
        })
    }
}

/// LCS-based line diff.
///
/// Backtracking prefers the *added* (column advance) branch on ties, so
/// runs of insertions surface before the removals they displace.
pub fn compute_diff(old_content: &str, new_content: &str) -> Vec<DiffLine> {
    let old_lines: Vec<&str> = old_content.split('\n').collect();
    let new_lines: Vec<&str> = new_content.split('\n').collect();

    let dp = lcs_table(&old_lines, &new_lines);
    backtrack(&old_lines, &new_lines, &dp)
}

fn lcs_table(a: &[&str], b: &[&str]) -> Vec<Vec<u32>> {
    let (m, n) = (a.len(), b.len());
    let mut dp = vec![vec![0u32; n + 1]; m + 1];

    for i in 1..=m {
        for j in 1..=n {
            dp[i][j] = if a[i - 1] == b[j - 1] {
                dp[i - 1][j - 1] + 1
            } else {
                dp[i - 1][j].max(dp[i][j - 1])
            };
        }
    }

    dp
}

fn backtrack(old_lines: &[&str], new_lines: &[&str], dp: &[Vec<u32>]) -> Vec<DiffLine> {
    let mut entries = Vec::new();
    let (mut i, mut j) = (old_lines.len(), new_lines.len());

    while i > 0 || j > 0 {
        if i > 0 && j > 0 && old_lines[i - 1] == new_lines[j - 1] {
            entries.push(DiffLine {
                kind: DiffKind::Unchanged,
                content: old_lines[i - 1].to_string(),
                old_line: Some(i as u32),
                new_line: Some(j as u32),
            });
            i -= 1;
            j -= 1;
        } else if j > 0 && (i == 0 || dp[i][j - 1] >= dp[i - 1][j]) {
            entries.push(DiffLine {
                kind: DiffKind::Added,
                content: new_lines[j - 1].to_string(),
                old_line: None,
                new_line: Some(j as u32),
            });
            j -= 1;
        } else {
            entries.push(DiffLine {
                kind: DiffKind::Removed,
                content: old_lines[i - 1].to_string(),
                old_line: Some(i as u32),
                new_line: None,
            });
            i -= 1;
        }
    }

    entries.reverse();
    entries
}
