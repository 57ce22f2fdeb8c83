//! Large-response spillover and the ephemeral temp-resource ring.
//!
//! Oversized tool output is written under the temp directory and replaced by
//! a pointer message. The file can then be read back in chunks through the
//! `fetch_large_response` tool or as a `file://` resource.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
};

use {
    bundler_catalog::slugify,
    bundler_mcp::types::{ToolContent, ToolsCallResult},
    chrono::{DateTime, Utc},
    serde::Serialize,
    tokio::{io::AsyncWriteExt, sync::Mutex},
    tracing::{debug, info},
};

#[cfg(feature = "metrics")]
use {bundler_common::definitions::router as router_metrics, metrics::counter};

use crate::error::{Result, RouterError};

/// Entries kept in the ring before the oldest is evicted.
pub const TEMP_RING_CAPACITY: usize = 32;
/// Largest file the fetch path will read.
pub const MAX_FETCH_BYTES: u64 = 50 * 1024 * 1024;
/// Default chunk size when a fetch omits `length` but passes an offset.
pub const DEFAULT_CHUNK_BYTES: usize = 64 * 1024;

const FIXED_TEMP_ROOTS: &[&str] = &["/tmp", "/private/tmp", "/var/folders"];
const MAX_NAME_ATTEMPTS: usize = 1000;

/// A spilled response registered as a readable resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TempResourceEntry {
    pub path: PathBuf,
    pub mime_type: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl TempResourceEntry {
    pub fn uri(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

/// Bounded FIFO of temp entries; oldest evicted first.
#[derive(Debug)]
pub struct TempResourceRing {
    capacity: usize,
    entries: VecDeque<TempResourceEntry>,
}

impl TempResourceRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns the evicted entry, if any.
    pub fn push(&mut self, entry: TempResourceEntry) -> Option<TempResourceEntry> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn get(&self, path: &Path) -> Option<&TempResourceEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TempResourceEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// JSON only when the trimmed body is wrapped in a matching `{}` or `[]` pair.
pub fn looks_like_json(body: &str) -> bool {
    let trimmed = body.trim();
    (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
}

/// `<timestamp>_<projectSlug>__<toolSlug>[-N].<ext>`
pub fn spill_file_name(
    at: DateTime<Utc>,
    project_slug: &str,
    tool: &str,
    attempt: usize,
    ext: &str,
) -> String {
    let stamp = at.format("%Y%m%dT%H%M%S%3fZ");
    let tool_slug = slugify(tool);
    if attempt == 0 {
        format!("{stamp}_{project_slug}__{tool_slug}.{ext}")
    } else {
        format!("{stamp}_{project_slug}__{tool_slug}-{attempt}.{ext}")
    }
}

/// One chunk of a spilled file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub path: String,
    pub offset: u64,
    pub length: u64,
    pub total_bytes: u64,
    pub eof: bool,
    pub text: String,
}

pub struct Spillover {
    dir: PathBuf,
    threshold: usize,
    allowed_roots: Vec<PathBuf>,
    ring: Mutex<TempResourceRing>,
}

impl Spillover {
    /// `dir` is where spill files are written; it is always allow-listed.
    pub fn new(dir: impl Into<PathBuf>, threshold: usize) -> Self {
        let dir = dir.into();
        let mut roots: Vec<PathBuf> = FIXED_TEMP_ROOTS.iter().map(PathBuf::from).collect();
        roots.push(std::env::temp_dir());
        roots.push(dir.clone());

        let mut allowed_roots = Vec::new();
        for root in roots {
            if let Ok(canonical) = std::fs::canonicalize(&root)
                && !allowed_roots.contains(&canonical)
            {
                allowed_roots.push(canonical);
            }
            if !allowed_roots.contains(&root) {
                allowed_roots.push(root);
            }
        }

        Self {
            dir,
            threshold,
            allowed_roots,
            ring: Mutex::new(TempResourceRing::new(TEMP_RING_CAPACITY)),
        }
    }

    /// Text byte count strictly above the threshold.
    pub fn exceeds_threshold(&self, result: &ToolsCallResult) -> bool {
        let bytes: usize = result
            .content
            .iter()
            .filter_map(ToolContent::as_text)
            .map(str::len)
            .sum();
        bytes > self.threshold
    }

    /// Write the text of `result` to a temp file and return the pointer result.
    ///
    /// Non-text content items are kept inline after the pointer.
    pub async fn spill(
        &self,
        project_slug: &str,
        tool: &str,
        result: &ToolsCallResult,
    ) -> Result<ToolsCallResult> {
        let body = result.joined_text();
        let json = looks_like_json(&body);
        let (ext, mime_type) = if json {
            ("json", "application/json")
        } else {
            ("txt", "text/plain")
        };

        tokio::fs::create_dir_all(&self.dir).await?;
        let now = Utc::now();
        let (path, mut file) = self.create_unique(now, project_slug, tool, ext).await?;
        file.write_all(body.as_bytes()).await?;
        file.flush().await?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let entry = TempResourceEntry {
            path: path.clone(),
            mime_type: mime_type.to_string(),
            name,
            created_at: now,
        };
        if let Some(evicted) = self.ring.lock().await.push(entry) {
            debug!(path = %evicted.path.display(), "temp resource evicted from ring");
        }

        #[cfg(feature = "metrics")]
        counter!(router_metrics::SPILL_FILES_TOTAL).increment(1);
        info!(
            tool = %tool,
            bytes = body.len(),
            path = %path.display(),
            "large tool response spilled to temp file"
        );

        let pointer = format!(
            "Response too large to return inline ({bytes} bytes, {kind}). Saved to {path}. \
             Read it with the fetch_large_response tool using {{\"path\": \"{path}\", \
             \"offset\": 0, \"length\": {chunk}}} and continue from the returned \
             offset + length to page through it.",
            bytes = body.len(),
            kind = mime_type,
            path = path.display(),
            chunk = DEFAULT_CHUNK_BYTES,
        );
        let mut content = vec![ToolContent::text(pointer)];
        content.extend(
            result
                .content
                .iter()
                .filter(|c| !matches!(c, ToolContent::Text { .. }))
                .cloned(),
        );
        Ok(ToolsCallResult {
            content,
            is_error: result.is_error,
            structured_content: None,
        })
    }

    async fn create_unique(
        &self,
        at: DateTime<Utc>,
        project_slug: &str,
        tool: &str,
        ext: &str,
    ) -> Result<(PathBuf, tokio::fs::File)> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let path = self
                .dir
                .join(spill_file_name(at, project_slug, tool, attempt, ext));
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(RouterError::message(format!(
            "could not pick a free spill file name for '{tool}'"
        )))
    }

    /// Resolve `path` and reject anything outside the allowed roots.
    pub async fn check_path(&self, path: &str) -> Result<PathBuf> {
        let not_allowed = || RouterError::PathNotAllowed {
            path: path.to_string(),
        };
        let candidate = Path::new(path);
        if !candidate.is_absolute() {
            return Err(not_allowed());
        }
        let canonical = tokio::fs::canonicalize(candidate).await?;
        if self
            .allowed_roots
            .iter()
            .any(|root| canonical.starts_with(root))
        {
            Ok(canonical)
        } else {
            Err(not_allowed())
        }
    }

    async fn read_checked(&self, path: &str) -> Result<(PathBuf, Vec<u8>)> {
        let canonical = self.check_path(path).await?;
        let size = tokio::fs::metadata(&canonical).await?.len();
        if size > MAX_FETCH_BYTES {
            return Err(RouterError::FileTooLarge {
                path: path.to_string(),
                size,
                limit: MAX_FETCH_BYTES,
            });
        }
        let bytes = tokio::fs::read(&canonical).await?;
        Ok((canonical, bytes))
    }

    /// Byte-range read. `length = None` with `offset = 0` returns the whole file.
    ///
    /// Chunk edges are moved onto UTF-8 character boundaries, so the returned
    /// `offset` and `length` may differ from the request. Paging continues at
    /// `offset + length`.
    pub async fn fetch(&self, path: &str, offset: u64, length: Option<u64>) -> Result<Chunk> {
        let (_, bytes) = self.read_checked(path).await?;
        let total = bytes.len();
        let length = match length {
            Some(length) => length,
            None if offset == 0 => total as u64,
            None => DEFAULT_CHUNK_BYTES as u64,
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(total);
        let end = usize::try_from(length)
            .map_or(total, |length| start.saturating_add(length))
            .min(total);
        let (start, end) = char_aligned(&bytes, start, end);
        Ok(Chunk {
            path: path.to_string(),
            offset: start as u64,
            length: (end - start) as u64,
            total_bytes: total as u64,
            eof: end >= total,
            text: String::from_utf8_lossy(&bytes[start..end]).into_owned(),
        })
    }

    /// Whole-file read for `resources/read` on a `file://` temp resource.
    pub async fn read_resource(&self, path: &str) -> Result<(String, String)> {
        let (canonical, bytes) = self.read_checked(path).await?;
        let mime_type = {
            let ring = self.ring.lock().await;
            ring.get(Path::new(path))
                .or_else(|| ring.get(&canonical))
                .map(|e| e.mime_type.clone())
        }
        .unwrap_or_else(|| {
            if looks_like_json(&String::from_utf8_lossy(&bytes)) {
                "application/json".to_string()
            } else {
                "text/plain".to_string()
            }
        });
        Ok((String::from_utf8_lossy(&bytes).into_owned(), mime_type))
    }

    /// Current ring contents, oldest first.
    pub async fn entries(&self) -> Vec<TempResourceEntry> {
        self.ring.lock().await.iter().cloned().collect()
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Pull `start` back and `end` back onto character boundaries. A range that
/// would end up empty is widened to the whole character at `start`.
fn char_aligned(bytes: &[u8], mut start: usize, mut end: usize) -> (usize, usize) {
    while start > 0 && start < bytes.len() && is_continuation(bytes[start]) {
        start -= 1;
    }
    while end > start && end < bytes.len() && is_continuation(bytes[end]) {
        end -= 1;
    }
    if end == start && start < bytes.len() && end < bytes.len() {
        end = start + 1;
        while end < bytes.len() && is_continuation(bytes[end]) {
            end += 1;
        }
    }
    (start, end)
}
