//! Append-only, human-readable record files shared between loops.
//!
//! Each record is one `|`-separated line. Writers take an exclusive advisory
//! lock for the duration of the append so concurrent writers (other loops, or
//! another devloop process) never interleave partial lines. Readers take a
//! shared lock. Nothing is ever rewritten in place.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;

use crate::board::ItemId;

#[derive(Debug, Clone)]
pub struct AppendLog {
    path: PathBuf,
}

impl AppendLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line (a trailing newline is added).
    pub fn append(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open record file {}", self.path.display()))?;

        FileExt::lock_exclusive(&file).context("Failed to lock record file")?;
        let written = file
            .write_all(format!("{}\n", line).as_bytes())
            .and_then(|_| file.flush());
        FileExt::unlock(&file).context("Failed to unlock record file")?;
        written.with_context(|| format!("Failed to append to {}", self.path.display()))
    }

    /// All lines, oldest first. A missing file reads as empty.
    pub fn lines(&self) -> Result<Vec<String>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open record file {}", self.path.display()));
            }
        };
        FileExt::lock_shared(&file).context("Failed to lock record file")?;
        let mut content = String::new();
        let read = file.read_to_string(&mut content);
        FileExt::unlock(&file).context("Failed to unlock record file")?;
        read.with_context(|| format!("Failed to read {}", self.path.display()))?;

        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// A parsed `<item>|...` record line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRecord {
    pub item: ItemId,
    /// Fields after the item id, timestamp included.
    pub fields: Vec<String>,
}

impl ItemRecord {
    /// Lines that do not start with a numeric item id are skipped.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split('|');
        let item = parts.next()?.trim().parse().ok()?;
        Some(Self {
            item,
            fields: parts.map(|p| p.trim().to_string()).collect(),
        })
    }

    /// Whether the record carries `tag` as its first field.
    pub fn is_tagged(&self, tag: &str) -> bool {
        self.fields.first().is_some_and(|f| f == tag)
    }
}

/// `<item>|<fields...>|<now>`
pub fn item_line(item: ItemId, fields: &[&str]) -> String {
    let mut parts = vec![item.to_string()];
    parts.extend(fields.iter().map(|f| f.to_string()));
    parts.push(Utc::now().to_rfc3339());
    parts.join("|")
}
