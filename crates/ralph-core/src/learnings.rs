//! Learnings file: a markdown notebook the orchestrator grows over time.
//!
//! Providers may embed `<learning>...</learning>` blocks in their output
//! with free-form `Pattern:` / `Context:` / `Insight:` lines. These are
//! parsed and filed under the matching section with a date stamp.
//! Entries are only ever added, never rewritten.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context as _, Result};
use chrono::Utc;
use regex::Regex;

/// The four fixed sections, in file order.
pub const SECTIONS: &[&str] = &[
    "Patterns Discovered",
    "Validation Failures",
    "Gotchas",
    "Session Summaries",
];

static LEARNING_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<learning>(.*?)</learning>").expect("static regex"));

/// A parsed `<learning>` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LearningEntry {
    pub pattern: Option<String>,
    pub context: Option<String>,
    pub insight: Option<String>,
}

impl LearningEntry {
    pub fn is_empty(&self) -> bool {
        self.pattern.is_none() && self.context.is_none() && self.insight.is_none()
    }
}

/// Extract every `<learning>` block from provider output.
pub fn parse_learning_blocks(output: &str) -> Vec<LearningEntry> {
    LEARNING_BLOCK_RE
        .captures_iter(output)
        .map(|caps| parse_block(&caps[1]))
        .filter(|entry| !entry.is_empty())
        .collect()
}

fn parse_block(body: &str) -> LearningEntry {
    let mut entry = LearningEntry::default();
    for line in body.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Pattern:") {
            entry.pattern = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Context:") {
            entry.context = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Insight:") {
            entry.insight = Some(rest.trim().to_string());
        }
    }
    entry
}

/// The on-disk learnings notebook.
#[derive(Debug, Clone)]
pub struct LearningsFile {
    path: PathBuf,
}

impl LearningsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file with its four section headers if missing.
    pub fn ensure_initialized(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut contents = String::from("# Learnings\n");
        for section in SECTIONS {
            contents.push_str(&format!("\n## {section}\n"));
        }
        std::fs::write(&self.path, contents)
            .with_context(|| format!("writing {}", self.path.display()))
    }

    /// File a parsed learning under `Patterns Discovered`.
    pub fn append_learning(&self, entry: &LearningEntry, task_id: Option<&str>) -> Result<()> {
        let mut line = format!("- [{}]", Utc::now().format("%Y-%m-%d"));
        if let Some(task_id) = task_id {
            line.push_str(&format!(" ({task_id})"));
        }
        if let Some(ref pattern) = entry.pattern {
            line.push_str(&format!(" Pattern: {pattern}."));
        }
        if let Some(ref context) = entry.context {
            line.push_str(&format!(" Context: {context}."));
        }
        if let Some(ref insight) = entry.insight {
            line.push_str(&format!(" Insight: {insight}."));
        }
        self.append_to_section("Patterns Discovered", &line)
    }

    /// File a failed-gate record under `Validation Failures`.
    pub fn record_validation_failure(
        &self,
        task_id: &str,
        failed_gates: &[String],
    ) -> Result<()> {
        let line = format!(
            "- [{}] ({task_id}) failed gates: {}",
            Utc::now().format("%Y-%m-%d"),
            failed_gates.join(", ")
        );
        self.append_to_section("Validation Failures", &line)
    }

    /// File a one-line run recap under `Session Summaries`.
    pub fn append_session_summary(&self, session_id: &str, summary: &str) -> Result<()> {
        let line = format!(
            "- [{}] session {session_id}: {summary}",
            Utc::now().format("%Y-%m-%d")
        );
        self.append_to_section("Session Summaries", &line)
    }

    /// Insert a line at the end of a section, creating the file (and the
    /// section, for files that predate it) as needed.
    fn append_to_section(&self, section: &str, line: &str) -> Result<()> {
        self.ensure_initialized()?;
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;

        let header = format!("## {section}");
        let mut lines: Vec<String> = contents.lines().map(String::from).collect();

        let Some(header_index) = lines.iter().position(|l| l.trim() == header) else {
            // Unknown section: append it at the end.
            lines.push(String::new());
            lines.push(header);
            lines.push(line.to_string());
            return self.write_lines(&lines);
        };

        // The section ends at the next header or end of file.
        let mut insert_at = lines.len();
        for (i, candidate) in lines.iter().enumerate().skip(header_index + 1) {
            if candidate.starts_with("## ") {
                insert_at = i;
                break;
            }
        }
        // Back up over trailing blank lines so entries stay contiguous.
        while insert_at > header_index + 1 && lines[insert_at - 1].trim().is_empty() {
            insert_at -= 1;
        }
        lines.insert(insert_at, line.to_string());
        self.write_lines(&lines)
    }

    fn write_lines(&self, lines: &[String]) -> Result<()> {
        let mut contents = lines.join("\n");
        contents.push('\n');
        std::fs::write(&self.path, contents)
            .with_context(|| format!("writing {}", self.path.display()))
    }
}
