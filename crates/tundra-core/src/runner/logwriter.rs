//! Streaming log pipeline.
//!
//! A single multiplexer task serializes line writes across workers so lines
//! never interleave mid-line. Each line is optionally prefixed with its
//! unit's relative path, absolute paths are rewritten to repo-relative form
//! (longest prefix wins, word-boundary matched), and ANSI escapes are
//! stripped or reset at line boundaries so inherited styles cannot leak into
//! the next line.

use std::io::Write;
use std::path::Path;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug)]
pub struct LogLine {
    pub unit: String,
    pub stream: StreamKind,
    pub line: String,
}

/// Absolute-path to relative-path substitutions, longest prefix first.
#[derive(Debug, Clone, Default)]
pub struct PathRewriter {
    subs: Vec<(String, String)>,
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/')
}

impl PathRewriter {
    pub fn new(root: &Path) -> Self {
        let mut rewriter = Self::default();
        rewriter.add(root, "");
        rewriter
    }

    pub fn add(&mut self, prefix: &Path, replacement: &str) {
        self.subs
            .push((prefix.to_string_lossy().into_owned(), replacement.to_string()));
        self.subs.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    pub fn rewrite(&self, line: &str) -> String {
        let mut out = String::with_capacity(line.len());
        let mut rest = line;
        let mut prev: Option<char> = None;
        'outer: while !rest.is_empty() {
            for (prefix, replacement) in &self.subs {
                if rest.starts_with(prefix.as_str())
                    && prev.map(|c| !is_path_char(c)).unwrap_or(true)
                {
                    let after = rest[prefix.len()..].chars().next();
                    let at_boundary = match after {
                        None => true,
                        Some('/') => true,
                        Some(c) => !is_path_char(c),
                    };
                    if at_boundary {
                        out.push_str(replacement);
                        rest = &rest[prefix.len()..];
                        // Collapse the separator when the replacement is empty
                        // so `/root/unit/main.tf` becomes `unit/main.tf`.
                        if replacement.is_empty() {
                            rest = rest.strip_prefix('/').unwrap_or(rest);
                        }
                        prev = Some('/');
                        continue 'outer;
                    }
                }
            }
            let c = rest.chars().next().expect("nonempty rest");
            out.push(c);
            prev = Some(c);
            rest = &rest[c.len_utf8()..];
        }
        out
    }
}

/// Strip escapes entirely when color is off; otherwise append a reset when the
/// line carried any escape so styles stop at the line boundary.
pub fn sanitize_line(line: &str, color: bool) -> String {
    if !color {
        return strip_ansi_escapes::strip_str(line);
    }
    if line.contains('\u{1b}') {
        let mut out = line.to_string();
        out.push_str("\u{1b}[0m");
        return out;
    }
    line.to_string()
}

pub fn format_line(rewriter: &PathRewriter, prefix: bool, color: bool, entry: &LogLine) -> String {
    let body = sanitize_line(&rewriter.rewrite(&entry.line), color);
    if prefix && !entry.unit.is_empty() {
        format!("[{}] {}", entry.unit, body)
    } else {
        body
    }
}

#[derive(Debug, Clone)]
pub struct LogMultiplexer {
    tx: mpsc::UnboundedSender<LogLine>,
}

impl LogMultiplexer {
    /// Spawn the writer task. It drains until every sender is dropped.
    pub fn spawn(rewriter: PathRewriter, prefix: bool, color: bool) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogLine>();
        let handle = tokio::spawn(async move {
            let stdout = std::io::stdout();
            let stderr = std::io::stderr();
            while let Some(entry) = rx.recv().await {
                let line = format_line(&rewriter, prefix, color, &entry);
                match entry.stream {
                    StreamKind::Stdout => {
                        let mut out = stdout.lock();
                        let _ = writeln!(out, "{line}");
                    }
                    StreamKind::Stderr => {
                        let mut out = stderr.lock();
                        let _ = writeln!(out, "{line}");
                    }
                }
            }
        });
        (Self { tx }, handle)
    }

    pub fn emit(&self, unit: &str, stream: StreamKind, line: String) {
        let _ = self.tx.send(LogLine {
            unit: unit.to_string(),
            stream,
            line,
        });
    }
}
