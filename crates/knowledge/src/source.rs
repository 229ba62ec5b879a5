//! Document sources and local text extraction.

use crate::types::Document;
use docrag_core::{AppError, AppResult};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Anything that yields cleaned documents for ingestion.
///
/// A failing item does not end iteration; the ingestor records it and moves
/// on to the next document.
pub trait DocumentSource: Send + Sync {
    fn documents(&self) -> Box<dyn Iterator<Item = AppResult<Document>> + '_>;
}

impl DocumentSource for Vec<Document> {
    fn documents(&self) -> Box<dyn Iterator<Item = AppResult<Document>> + '_> {
        Box::new(self.iter().cloned().map(Ok))
    }
}

/// Content type classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Markdown,
    Html,
    PlainText,
    Unknown,
}

impl ContentType {
    /// Detect content type from file extension.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("md") | Some("markdown") => Self::Markdown,
            Some("html") | Some("htm") => Self::Html,
            Some("txt") | Some("text") => Self::PlainText,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::Html => "html",
            Self::PlainText => "text",
            Self::Unknown => "unknown",
        }
    }
}

/// Files under one or more roots, each becoming a document.
///
/// Document ids are paths relative to their root with `/` separators, so
/// ingesting the same tree again reprocesses rather than duplicates.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    roots: Vec<PathBuf>,
    owner: String,
    language: String,
    include: Vec<String>,
    exclude: Vec<String>,
}

impl DirectorySource {
    pub fn new(roots: Vec<PathBuf>, owner: impl Into<String>) -> Self {
        Self {
            roots,
            owner: owner.into(),
            language: "und".to_string(),
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Substring patterns; when non-empty a path must match one of them.
    pub fn with_include(mut self, include: Vec<String>) -> Self {
        self.include = include;
        self
    }

    /// Substring patterns that reject a path; checked before includes.
    pub fn with_exclude(mut self, exclude: Vec<String>) -> Self {
        self.exclude = exclude;
        self
    }

    fn should_include(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();

        if self.exclude.iter().any(|p| path_str.contains(p.as_str())) {
            return false;
        }

        self.include.is_empty() || self.include.iter().any(|p| path_str.contains(p.as_str()))
    }

    fn files(&self) -> impl Iterator<Item = AppResult<(PathBuf, String)>> + '_ {
        self.roots.iter().flat_map(move |root| {
            let base = if root.is_file() {
                root.parent().map(Path::to_path_buf).unwrap_or_default()
            } else {
                root.clone()
            };

            WalkDir::new(root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_map(move |entry| match entry {
                    Ok(entry) if entry.file_type().is_file() => {
                        let path = entry.into_path();
                        let id = document_id(&base, &path);
                        Some(Ok((path, id)))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(AppError::Io(e.into()))),
                })
        })
    }

    fn load(&self, path: &Path, id: String) -> AppResult<Document> {
        let text = parse_file(path)?;
        Ok(Document::new(id, self.owner.clone(), &self.language, text))
    }
}

impl DocumentSource for DirectorySource {
    fn documents(&self) -> Box<dyn Iterator<Item = AppResult<Document>> + '_> {
        Box::new(self.files().filter_map(move |item| match item {
            Ok((path, id)) if self.should_include(&path) => Some(self.load(&path, id)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        }))
    }
}

fn document_id(base: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Read a file and extract clean text.
pub fn parse_file(path: &Path) -> AppResult<String> {
    let bytes = fs::read(path)?;
    let raw = String::from_utf8(bytes)
        .map_err(|_| AppError::Validation(format!("{} is not UTF-8 text", path.display())))?;

    match ContentType::from_path(path) {
        ContentType::Markdown => Ok(clean_markdown(&raw)),
        ContentType::Html => Ok(clean_html(&raw)),
        ContentType::PlainText => Ok(raw),
        ContentType::Unknown if is_likely_text(&raw) => Ok(raw),
        ContentType::Unknown => {
            tracing::warn!("Skipping likely binary file: {:?}", path);
            Err(AppError::Validation(format!(
                "{} looks like a binary file",
                path.display()
            )))
        }
    }
}

/// Strip heading markers, rules and fences; paragraph breaks survive.
fn clean_markdown(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut blank = false;

    for line in text.lines() {
        let trimmed = line.trim_start_matches('#').trim();

        if trimmed.starts_with("---") || trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            continue;
        }

        if trimmed.is_empty() {
            blank = !result.is_empty();
            continue;
        }

        if blank {
            result.push('\n');
            blank = false;
        }
        result.push_str(trimmed);
        result.push('\n');
    }

    result.trim().to_string()
}

/// Strip tags plus script and style bodies, then collapse whitespace.
fn clean_html(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut in_tag = false;
    let mut skip_until: Option<&str> = None;

    for (i, ch) in text.char_indices() {
        let rest = &text[i..];

        if let Some(closing) = skip_until {
            if starts_with_ignore_case(rest, closing) {
                skip_until = None;
                in_tag = true;
            }
            continue;
        }

        match ch {
            '<' => {
                in_tag = true;
                if starts_with_ignore_case(rest, "<script") {
                    skip_until = Some("</script");
                } else if starts_with_ignore_case(rest, "<style") {
                    skip_until = Some("</style");
                }
                result.push(' ');
            }
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }

    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn starts_with_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack
        .get(..needle.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(needle))
}

fn is_likely_text(data: &str) -> bool {
    !data.contains('\0')
}
