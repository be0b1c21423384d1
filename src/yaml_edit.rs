//! Surgical edits of block-style YAML documents.
//!
//! Only the byte range of the node being replaced changes; comments, key
//! order, quoting, and spacing elsewhere in the document stay exactly as the
//! author left them. Edits address a child key under a top-level mapping,
//! which is all the declarative table file needs.

use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_yaml::{Mapping, Value};

use crate::error::Error;
use crate::yaml_provider;

const DEFAULT_CHILD_INDENT: usize = 2;

#[derive(Debug, Clone)]
pub struct YamlDocument {
    origin: PathBuf,
    text: String,
}

#[derive(Debug, Clone, Copy)]
struct Line<'a> {
    start: usize,
    end: usize,
    indent: usize,
    /// Text after indentation, without the line terminator. Empty for blank
    /// and comment-only lines.
    content: &'a str,
}

impl Line<'_> {
    fn is_content(&self) -> bool {
        !self.content.is_empty()
    }

    fn is_sequence_item(&self) -> bool {
        self.content == "-" || self.content.starts_with("- ")
    }
}

#[derive(Debug)]
struct Block {
    /// Byte range of the key line through the last content line of its value.
    span: Range<usize>,
    /// Offset just past the last content line belonging to the block.
    body_end: usize,
    child_indent: Option<usize>,
    indent: usize,
}

impl YamlDocument {
    pub fn parse(text: impl Into<String>, origin: &Path) -> Result<Self> {
        let text = text.into();
        yaml_provider::parse_document(&text)
            .with_context(|| format!("Parsing YAML document {origin:?}"))?;
        Ok(Self {
            origin: origin.to_path_buf(),
            text,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::parse(yaml_provider::read_to_string(path)?, path)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    pub fn value(&self) -> Result<Value> {
        yaml_provider::parse_document(&self.text)
            .with_context(|| format!("Parsing YAML document {:?}", self.origin))
    }

    /// Replaces (or inserts) `parent.key` with `value`.
    pub fn set(&mut self, parent: &str, key: &str, value: &Value) -> Result<()> {
        let lines = scan_lines(&self.text);
        let newline = if self.text.contains("\r\n") { "\r\n" } else { "\n" };
        let Some(parent_block) = find_block(&lines, 0..lines.len(), 0, parent) else {
            let mut addition = String::new();
            if !self.text.is_empty() && !self.text.ends_with('\n') {
                addition.push_str(newline);
            }
            addition.push_str(&format!("{parent}:{newline}"));
            addition.push_str(&render_entry(key, value, DEFAULT_CHILD_INDENT, newline)?);
            self.text.push_str(&addition);
            return self.reparse();
        };
        self.ensure_block_mapping(&lines, &parent_block, parent)?;

        let body = body_lines(&lines, &parent_block);
        let child_indent = parent_block
            .child_indent
            .unwrap_or(parent_block.indent + DEFAULT_CHILD_INDENT);
        let rendered = render_entry(key, value, child_indent, newline)?;

        match find_block(&lines, body, child_indent, key) {
            Some(child) => {
                let mut replacement = rendered;
                if child.span.end == self.text.len() && !self.text.ends_with('\n') {
                    replacement.truncate(replacement.len() - newline.len());
                }
                self.text.replace_range(child.span, &replacement);
            }
            None => {
                let at = parent_block.body_end;
                let mut insertion = String::new();
                if at == self.text.len() && !self.text.ends_with('\n') {
                    insertion.push_str(newline);
                }
                insertion.push_str(&rendered);
                self.text.insert_str(at, &insertion);
            }
        }
        self.reparse()
    }

    /// Removes `parent.key`; returns whether it was present.
    pub fn remove(&mut self, parent: &str, key: &str) -> Result<bool> {
        let lines = scan_lines(&self.text);
        let Some(parent_block) = find_block(&lines, 0..lines.len(), 0, parent) else {
            return Ok(false);
        };
        self.ensure_block_mapping(&lines, &parent_block, parent)?;
        let Some(child_indent) = parent_block.child_indent else {
            return Ok(false);
        };
        let body = body_lines(&lines, &parent_block);
        let Some(child) = find_block(&lines, body, child_indent, key) else {
            return Ok(false);
        };
        self.text.replace_range(child.span, "");
        self.reparse()?;
        Ok(true)
    }

    fn ensure_block_mapping(&self, lines: &[Line<'_>], block: &Block, parent: &str) -> Result<()> {
        let head = lines
            .iter()
            .find(|line| line.start == block.span.start)
            .map(|line| line.content)
            .unwrap_or_default();
        let inline = split_key(head)
            .map(|(_, rest)| strip_comment(rest).trim())
            .unwrap_or_default();
        if !inline.is_empty() {
            return Err(Error::UnsupportedYamlLayout {
                path: self.origin.clone(),
                reason: format!("'{parent}' must be a block mapping, found inline value '{inline}'"),
            }
            .into());
        }
        if let Some(line) = lines
            .iter()
            .filter(|line| line.start >= block.span.start && line.start < block.body_end)
            .skip(1)
            .find(|line| line.is_content() && line.indent == block.child_indent.unwrap_or(0))
            && line.is_sequence_item()
        {
            return Err(Error::UnsupportedYamlLayout {
                path: self.origin.clone(),
                reason: format!("'{parent}' is a sequence, expected a mapping"),
            }
            .into());
        }
        Ok(())
    }

    fn reparse(&self) -> Result<()> {
        yaml_provider::parse_document(&self.text)
            .map(|_| ())
            .map_err(|err| {
                Error::UnsupportedYamlLayout {
                    path: self.origin.clone(),
                    reason: format!("edit produced invalid YAML: {err:#}"),
                }
                .into()
            })
    }
}

fn scan_lines(text: &str) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut start = 0;
    for raw in text.split_inclusive('\n') {
        let end = start + raw.len();
        let body = raw.trim_end_matches(['\n', '\r']);
        let trimmed = body.trim_start_matches(' ');
        let indent = body.len() - trimmed.len();
        let is_marker = indent == 0 && (trimmed.starts_with("---") || trimmed.starts_with("..."));
        let content = if trimmed.trim().is_empty() || trimmed.starts_with('#') || is_marker {
            ""
        } else {
            trimmed.trim_end()
        };
        lines.push(Line {
            start,
            end,
            indent,
            content,
        });
        start = end;
    }
    lines
}

/// Splits `key: rest` into its unquoted key and the text after the colon.
fn split_key(content: &str) -> Option<(&str, &str)> {
    if let Some(quote) = content.chars().next().filter(|c| *c == '"' || *c == '\'') {
        let close = content[1..].find(quote)? + 1;
        let rest = content[close + 1..].strip_prefix(':')?;
        if !rest.is_empty() && !rest.starts_with(' ') {
            return None;
        }
        return Some((&content[1..close], rest));
    }
    if content.starts_with("- ") || content == "-" {
        return None;
    }
    let colon = content
        .match_indices(':')
        .map(|(idx, _)| idx)
        .find(|idx| {
            let after = &content[idx + 1..];
            after.is_empty() || after.starts_with(' ')
        })?;
    Some((content[..colon].trim_end(), &content[colon + 1..]))
}

fn strip_comment(rest: &str) -> &str {
    match rest.find(" #") {
        Some(idx) => &rest[..idx],
        None if rest.trim_start().starts_with('#') => "",
        None => rest,
    }
}

/// Finds `key` at exactly `indent` among `range` and measures its value block.
fn find_block(lines: &[Line<'_>], range: Range<usize>, indent: usize, key: &str) -> Option<Block> {
    let head = range.clone().find(|idx| {
        let line = &lines[*idx];
        line.is_content()
            && line.indent == indent
            && split_key(line.content).is_some_and(|(found, _)| found == key)
    })?;

    let mut last = head;
    let mut child_indent = None;
    for idx in head + 1..range.end {
        let line = &lines[idx];
        if !line.is_content() {
            continue;
        }
        let nested = line.indent > indent || (line.indent == indent && line.is_sequence_item());
        if !nested {
            break;
        }
        child_indent.get_or_insert(line.indent);
        last = idx;
    }
    Some(Block {
        span: lines[head].start..lines[last].end,
        body_end: lines[last].end,
        child_indent,
        indent,
    })
}

fn body_lines(lines: &[Line<'_>], block: &Block) -> Range<usize> {
    let first = lines
        .iter()
        .position(|line| line.start == block.span.start)
        .map(|idx| idx + 1)
        .unwrap_or(lines.len());
    let end = lines
        .iter()
        .position(|line| line.start >= block.body_end)
        .unwrap_or(lines.len());
    first..end.max(first)
}

fn render_entry(key: &str, value: &Value, indent: usize, newline: &str) -> Result<String> {
    let mut entry = Mapping::new();
    entry.insert(Value::from(key), value.clone());
    let dumped = yaml_provider::provider().dump_value(&Value::Mapping(entry))?;
    let dumped = dumped.strip_prefix("---\n").unwrap_or(&dumped);
    let pad = " ".repeat(indent);
    Ok(dumped
        .lines()
        .map(|line| {
            if line.is_empty() {
                newline.to_string()
            } else {
                format!("{pad}{line}{newline}")
            }
        })
        .collect())
}
