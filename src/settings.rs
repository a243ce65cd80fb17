//! INI-shaped settings: parse, query, and minimal-churn rewrite.
//!
//! The grammar is two line patterns, everything else is opaque:
//!
//! - `\s*\[([^\]]+)\]` opens a named section;
//! - `\s*([A-Za-z0-9./_]+)\s*=\s*"?([^\r\n="]*)"?` defines a key/value pair
//!   within the current section.
//!
//! All other lines (comments, blanks, hand-written notes) are ignored by the
//! parser but preserved byte-for-byte on rewrite, so saving over a hand-edited
//! file only touches the keys that were actually changed. Keys added since the
//! last parse are appended at the end of their section; new sections are
//! appended at the end of the file.
//!
//! The same type doubles as the serialization substrate for the stream
//! footer, which is an INI-shaped text block.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::DaqResult;

static SECTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\[([^\]]+)\]").expect("section regex"));
static KV_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\s*([A-Za-z0-9./_]+)\s*=\s*"?([^\r\n="]*)"?"#).expect("kv regex"));

/// One section's key/value pairs.
pub type Section = BTreeMap<String, String>;

/// Parsed settings plus enough source text to rewrite with minimal churn.
#[derive(Debug, Default, Clone)]
pub struct Settings {
    sections: BTreeMap<String, Section>,
    dirty: BTreeMap<String, BTreeSet<String>>,
    source_lines: Vec<String>,
    path: Option<PathBuf>,
}

impl Settings {
    /// Empty settings with no backing file.
    pub fn new() -> Self {
        Settings::default()
    }

    /// Parse settings from a file, remembering the path for [`Settings::save`].
    pub fn load(path: &Path) -> DaqResult<Self> {
        let text = fs::read_to_string(path)?;
        let mut s = Settings::parse(&text);
        s.path = Some(path.to_path_buf());
        Ok(s)
    }

    /// Parse settings from text. Clobbers nothing: the returned instance has
    /// no dirty keys, so a rewrite reproduces the input byte-for-byte.
    pub fn parse(text: &str) -> Self {
        let mut sections: BTreeMap<String, Section> = BTreeMap::new();
        let mut current = String::new();
        let source_lines: Vec<String> = text.lines().map(str::to_owned).collect();

        for line in &source_lines {
            if let Some(cap) = SECTION_RE.captures(line) {
                current = cap[1].to_owned();
                sections.entry(current.clone()).or_default();
            } else if let Some(cap) = KV_RE.captures(line) {
                sections
                    .entry(current.clone())
                    .or_default()
                    .insert(cap[1].to_owned(), cap[2].trim_end().to_owned());
            }
        }

        Settings {
            sections,
            dirty: BTreeMap::new(),
            source_lines,
            path: None,
        }
    }

    /// Look up a key in a section.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(String::as_str)
    }

    /// Set a key in a section, marking it dirty for the next rewrite.
    pub fn put(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_owned())
            .or_default()
            .insert(key.to_owned(), value.into());
        self.dirty
            .entry(section.to_owned())
            .or_default()
            .insert(key.to_owned());
    }

    /// Replace a whole section.
    pub fn put_section(&mut self, name: &str, section: Section) {
        for key in section.keys() {
            self.dirty
                .entry(name.to_owned())
                .or_default()
                .insert(key.clone());
        }
        self.sections.insert(name.to_owned(), section);
    }

    /// A copy of a section's map, empty if the section does not exist.
    pub fn section(&self, name: &str) -> Section {
        self.sections.get(name).cloned().unwrap_or_default()
    }

    /// All section names present.
    pub fn section_names(&self) -> Vec<String> {
        self.sections.keys().cloned().collect()
    }

    /// Render the settings back to text.
    ///
    /// Lines from the original source are emitted verbatim except for
    /// key/value lines whose key is dirty, which are rewritten in place.
    /// Keys never seen in the source are appended at the end of their
    /// section, and unseen sections at the end of the file.
    pub fn render(&self) -> String {
        let mut out: Vec<String> = Vec::with_capacity(self.source_lines.len() + 8);
        let mut emitted: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut seen_sections: BTreeSet<String> = BTreeSet::new();
        let mut current = String::new();
        seen_sections.insert(current.clone());

        for line in &self.source_lines {
            if let Some(cap) = SECTION_RE.captures(line) {
                self.append_missing(&current, &emitted, &mut out);
                current = cap[1].to_owned();
                seen_sections.insert(current.clone());
                out.push(line.clone());
            } else if let Some(cap) = KV_RE.captures(line) {
                let key = &cap[1];
                let is_dirty = self
                    .dirty
                    .get(&current)
                    .is_some_and(|keys| keys.contains(key));
                if is_dirty {
                    if let Some(value) = self.get(&current, key) {
                        out.push(format!("{} = {}", key, value));
                    } else {
                        out.push(line.clone());
                    }
                } else {
                    out.push(line.clone());
                }
                emitted
                    .entry(current.clone())
                    .or_default()
                    .insert(key.to_owned());
            } else {
                out.push(line.clone());
            }
        }
        self.append_missing(&current, &emitted, &mut out);

        for (name, section) in &self.sections {
            if seen_sections.contains(name) {
                continue;
            }
            if !out.is_empty() {
                out.push(String::new());
            }
            out.push(format!("[{}]", name));
            for (key, value) in section {
                out.push(format!("{} = {}", key, value));
            }
        }

        let mut text = out.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        text
    }

    fn append_missing(
        &self,
        section: &str,
        emitted: &BTreeMap<String, BTreeSet<String>>,
        out: &mut Vec<String>,
    ) {
        let Some(map) = self.sections.get(section) else {
            return;
        };
        let empty = BTreeSet::new();
        let done = emitted.get(section).unwrap_or(&empty);
        for (key, value) in map {
            if !done.contains(key) {
                out.push(format!("{} = {}", key, value));
            }
        }
    }

    /// Rewrite the backing file (the one given to [`Settings::load`]).
    pub fn save(&self) -> DaqResult<()> {
        if let Some(path) = &self.path {
            fs::write(path, self.render())?;
        }
        Ok(())
    }
}
