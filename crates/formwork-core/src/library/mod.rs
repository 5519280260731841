//! Strategy library catalogue
//!
//! Strategies accumulated across tasks, grouped into lettered
//! categories and identified by sequential ids like `A-03`. The
//! catalogue round-trips through a human-readable markdown form:
//!
//! ```text
//! ### A. Research
//! #### Broad-then-narrow search (A-01)
//! Applicability: when the topic is unfamiliar
//! Steps:
//! - cast a wide query first
//! - narrow by date and source
//! ```

pub mod gate;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

static CATEGORY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^###\s+([A-Z])\.\s*(.*)$").expect("category regex"));
static ENTRY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^####\s+(.+?)\s*\(([A-Z])-(\d+)\)\s*$").expect("entry regex"));
static ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Z])-(\d+)$").expect("id regex"));

/// Sequential per-category strategy identifier, rendered `A-01`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct StrategyId {
    pub category: char,
    pub number: u32,
}

impl StrategyId {
    pub fn new(category: char, number: u32) -> Self {
        Self { category, number }
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.category, self.number)
    }
}

impl FromStr for StrategyId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = ID_RE
            .captures(s.trim())
            .ok_or_else(|| format!("invalid strategy id: {}", s))?;
        let category = caps[1]
            .chars()
            .next()
            .ok_or_else(|| "empty category".to_string())?;
        let number: u32 = caps[2]
            .parse()
            .map_err(|_| format!("invalid strategy number in: {}", s))?;
        Ok(Self { category, number })
    }
}

impl From<StrategyId> for String {
    fn from(id: StrategyId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for StrategyId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A strategy proposed for admission; the id is allocated on commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDraft {
    pub category: char,
    pub title: String,
    pub applicability: String,
    pub steps: Vec<String>,
    pub examples: Vec<String>,
}

/// An admitted catalogue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyEntry {
    pub id: StrategyId,
    pub title: String,
    pub applicability: String,
    pub steps: Vec<String>,
    pub examples: Vec<String>,
    /// Notes appended by enhance-existing decisions.
    #[serde(default)]
    pub enhancements: Vec<String>,
}

impl StrategyEntry {
    pub fn from_draft(id: StrategyId, draft: StrategyDraft) -> Self {
        Self {
            id,
            title: draft.title,
            applicability: draft.applicability,
            steps: draft.steps,
            examples: draft.examples,
            enhancements: Vec::new(),
        }
    }
}

/// The full catalogue: category names plus entries in catalogue order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyCatalog {
    pub categories: BTreeMap<char, String>,
    pub entries: Vec<StrategyEntry>,
}

impl StrategyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &StrategyId) -> Option<&StrategyEntry> {
        self.entries.iter().find(|e| e.id == *id)
    }

    pub fn contains(&self, id: &StrategyId) -> bool {
        self.get(id).is_some()
    }

    pub fn entries_in(&self, category: char) -> impl Iterator<Item = &StrategyEntry> {
        self.entries.iter().filter(move |e| e.id.category == category)
    }

    /// Next sequential id for a category (numbering starts at 1).
    pub fn next_id(&self, category: char) -> StrategyId {
        let max = self
            .entries_in(category)
            .map(|e| e.id.number)
            .max()
            .unwrap_or(0);
        StrategyId::new(category, max + 1)
    }

    /// Case-insensitive title lookup inside one category.
    pub fn has_title(&self, category: char, title: &str) -> bool {
        let wanted = normalize_title(title);
        self.entries_in(category)
            .any(|e| normalize_title(&e.title) == wanted)
    }

    /// First referenced id that actually exists, in reference order.
    pub fn first_existing(&self, references: &[StrategyId]) -> Option<StrategyId> {
        references.iter().copied().find(|id| self.contains(id))
    }

    pub fn ensure_category(&mut self, category: char, name: &str) {
        self.categories
            .entry(category)
            .or_insert_with(|| name.to_string());
    }

    /// Parse the markdown catalogue form. Unknown lines are ignored.
    pub fn parse(text: &str) -> Self {
        let mut catalog = StrategyCatalog::new();
        let mut current: Option<StrategyEntry> = None;
        let mut list: Option<EntryList> = None;

        for line in text.lines() {
            if let Some(caps) = CATEGORY_RE.captures(line) {
                if let Some(entry) = current.take() {
                    catalog.entries.push(entry);
                }
                let category = caps[1].chars().next().unwrap_or('?');
                catalog.categories.insert(category, caps[2].trim().to_string());
                list = None;
                continue;
            }
            if let Some(caps) = ENTRY_RE.captures(line) {
                if let Some(entry) = current.take() {
                    catalog.entries.push(entry);
                }
                let category = caps[2].chars().next().unwrap_or('?');
                let number: u32 = caps[3].parse().unwrap_or(0);
                current = Some(StrategyEntry {
                    id: StrategyId::new(category, number),
                    title: caps[1].trim().to_string(),
                    applicability: String::new(),
                    steps: Vec::new(),
                    examples: Vec::new(),
                    enhancements: Vec::new(),
                });
                list = None;
                continue;
            }
            let Some(entry) = current.as_mut() else {
                continue;
            };
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix("Applicability:") {
                entry.applicability = rest.trim().to_string();
                list = None;
            } else if trimmed == "Steps:" {
                list = Some(EntryList::Steps);
            } else if trimmed == "Examples:" {
                list = Some(EntryList::Examples);
            } else if trimmed == "Enhancements:" {
                list = Some(EntryList::Enhancements);
            } else if let Some(item) = trimmed.strip_prefix("- ") {
                match list {
                    Some(EntryList::Steps) => entry.steps.push(item.trim().to_string()),
                    Some(EntryList::Examples) => entry.examples.push(item.trim().to_string()),
                    Some(EntryList::Enhancements) => {
                        entry.enhancements.push(item.trim().to_string())
                    }
                    None => {}
                }
            }
        }
        if let Some(entry) = current.take() {
            catalog.entries.push(entry);
        }
        catalog
    }

    /// Render the markdown catalogue form, grouped by category.
    pub fn render(&self) -> String {
        let mut out = String::from("# Strategy Library\n");
        let mut categories: Vec<char> = self.categories.keys().copied().collect();
        for entry in &self.entries {
            if !categories.contains(&entry.id.category) {
                categories.push(entry.id.category);
            }
        }
        categories.sort_unstable();

        for category in categories {
            let name = self
                .categories
                .get(&category)
                .cloned()
                .unwrap_or_else(|| "General".to_string());
            out.push_str(&format!("\n### {}. {}\n", category, name));
            for entry in self.entries_in(category) {
                out.push_str(&format!("\n#### {} ({})\n", entry.title, entry.id));
                out.push_str(&format!("Applicability: {}\n", entry.applicability));
                if !entry.steps.is_empty() {
                    out.push_str("Steps:\n");
                    for step in &entry.steps {
                        out.push_str(&format!("- {}\n", step));
                    }
                }
                if !entry.examples.is_empty() {
                    out.push_str("Examples:\n");
                    for example in &entry.examples {
                        out.push_str(&format!("- {}\n", example));
                    }
                }
                if !entry.enhancements.is_empty() {
                    out.push_str("Enhancements:\n");
                    for note in &entry.enhancements {
                        out.push_str(&format!("- {}\n", note));
                    }
                }
            }
        }
        out
    }
}

#[derive(Clone, Copy)]
enum EntryList {
    Steps,
    Examples,
    Enhancements,
}

fn normalize_title(title: &str) -> String {
    title.trim().to_lowercase()
}
