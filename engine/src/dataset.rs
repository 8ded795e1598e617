//! Dataset items and the source the orchestrator reads them from.
//!
//! Datasets are JSON files. Either a bare array of items, or an object with
//! dataset-level defaults:
//!
//! ```json
//! {
//!   "id": "returns-policy",
//!   "eval_type": "single_turn",
//!   "items": [
//!     { "turns": [{ "role": "user", "content": "What is the return window?" }],
//!       "expected_output": "Returns within 30 days" }
//!   ]
//! }
//! ```
//!
//! Items without an `eval_type` inherit the dataset's.

use crate::error::{DatasetError, DatasetResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalType {
    SingleTurn,
    MultiTurn,
    Autonomous,
}

impl EvalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvalType::SingleTurn => "single_turn",
            EvalType::MultiTurn => "multi_turn",
            EvalType::Autonomous => "autonomous",
        }
    }
}

impl std::fmt::Display for EvalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

/// One evaluation case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub eval_type: EvalType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub turns: Vec<Turn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
}

impl DatasetItem {
    pub fn single_turn(message: impl Into<String>) -> Self {
        Self::scripted(EvalType::SingleTurn, vec![Turn::user(message)])
    }

    pub fn multi_turn(turns: Vec<Turn>) -> Self {
        Self::scripted(EvalType::MultiTurn, turns)
    }

    pub fn autonomous(goal: impl Into<String>) -> Self {
        Self {
            goal: Some(goal.into()),
            ..Self::scripted(EvalType::Autonomous, vec![])
        }
    }

    fn scripted(eval_type: EvalType, turns: Vec<Turn>) -> Self {
        Self {
            id: None,
            eval_type,
            turns,
            goal: None,
            expected_output: None,
            context: None,
            tags: BTreeSet::new(),
            difficulty: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = Some(expected.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// User turns in script order.
    pub fn user_turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter().filter(|t| t.role == Role::User)
    }

    /// The request the final reply answers: the goal for autonomous items,
    /// otherwise the last user turn.
    pub fn input(&self) -> &str {
        match self.eval_type {
            EvalType::Autonomous => self.goal.as_deref().unwrap_or_default(),
            _ => self
                .user_turns()
                .last()
                .map(|t| t.content.as_str())
                .unwrap_or_default(),
        }
    }

    /// Non-empty context, if any.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref().filter(|c| !c.trim().is_empty())
    }

    /// Non-empty expected output, if any.
    pub fn expected_output(&self) -> Option<&str> {
        self.expected_output
            .as_deref()
            .filter(|e| !e.trim().is_empty())
    }

    /// Check the shape invariants for the item's eval type.
    pub fn validate(&self) -> Result<(), String> {
        match self.eval_type {
            EvalType::Autonomous => {
                if self.goal.as_deref().map(str::trim).unwrap_or_default().is_empty() {
                    return Err("autonomous item requires a non-empty goal".to_string());
                }
                if !self.turns.is_empty() {
                    return Err("autonomous item must not have scripted turns".to_string());
                }
            }
            EvalType::SingleTurn | EvalType::MultiTurn => {
                if self.goal.is_some() {
                    return Err(format!("{} item must not have a goal", self.eval_type));
                }
                let user_turns = self.user_turns().count();
                if user_turns == 0 {
                    return Err(format!(
                        "{} item requires at least one user turn",
                        self.eval_type
                    ));
                }
                if self.eval_type == EvalType::SingleTurn && user_turns > 1 {
                    return Err(format!(
                        "single_turn item has {} user turns, expected 1",
                        user_turns
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Where the orchestrator gets its items from.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    /// Items of `dataset_id` in dataset order.
    async fn list_items(&self, dataset_id: &str) -> DatasetResult<Vec<DatasetItem>>;
}

/// Item as written in a dataset file; `eval_type` may be inherited.
#[derive(Deserialize)]
struct RawItem {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    eval_type: Option<EvalType>,
    #[serde(default)]
    turns: Vec<Turn>,
    #[serde(default)]
    goal: Option<String>,
    #[serde(default)]
    expected_output: Option<String>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default)]
    difficulty: Option<Difficulty>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DatasetFile {
    Items(Vec<RawItem>),
    Document {
        #[serde(default)]
        eval_type: Option<EvalType>,
        items: Vec<RawItem>,
    },
}

/// Parse a dataset document.
pub fn parse_dataset(json: &str) -> DatasetResult<Vec<DatasetItem>> {
    let (default_type, raw) = match serde_json::from_str::<DatasetFile>(json)? {
        DatasetFile::Items(items) => (None, items),
        DatasetFile::Document { eval_type, items } => (eval_type, items),
    };

    Ok(raw
        .into_iter()
        .map(|item| DatasetItem {
            id: item.id,
            eval_type: item
                .eval_type
                .or(default_type)
                .unwrap_or(EvalType::SingleTurn),
            turns: item.turns,
            goal: item.goal,
            expected_output: item.expected_output,
            context: item.context,
            tags: item.tags,
            difficulty: item.difficulty,
        })
        .collect())
}

/// Datasets stored as `<dir>/<dataset_id>.json`.
pub struct JsonDatasetSource {
    dir: PathBuf,
}

impl JsonDatasetSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Source for a single file; its dataset id is the file stem.
    pub fn for_file(path: &Path) -> (Self, String) {
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        (Self::new(dir), id)
    }

    fn path_for(&self, dataset_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", dataset_id))
    }
}

#[async_trait]
impl DatasetSource for JsonDatasetSource {
    async fn list_items(&self, dataset_id: &str) -> DatasetResult<Vec<DatasetItem>> {
        let path = self.path_for(dataset_id);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DatasetError::NotFound(dataset_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let items = parse_dataset(&json)?;
        debug!("Loaded {} items from {}", items.len(), path.display());
        Ok(items)
    }
}

/// Fixed in-memory datasets, keyed by id.
#[derive(Default)]
pub struct StaticDatasetSource {
    datasets: std::collections::HashMap<String, Vec<DatasetItem>>,
}

impl StaticDatasetSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, id: impl Into<String>, items: Vec<DatasetItem>) -> Self {
        self.datasets.insert(id.into(), items);
        self
    }
}

#[async_trait]
impl DatasetSource for StaticDatasetSource {
    async fn list_items(&self, dataset_id: &str) -> DatasetResult<Vec<DatasetItem>> {
        self.datasets
            .get(dataset_id)
            .cloned()
            .ok_or_else(|| DatasetError::NotFound(dataset_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_shapes() {
        assert!(DatasetItem::single_turn("hi").validate().is_ok());
        assert!(DatasetItem::autonomous("book a flight").validate().is_ok());
        assert!(DatasetItem::autonomous("   ").validate().is_err());

        let mut two_users = DatasetItem::single_turn("a");
        two_users.turns.push(Turn::user("b"));
        assert!(two_users.validate().is_err());

        let only_assistant = DatasetItem::multi_turn(vec![Turn::assistant("hello")]);
        assert!(only_assistant.validate().is_err());

        let mut autonomous_with_turns = DatasetItem::autonomous("goal");
        autonomous_with_turns.turns.push(Turn::user("x"));
        assert!(autonomous_with_turns.validate().is_err());
    }

    #[test]
    fn test_input_and_blank_fields() {
        let item = DatasetItem::multi_turn(vec![
            Turn::user("first"),
            Turn::assistant("reply"),
            Turn::user("second"),
        ])
        .with_context("  ")
        .with_expected_output("done");

        assert_eq!(item.input(), "second");
        assert_eq!(item.context(), None);
        assert_eq!(item.expected_output(), Some("done"));
        assert_eq!(item.user_turns().count(), 2);
        assert_eq!(DatasetItem::autonomous("goal").input(), "goal");
    }

    #[test]
    fn test_parse_document_inherits_eval_type() {
        let json = r#"{
            "eval_type": "multi_turn",
            "items": [
                {"turns": [{"role": "user", "content": "a"}, {"role": "user", "content": "b"}]},
                {"eval_type": "autonomous", "goal": "g", "tags": ["smoke"], "difficulty": "hard"}
            ]
        }"#;

        let items = parse_dataset(json).unwrap();
        assert_eq!(items[0].eval_type, EvalType::MultiTurn);
        assert_eq!(items[1].eval_type, EvalType::Autonomous);
        assert!(items[1].tags.contains("smoke"));
        assert_eq!(items[1].difficulty, Some(Difficulty::Hard));
    }

    #[test]
    fn test_parse_bare_array() {
        let json = r#"[{"turns": [{"role": "user", "content": "hi"}], "expected_output": "hello"}]"#;
        let items = parse_dataset(json).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].eval_type, EvalType::SingleTurn);
        assert!(parse_dataset("{\"nope\": 1}").is_err());
    }

    #[tokio::test]
    async fn test_json_source_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("returns.json");
        std::fs::write(
            &path,
            r#"[{"turns": [{"role": "user", "content": "refund?"}]}]"#,
        )
        .unwrap();

        let (source, id) = JsonDatasetSource::for_file(&path);
        assert_eq!(id, "returns");
        assert_eq!(source.list_items(&id).await.unwrap().len(), 1);
        assert!(matches!(
            source.list_items("missing").await,
            Err(DatasetError::NotFound(_))
        ));
    }
}
