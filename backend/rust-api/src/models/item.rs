use serde::{Deserialize, Serialize};

use super::session::SubjectKind;

/// A single question as supplied by the question bank. Read-only to the attempt core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub options: Vec<String>,
    pub correct_answer: String,
    #[serde(default = "default_points")]
    pub points: u32,
    pub time_limit_seconds: u32,
}

fn default_points() -> u32 {
    1
}

impl Item {
    pub fn is_correct(&self, given: &str) -> bool {
        given.trim() == self.correct_answer.trim()
    }
}

/// One answered (or timed out) item. Appended once, in item order, never edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub item_id: String,
    /// `None` when the item timed out without a choice.
    pub given: Option<String>,
    pub is_correct: bool,
    pub time_taken_seconds: u32,
}

/// Subject document in the `subjects` collection: a quiz or mixed test reachable by access code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    #[serde(rename = "_id")]
    pub id: String,
    pub code: String,
    pub kind: SubjectKind,
    pub title: String,
    #[serde(default)]
    pub items: Vec<Item>,
}

impl Subject {
    pub fn item(&self, item_id: &str) -> Option<&Item> {
        self.items.iter().find(|item| item.id == item_id)
    }

    pub fn max_points(&self) -> u32 {
        self.items.iter().map(|item| item.points).sum()
    }
}
