use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Turns kept when no limit is given.
pub const DEFAULT_MAX_TURNS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

/// Conversation log capped to the most recent turns.
///
/// When backed by a file, the whole log is rewritten as a JSON array after
/// every exchange.
#[derive(Debug, Clone)]
pub struct ChatHistory {
    path: Option<PathBuf>,
    max_turns: usize,
    turns: Vec<Turn>,
}

impl ChatHistory {
    pub fn in_memory(max_turns: usize) -> Self {
        Self {
            path: None,
            max_turns,
            turns: Vec::new(),
        }
    }

    /// Open the history stored at `path`, starting empty if it does not
    /// exist yet.
    pub fn open(path: &Path, max_turns: usize) -> Result<Self> {
        let turns = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            Vec::new()
        };

        let mut history = Self {
            path: Some(path.to_path_buf()),
            max_turns,
            turns,
        };
        history.truncate();
        Ok(history)
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// Append a user question and the assistant's answer, then persist.
    pub fn record_exchange(&mut self, question: &str, answer: &str) -> Result<()> {
        self.turns.push(Turn {
            role: Role::User,
            content: question.to_string(),
        });
        self.turns.push(Turn {
            role: Role::Assistant,
            content: answer.to_string(),
        });
        self.truncate();
        self.save()
    }

    fn truncate(&mut self) {
        if self.turns.len() > self.max_turns {
            let excess = self.turns.len() - self.max_turns;
            self.turns.drain(..excess);
        }
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&self.turns)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_most_recent_turns() {
        let mut history = ChatHistory::in_memory(4);
        for i in 0..3 {
            history
                .record_exchange(&format!("q{i}"), &format!("a{i}"))
                .unwrap();
        }
        let contents: Vec<&str> =
            history.turns().iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["q1", "a1", "q2", "a2"]);
        assert_eq!(history.turns()[0].role, Role::User);
    }

    #[test]
    fn persists_as_json_array() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("chat_history.json");

        let mut history = ChatHistory::open(&path, DEFAULT_MAX_TURNS).unwrap();
        assert!(history.turns().is_empty());
        history.record_exchange("hello", "hi there").unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\n  {"));
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value[0]["role"], "user");
        assert_eq!(value[1]["role"], "assistant");
        assert_eq!(value[1]["content"], "hi there");

        let reopened = ChatHistory::open(&path, DEFAULT_MAX_TURNS).unwrap();
        assert_eq!(reopened.turns(), history.turns());
    }

    #[test]
    fn reopening_applies_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("h.json");
        let mut history = ChatHistory::open(&path, 10).unwrap();
        for i in 0..4 {
            history.record_exchange(&i.to_string(), "a").unwrap();
        }

        let reopened = ChatHistory::open(&path, 2).unwrap();
        assert_eq!(reopened.turns().len(), 2);
        assert_eq!(reopened.turns()[0].content, "3");
    }
}
