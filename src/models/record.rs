use serde::{ Serialize, Deserialize };
use serde_json::{ Map, Value as JsonValue };

/// Failure details attached to a record written under the `annotate` policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    pub kind: String,
    pub message: String,
    pub attempts: u32,
}

/// One JSONL line: a conversation with index-aligned `role` and `text` turns.
///
/// Top-level fields other than `id`, `role`, `text` and `error` are kept in
/// `extra` and written back untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub role: Vec<String>,
    pub text: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordFailure>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Record {
    pub fn new(id: i64, role: &str, text: &str) -> Self {
        Self {
            id,
            role: vec![role.to_string()],
            text: vec![text.to_string()],
            error: None,
            extra: Map::new(),
        }
    }

    /// Checks the turn invariant: equal lengths and at least one turn.
    pub fn validate(&self) -> Result<(), String> {
        if self.role.len() != self.text.len() {
            return Err(
                format!(
                    "`role` has {} entries but `text` has {}",
                    self.role.len(),
                    self.text.len()
                )
            );
        }
        if self.text.is_empty() {
            return Err("`role` and `text` must contain at least one turn".to_string());
        }
        Ok(())
    }

    pub fn turn_count(&self) -> usize {
        self.text.len()
    }

    /// The text of the last turn, i.e. the one awaiting a response.
    pub fn prompt(&self) -> Option<&str> {
        self.text.last().map(|s| s.as_str())
    }

    pub fn last_role(&self) -> Option<&str> {
        self.role.last().map(|s| s.as_str())
    }

    /// All turns before the last one as `(role, text)` pairs.
    pub fn history(&self) -> impl Iterator<Item = (&str, &str)> {
        let n = self.turn_count().saturating_sub(1);
        self.role
            .iter()
            .zip(self.text.iter())
            .take(n)
            .map(|(r, t)| (r.as_str(), t.as_str()))
    }

    pub fn push_turn(&mut self, role: impl Into<String>, text: impl Into<String>) {
        self.role.push(role.into());
        self.text.push(text.into());
    }

    pub fn annotate(&mut self, failure: RecordFailure) {
        self.error = Some(failure);
    }
}
