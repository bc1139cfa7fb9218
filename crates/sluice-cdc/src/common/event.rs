//! Change event envelope
//!
//! Unified, immutable representation of a captured change for one entity.
//!
//! ## Resume Tokens
//!
//! Events read from a live change stream carry the stream's resume token.
//! Tokens are opaque, but their lexicographic order equals stream order
//! (MongoDB `_data` keystrings and zero-padded sequence encodings both
//! satisfy this), so the pipeline can tell whether a token moves a stored
//! position forward without knowing the source.
//!
//! Events synthesized by bulk migration carry no token:
//!
//! ```ignore
//! let event = ChangeEvent::insert("users", "42", json!({"id": 42}));
//! assert!(event.is_synthesized());
//! ```

use serde::{Deserialize, Serialize};

/// Opaque, totally ordered position in one entity type's change stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    /// Wrap a source-provided token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Encode a stream sequence number as an order-preserving token.
    pub fn from_sequence(sequence: u64) -> Self {
        Self(format!("{:016x}", sequence))
    }

    /// Decode a token produced by [`ResumeToken::from_sequence`].
    pub fn to_sequence(&self) -> Option<u64> {
        if self.0.len() != 16 {
            return None;
        }
        u64::from_str_radix(&self.0, 16).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResumeToken {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ResumeToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of change captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// Record inserted (also used for bulk-migrated rows)
    Insert,
    /// Record updated or replaced
    Update,
    /// Record deleted
    Delete,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "INSERT"),
            ChangeKind::Update => write!(f, "UPDATE"),
            ChangeKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// Native record identifier as reported by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NativeId {
    /// Plain string id
    String(String),
    /// Integer id
    Int(i64),
    /// 12-byte structured id (MongoDB ObjectId layout)
    ObjectId([u8; 12]),
}

/// Render a native id in its canonical string form.
///
/// Structured ids become lowercase hex, integers their decimal form.
pub fn normalize_entity_id(id: &NativeId) -> String {
    match id {
        NativeId::String(s) => s.clone(),
        NativeId::Int(i) => i.to_string(),
        NativeId::ObjectId(bytes) => bytes.iter().map(|b| format!("{:02x}", b)).collect(),
    }
}

/// A change captured for one entity of a subscribed entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Subscribed entity type (routing and handler lookup key)
    pub entity_type: String,
    /// Kind of change
    pub change_kind: ChangeKind,
    /// Normalized id of the affected record
    pub entity_id: String,
    /// Full document at capture time (INSERT/UPDATE; may be absent for DELETE)
    pub full_document: Option<serde_json::Value>,
    /// Stream position, absent on bulk-migration events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<ResumeToken>,
    /// Capture timestamp (Unix epoch millis)
    pub captured_at: i64,
}

impl ChangeEvent {
    /// Create a new event.
    pub fn new(
        entity_type: impl Into<String>,
        change_kind: ChangeKind,
        entity_id: impl Into<String>,
        full_document: Option<serde_json::Value>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            change_kind,
            entity_id: entity_id.into(),
            full_document,
            resume_token: None,
            captured_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create a new INSERT event
    pub fn insert(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        document: serde_json::Value,
    ) -> Self {
        Self::new(entity_type, ChangeKind::Insert, entity_id, Some(document))
    }

    /// Create a new UPDATE event
    pub fn update(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        document: serde_json::Value,
    ) -> Self {
        Self::new(entity_type, ChangeKind::Update, entity_id, Some(document))
    }

    /// Create a new DELETE event
    pub fn delete(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(entity_type, ChangeKind::Delete, entity_id, None)
    }

    /// Attach the stream position this event was read at.
    pub fn with_resume_token(mut self, token: ResumeToken) -> Self {
        self.resume_token = Some(token);
        self
    }

    /// True for events that did not come from a live stream.
    pub fn is_synthesized(&self) -> bool {
        self.resume_token.is_none()
    }

    /// Project the full document onto `fields`.
    ///
    /// An empty field list means "all fields". Non-object documents are
    /// returned unchanged.
    pub fn projected_document(&self, fields: &[String]) -> Option<serde_json::Value> {
        let doc = self.full_document.as_ref()?;
        if fields.is_empty() {
            return Some(doc.clone());
        }
        match doc.as_object() {
            Some(obj) => {
                let projected: serde_json::Map<_, _> = fields
                    .iter()
                    .filter_map(|f| obj.get(f).map(|v| (f.clone(), v.clone())))
                    .collect();
                Some(serde_json::Value::Object(projected))
            }
            None => Some(doc.clone()),
        }
    }
}
