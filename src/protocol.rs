//! Request and response documents exchanged with clients.
//!
//! Requests are JSON objects tagged by `type`:
//!
//! ```text
//! {"type": "sub", "queryId": 7, "sub": {"all": {"visor": "Account"}}}
//! {"type": "insert", "query": {"visor": "Account"}, "insert": {"name": "ccc"}}
//! {"type": "update", "update": [[{"visor": "Account", "id": 1}, {"name": "aaa1"}]]}
//! {"type": "delete", "delete": [{"visor": "Account", "id": 1}]}
//! ```
//!
//! Replies echo `queryId` as `responseQueryId`. Pushes carry a subscription
//! document and no `responseQueryId`.

use crate::error::{Result, SyncError};
use crate::subscriptions::{Resolution, SubscriptionSet};
use crate::types::{PrimaryKey, Record};
use crate::visor::Visor;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A client request.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Request {
    /// Replace the connection's subscription set.
    Sub { sub: SubscriptionSet },
    /// Insert one row.
    Insert { query: InsertTarget, insert: Record },
    /// Apply changes to selected rows, all or nothing.
    Update { update: Vec<(Selector, Record)> },
    /// Delete selected rows, all or nothing.
    Delete { delete: Vec<Selector> },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Sub { .. } => "sub",
            Request::Insert { .. } => "insert",
            Request::Update { .. } => "update",
            Request::Delete { .. } => "delete",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct InsertTarget {
    pub visor: String,
}

/// `{visor, <primary key field>: value}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    pub visor: String,
    #[serde(flatten)]
    pub fields: Record,
}

impl Selector {
    pub fn new(visor: impl Into<String>, field: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut fields = Record::new();
        fields.insert(field.into(), value.into());
        Self {
            visor: visor.into(),
            fields,
        }
    }

    /// The selected primary key, read from the visor's key field.
    pub fn key(&self, visor: &Visor) -> Result<PrimaryKey> {
        self.fields
            .get(&visor.primary_key)
            .and_then(PrimaryKey::from_value)
            .ok_or_else(|| {
                SyncError::InvalidRequest(format!(
                    "selector for '{}' lacks primary key '{}'",
                    visor.name, visor.primary_key
                ))
            })
    }
}

/// Parse a raw message. The query id is returned even when the request
/// itself is malformed, so the error reply can still be correlated.
pub fn parse_message(text: &str) -> (Option<Value>, Result<Request>) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return (None, Err(SyncError::InvalidRequest(e.to_string()))),
    };

    let query_id = value.get("queryId").filter(|id| !id.is_null()).cloned();
    let request =
        serde_json::from_value(value).map_err(|e| SyncError::InvalidRequest(e.to_string()));
    (query_id, request)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Body of a reply.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    /// `{data, sub, errors?}`
    Document(Resolution),
    /// `{status: "ok", ...fields}`
    Done {
        status: Status,
        #[serde(flatten)]
        fields: Record,
    },
    /// `{status: "error", message}`
    Failed { status: Status, message: String },
}

impl Response {
    pub fn ok() -> Self {
        Response::Done {
            status: Status::Ok,
            fields: Record::new(),
        }
    }

    pub fn inserted(record: Record) -> Self {
        Response::Done {
            status: Status::Ok,
            fields: record,
        }
    }

    pub fn error(error: &SyncError) -> Self {
        Response::Failed {
            status: Status::Error,
            message: error.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Failed { .. })
    }
}

/// A reply or push sent to one connection.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Reply {
    #[serde(rename = "responseQueryId", skip_serializing_if = "Option::is_none")]
    pub response_query_id: Option<Value>,
    #[serde(flatten)]
    pub body: Response,
}

impl Reply {
    pub fn new(body: Response) -> Self {
        Self {
            response_query_id: None,
            body,
        }
    }

    /// Unsolicited subscription document.
    pub fn push(resolution: Resolution) -> Self {
        Self::new(Response::Document(resolution))
    }

    pub fn error(error: &SyncError) -> Self {
        Self::new(Response::error(error))
    }

    pub fn with_query_id(mut self, query_id: Option<Value>) -> Self {
        self.response_query_id = query_id;
        self
    }

    pub fn resolution(&self) -> Option<&Resolution> {
        match &self.body {
            Response::Document(resolution) => Some(resolution),
            _ => None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"status":"error","message":{}}}"#,
                Value::String(format!("Serialization error: {}", e))
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_requests() {
        let (id, request) = parse_message(
            r#"{"type": "sub", "queryId": "q1", "sub": {"b": {"visor": "B"}, "a": {"visor": "A"}}}"#,
        );
        assert_eq!(id, Some(json!("q1")));
        match request.unwrap() {
            Request::Sub { sub } => {
                let names: Vec<&str> = sub.iter().map(|(name, _)| name).collect();
                assert_eq!(names, vec!["b", "a"]);
            }
            other => panic!("expected sub, got {:?}", other),
        }

        let (_, request) = parse_message(
            r#"{"type": "update", "update": [[{"visor": "Account", "id": 1}, {"name": "aaa1"}]]}"#,
        );
        match request.unwrap() {
            Request::Update { update } => {
                assert_eq!(update.len(), 1);
                assert_eq!(update[0].0.visor, "Account");
                assert_eq!(update[0].0.fields["id"], json!(1));
                assert_eq!(update[0].1["name"], json!("aaa1"));
            }
            other => panic!("expected update, got {:?}", other),
        }

        let (_, request) =
            parse_message(r#"{"type": "insert", "query": {"visor": "Account"}, "insert": {}}"#);
        assert_eq!(request.unwrap().kind(), "insert");
    }

    #[test]
    fn test_malformed_keeps_query_id() {
        let (id, request) = parse_message(r#"{"type": "teleport", "queryId": 4}"#);
        assert_eq!(id, Some(json!(4)));
        assert!(matches!(request, Err(SyncError::InvalidRequest(_))));

        let (id, request) = parse_message("not json");
        assert_eq!(id, None);
        assert!(request.is_err());
    }

    #[test]
    fn test_reply_shapes() {
        let reply = Reply::new(Response::ok()).with_query_id(Some(json!(9)));
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"responseQueryId": 9, "status": "ok"})
        );

        let record = json!({"id": 3, "name": "ccc"}).as_object().cloned().unwrap();
        let reply = Reply::new(Response::inserted(record));
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"status": "ok", "id": 3, "name": "ccc"})
        );

        let reply = Reply::error(&SyncError::VisorNotFound("Nope".into()));
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"status": "error", "message": "Visor not found: Nope"})
        );
    }

    #[test]
    fn test_selector_key() {
        let visor = Visor::new("Account", "accounts", "id");
        assert_eq!(
            Selector::new("Account", "id", 1).key(&visor).unwrap(),
            PrimaryKey::Int(1)
        );
        assert!(Selector::new("Account", "name", "x").key(&visor).is_err());
    }
}
