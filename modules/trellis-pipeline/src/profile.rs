//! Vector profile resolution and record normalization for indexing.
//!
//! A profile governs which fields make it into the indexed content text
//! and which fields are required before a record is worth embedding.

use trellis_common::Record;

pub const GENERIC_PROFILE: &str = "source.generic.v1";
pub const WORK_ITEM_PROFILE: &str = "cdm.work_item.v1";
pub const DOCUMENT_PROFILE: &str = "cdm.document.v1";

/// Resolve the profile id for a record: explicit request, else the
/// CDM-derived `cdm.<suffix>.v1`, else a source-family heuristic, else
/// the generic profile.
pub fn resolve_profile_id(
    requested: Option<&str>,
    cdm_model_id: Option<&str>,
    source_family: &str,
) -> String {
    if let Some(profile) = requested.filter(|p| !p.is_empty()) {
        return profile.to_string();
    }
    if let Some(model) = cdm_model_id.filter(|m| !m.is_empty()) {
        if model.starts_with("cdm.") {
            return model.to_string();
        }
        return format!("cdm.{model}.v1");
    }
    match source_family {
        "jira" | "github" | "gitlab" | "azure_devops" => WORK_ITEM_PROFILE.to_string(),
        "confluence" | "notion" | "sharepoint" | "gdrive" => DOCUMENT_PROFILE.to_string(),
        _ => GENERIC_PROFILE.to_string(),
    }
}

/// Fields a profile insists on before a record is indexed at all.
pub fn required_fields(profile_id: &str) -> &'static [&'static str] {
    match profile_id {
        WORK_ITEM_PROFILE => &["title"],
        DOCUMENT_PROFILE => &["title"],
        _ => &[],
    }
}

const TITLE_KEYS: &[&str] = &["title", "name", "summary", "subject", "key"];
const BODY_KEYS: &[&str] = &["description", "body", "content", "text"];
const URL_KEYS: &[&str] = &["url", "html_url", "self", "link"];

fn first_string<'a>(payload: &'a Record, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| payload.get(*k).and_then(|v| v.as_str()))
        .find(|s| !s.is_empty())
}

/// Legacy profile normalizer: project a raw payload into the flat shape
/// expected by the indexer. `None` when nothing indexable is present.
pub fn legacy_normalize(_profile_id: &str, payload: &Record) -> Option<Record> {
    let title = first_string(payload, TITLE_KEYS);
    let body = first_string(payload, BODY_KEYS);
    if title.is_none() && body.is_none() {
        return None;
    }

    let mut normalized = Record::new();
    if let Some(title) = title {
        normalized.insert("title".to_string(), serde_json::json!(title));
    }
    if let Some(body) = body {
        normalized.insert("body".to_string(), serde_json::json!(body));
    }
    if let Some(url) = first_string(payload, URL_KEYS) {
        normalized.insert("url".to_string(), serde_json::json!(url));
    }
    if let Some(status) = payload.get("status") {
        let status = status
            .as_str()
            .map(str::to_string)
            .or_else(|| status.get("name").and_then(|v| v.as_str()).map(str::to_string));
        if let Some(status) = status {
            normalized.insert("status".to_string(), serde_json::json!(status));
        }
    }
    Some(normalized)
}

/// Deterministic content text for embedding: title and body first, then
/// remaining scalar fields in key order.
pub fn content_text(vector_payload: &Record) -> String {
    let mut parts: Vec<String> = Vec::new();
    for key in ["title", "body"] {
        if let Some(value) = vector_payload.get(key).and_then(|v| v.as_str()) {
            if !value.is_empty() {
                parts.push(value.to_string());
            }
        }
    }
    let mut rest: Vec<(&String, &serde_json::Value)> = vector_payload
        .iter()
        .filter(|(k, _)| *k != "title" && *k != "body")
        .collect();
    rest.sort_by_key(|(k, _)| k.as_str());
    for (key, value) in rest {
        match value {
            serde_json::Value::String(s) if !s.is_empty() => {
                parts.push(format!("{key}: {s}"));
            }
            serde_json::Value::Number(n) => parts.push(format!("{key}: {n}")),
            serde_json::Value::Bool(b) => parts.push(format!("{key}: {b}")),
            _ => {}
        }
    }
    parts.join("\n")
}

/// The logical-id priority chain used by the runner and indexer:
/// `_externalId` → `sha` → `issueId` → `number`, else `None` (the runner
/// then synthesizes one).
pub fn logical_id(payload: &Record) -> Option<String> {
    for key in ["_externalId", "sha", "issueId", "number"] {
        if let Some(value) = payload.get(key) {
            match value {
                serde_json::Value::String(s) if !s.is_empty() => return Some(s.clone()),
                serde_json::Value::Number(n) => return Some(n.to_string()),
                _ => {}
            }
        }
    }
    None
}

/// Display-name priority chain: `title` → `path` → the logical id.
pub fn display_name(payload: &Record, logical_id: &str) -> String {
    for key in ["title", "path"] {
        if let Some(value) = payload.get(key).and_then(|v| v.as_str()) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    logical_id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(json: serde_json::Value) -> Record {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn profile_resolution_order() {
        assert_eq!(
            resolve_profile_id(Some("custom.v2"), Some("cdm.work_item.v1"), "jira"),
            "custom.v2"
        );
        assert_eq!(
            resolve_profile_id(None, Some("cdm.document.v1"), "jira"),
            "cdm.document.v1"
        );
        assert_eq!(
            resolve_profile_id(None, Some("ticket"), "jira"),
            "cdm.ticket.v1"
        );
        assert_eq!(resolve_profile_id(None, None, "github"), WORK_ITEM_PROFILE);
        assert_eq!(resolve_profile_id(None, None, "confluence"), DOCUMENT_PROFILE);
        assert_eq!(resolve_profile_id(None, None, "salesforce"), GENERIC_PROFILE);
    }

    #[test]
    fn legacy_normalize_picks_title_and_body() {
        let payload = record(serde_json::json!({
            "summary": "Fix the flaky test",
            "description": "It fails every third run",
            "html_url": "https://example.com/i/1",
            "status": {"name": "Open"}
        }));
        let normalized = legacy_normalize(GENERIC_PROFILE, &payload).unwrap();
        assert_eq!(normalized["title"], "Fix the flaky test");
        assert_eq!(normalized["body"], "It fails every third run");
        assert_eq!(normalized["url"], "https://example.com/i/1");
        assert_eq!(normalized["status"], "Open");
    }

    #[test]
    fn legacy_normalize_rejects_empty_records() {
        let payload = record(serde_json::json!({"count": 3}));
        assert!(legacy_normalize(GENERIC_PROFILE, &payload).is_none());
    }

    #[test]
    fn content_text_is_deterministic() {
        let payload = record(serde_json::json!({
            "title": "T",
            "body": "B",
            "status": "open",
            "assignee": "sam"
        }));
        let text = content_text(&payload);
        assert_eq!(text, "T\nB\nassignee: sam\nstatus: open");
        assert_eq!(text, content_text(&payload));
    }

    #[test]
    fn logical_id_priority_chain() {
        assert_eq!(
            logical_id(&record(serde_json::json!({"_externalId": "e1", "sha": "s1"}))),
            Some("e1".to_string())
        );
        assert_eq!(
            logical_id(&record(serde_json::json!({"sha": "s1", "number": 7}))),
            Some("s1".to_string())
        );
        assert_eq!(
            logical_id(&record(serde_json::json!({"issueId": "I-9"}))),
            Some("I-9".to_string())
        );
        assert_eq!(
            logical_id(&record(serde_json::json!({"number": 42}))),
            Some("42".to_string())
        );
        assert_eq!(logical_id(&record(serde_json::json!({"id": "ignored"}))), None);
    }

    #[test]
    fn display_name_priority_chain() {
        assert_eq!(
            display_name(&record(serde_json::json!({"title": "A title", "path": "/p"})), "lid"),
            "A title"
        );
        assert_eq!(
            display_name(&record(serde_json::json!({"path": "/docs/readme"})), "lid"),
            "/docs/readme"
        );
        assert_eq!(display_name(&record(serde_json::json!({})), "lid"), "lid");
    }
}
