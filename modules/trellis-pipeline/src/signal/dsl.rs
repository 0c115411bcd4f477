//! Typed DSL for signal definitions, version 1. Three shapes:
//! `cdm.work.stale_item`, `cdm.doc.orphan` and `cdm.generic.filter`.
//! Each carries its own config schema and evaluates one record at a time.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;

use trellis_common::{Record, SignalSeverity};

pub const DSL_VERSION: u64 = 1;

// ---------------------------------------------------------------------------
// Spec shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgeUnit {
    Days,
    Hours,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgeSpec {
    pub unit: AgeUnit,
    pub value: u64,
}

impl AgeSpec {
    pub fn to_duration(self) -> Duration {
        match self.unit {
            AgeUnit::Days => Duration::days(self.value as i64),
            AgeUnit::Hours => Duration::hours(self.value as i64),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleItemSpec {
    pub max_age: AgeSpec,
    #[serde(default)]
    pub status_include: Vec<String>,
    #[serde(default)]
    pub status_exclude: Vec<String>,
    #[serde(default)]
    pub project_include: Vec<String>,
    #[serde(default)]
    pub project_exclude: Vec<String>,
    /// Escalate to WARNING once the age crosses this bound.
    #[serde(default)]
    pub warn_after: Option<AgeSpec>,
    /// Escalate to ERROR once the age crosses this bound.
    #[serde(default)]
    pub error_after: Option<AgeSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocOrphanSpec {
    pub min_age: AgeSpec,
    #[serde(default)]
    pub min_view_count: Option<u64>,
    /// When set, only documents missing a project link match.
    #[serde(default)]
    pub require_project_link: bool,
    #[serde(default)]
    pub space_include: Vec<String>,
    #[serde(default)]
    pub space_exclude: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "LT")]
    Lt,
    #[serde(rename = "LTE")]
    Lte,
    #[serde(rename = "GT")]
    Gt,
    #[serde(rename = "GTE")]
    Gte,
    #[serde(rename = "EQ")]
    Eq,
    #[serde(rename = "NEQ")]
    Neq,
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "NOT_IN")]
    NotIn,
    #[serde(rename = "IS_NULL")]
    IsNull,
    #[serde(rename = "IS_NOT_NULL")]
    IsNotNull,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub field: String,
    pub op: CompareOp,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeverityRule {
    pub when: Condition,
    pub severity: SignalSeverity,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericFilterSpec {
    /// Conjunctive conditions; all must hold.
    #[serde(rename = "where", default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub severity_rules: Vec<SeverityRule>,
    #[serde(default)]
    pub summary_template: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum DslSpec {
    #[serde(rename = "cdm.work.stale_item")]
    StaleItem(StaleItemSpec),
    #[serde(rename = "cdm.doc.orphan")]
    DocOrphan(DocOrphanSpec),
    #[serde(rename = "cdm.generic.filter")]
    GenericFilter(GenericFilterSpec),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DslDocument {
    pub version: u64,
    #[serde(flatten)]
    pub spec: DslSpec,
}

/// Parse a `definition_spec` value. Only version 1 is understood.
pub fn parse(spec: &Value) -> Result<DslDocument> {
    let doc: DslDocument =
        serde_json::from_value(spec.clone()).map_err(|e| anyhow!("invalid DSL spec: {e}"))?;
    if doc.version != DSL_VERSION {
        return Err(anyhow!("unsupported DSL version: {}", doc.version));
    }
    Ok(doc)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DslOutcome {
    pub severity: SignalSeverity,
    pub summary: Option<String>,
    pub details: Record,
}

impl DslDocument {
    /// Evaluate one record. `None` means no match.
    pub fn eval(
        &self,
        payload: &Record,
        default_severity: SignalSeverity,
        now: DateTime<Utc>,
    ) -> Option<DslOutcome> {
        match &self.spec {
            DslSpec::StaleItem(spec) => eval_stale_item(spec, payload, default_severity, now),
            DslSpec::DocOrphan(spec) => eval_doc_orphan(spec, payload, default_severity, now),
            DslSpec::GenericFilter(spec) => eval_generic(spec, payload, default_severity),
        }
    }
}

fn eval_stale_item(
    spec: &StaleItemSpec,
    payload: &Record,
    default_severity: SignalSeverity,
    now: DateTime<Utc>,
) -> Option<DslOutcome> {
    let updated = first_timestamp(payload, &["updatedAt", "updated_at", "updated", "lastModified"])?;
    let age = now.signed_duration_since(updated);
    if age < spec.max_age.to_duration() {
        return None;
    }

    let status = string_at(payload, "status");
    if !spec.status_include.is_empty()
        && !status.as_deref().map(|s| spec.status_include.iter().any(|i| i == s)).unwrap_or(false)
    {
        return None;
    }
    if let Some(status) = &status {
        if spec.status_exclude.iter().any(|e| e == status) {
            return None;
        }
    }

    let project = string_at(payload, "projectKey").or_else(|| string_at(payload, "project"));
    if !spec.project_include.is_empty()
        && !project.as_deref().map(|p| spec.project_include.iter().any(|i| i == p)).unwrap_or(false)
    {
        return None;
    }
    if let Some(project) = &project {
        if spec.project_exclude.iter().any(|e| e == project) {
            return None;
        }
    }

    let severity = match (&spec.error_after, &spec.warn_after) {
        (Some(error_after), _) if age >= error_after.to_duration() => SignalSeverity::Error,
        (_, Some(warn_after)) if age >= warn_after.to_duration() => SignalSeverity::Warning,
        _ => default_severity,
    };

    let mut details = Record::new();
    details.insert("ageDays".to_string(), serde_json::json!(age.num_days()));
    details.insert("updatedAt".to_string(), serde_json::json!(updated.to_rfc3339()));
    if let Some(status) = status {
        details.insert("status".to_string(), serde_json::json!(status));
    }

    Some(DslOutcome {
        severity,
        summary: Some(format!("stale for {} days", age.num_days())),
        details,
    })
}

fn eval_doc_orphan(
    spec: &DocOrphanSpec,
    payload: &Record,
    default_severity: SignalSeverity,
    now: DateTime<Utc>,
) -> Option<DslOutcome> {
    let created = first_timestamp(payload, &["createdAt", "created", "updatedAt"])?;
    let age = now.signed_duration_since(created);
    if age < spec.min_age.to_duration() {
        return None;
    }

    let view_count = payload
        .get("viewCount")
        .or_else(|| payload.get("views"))
        .and_then(|v| v.as_u64());
    if let Some(min_views) = spec.min_view_count {
        if !view_count.map(|v| v < min_views).unwrap_or(true) {
            return None;
        }
    }

    if spec.require_project_link {
        let linked = string_at(payload, "projectKey")
            .or_else(|| string_at(payload, "project"))
            .map(|p| !p.is_empty())
            .unwrap_or(false);
        if linked {
            return None;
        }
    }

    let space = string_at(payload, "spaceKey").or_else(|| string_at(payload, "space"));
    if !spec.space_include.is_empty()
        && !space.as_deref().map(|s| spec.space_include.iter().any(|i| i == s)).unwrap_or(false)
    {
        return None;
    }
    if let Some(space) = &space {
        if spec.space_exclude.iter().any(|e| e == space) {
            return None;
        }
    }

    let mut details = Record::new();
    details.insert("ageDays".to_string(), serde_json::json!(age.num_days()));
    if let Some(views) = view_count {
        details.insert("viewCount".to_string(), serde_json::json!(views));
    }

    Some(DslOutcome {
        severity: default_severity,
        summary: Some(format!("orphaned document, {} days old", age.num_days())),
        details,
    })
}

fn eval_generic(
    spec: &GenericFilterSpec,
    payload: &Record,
    default_severity: SignalSeverity,
) -> Option<DslOutcome> {
    if !spec.conditions.iter().all(|c| eval_condition(c, payload)) {
        return None;
    }

    let severity = spec
        .severity_rules
        .iter()
        .find(|rule| eval_condition(&rule.when, payload))
        .map(|rule| rule.severity)
        .unwrap_or(default_severity);

    let summary = spec
        .summary_template
        .as_deref()
        .map(|template| render_template(template, payload));

    Some(DslOutcome {
        severity,
        summary,
        details: Record::new(),
    })
}

fn eval_condition(condition: &Condition, payload: &Record) -> bool {
    let actual = lookup_path(payload, &condition.field);
    match condition.op {
        CompareOp::IsNull => actual.map(Value::is_null).unwrap_or(true),
        CompareOp::IsNotNull => actual.map(|v| !v.is_null()).unwrap_or(false),
        CompareOp::Eq => loose_eq(actual, condition.value.as_ref()),
        CompareOp::Neq => !loose_eq(actual, condition.value.as_ref()),
        CompareOp::In => in_set(actual, condition.value.as_ref()),
        CompareOp::NotIn => !in_set(actual, condition.value.as_ref()),
        CompareOp::Lt | CompareOp::Lte | CompareOp::Gt | CompareOp::Gte => {
            let (Some(actual), Some(expected)) = (actual, condition.value.as_ref()) else {
                return false;
            };
            match ordering(actual, expected) {
                Some(ord) => match condition.op {
                    CompareOp::Lt => ord.is_lt(),
                    CompareOp::Lte => ord.is_le(),
                    CompareOp::Gt => ord.is_gt(),
                    CompareOp::Gte => ord.is_ge(),
                    _ => unreachable!(),
                },
                None => false,
            }
        }
    }
}

fn loose_eq(actual: Option<&Value>, expected: Option<&Value>) -> bool {
    match (actual, expected) {
        (None, None) => true,
        (Some(a), Some(e)) => {
            if a == e {
                return true;
            }
            match (as_number(a), as_number(e)) {
                (Some(x), Some(y)) => x == y,
                _ => scalar_string(a) == scalar_string(e),
            }
        }
        _ => false,
    }
}

fn in_set(actual: Option<&Value>, expected: Option<&Value>) -> bool {
    let Some(Value::Array(set)) = expected else {
        return false;
    };
    set.iter().any(|candidate| loose_eq(actual, Some(candidate)))
}

fn ordering(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y);
    }
    Some(scalar_string(a)?.cmp(&scalar_string(b)?))
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Dotted-path lookup into a record.
pub fn lookup_path<'a>(payload: &'a Record, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = payload.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Substitute `{{field}}` tokens from record fields (dotted paths allowed).
pub fn render_template(template: &str, payload: &Record) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                if let Some(value) = lookup_path(payload, key) {
                    out.push_str(&scalar_string(value).unwrap_or_else(|| value.to_string()));
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// The `status` field may be a scalar or an object with a `name`.
fn string_at(payload: &Record, key: &str) -> Option<String> {
    let value = payload.get(key)?;
    value
        .as_str()
        .map(str::to_string)
        .or_else(|| value.get("name").and_then(|v| v.as_str()).map(str::to_string))
}

fn first_timestamp(payload: &Record, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter()
        .filter_map(|k| payload.get(*k))
        .filter_map(|v| v.as_str())
        .find_map(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(json: Value) -> Record {
        serde_json::from_value(json).unwrap()
    }

    fn stale_spec(json: Value) -> DslDocument {
        parse(&json).unwrap()
    }

    #[test]
    fn parse_rejects_unknown_version() {
        let err = parse(&serde_json::json!({
            "version": 2,
            "type": "cdm.generic.filter"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn stale_item_matches_on_age() {
        let doc = stale_spec(serde_json::json!({
            "version": 1,
            "type": "cdm.work.stale_item",
            "maxAge": {"unit": "days", "value": 7}
        }));
        let now = Utc::now();
        let stale = record(serde_json::json!({
            "updatedAt": (now - Duration::days(10)).to_rfc3339()
        }));
        let fresh = record(serde_json::json!({
            "updatedAt": (now - Duration::days(2)).to_rfc3339()
        }));

        assert!(doc.eval(&stale, SignalSeverity::Info, now).is_some());
        assert!(doc.eval(&fresh, SignalSeverity::Info, now).is_none());
    }

    #[test]
    fn stale_item_escalates_severity_by_age() {
        let doc = stale_spec(serde_json::json!({
            "version": 1,
            "type": "cdm.work.stale_item",
            "maxAge": {"unit": "days", "value": 7},
            "warnAfter": {"unit": "days", "value": 14},
            "errorAfter": {"unit": "days", "value": 30}
        }));
        let now = Utc::now();

        let at = |days: i64| {
            record(serde_json::json!({"updatedAt": (now - Duration::days(days)).to_rfc3339()}))
        };
        assert_eq!(
            doc.eval(&at(10), SignalSeverity::Info, now).unwrap().severity,
            SignalSeverity::Info
        );
        assert_eq!(
            doc.eval(&at(20), SignalSeverity::Info, now).unwrap().severity,
            SignalSeverity::Warning
        );
        assert_eq!(
            doc.eval(&at(40), SignalSeverity::Info, now).unwrap().severity,
            SignalSeverity::Error
        );
    }

    #[test]
    fn stale_item_honours_status_filters() {
        let doc = stale_spec(serde_json::json!({
            "version": 1,
            "type": "cdm.work.stale_item",
            "maxAge": {"unit": "days", "value": 7},
            "statusExclude": ["Done"]
        }));
        let now = Utc::now();
        let done = record(serde_json::json!({
            "updatedAt": (now - Duration::days(20)).to_rfc3339(),
            "status": {"name": "Done"}
        }));
        assert!(doc.eval(&done, SignalSeverity::Info, now).is_none());
    }

    #[test]
    fn doc_orphan_requires_missing_project_link() {
        let doc = stale_spec(serde_json::json!({
            "version": 1,
            "type": "cdm.doc.orphan",
            "minAge": {"unit": "days", "value": 30},
            "requireProjectLink": true
        }));
        let now = Utc::now();
        let orphan = record(serde_json::json!({
            "createdAt": (now - Duration::days(90)).to_rfc3339()
        }));
        let linked = record(serde_json::json!({
            "createdAt": (now - Duration::days(90)).to_rfc3339(),
            "projectKey": "CORE"
        }));
        assert!(doc.eval(&orphan, SignalSeverity::Info, now).is_some());
        assert!(doc.eval(&linked, SignalSeverity::Info, now).is_none());
    }

    #[test]
    fn doc_orphan_view_count_gate() {
        let doc = stale_spec(serde_json::json!({
            "version": 1,
            "type": "cdm.doc.orphan",
            "minAge": {"unit": "days", "value": 30},
            "minViewCount": 5
        }));
        let now = Utc::now();
        let quiet = record(serde_json::json!({
            "createdAt": (now - Duration::days(90)).to_rfc3339(),
            "viewCount": 2
        }));
        let popular = record(serde_json::json!({
            "createdAt": (now - Duration::days(90)).to_rfc3339(),
            "viewCount": 50
        }));
        assert!(doc.eval(&quiet, SignalSeverity::Info, now).is_some());
        assert!(doc.eval(&popular, SignalSeverity::Info, now).is_none());
    }

    #[test]
    fn generic_filter_is_conjunctive() {
        let doc = stale_spec(serde_json::json!({
            "version": 1,
            "type": "cdm.generic.filter",
            "where": [
                {"field": "severity", "op": "EQ", "value": "high"},
                {"field": "count", "op": "GTE", "value": 10}
            ]
        }));
        let now = Utc::now();
        let both = record(serde_json::json!({"severity": "high", "count": 12}));
        let one = record(serde_json::json!({"severity": "high", "count": 3}));
        assert!(doc.eval(&both, SignalSeverity::Info, now).is_some());
        assert!(doc.eval(&one, SignalSeverity::Info, now).is_none());
    }

    #[test]
    fn generic_filter_all_ops() {
        let payload = record(serde_json::json!({
            "n": 5,
            "s": "beta",
            "nested": {"flag": null}
        }));
        let check = |op: &str, field: &str, value: Value| -> bool {
            let condition: Condition = serde_json::from_value(serde_json::json!({
                "field": field, "op": op, "value": value
            }))
            .unwrap();
            eval_condition(&condition, &payload)
        };

        assert!(check("LT", "n", serde_json::json!(6)));
        assert!(check("LTE", "n", serde_json::json!(5)));
        assert!(check("GT", "n", serde_json::json!(4)));
        assert!(check("GTE", "n", serde_json::json!(5)));
        assert!(check("EQ", "s", serde_json::json!("beta")));
        assert!(check("NEQ", "s", serde_json::json!("alpha")));
        assert!(check("IN", "s", serde_json::json!(["alpha", "beta"])));
        assert!(check("NOT_IN", "s", serde_json::json!(["alpha", "gamma"])));
        assert!(check("IS_NULL", "nested.flag", Value::Null));
        assert!(check("IS_NULL", "missing", Value::Null));
        assert!(check("IS_NOT_NULL", "s", Value::Null));
    }

    #[test]
    fn severity_rules_first_match_wins() {
        let doc = stale_spec(serde_json::json!({
            "version": 1,
            "type": "cdm.generic.filter",
            "where": [],
            "severityRules": [
                {"when": {"field": "count", "op": "GTE", "value": 100}, "severity": "critical"},
                {"when": {"field": "count", "op": "GTE", "value": 10}, "severity": "warning"}
            ]
        }));
        let now = Utc::now();
        let big = record(serde_json::json!({"count": 500}));
        let mid = record(serde_json::json!({"count": 50}));
        let small = record(serde_json::json!({"count": 1}));

        assert_eq!(
            doc.eval(&big, SignalSeverity::Info, now).unwrap().severity,
            SignalSeverity::Critical
        );
        assert_eq!(
            doc.eval(&mid, SignalSeverity::Info, now).unwrap().severity,
            SignalSeverity::Warning
        );
        assert_eq!(
            doc.eval(&small, SignalSeverity::Info, now).unwrap().severity,
            SignalSeverity::Info
        );
    }

    #[test]
    fn summary_template_renders_fields() {
        let doc = stale_spec(serde_json::json!({
            "version": 1,
            "type": "cdm.generic.filter",
            "where": [],
            "summaryTemplate": "issue {{key}} has {{count}} open comments"
        }));
        let now = Utc::now();
        let payload = record(serde_json::json!({"key": "CORE-7", "count": 4}));
        let outcome = doc.eval(&payload, SignalSeverity::Info, now).unwrap();
        assert_eq!(
            outcome.summary.as_deref(),
            Some("issue CORE-7 has 4 open comments")
        );
    }
}
