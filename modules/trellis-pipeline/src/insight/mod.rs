//! Insight extractor: skill-templated LLM calls per record, gated by
//! required inputs, deduplicated by a content signature in the KV store,
//! normalized and validated before landing in the knowledge graph.

pub mod skill;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use llm_client::ChatModel;
use trellis_common::{
    content_hash, GraphSink, Insight, InsightSummary, KbOp, KgEdge, KgNode, KvStore, Record,
    RecordEnvelope, RecordKind, Scope, Sentiment, TrellisError,
};
use trellis_endpoint::Registries;
use trellis_store::insight_key;

use crate::events::KbEventLog;
use crate::signal::entity_ref;
use self::skill::{Skill, SkillRegistry};

/// Rendered `{{payload}}` dumps are capped at this many characters.
const PAYLOAD_DUMP_CHARS: usize = 2_000;

/// Fallback echo insights truncate the payload to this many characters.
const FALLBACK_ECHO_CHARS: usize = 500;

const SYSTEM_PROMPT: &str =
    "You are a metadata insight extractor. Respond only with valid JSON.";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsightStats {
    pub skipped_missing: u64,
    pub cache_hits: u64,
    pub errors: u64,
    pub parsed: u64,
}

impl std::fmt::Display for InsightStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "parsed={} cacheHits={} skippedMissing={} errors={}",
            self.parsed, self.cache_hits, self.skipped_missing, self.errors
        )
    }
}

/// Run-scoped counters. Monotonic, incremented from the single pipeline
/// task but safe under concurrent readers.
#[derive(Default)]
struct Counters {
    skipped_missing: AtomicU64,
    cache_hits: AtomicU64,
    errors: AtomicU64,
    parsed: AtomicU64,
}

pub struct InsightExtractor {
    kv: Arc<dyn KvStore>,
    graph: Arc<dyn GraphSink>,
    chat: Option<Arc<dyn ChatModel>>,
    skills: Arc<SkillRegistry>,
    registries: Arc<Registries>,
    scope: Scope,
    counters: Counters,
}

impl InsightExtractor {
    pub fn new(
        kv: Arc<dyn KvStore>,
        graph: Arc<dyn GraphSink>,
        chat: Option<Arc<dyn ChatModel>>,
        skills: Arc<SkillRegistry>,
        registries: Arc<Registries>,
        scope: Scope,
    ) -> Self {
        Self {
            kv,
            graph,
            chat,
            skills,
            registries,
            scope,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> InsightStats {
        InsightStats {
            skipped_missing: self.counters.skipped_missing.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            parsed: self.counters.parsed.load(Ordering::Relaxed),
        }
    }

    /// Process one staged record. Returns the emitted insights, or `None`
    /// when the record was gated out or served from cache.
    pub async fn process(
        &self,
        envelope: &RecordEnvelope,
        events: &mut KbEventLog,
    ) -> Result<Option<Vec<Insight>>, TrellisError> {
        let Some(skill) = self.skills.pick_for(&envelope.source.source_family) else {
            return Ok(None);
        };

        let Some(entity) = entity_ref(&envelope.payload) else {
            self.counters.skipped_missing.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        // CDM mapping when the skill prefers it and the envelope still
        // carries the raw shape.
        let payload: Record = if skill.prefer_cdm && envelope.record_kind != RecordKind::Cdm {
            match self.registries.cdm.mapping_for(&envelope.source.source_id) {
                Some(mapping) => (mapping.mapper)(&envelope.payload),
                None => envelope.payload.clone(),
            }
        } else {
            envelope.payload.clone()
        };

        let params = flatten_params(&payload, &envelope.entity_kind);

        // Required-input gating with entity-kind aliasing.
        for field in &skill.input_schema.required {
            let aliased = format!("{}.{field}", envelope.entity_kind);
            let present = params
                .get(field)
                .or_else(|| params.get(&aliased))
                .map(|v| !v.is_empty())
                .unwrap_or(false);
            if !present {
                self.counters.skipped_missing.fetch_add(1, Ordering::Relaxed);
                debug!(
                    skill_id = %skill.id,
                    entity = %entity,
                    field = %field,
                    "Skipping record: required input missing"
                );
                return Ok(None);
            }
        }

        // Signature dedup: identical inputs never re-prompt the model.
        let params_canonical =
            serde_json::to_string(&params).map_err(|e| TrellisError::Data(e.to_string()))?;
        let signature = content_hash(&format!("{}|{entity}|{params_canonical}", skill.id));
        let cache_key = insight_key(&skill.id, &entity);

        let stored = self
            .kv
            .get(&self.scope, &cache_key)
            .await
            .map_err(TrellisError::Anyhow)?;
        if let Some(stored) = stored {
            let stored_signature = stored
                .value
                .get("signature")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if stored_signature == signature {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        }

        let prompt = render(&skill.template, &params, &payload);

        let (insights, from_llm) = self.generate(&skill, &entity, &payload, &prompt).await;
        if insights.is_empty() {
            return Ok(None);
        }

        for (index, insight) in insights.iter().enumerate() {
            self.emit_graph(&skill, &entity, index, insight, events).await;
        }

        if from_llm {
            self.counters
                .parsed
                .fetch_add(insights.len() as u64, Ordering::Relaxed);
            let value = serde_json::json!({
                "signature": signature,
                "ttlSeconds": skill.cache.ttl_seconds,
                "savedAt": Utc::now().to_rfc3339(),
            });
            if let Err(e) = self.kv.put(&self.scope, &cache_key, value, None).await {
                warn!(key = %cache_key, error = %e, "Failed to save insight signature");
            }
        }

        Ok(Some(insights))
    }

    /// Call the model and parse its reply; any failure degrades to the
    /// truncated-echo fallback insight. The bool is true for real model
    /// output (fallbacks are never signature-cached).
    async fn generate(
        &self,
        skill: &Skill,
        entity: &str,
        payload: &Record,
        prompt: &str,
    ) -> (Vec<Insight>, bool) {
        let reply = match &self.chat {
            Some(chat) => match chat.chat_completion(SYSTEM_PROMPT, prompt).await {
                Ok(text) if !text.trim().is_empty() => Some((text, chat.provider().to_string())),
                Ok(_) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(skill_id = %skill.id, entity, "Empty LLM reply, using fallback insight");
                    None
                }
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(skill_id = %skill.id, entity, error = %e, "LLM call failed, using fallback insight");
                    None
                }
            },
            None => None,
        };

        match reply {
            Some((text, provider)) => match parse_insights(&text, skill, entity, &provider) {
                Ok(insights) if !insights.is_empty() => (insights, true),
                Ok(_) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    (vec![fallback_insight(skill, entity, payload)], false)
                }
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(skill_id = %skill.id, entity, error = %e, "Unparseable LLM reply, using fallback insight");
                    (vec![fallback_insight(skill, entity, payload)], false)
                }
            },
            None => (vec![fallback_insight(skill, entity, payload)], false),
        }
    }

    async fn emit_graph(
        &self,
        skill: &Skill,
        entity: &str,
        index: usize,
        insight: &Insight,
        events: &mut KbEventLog,
    ) {
        let node_id = if index == 0 {
            format!("insight:{}:{entity}", skill.id)
        } else {
            format!("insight:{}:{entity}:{index}", skill.id)
        };

        // Scalar fields become plain strings, complex fields JSON.
        let mut properties = BTreeMap::new();
        properties.insert("provider".to_string(), insight.provider.clone());
        properties.insert("promptId".to_string(), insight.prompt_id.clone());
        properties.insert("summary".to_string(), insight.summary.text.clone());
        properties.insert(
            "confidence".to_string(),
            format!("{:.2}", insight.summary.confidence),
        );
        properties.insert(
            "escalationScore".to_string(),
            format!("{:.2}", insight.escalation_score),
        );
        properties.insert(
            "sentiment".to_string(),
            serde_json::to_string(&insight.sentiment).unwrap_or_default(),
        );
        if !insight.signals.is_empty() {
            properties.insert(
                "signals".to_string(),
                serde_json::to_string(&insight.signals).unwrap_or_default(),
            );
        }
        if !insight.tags.is_empty() {
            properties.insert(
                "tags".to_string(),
                serde_json::to_string(&insight.tags).unwrap_or_default(),
            );
        }
        if let Some(requirement) = &insight.requirement {
            properties.insert("requirement".to_string(), requirement.clone());
        }
        if !insight.waiting_on.is_empty() {
            properties.insert(
                "waitingOn".to_string(),
                serde_json::to_string(&insight.waiting_on).unwrap_or_default(),
            );
        }

        let node = KgNode {
            id: node_id.clone(),
            node_type: "insight".to_string(),
            properties,
        };
        if let Err(e) = self.graph.upsert_node(&node).await {
            warn!(node_id = %node.id, error = %e, "Insight node upsert failed");
        }
        events.record(KbOp::UpsertNode, "insight", &node_id, &insight.summary.text);

        let edge = KgEdge {
            id: format!("{node_id}|about"),
            edge_type: "about".to_string(),
            from_id: node_id,
            to_id: entity.to_string(),
            properties: Default::default(),
        };
        if let Err(e) = self.graph.upsert_edge(&edge).await {
            warn!(edge_id = %edge.id, error = %e, "Insight edge upsert failed");
        }
        events.record(KbOp::UpsertEdge, "about", &edge.id, entity);
    }
}

// ---------------------------------------------------------------------------
// Params, rendering, parsing
// ---------------------------------------------------------------------------

/// Flatten a payload one level: scalars keep their key, keys of nested
/// sections gain an `<entityKind>.` prefix, arrays are JSON-encoded.
fn flatten_params(payload: &Record, entity_kind: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    for (key, value) in payload {
        match value {
            Value::Object(section) => {
                for (inner_key, inner_value) in section {
                    if let Some(s) = scalar_to_string(inner_value) {
                        params.insert(format!("{entity_kind}.{inner_key}"), s);
                    }
                }
            }
            Value::Array(_) => {
                params.insert(key.clone(), value.to_string());
            }
            other => {
                if let Some(s) = scalar_to_string(other) {
                    params.insert(key.clone(), s);
                }
            }
        }
    }
    params
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

/// Substitute `{{key}}` tokens from the params map; `{{payload}}` renders
/// a truncated JSON dump of the whole record.
fn render(template: &str, params: &BTreeMap<String, String>, payload: &Record) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                if key == "payload" {
                    let dump = serde_json::to_string(payload).unwrap_or_default();
                    out.push_str(truncate_chars(&dump, PAYLOAD_DUMP_CHARS));
                } else if let Some(value) = params.get(key) {
                    out.push_str(value);
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

fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// What the model actually returns; everything is optional and
/// normalized afterwards.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartialInsight {
    #[serde(default)]
    summary: Option<SummaryField>,
    #[serde(default)]
    sentiment: Option<Sentiment>,
    #[serde(default)]
    signals: Vec<String>,
    #[serde(default)]
    escalation_score: f64,
    #[serde(default)]
    requirement: Option<String>,
    #[serde(default)]
    waiting_on: Vec<String>,
    #[serde(default)]
    metadata: Record,
    #[serde(default)]
    tags: Vec<String>,
}

/// Models return `summary` as either a bare string or the structured
/// object; accept both.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SummaryField {
    Text(String),
    Structured(InsightSummary),
}

fn parse_insights(
    text: &str,
    skill: &Skill,
    entity: &str,
    provider: &str,
) -> anyhow::Result<Vec<Insight>> {
    let cleaned = strip_code_fences(text);
    let value: Value = serde_json::from_str(cleaned)?;

    let partials: Vec<PartialInsight> = match value {
        Value::Array(items) => items
            .into_iter()
            .take(skill.max_insights)
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()?,
        object => vec![serde_json::from_value(object)?],
    };

    let now = Utc::now();
    let insights = partials
        .into_iter()
        .filter_map(|partial| normalize(partial, skill, entity, provider, now))
        .collect();
    Ok(insights)
}

/// Apply defaults and drop invalid insights (empty summary text).
fn normalize(
    partial: PartialInsight,
    skill: &Skill,
    entity: &str,
    provider: &str,
    now: chrono::DateTime<Utc>,
) -> Option<Insight> {
    let summary = match partial.summary? {
        SummaryField::Text(text) => InsightSummary {
            text,
            confidence: 0.0,
        },
        SummaryField::Structured(summary) => summary,
    };
    if summary.text.trim().is_empty() {
        return None;
    }

    let mut sentiment = partial.sentiment.unwrap_or_default();
    if sentiment.label.trim().is_empty() {
        sentiment.label = "neutral".to_string();
    }
    sentiment.label = sentiment.label.to_lowercase();

    Some(Insight {
        provider: provider.to_string(),
        prompt_id: skill.id.clone(),
        entity_ref: entity.to_string(),
        generated_at: now,
        summary,
        sentiment,
        signals: partial.signals.iter().map(|s| s.to_lowercase()).collect(),
        escalation_score: partial.escalation_score.clamp(0.0, 1.0),
        requirement: partial.requirement.filter(|r| !r.is_empty()),
        waiting_on: partial.waiting_on,
        metadata: partial.metadata,
        tags: partial.tags,
    })
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

fn fallback_insight(skill: &Skill, entity: &str, payload: &Record) -> Insight {
    let dump = serde_json::to_string(payload).unwrap_or_default();
    Insight {
        provider: "fallback".to_string(),
        prompt_id: skill.id.clone(),
        entity_ref: entity.to_string(),
        generated_at: Utc::now(),
        summary: InsightSummary {
            text: truncate_chars(&dump, FALLBACK_ECHO_CHARS).to_string(),
            confidence: 0.0,
        },
        sentiment: Sentiment::default(),
        signals: Vec::new(),
        escalation_score: 0.0,
        requirement: None,
        waiting_on: Vec::new(),
        metadata: Record::new(),
        tags: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insight::skill::GENERIC_SKILL;

    fn record(json: Value) -> Record {
        serde_json::from_value(json).unwrap()
    }

    fn test_skill() -> Skill {
        Skill {
            id: GENERIC_SKILL.to_string(),
            template: "entity {{key}}\n{{payload}}".to_string(),
            input_schema: Default::default(),
            model: Default::default(),
            cache: Default::default(),
            prefer_cdm: false,
            max_insights: 2,
        }
    }

    #[test]
    fn flatten_prefixes_nested_sections() {
        let payload = record(serde_json::json!({
            "title": "T",
            "count": 3,
            "fields": {"status": "open", "points": 5},
            "labels": ["a", "b"]
        }));
        let params = flatten_params(&payload, "work_item");
        assert_eq!(params["title"], "T");
        assert_eq!(params["count"], "3");
        assert_eq!(params["work_item.status"], "open");
        assert_eq!(params["work_item.points"], "5");
        assert_eq!(params["labels"], "[\"a\",\"b\"]");
    }

    #[test]
    fn render_substitutes_params_and_payload() {
        let payload = record(serde_json::json!({"key": "CORE-1"}));
        let params = flatten_params(&payload, "work_item");
        let rendered = render("issue {{key}} -> {{payload}}", &params, &payload);
        assert!(rendered.starts_with("issue CORE-1 -> {"));
        assert!(rendered.contains("CORE-1"));
    }

    #[test]
    fn render_truncates_payload_dump() {
        let big = "x".repeat(10_000);
        let payload = record(serde_json::json!({"body": big}));
        let params = flatten_params(&payload, "doc");
        let rendered = render("{{payload}}", &params, &payload);
        assert!(rendered.chars().count() <= PAYLOAD_DUMP_CHARS);
    }

    #[test]
    fn parse_accepts_single_object_and_array() {
        let skill = test_skill();
        let single = r#"{"summary": {"text": "one", "confidence": 0.8}}"#;
        let insights = parse_insights(single, &skill, "E-1", "anthropic").unwrap();
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].summary.text, "one");
        assert_eq!(insights[0].sentiment.label, "neutral");

        let array = r#"[
            {"summary": "a"},
            {"summary": "b"},
            {"summary": "c"}
        ]"#;
        let insights = parse_insights(array, &skill, "E-1", "anthropic").unwrap();
        // Capped at max_insights.
        assert_eq!(insights.len(), 2);
    }

    #[test]
    fn parse_tolerates_code_fences() {
        let skill = test_skill();
        let fenced = "```json\n{\"summary\": \"fenced\"}\n```";
        let insights = parse_insights(fenced, &skill, "E-1", "openai").unwrap();
        assert_eq!(insights[0].summary.text, "fenced");
    }

    #[test]
    fn empty_summary_is_dropped() {
        let skill = test_skill();
        let insights =
            parse_insights(r#"{"summary": {"text": "  "}}"#, &skill, "E-1", "openai").unwrap();
        assert!(insights.is_empty());
    }

    #[test]
    fn normalization_defaults_and_clamps() {
        let skill = test_skill();
        let reply = r#"{"summary": "s", "sentiment": {"label": "NEGATIVE", "score": -0.4, "tones": []},
                        "signals": ["WARNING"], "escalationScore": 7.5}"#;
        let insight = parse_insights(reply, &skill, "E-1", "openai")
            .unwrap()
            .remove(0);
        assert_eq!(insight.sentiment.label, "negative");
        assert_eq!(insight.signals, vec!["warning".to_string()]);
        assert!((insight.escalation_score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn fallback_is_truncated_neutral_echo() {
        let skill = test_skill();
        let payload = record(serde_json::json!({"body": "y".repeat(2_000)}));
        let insight = fallback_insight(&skill, "E-1", &payload);
        assert_eq!(insight.provider, "fallback");
        assert_eq!(insight.sentiment.label, "neutral");
        assert!(insight.summary.text.chars().count() <= FALLBACK_ECHO_CHARS);
        assert!(!insight.summary.text.is_empty());
    }
}
