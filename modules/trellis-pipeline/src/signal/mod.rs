//! Signal engine: evaluate CODE and DSL definitions against staged
//! records, upsert instances keyed by `(definitionId, entityRef)`, and
//! reconcile: previously-OPEN instances that stopped matching become
//! RESOLVED, suppressed instances are never touched.

pub mod dsl;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use trellis_common::{
    GraphSink, ImplMode, KbOp, KgEdge, KgNode, Record, RecordEnvelope, SignalDefinition,
    SignalInstance, SignalStatus, SignalStore, TrellisError,
};

use crate::events::KbEventLog;
use self::dsl::{DslDocument, DslOutcome};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalStats {
    pub records: u64,
    pub evaluated: u64,
    pub matched: u64,
    pub opened: u64,
    pub resolved: u64,
    pub suppressed_kept: u64,
}

impl std::fmt::Display for SignalStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "records={} evaluated={} matched={} opened={} resolved={} suppressed={}",
            self.records, self.evaluated, self.matched, self.opened, self.resolved,
            self.suppressed_kept
        )
    }
}

/// The record field priority for an instance's entity reference.
pub fn entity_ref(payload: &Record) -> Option<String> {
    for key in ["entityRef", "id", "key"] {
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

pub struct SignalEngine {
    signals: Arc<dyn SignalStore>,
    graph: Arc<dyn GraphSink>,
}

impl SignalEngine {
    pub fn new(signals: Arc<dyn SignalStore>, graph: Arc<dyn GraphSink>) -> Self {
        Self { signals, graph }
    }

    /// Open a run session: loads the definitions for a source family and
    /// preloads every existing instance so reconciliation can observe the
    /// whole run before resolving anything.
    pub async fn session(
        &self,
        source_family: &str,
        run_id: &str,
    ) -> Result<SignalSession, TrellisError> {
        let definitions = self
            .signals
            .list_definitions(source_family)
            .await
            .map_err(TrellisError::Anyhow)?;

        let mut parsed: Vec<(SignalDefinition, Option<DslDocument>)> =
            Vec::with_capacity(definitions.len());
        let mut preloaded: HashMap<(String, String), SignalInstance> = HashMap::new();

        for definition in definitions {
            let doc = match definition.impl_mode {
                ImplMode::Code => None,
                ImplMode::Dsl => match &definition.definition_spec {
                    Some(spec) => match dsl::parse(spec) {
                        Ok(doc) => Some(doc),
                        Err(e) => {
                            warn!(definition_id = %definition.id, error = %e, "Skipping unparseable DSL definition");
                            continue;
                        }
                    },
                    None => {
                        warn!(definition_id = %definition.id, "DSL definition without a spec, skipping");
                        continue;
                    }
                },
            };

            let instances = self
                .signals
                .list_instances(&definition.id)
                .await
                .map_err(TrellisError::Anyhow)?;
            for instance in instances {
                preloaded.insert(
                    (instance.definition_id.clone(), instance.entity_ref.clone()),
                    instance,
                );
            }
            parsed.push((definition, doc));
        }

        Ok(SignalSession {
            signals: Arc::clone(&self.signals),
            graph: Arc::clone(&self.graph),
            definitions: parsed,
            preloaded,
            seen: HashSet::new(),
            run_id: run_id.to_string(),
            stats: SignalStats::default(),
        })
    }
}

pub struct SignalSession {
    signals: Arc<dyn SignalStore>,
    graph: Arc<dyn GraphSink>,
    definitions: Vec<(SignalDefinition, Option<DslDocument>)>,
    preloaded: HashMap<(String, String), SignalInstance>,
    seen: HashSet<(String, String)>,
    run_id: String,
    stats: SignalStats,
}

impl SignalSession {
    /// Evaluate one staged record against every applicable definition.
    pub async fn observe(
        &mut self,
        envelope: &RecordEnvelope,
        events: &mut KbEventLog,
    ) -> Result<(), TrellisError> {
        self.stats.records += 1;
        let now = Utc::now();

        // Collect matches first; definitions are borrowed, upserts await.
        let mut hits: Vec<(SignalDefinition, DslOutcome, String)> = Vec::new();
        for (definition, doc) in &self.definitions {
            if !definition.entity_kind.is_empty()
                && definition.entity_kind != "*"
                && definition.entity_kind != envelope.entity_kind
            {
                continue;
            }
            self.stats.evaluated += 1;

            let outcome = match (definition.impl_mode, doc) {
                (ImplMode::Code, _) => Some(DslOutcome {
                    severity: definition.severity,
                    summary: None,
                    details: Record::new(),
                }),
                (ImplMode::Dsl, Some(doc)) => {
                    doc.eval(&envelope.payload, definition.severity, now)
                }
                (ImplMode::Dsl, None) => None,
            };
            let Some(outcome) = outcome else { continue };

            let Some(entity) = entity_ref(&envelope.payload) else {
                continue;
            };
            hits.push((definition.clone(), outcome, entity));
        }

        for (definition, outcome, entity) in hits {
            self.stats.matched += 1;
            let key = (definition.id.clone(), entity.clone());
            self.seen.insert(key.clone());

            if let Some(existing) = self.preloaded.get(&key) {
                if existing.status == SignalStatus::Suppressed {
                    // Manual suppression survives every run.
                    self.stats.suppressed_kept += 1;
                    continue;
                }
            }

            let summary = outcome.summary.unwrap_or_else(|| {
                let label = definition.title.as_deref().unwrap_or(&definition.slug);
                format!("{label}: {entity}")
            });
            let instance = SignalInstance {
                definition_id: definition.id.clone(),
                entity_ref: entity.clone(),
                entity_kind: envelope.entity_kind.clone(),
                severity: outcome.severity,
                status: SignalStatus::Open,
                summary,
                details: outcome.details,
                source_run_id: self.run_id.clone(),
            };
            self.signals
                .upsert_instance(&instance)
                .await
                .map_err(TrellisError::Anyhow)?;
            self.stats.opened += 1;

            self.emit_graph(&definition, &instance, events).await;
        }
        Ok(())
    }

    /// Finish the run: every previously-OPEN instance that was not seen
    /// again transitions to RESOLVED.
    pub async fn reconcile(
        mut self,
        events: &mut KbEventLog,
    ) -> Result<SignalStats, TrellisError> {
        for (key, instance) in &self.preloaded {
            if instance.status != SignalStatus::Open || self.seen.contains(key) {
                continue;
            }
            self.signals
                .update_instance_status(&key.0, &key.1, SignalStatus::Resolved)
                .await
                .map_err(TrellisError::Anyhow)?;
            self.stats.resolved += 1;
            events.record(
                KbOp::UpsertNode,
                "signal",
                &format!("signal:{}:{}", key.0, key.1),
                "RESOLVED",
            );
        }

        info!(run_id = %self.run_id, stats = %self.stats, "Signal run reconciled");
        Ok(self.stats)
    }

    pub fn stats(&self) -> &SignalStats {
        &self.stats
    }

    /// Upsert the signal node plus its `instance_of` and `flags` edges.
    /// Graph failures are logged, never fatal.
    async fn emit_graph(
        &self,
        definition: &SignalDefinition,
        instance: &SignalInstance,
        events: &mut KbEventLog,
    ) {
        let node_id = format!("signal:{}:{}", definition.id, instance.entity_ref);
        let mut properties = std::collections::BTreeMap::new();
        properties.insert("severity".to_string(), instance.severity.to_string());
        properties.insert("status".to_string(), instance.status.to_string());
        properties.insert("summary".to_string(), instance.summary.clone());
        properties.insert("sourceRunId".to_string(), instance.source_run_id.clone());

        let node = KgNode {
            id: node_id.clone(),
            node_type: "signal".to_string(),
            properties,
        };
        if let Err(e) = self.graph.upsert_node(&node).await {
            warn!(node_id = %node.id, error = %e, "Signal node upsert failed");
        }
        events.record(KbOp::UpsertNode, "signal", &node_id, &instance.summary);

        let instance_of = KgEdge {
            id: format!("{node_id}|instance_of"),
            edge_type: "instance_of".to_string(),
            from_id: node_id.clone(),
            to_id: definition.id.clone(),
            properties: Default::default(),
        };
        if let Err(e) = self.graph.upsert_edge(&instance_of).await {
            warn!(edge_id = %instance_of.id, error = %e, "instance_of edge upsert failed");
        }
        events.record(KbOp::UpsertEdge, "instance_of", &instance_of.id, &definition.id);

        let flags = KgEdge {
            id: format!("{node_id}|flags"),
            edge_type: "flags".to_string(),
            from_id: node_id,
            to_id: instance.entity_ref.clone(),
            properties: Default::default(),
        };
        if let Err(e) = self.graph.upsert_edge(&flags).await {
            warn!(edge_id = %flags.id, error = %e, "flags edge upsert failed");
        }
        events.record(KbOp::UpsertEdge, "flags", &flags.id, &instance.entity_ref);
    }
}
