//! Typed store clients over the generated gRPC stubs.
//!
//! Each wrapper implements the corresponding `trellis-common` trait so the
//! pipeline never sees tonic types. Generated clients are cheap to clone
//! (they share one HTTP/2 channel), so every call clones rather than
//! locking.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{anyhow, Context as _, Result};
use chrono::{DateTime, Utc};
use tonic::transport::Channel;

use trellis_common::{
    KgEdge, KgNode, KvStore, PutOutcome, Scope, SignalDefinition, SignalInstance,
    SignalSeverity, SignalStatus, ImplMode, VectorEntry, VectorFilter, VersionedValue,
    GraphSink, SignalStore, VectorStore,
};

use crate::pb;
use crate::pb::kg_service_client::KgServiceClient;
use crate::pb::kv_service_client::KvServiceClient;
use crate::pb::signal_service_client::SignalServiceClient;
use crate::pb::vector_service_client::VectorServiceClient;

/// gRPC endpoints are configured as `host:port`; tonic wants a URI.
fn endpoint_uri(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

// ---------------------------------------------------------------------------
// KV
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GrpcKvStore {
    client: KvServiceClient<Channel>,
}

impl GrpcKvStore {
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = KvServiceClient::connect(endpoint_uri(addr))
            .await
            .with_context(|| format!("connecting to KV service at {addr}"))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl KvStore for GrpcKvStore {
    async fn get(&self, scope: &Scope, key: &str) -> Result<Option<VersionedValue>> {
        let mut client = self.client.clone();
        let reply = client
            .get(pb::KvGetRequest {
                scope: Some(scope_to_pb(scope)),
                key: key.to_string(),
            })
            .await?
            .into_inner();

        if !reply.found {
            return Ok(None);
        }
        let value = serde_json::from_slice(&reply.value)
            .with_context(|| format!("decoding KV value for key {key}"))?;
        Ok(Some(VersionedValue {
            value,
            version: reply.version,
        }))
    }

    async fn put(
        &self,
        scope: &Scope,
        key: &str,
        value: serde_json::Value,
        expected_version: Option<u64>,
    ) -> Result<PutOutcome> {
        let mut client = self.client.clone();
        let reply = client
            .put(pb::KvPutRequest {
                scope: Some(scope_to_pb(scope)),
                key: key.to_string(),
                value: serde_json::to_vec(&value)?,
                expected_version,
            })
            .await?
            .into_inner();

        if reply.stored {
            Ok(PutOutcome::Stored {
                version: reply.version,
            })
        } else {
            Ok(PutOutcome::Conflict {
                current_version: reply.version,
            })
        }
    }
}

fn scope_to_pb(scope: &Scope) -> pb::Scope {
    pb::Scope {
        tenant_id: scope.tenant_id.clone(),
        project_id: scope.project_id.clone(),
    }
}

// ---------------------------------------------------------------------------
// Vector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GrpcVectorStore {
    client: VectorServiceClient<Channel>,
}

impl GrpcVectorStore {
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = VectorServiceClient::connect(endpoint_uri(addr))
            .await
            .with_context(|| format!("connecting to vector service at {addr}"))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl VectorStore for GrpcVectorStore {
    async fn upsert_entries(&self, entries: &[VectorEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut client = self.client.clone();
        client
            .upsert_entries(pb::UpsertEntriesRequest {
                entries: entries.iter().map(entry_to_pb).collect(),
            })
            .await?;
        Ok(())
    }

    async fn list_entries(&self, filter: &VectorFilter) -> Result<Vec<VectorEntry>> {
        let mut client = self.client.clone();
        let reply = client
            .list_entries(pb::ListEntriesRequest {
                tenant_id: filter.tenant_id.clone(),
                project_id: filter.project_id.clone(),
                profile_ids: filter.profile_ids.clone(),
                source_family: filter.source_family.clone().unwrap_or_default(),
                artifact_id: filter.artifact_id.clone().unwrap_or_default(),
                since_updated_at: filter
                    .since_updated_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
                limit: filter.limit,
            })
            .await?
            .into_inner();

        reply.entries.into_iter().map(entry_from_pb).collect()
    }

    async fn delete_by_artifact(
        &self,
        tenant_id: &str,
        artifact_id: &str,
        run_id: &str,
    ) -> Result<u64> {
        let mut client = self.client.clone();
        let reply = client
            .delete_by_artifact(pb::DeleteByArtifactRequest {
                tenant_id: tenant_id.to_string(),
                artifact_id: artifact_id.to_string(),
                run_id: run_id.to_string(),
            })
            .await?
            .into_inner();
        Ok(reply.deleted)
    }
}

fn entry_to_pb(e: &VectorEntry) -> pb::VectorEntry {
    pb::VectorEntry {
        tenant_id: e.tenant_id.clone(),
        project_id: e.project_id.clone(),
        profile_id: e.profile_id.clone(),
        node_id: e.node_id.clone(),
        source_family: e.source_family.clone(),
        artifact_id: e.artifact_id.clone(),
        run_id: e.run_id.clone(),
        entity_kind: e.entity_kind.clone(),
        content_text: e.content_text.clone(),
        embedding: e.embedding.clone(),
        metadata: e.metadata.clone().into_iter().collect(),
        updated_at: e.updated_at.to_rfc3339(),
    }
}

fn entry_from_pb(e: pb::VectorEntry) -> Result<VectorEntry> {
    let updated_at = parse_rfc3339(&e.updated_at)
        .with_context(|| format!("bad updatedAt on vector entry {}", e.node_id))?;
    Ok(VectorEntry {
        tenant_id: e.tenant_id,
        project_id: e.project_id,
        profile_id: e.profile_id,
        node_id: e.node_id,
        source_family: e.source_family,
        artifact_id: e.artifact_id,
        run_id: e.run_id,
        entity_kind: e.entity_kind,
        content_text: e.content_text,
        embedding: e.embedding,
        metadata: e.metadata.into_iter().collect::<BTreeMap<_, _>>(),
        updated_at,
    })
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| anyhow!("invalid RFC3339 timestamp {s:?}: {e}"))
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GrpcSignalStore {
    client: SignalServiceClient<Channel>,
}

impl GrpcSignalStore {
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = SignalServiceClient::connect(endpoint_uri(addr))
            .await
            .with_context(|| format!("connecting to signal service at {addr}"))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl SignalStore for GrpcSignalStore {
    async fn upsert_definition(&self, def: &SignalDefinition) -> Result<()> {
        let mut client = self.client.clone();
        client
            .upsert_definition(pb::UpsertDefinitionRequest {
                definition: Some(definition_to_pb(def)?),
            })
            .await?;
        Ok(())
    }

    async fn list_definitions(&self, source_family: &str) -> Result<Vec<SignalDefinition>> {
        let mut client = self.client.clone();
        let reply = client
            .list_definitions(pb::ListDefinitionsRequest {
                source_family: source_family.to_string(),
            })
            .await?
            .into_inner();
        reply
            .definitions
            .into_iter()
            .map(definition_from_pb)
            .collect()
    }

    async fn list_instances(&self, definition_id: &str) -> Result<Vec<SignalInstance>> {
        let mut client = self.client.clone();
        let reply = client
            .list_instances_for_definition(pb::ListInstancesRequest {
                definition_id: definition_id.to_string(),
            })
            .await?
            .into_inner();
        reply.instances.into_iter().map(instance_from_pb).collect()
    }

    async fn upsert_instance(&self, instance: &SignalInstance) -> Result<()> {
        let mut client = self.client.clone();
        client
            .upsert_instance(pb::UpsertInstanceRequest {
                instance: Some(instance_to_pb(instance)?),
            })
            .await?;
        Ok(())
    }

    async fn update_instance_status(
        &self,
        definition_id: &str,
        entity_ref: &str,
        status: SignalStatus,
    ) -> Result<()> {
        let mut client = self.client.clone();
        client
            .update_instance_status(pb::UpdateInstanceStatusRequest {
                definition_id: definition_id.to_string(),
                entity_ref: entity_ref.to_string(),
                status: status.to_string(),
            })
            .await?;
        Ok(())
    }
}

fn definition_to_pb(def: &SignalDefinition) -> Result<pb::SignalDefinition> {
    Ok(pb::SignalDefinition {
        id: def.id.clone(),
        slug: def.slug.clone(),
        source_family: def.source_family.clone(),
        entity_kind: def.entity_kind.clone(),
        severity: def.severity.to_string(),
        title: def.title.clone().unwrap_or_default(),
        impl_mode: match def.impl_mode {
            ImplMode::Code => "CODE".to_string(),
            ImplMode::Dsl => "DSL".to_string(),
        },
        definition_spec: match &def.definition_spec {
            Some(spec) => serde_json::to_string(spec)?,
            None => String::new(),
        },
    })
}

fn definition_from_pb(def: pb::SignalDefinition) -> Result<SignalDefinition> {
    let severity = SignalSeverity::from_str(&def.severity).map_err(|e| anyhow!(e))?;
    let impl_mode = match def.impl_mode.as_str() {
        "CODE" => ImplMode::Code,
        "DSL" => ImplMode::Dsl,
        other => return Err(anyhow!("unknown impl mode: {other}")),
    };
    let definition_spec = if def.definition_spec.is_empty() {
        None
    } else {
        Some(serde_json::from_str(&def.definition_spec)?)
    };
    Ok(SignalDefinition {
        id: def.id,
        slug: def.slug,
        source_family: def.source_family,
        entity_kind: def.entity_kind,
        severity,
        title: (!def.title.is_empty()).then_some(def.title),
        impl_mode,
        definition_spec,
    })
}

fn instance_to_pb(i: &SignalInstance) -> Result<pb::SignalInstance> {
    Ok(pb::SignalInstance {
        definition_id: i.definition_id.clone(),
        entity_ref: i.entity_ref.clone(),
        entity_kind: i.entity_kind.clone(),
        severity: i.severity.to_string(),
        status: i.status.to_string(),
        summary: i.summary.clone(),
        details: serde_json::to_string(&i.details)?,
        source_run_id: i.source_run_id.clone(),
    })
}

fn instance_from_pb(i: pb::SignalInstance) -> Result<SignalInstance> {
    let severity = SignalSeverity::from_str(&i.severity).map_err(|e| anyhow!(e))?;
    let status = match i.status.as_str() {
        "OPEN" => SignalStatus::Open,
        "RESOLVED" => SignalStatus::Resolved,
        "SUPPRESSED" => SignalStatus::Suppressed,
        other => return Err(anyhow!("unknown instance status: {other}")),
    };
    let details = if i.details.is_empty() {
        Default::default()
    } else {
        serde_json::from_str(&i.details)?
    };
    Ok(SignalInstance {
        definition_id: i.definition_id,
        entity_ref: i.entity_ref,
        entity_kind: i.entity_kind,
        severity,
        status,
        summary: i.summary,
        details,
        source_run_id: i.source_run_id,
    })
}

// ---------------------------------------------------------------------------
// Knowledge graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GrpcGraphSink {
    client: KgServiceClient<Channel>,
}

impl GrpcGraphSink {
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = KgServiceClient::connect(endpoint_uri(addr))
            .await
            .with_context(|| format!("connecting to KG service at {addr}"))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl GraphSink for GrpcGraphSink {
    async fn upsert_node(&self, node: &KgNode) -> Result<()> {
        let mut client = self.client.clone();
        client
            .upsert_node(pb::UpsertNodeRequest {
                node: Some(pb::KgNode {
                    id: node.id.clone(),
                    r#type: node.node_type.clone(),
                    properties: node.properties.clone().into_iter().collect(),
                }),
            })
            .await?;
        Ok(())
    }

    async fn upsert_edge(&self, edge: &KgEdge) -> Result<()> {
        let mut client = self.client.clone();
        client
            .upsert_edge(pb::UpsertEdgeRequest {
                edge: Some(pb::KgEdge {
                    id: edge.id.clone(),
                    r#type: edge.edge_type.clone(),
                    from_id: edge.from_id.clone(),
                    to_id: edge.to_id.clone(),
                    properties: edge.properties.clone().into_iter().collect(),
                }),
            })
            .await?;
        Ok(())
    }
}
