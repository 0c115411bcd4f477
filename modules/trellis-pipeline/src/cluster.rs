//! Cluster builder: greedy centroid assignment refined by connected
//! components over a similarity graph, with deterministic cluster ids and
//! a CAS-versioned centroid cache.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use trellis_common::{
    sha1_hex, slugify, Checkpoint, Cluster, GraphSink, KbOp, KgEdge, KgNode, KvStore, PutOutcome,
    RelatedCluster, Scope, TrellisError, VectorEntry, VectorFilter, VectorStore,
};
use trellis_store::{cluster_key, CheckpointEngine, LogStore};

use crate::events::KbEventLog;

/// Entries considered per run; older backlog waits for the next run.
pub const MAX_ENTRIES_PER_RUN: usize = 300;

const CACHE_CAS_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct ClusterRequest {
    pub dataset_id: String,
    pub source_family: Option<String>,
    pub artifact_id: Option<String>,
    pub run_id: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ClusterThresholds {
    /// Greedy assignment threshold (`CLUSTER_SIM_THRESHOLD`, default 0.35).
    pub sim_threshold: f32,
    /// Similarity-graph edge threshold (`CLUSTER_GRAPH_THRESHOLD`, default 0.45).
    pub graph_threshold: f32,
    /// Greedy cluster size cap (`CLUSTER_MAX_SIZE`, default 5).
    pub max_cluster_size: usize,
}

impl ClusterThresholds {
    pub fn from_config(config: &trellis_common::Config) -> Self {
        Self {
            sim_threshold: config.cluster_sim_threshold,
            graph_threshold: config.cluster_graph_threshold,
            max_cluster_size: config.cluster_max_size,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ClusterStats {
    pub entries: u64,
    pub clusters: u32,
    pub cache_hits: u32,
    pub related_edges: u32,
    pub status: String,
}

impl std::fmt::Display for ClusterStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Clustering Complete ===")?;
        writeln!(f, "Entries:       {}", self.entries)?;
        writeln!(f, "Clusters:      {}", self.clusters)?;
        writeln!(f, "Cache hits:    {}", self.cache_hits)?;
        writeln!(f, "Related edges: {}", self.related_edges)?;
        writeln!(f, "Status:        {}", self.status)?;
        Ok(())
    }
}

/// One cached centroid record inside `cluster:centroids:<dataset>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedCentroid {
    centroid: Vec<f32>,
    size: u32,
    avg_sim: f32,
    max_sim: f32,
    updated_at: DateTime<Utc>,
    edge_degree: u32,
    member_hash: String,
    #[serde(default)]
    top_related: Vec<RelatedCluster>,
    dim: usize,
}

pub struct ClusterBuilder {
    kv: Arc<dyn KvStore>,
    vectors: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphSink>,
    checkpoints: Arc<CheckpointEngine>,
    log: Option<LogStore>,
    scope: Scope,
    thresholds: ClusterThresholds,
}

impl ClusterBuilder {
    pub fn new(
        kv: Arc<dyn KvStore>,
        vectors: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphSink>,
        checkpoints: Arc<CheckpointEngine>,
        log: Option<LogStore>,
        scope: Scope,
        thresholds: ClusterThresholds,
    ) -> Self {
        Self {
            kv,
            vectors,
            graph,
            checkpoints,
            log,
            scope,
            thresholds,
        }
    }

    pub async fn run(
        &self,
        req: ClusterRequest,
        cancel: &CancellationToken,
    ) -> Result<ClusterStats, TrellisError> {
        let mut stats = ClusterStats::default();
        let dataset_slug = slugify(&req.dataset_id);
        let checkpoint_key = cluster_key(&dataset_slug);

        // Entries updated since the last cluster run.
        let since = self
            .checkpoints
            .load(&self.scope, &checkpoint_key)
            .await
            .map_err(TrellisError::Anyhow)?
            .and_then(|cp| {
                cp.extra
                    .get("lastUpdatedAt")
                    .and_then(|v| v.as_str())
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
            });

        let mut entries = self
            .vectors
            .list_entries(&VectorFilter {
                tenant_id: self.scope.tenant_id.clone(),
                project_id: self.scope.project_id.clone(),
                profile_ids: Vec::new(),
                source_family: req.source_family.clone(),
                artifact_id: req.artifact_id.clone(),
                since_updated_at: since,
                limit: MAX_ENTRIES_PER_RUN as u32,
            })
            .await
            .map_err(TrellisError::Anyhow)?;

        // Deterministic iteration order, and a single embedding dimension
        // per run; mixed-dim strays are dropped.
        entries.retain(|e| !e.embedding.is_empty());
        entries.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        if let Some(dim) = entries.first().map(|e| e.embedding.len()) {
            entries.retain(|e| e.embedding.len() == dim);
        }
        entries.truncate(MAX_ENTRIES_PER_RUN);
        stats.entries = entries.len() as u64;

        if entries.is_empty() {
            stats.status = "no_entries".to_string();
            return Ok(stats);
        }
        if cancel.is_cancelled() {
            stats.status = "cancelled".to_string();
            return Ok(stats);
        }

        let latest_updated = entries
            .iter()
            .map(|e| e.updated_at)
            .max()
            .unwrap_or_else(Utc::now);

        // 1. Greedy pass, 2. graph-component refinement.
        let embeddings: Vec<&[f32]> = entries.iter().map(|e| e.embedding.as_slice()).collect();
        let greedy = greedy_assign(
            &embeddings,
            self.thresholds.sim_threshold,
            self.thresholds.max_cluster_size,
        );
        let groups = refine_with_components(&embeddings, greedy, self.thresholds.graph_threshold);

        // 3. Stable ids + per-cluster stats.
        let mut clusters: Vec<Cluster> = groups
            .iter()
            .map(|members| build_cluster(&req.dataset_id, &entries, &embeddings, members, self.thresholds.graph_threshold))
            .collect();
        clusters.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));

        // 4. Centroid cache.
        let cache_key = format!("cluster:centroids:{dataset_slug}");
        let (mut cache, cache_version) = self.load_cache(&cache_key).await?;
        for cluster in &mut clusters {
            if let Some(cached) = cache.get(&cluster.cluster_id) {
                if cached.member_hash == cluster.member_hash && cached.updated_at >= latest_updated
                {
                    cluster.centroid = cached.centroid.clone();
                    cluster.avg_sim = cached.avg_sim;
                    cluster.max_sim = cached.max_sim;
                    cluster.edge_degree = cached.edge_degree;
                    stats.cache_hits += 1;
                }
            }
        }

        // 5. Related-cluster ranking over centroids.
        rank_related(&mut clusters);

        // 6. Emit nodes, membership edges, related edges, KB events.
        let mut events = KbEventLog::new("kb", &req.run_id);
        for cluster in &clusters {
            self.emit_cluster(cluster, &mut events, &mut stats).await;
        }
        stats.clusters = clusters.len() as u32;

        // Save the refreshed cache under CAS.
        let now = Utc::now();
        cache.clear();
        for cluster in &clusters {
            cache.insert(
                cluster.cluster_id.clone(),
                CachedCentroid {
                    centroid: cluster.centroid.clone(),
                    size: cluster.size,
                    avg_sim: cluster.avg_sim,
                    max_sim: cluster.max_sim,
                    updated_at: latest_updated,
                    edge_degree: cluster.edge_degree,
                    member_hash: cluster.member_hash.clone(),
                    top_related: cluster.top_related.clone(),
                    dim: cluster.centroid.len(),
                },
            );
        }
        self.save_cache(&cache_key, &cache, cache_version).await?;

        // Cluster checkpoint: high-water mark over entry updates.
        let mut update = Checkpoint {
            last_run_at: Some(now),
            last_run_id: Some(req.run_id.clone()),
            ..Default::default()
        };
        update.extra.insert(
            "lastUpdatedAt".to_string(),
            serde_json::json!(latest_updated.to_rfc3339()),
        );
        self.checkpoints
            .save(&self.scope, &checkpoint_key, &update)
            .await
            .map_err(TrellisError::Anyhow)?;

        if let Some(log) = &self.log {
            events.flush(log).await;
        }

        stats.status = "complete".to_string();
        info!(
            dataset_id = %req.dataset_id,
            clusters = stats.clusters,
            cache_hits = stats.cache_hits,
            "Clustering complete"
        );
        Ok(stats)
    }

    async fn load_cache(
        &self,
        cache_key: &str,
    ) -> Result<(std::collections::BTreeMap<String, CachedCentroid>, Option<u64>), TrellisError>
    {
        match self
            .kv
            .get(&self.scope, cache_key)
            .await
            .map_err(TrellisError::Anyhow)?
        {
            Some(stored) => {
                let cache = serde_json::from_value(stored.value).unwrap_or_default();
                Ok((cache, Some(stored.version)))
            }
            None => Ok((Default::default(), None)),
        }
    }

    /// Read-modify-write with a bounded CAS retry. The lock is never held
    /// across the KV round-trips; conflicts just re-read.
    async fn save_cache(
        &self,
        cache_key: &str,
        cache: &std::collections::BTreeMap<String, CachedCentroid>,
        mut expected_version: Option<u64>,
    ) -> Result<(), TrellisError> {
        let value = serde_json::to_value(cache).map_err(|e| TrellisError::Data(e.to_string()))?;
        for _ in 0..CACHE_CAS_RETRIES {
            match self
                .kv
                .put(&self.scope, cache_key, value.clone(), expected_version)
                .await
                .map_err(TrellisError::Anyhow)?
            {
                PutOutcome::Stored { .. } => return Ok(()),
                PutOutcome::Conflict { current_version } => {
                    expected_version = Some(current_version);
                }
            }
        }
        Err(TrellisError::Data(format!(
            "centroid cache CAS retries exhausted for {cache_key}"
        )))
    }

    async fn emit_cluster(
        &self,
        cluster: &Cluster,
        events: &mut KbEventLog,
        stats: &mut ClusterStats,
    ) {
        let mut properties = std::collections::BTreeMap::new();
        properties.insert("size".to_string(), cluster.size.to_string());
        properties.insert("avgSim".to_string(), format!("{:.4}", cluster.avg_sim));
        properties.insert("maxSim".to_string(), format!("{:.4}", cluster.max_sim));
        properties.insert("edgeDegree".to_string(), cluster.edge_degree.to_string());
        properties.insert("memberHash".to_string(), cluster.member_hash.clone());

        let node = KgNode {
            id: cluster.cluster_id.clone(),
            node_type: "cluster".to_string(),
            properties,
        };
        if let Err(e) = self.graph.upsert_node(&node).await {
            warn!(cluster_id = %cluster.cluster_id, error = %e, "Cluster node upsert failed");
        }
        events.record(KbOp::UpsertNode, "cluster", &cluster.cluster_id, &cluster.member_hash);

        for member in &cluster.member_ids {
            let edge = KgEdge {
                id: format!("{}->{}", cluster.cluster_id, member),
                edge_type: "IN_CLUSTER".to_string(),
                from_id: cluster.cluster_id.clone(),
                to_id: member.clone(),
                properties: Default::default(),
            };
            if let Err(e) = self.graph.upsert_edge(&edge).await {
                warn!(cluster_id = %cluster.cluster_id, error = %e, "Membership edge upsert failed");
            }
            events.record(KbOp::UpsertEdge, "in_cluster", &edge.id, member);
        }

        for related in &cluster.top_related {
            let edge = KgEdge {
                id: format!("{}~{}", cluster.cluster_id, related.cluster_id),
                edge_type: "RELATED".to_string(),
                from_id: cluster.cluster_id.clone(),
                to_id: related.cluster_id.clone(),
                properties: std::collections::BTreeMap::from([(
                    "score".to_string(),
                    format!("{:.4}", related.score),
                )]),
            };
            if let Err(e) = self.graph.upsert_edge(&edge).await {
                warn!(cluster_id = %cluster.cluster_id, error = %e, "Related edge upsert failed");
            }
            events.record(KbOp::UpsertEdge, "related", &edge.id, &format!("{:.4}", related.score));
            stats.related_edges += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Pure clustering helpers
// ---------------------------------------------------------------------------

pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Greedy pass: each entry joins the best existing centroid when the
/// similarity clears the threshold and the cluster has room, else opens a
/// new cluster. Ties resolve to the lower cluster index. Centroids are
/// maintained by incremental averaging.
fn greedy_assign(embeddings: &[&[f32]], sim_threshold: f32, max_size: usize) -> Vec<Vec<usize>> {
    let mut clusters: Vec<Vec<usize>> = Vec::new();
    let mut centroids: Vec<Vec<f32>> = Vec::new();

    for (idx, embedding) in embeddings.iter().enumerate() {
        let mut best: Option<(usize, f32)> = None;
        for (cluster_idx, centroid) in centroids.iter().enumerate() {
            if clusters[cluster_idx].len() >= max_size {
                continue;
            }
            let sim = cosine(embedding, centroid);
            // Strictly-greater keeps the lower index on ties.
            if best.map(|(_, s)| sim > s).unwrap_or(true) {
                best = Some((cluster_idx, sim));
            }
        }

        match best {
            Some((cluster_idx, sim)) if sim >= sim_threshold => {
                let n = clusters[cluster_idx].len() as f32;
                for (c, x) in centroids[cluster_idx].iter_mut().zip(embedding.iter()) {
                    *c = (*c * n + x) / (n + 1.0);
                }
                clusters[cluster_idx].push(idx);
            }
            _ => {
                clusters.push(vec![idx]);
                centroids.push(embedding.to_vec());
            }
        }
    }
    clusters
}

/// Connected components of the similarity graph at `graph_threshold`.
/// Components of size >= 2 override greedy assignments; entries outside
/// any component keep their greedy cluster.
fn refine_with_components(
    embeddings: &[&[f32]],
    greedy: Vec<Vec<usize>>,
    graph_threshold: f32,
) -> Vec<Vec<usize>> {
    let n = embeddings.len();
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        for j in (i + 1)..n {
            if cosine(embeddings[i], embeddings[j]) >= graph_threshold {
                adjacency[i].push(j);
                adjacency[j].push(i);
            }
        }
    }

    let mut component_of: Vec<Option<usize>> = vec![None; n];
    let mut components: Vec<Vec<usize>> = Vec::new();
    for start in 0..n {
        if component_of[start].is_some() || adjacency[start].is_empty() {
            continue;
        }
        let id = components.len();
        let mut stack = vec![start];
        let mut members = Vec::new();
        component_of[start] = Some(id);
        while let Some(node) = stack.pop() {
            members.push(node);
            for &next in &adjacency[node] {
                if component_of[next].is_none() {
                    component_of[next] = Some(id);
                    stack.push(next);
                }
            }
        }
        members.sort_unstable();
        components.push(members);
    }

    let mut result: Vec<Vec<usize>> = components;
    for cluster in greedy {
        let leftovers: Vec<usize> = cluster
            .into_iter()
            .filter(|idx| component_of[*idx].is_none())
            .collect();
        if !leftovers.is_empty() {
            result.push(leftovers);
        }
    }
    result
}

fn build_cluster(
    dataset_id: &str,
    entries: &[VectorEntry],
    embeddings: &[&[f32]],
    members: &[usize],
    graph_threshold: f32,
) -> Cluster {
    let mut member_ids: Vec<String> =
        members.iter().map(|idx| entries[*idx].node_id.clone()).collect();
    member_ids.sort();

    let digest = sha1_hex(&member_ids.join(","));
    let cluster_id = format!("cluster:{dataset_id}:{digest}");

    let dim = embeddings[members[0]].len();
    let mut centroid = vec![0.0f32; dim];
    for idx in members {
        for (c, x) in centroid.iter_mut().zip(embeddings[*idx].iter()) {
            *c += x;
        }
    }
    for c in &mut centroid {
        *c /= members.len() as f32;
    }

    let mut avg_sim = 0.0f32;
    let mut max_sim = 0.0f32;
    let mut edge_degree = 0u32;
    let mut pairs = 0u32;
    for (a_pos, a) in members.iter().enumerate() {
        for b in members.iter().skip(a_pos + 1) {
            let sim = cosine(embeddings[*a], embeddings[*b]);
            avg_sim += sim;
            max_sim = max_sim.max(sim);
            pairs += 1;
            if sim >= graph_threshold {
                edge_degree += 1;
            }
        }
    }
    if pairs > 0 {
        avg_sim /= pairs as f32;
    }

    Cluster {
        cluster_id,
        size: member_ids.len() as u32,
        member_hash: digest,
        member_ids,
        centroid,
        avg_sim,
        max_sim,
        edge_degree,
        top_related: Vec::new(),
    }
}

/// Up to 5 related clusters each, ranked by centroid similarity; score
/// ties break lexicographically on (src, dst).
fn rank_related(clusters: &mut [Cluster]) {
    let centroids: Vec<(String, Vec<f32>)> = clusters
        .iter()
        .map(|c| (c.cluster_id.clone(), c.centroid.clone()))
        .collect();

    for cluster in clusters.iter_mut() {
        // A singleton cluster emits no RELATED edges.
        if cluster.size < 2 {
            cluster.top_related.clear();
            continue;
        }
        let mut scored: Vec<RelatedCluster> = centroids
            .iter()
            .filter(|(id, _)| *id != cluster.cluster_id)
            .map(|(id, centroid)| RelatedCluster {
                cluster_id: id.clone(),
                score: cosine(&cluster.centroid, centroid),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cluster_id.cmp(&b.cluster_id))
        });
        scored.truncate(5);
        cluster.top_related = scored;
    }
}
