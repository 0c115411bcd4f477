//! Process-wide registries: endpoint factories, CDM dataset mappings, and
//! discovery trait implementations. All three are read-mostly maps behind
//! readers-writer locks; registration happens at startup but stays safe
//! under later registration for test harnesses.
//!
//! Tests build their own instances instead of sharing the process-wide one.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock, RwLock};

use anyhow::anyhow;
use tracing::error;

use trellis_common::{Record, TrellisError};

use crate::contract::{
    Endpoint, EntityMapper, EntityResolver, MentionExtractor, RelationEventProcessor,
    RelationExtractor, ValidationReport,
};

// ---------------------------------------------------------------------------
// Endpoint registry
// ---------------------------------------------------------------------------

/// Builds an endpoint from its configuration.
pub type EndpointFactory = Arc<dyn Fn(&Record) -> anyhow::Result<Arc<dyn Endpoint>> + Send + Sync>;

#[derive(Default)]
pub struct EndpointRegistry {
    factories: RwLock<HashMap<String, EndpointFactory>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a template. Duplicate registration is fatal;
    /// the caller is expected to abort startup on this error.
    pub fn register(
        &self,
        template_id: impl Into<String>,
        factory: EndpointFactory,
    ) -> anyhow::Result<()> {
        let template_id = template_id.into();
        let mut factories = self.factories.write().expect("endpoint registry poisoned");
        if factories.contains_key(&template_id) {
            return Err(anyhow!("endpoint template already registered: {template_id}"));
        }
        factories.insert(template_id, factory);
        Ok(())
    }

    pub fn templates(&self) -> Vec<String> {
        let factories = self.factories.read().expect("endpoint registry poisoned");
        let mut ids: Vec<String> = factories.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Instantiate an endpoint. Unknown templates map to
    /// `E_ENDPOINT_NOT_FOUND`; a panicking factory is caught and surfaced
    /// as `E_UNKNOWN` rather than taking the process down.
    pub fn open(
        &self,
        template_id: &str,
        config: &Record,
    ) -> Result<Arc<dyn Endpoint>, TrellisError> {
        let factory = {
            let factories = self.factories.read().expect("endpoint registry poisoned");
            factories
                .get(template_id)
                .cloned()
                .ok_or_else(|| TrellisError::EndpointNotFound(template_id.to_string()))?
        };

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| factory(config)));
        match result {
            Ok(Ok(endpoint)) => Ok(endpoint),
            Ok(Err(e)) => Err(TrellisError::Anyhow(e)),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "endpoint factory panicked".to_string());
                error!(template_id, panic = %msg, "Endpoint factory panicked");
                Err(TrellisError::Anyhow(anyhow!(
                    "endpoint factory for {template_id} panicked: {msg}"
                )))
            }
        }
    }
}

/// Map a failed validation report onto the coded error space: messages
/// mentioning auth become `E_AUTH_INVALID`, everything else
/// `E_ENDPOINT_UNREACHABLE`.
pub fn classify_validation(template_id: &str, report: &ValidationReport) -> TrellisError {
    let lower = report.message.to_lowercase();
    if lower.contains("auth") || lower.contains("credential") || lower.contains("forbidden") {
        TrellisError::AuthInvalid(format!("{template_id}: {}", report.message))
    } else {
        TrellisError::EndpointUnreachable(format!("{template_id}: {}", report.message))
    }
}

// ---------------------------------------------------------------------------
// CDM registry
// ---------------------------------------------------------------------------

/// Maps a raw record payload into its CDM shape.
pub type CdmMapper = Arc<dyn Fn(&Record) -> Record + Send + Sync>;

#[derive(Clone)]
pub struct CdmMapping {
    pub model_id: String,
    pub mapper: CdmMapper,
}

/// Dataset-id → CDM mapping, plus the CDM models each endpoint template
/// declares.
#[derive(Default)]
pub struct CdmRegistry {
    mappings: RwLock<HashMap<String, CdmMapping>>,
    declared_models: RwLock<HashMap<String, Vec<String>>>,
    schemas: RwLock<HashMap<String, serde_json::Value>>,
}

impl CdmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_mapping(
        &self,
        dataset_id: impl Into<String>,
        model_id: impl Into<String>,
        mapper: CdmMapper,
    ) {
        let mut mappings = self.mappings.write().expect("cdm registry poisoned");
        mappings.insert(
            dataset_id.into(),
            CdmMapping {
                model_id: model_id.into(),
                mapper,
            },
        );
    }

    pub fn mapping_for(&self, dataset_id: &str) -> Option<CdmMapping> {
        let mappings = self.mappings.read().expect("cdm registry poisoned");
        mappings.get(dataset_id).cloned()
    }

    pub fn declare_models(&self, template_id: impl Into<String>, models: Vec<String>) {
        let mut declared = self.declared_models.write().expect("cdm registry poisoned");
        declared.insert(template_id.into(), models);
    }

    pub fn models_for(&self, template_id: &str) -> Vec<String> {
        let declared = self.declared_models.read().expect("cdm registry poisoned");
        declared.get(template_id).cloned().unwrap_or_default()
    }

    /// Field schema for a CDM model, when one was registered.
    pub fn register_schema(&self, model_id: impl Into<String>, schema: serde_json::Value) {
        let mut schemas = self.schemas.write().expect("cdm registry poisoned");
        schemas.insert(model_id.into(), schema);
    }

    pub fn schema_for(&self, model_id: &str) -> Option<serde_json::Value> {
        let schemas = self.schemas.read().expect("cdm registry poisoned");
        schemas.get(model_id).cloned()
    }
}

// ---------------------------------------------------------------------------
// Discovery registry
// ---------------------------------------------------------------------------

/// Discovery trait implementations keyed by source family.
#[derive(Default)]
pub struct DiscoveryRegistry {
    mention_extractors: RwLock<HashMap<String, Arc<dyn MentionExtractor>>>,
    relation_extractors: RwLock<HashMap<String, Arc<dyn RelationExtractor>>>,
    entity_mappers: RwLock<HashMap<String, Arc<dyn EntityMapper>>>,
    entity_resolvers: RwLock<HashMap<String, Arc<dyn EntityResolver>>>,
    relation_event_processors: RwLock<HashMap<String, Arc<dyn RelationEventProcessor>>>,
}

macro_rules! discovery_accessors {
    ($register:ident, $get:ident, $field:ident, $trait:ident) => {
        pub fn $register(&self, source_family: impl Into<String>, imp: Arc<dyn $trait>) {
            let mut map = self.$field.write().expect("discovery registry poisoned");
            map.insert(source_family.into(), imp);
        }

        pub fn $get(&self, source_family: &str) -> Option<Arc<dyn $trait>> {
            let map = self.$field.read().expect("discovery registry poisoned");
            map.get(source_family).cloned()
        }
    };
}

impl DiscoveryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    discovery_accessors!(
        register_mention_extractor,
        mention_extractor,
        mention_extractors,
        MentionExtractor
    );
    discovery_accessors!(
        register_relation_extractor,
        relation_extractor,
        relation_extractors,
        RelationExtractor
    );
    discovery_accessors!(register_entity_mapper, entity_mapper, entity_mappers, EntityMapper);
    discovery_accessors!(
        register_entity_resolver,
        entity_resolver,
        entity_resolvers,
        EntityResolver
    );
    discovery_accessors!(
        register_relation_event_processor,
        relation_event_processor,
        relation_event_processors,
        RelationEventProcessor
    );
}

// ---------------------------------------------------------------------------
// Bundle + process-wide instance
// ---------------------------------------------------------------------------

/// The three registries wired together.
#[derive(Default)]
pub struct Registries {
    pub endpoints: EndpointRegistry,
    pub cdm: CdmRegistry,
    pub discovery: DiscoveryRegistry,
}

impl Registries {
    pub fn new() -> Self {
        Self::default()
    }
}

static GLOBAL: OnceLock<Registries> = OnceLock::new();

/// The process-wide registry bundle. Tests should construct their own
/// `Registries` instead of sharing this one.
pub fn global() -> &'static Registries {
    GLOBAL.get_or_init(Registries::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{Capability, EndpointDescriptor};

    #[derive(Debug)]
    struct NullEndpoint;

    #[async_trait::async_trait]
    impl Endpoint for NullEndpoint {
        fn id(&self) -> &str {
            "null"
        }
        fn source_family(&self) -> &str {
            "test"
        }
        async fn validate(&self) -> anyhow::Result<ValidationReport> {
            Ok(ValidationReport::ok())
        }
        fn capabilities(&self) -> &[Capability] {
            &[]
        }
        fn descriptor(&self) -> EndpointDescriptor {
            EndpointDescriptor {
                template_id: "null".to_string(),
                display_name: "Null".to_string(),
                fields: vec![],
            }
        }
    }

    fn null_factory() -> EndpointFactory {
        Arc::new(|_config| Ok(Arc::new(NullEndpoint) as Arc<dyn Endpoint>))
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = EndpointRegistry::new();
        registry.register("null", null_factory()).unwrap();
        assert!(registry.register("null", null_factory()).is_err());
    }

    #[test]
    fn unknown_template_maps_to_not_found() {
        let registry = EndpointRegistry::new();
        let err = registry.open("ghost", &Record::new()).unwrap_err();
        assert_eq!(err.code(), trellis_common::ErrorCode::EndpointNotFound);
        assert!(!err.retryable());
    }

    #[test]
    fn factory_panic_is_caught() {
        let registry = EndpointRegistry::new();
        registry
            .register(
                "explosive",
                Arc::new(|_config: &Record| -> anyhow::Result<Arc<dyn Endpoint>> {
                    panic!("boom")
                }),
            )
            .unwrap();
        let err = registry.open("explosive", &Record::new()).unwrap_err();
        assert_eq!(err.code(), trellis_common::ErrorCode::Unknown);
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn validation_failure_classification() {
        let auth = classify_validation("jira", &ValidationReport::invalid("auth token expired"));
        assert_eq!(auth.code(), trellis_common::ErrorCode::AuthInvalid);

        let unreachable =
            classify_validation("jira", &ValidationReport::invalid("connection refused"));
        assert_eq!(
            unreachable.code(),
            trellis_common::ErrorCode::EndpointUnreachable
        );
    }

    #[test]
    fn discovery_registry_resolves_by_source_family() {
        struct TitleMentions;
        impl MentionExtractor for TitleMentions {
            fn extract_mentions(&self, payload: &Record) -> Vec<String> {
                payload
                    .get("title")
                    .and_then(|v| v.as_str())
                    .map(|t| vec![t.to_string()])
                    .unwrap_or_default()
            }
        }

        let discovery = DiscoveryRegistry::new();
        discovery.register_mention_extractor("jira", Arc::new(TitleMentions));

        let extractor = discovery.mention_extractor("jira").unwrap();
        let mut payload = Record::new();
        payload.insert("title".to_string(), serde_json::json!("@sam"));
        assert_eq!(extractor.extract_mentions(&payload), vec!["@sam".to_string()]);
        assert!(discovery.mention_extractor("github").is_none());
        assert!(discovery.entity_resolver("jira").is_none());
    }

    #[test]
    fn cdm_registry_round_trip() {
        let cdm = CdmRegistry::new();
        cdm.register_mapping(
            "jira:issues",
            "cdm.work_item.v1",
            Arc::new(|payload: &Record| payload.clone()),
        );
        let mapping = cdm.mapping_for("jira:issues").unwrap();
        assert_eq!(mapping.model_id, "cdm.work_item.v1");
        assert!(cdm.mapping_for("github:prs").is_none());

        cdm.declare_models("jira", vec!["cdm.work_item.v1".to_string()]);
        assert_eq!(cdm.models_for("jira"), vec!["cdm.work_item.v1".to_string()]);
        assert!(cdm.models_for("github").is_empty());
    }
}
