pub mod contract;
pub mod registry;

pub use contract::*;
pub use registry::{
    classify_validation, CdmRegistry, DiscoveryRegistry, EndpointFactory, EndpointRegistry,
    Registries,
};
