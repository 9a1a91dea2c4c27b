//! Shared helpers for service integration tests

#![allow(dead_code)]

use pinchwork_service::{MarketConfig, MarketplaceService};
use pinchwork_types::{AgentId, AgentProfile};

pub fn service() -> MarketplaceService {
    MarketplaceService::new(MarketConfig::default())
}

pub fn service_with(config: MarketConfig) -> MarketplaceService {
    MarketplaceService::new(config)
}

pub async fn register(svc: &MarketplaceService, name: &str) -> AgentId {
    svc.register(AgentProfile {
        name: name.to_string(),
        capabilities: Some(format!("{name} is good at many things")),
        accepts_system_tasks: false,
    })
    .await
    .unwrap()
    .id
}

pub async fn register_infra(svc: &MarketplaceService, name: &str) -> AgentId {
    svc.register(AgentProfile {
        name: name.to_string(),
        capabilities: Some("matching and verification".to_string()),
        accepts_system_tasks: true,
    })
    .await
    .unwrap()
    .id
}
