//! The provider registry backing round-robin, proximity, and leader
//! destination selection (SPEC_FULL §4.D.1). One registry is shared by a
//! VNic across every `(serviceName, serviceArea)` it knows providers
//! for; it does not itself do any I/O — populating it from handshake
//! service-registry exchanges or a discovery protocol is the caller's
//! concern.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::RuntimeError;

/// One known provider of a `(serviceName, serviceArea)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub uuid: String,
    /// True if this provider is the in-process handler on this same
    /// VNic — what makes `Local` dispatch skip the wire entirely.
    pub is_local: bool,
    /// Lower is closer. Maintained by whatever locality/latency heuristic
    /// the embedding application uses; this registry just orders by it.
    pub proximity_score: u32,
}

type ServiceKey = (String, u8);

/// `(serviceName, serviceArea) -> known providers`, plus the per-key
/// round-robin cursor and elected leader SPEC_FULL §5 calls for.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<ServiceKey, Vec<ProviderInfo>>,
    cursors: DashMap<ServiceKey, AtomicUsize>,
    leaders: DashMap<ServiceKey, String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn register(&self, service_name: impl Into<String>, service_area: u8, provider: ProviderInfo) {
        let key = (service_name.into(), service_area);
        let mut list = self.providers.entry(key).or_default();
        if !list.iter().any(|p| p.uuid == provider.uuid) {
            list.push(provider);
        }
    }

    pub fn unregister(&self, service_name: &str, service_area: u8, uuid: &str) {
        let key = (service_name.to_string(), service_area);
        if let Some(mut list) = self.providers.get_mut(&key) {
            list.retain(|p| p.uuid != uuid);
        }
    }

    pub fn all(&self, service_name: &str, service_area: u8) -> Vec<ProviderInfo> {
        self.providers
            .get(&(service_name.to_string(), service_area))
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    /// Pick the next provider by a per-key round-robin cursor, wrapping.
    /// A service/area with zero known providers returns `NoProvider`
    /// immediately rather than block (SPEC_FULL §9, Open Question 1) —
    /// there is nothing a caller can usefully wait on here.
    pub fn round_robin(&self, service_name: &str, service_area: u8) -> Result<ProviderInfo, RuntimeError> {
        let key = (service_name.to_string(), service_area);
        let list = self.providers.get(&key).ok_or(RuntimeError::NoProvider)?;
        if list.is_empty() {
            return Err(RuntimeError::NoProvider);
        }
        let cursor = self.cursors.entry(key.clone()).or_insert_with(|| AtomicUsize::new(0));
        let idx = cursor.fetch_add(1, Ordering::Relaxed) % list.len();
        Ok(list[idx].clone())
    }

    /// Pick the lowest-`proximity_score` provider. Ties resolve to
    /// whichever was registered first, since `min_by_key` keeps the
    /// earliest minimum.
    pub fn proximity(&self, service_name: &str, service_area: u8) -> Result<ProviderInfo, RuntimeError> {
        self.all(service_name, service_area)
            .into_iter()
            .min_by_key(|p| p.proximity_score)
            .ok_or(RuntimeError::NoProvider)
    }

    /// Pick the in-process provider, if this VNic hosts one.
    pub fn local(&self, service_name: &str, service_area: u8) -> Result<ProviderInfo, RuntimeError> {
        self.all(service_name, service_area)
            .into_iter()
            .find(|p| p.is_local)
            .ok_or(RuntimeError::NoProvider)
    }

    pub fn set_leader(&self, service_name: impl Into<String>, service_area: u8, uuid: impl Into<String>) {
        self.leaders.insert((service_name.into(), service_area), uuid.into());
    }

    pub fn clear_leader(&self, service_name: &str, service_area: u8) {
        self.leaders.remove(&(service_name.to_string(), service_area));
    }

    pub fn leader(&self, service_name: &str, service_area: u8) -> Result<String, RuntimeError> {
        self.leaders
            .get(&(service_name.to_string(), service_area))
            .map(|entry| entry.clone())
            .ok_or(RuntimeError::NoProvider)
    }
}
