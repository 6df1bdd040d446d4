//! `SystemConfig` — the in-memory identity, negotiation, and service-
//! registry state a VNic carries per connection.
//!
//! Loading this from a config file or environment is explicitly out of
//! scope for this layer: the embedding application builds a `SystemConfig`
//! and hands it, fully formed, to the handshake and dispatch code in
//! `mesh-runtime`. What this module owns is the shape of that state and
//! the service-registry encoding exchanged during handshake step 4.

use std::collections::{BTreeSet, HashMap};

/// Per-connection identity, negotiation state, and service registry.
///
/// `local_uuid` is assigned at construction and never changes afterward —
/// there is no setter for it. `remote_uuid`, `remote_alias`, and
/// `remote_vnet` start empty and are filled in by the handshake.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    local_uuid: String,
    pub local_alias: String,
    pub remote_uuid: String,
    pub remote_alias: String,
    pub remote_vnet: String,
    pub force_external: bool,
    pub max_data_size: u64,
    pub services: ServiceRegistry,
}

impl SystemConfig {
    /// Construct a config for a VNic with the given identity. `local_uuid`
    /// is fixed for the lifetime of this value.
    pub fn new(local_uuid: impl Into<String>, local_alias: impl Into<String>, max_data_size: u64) -> Self {
        SystemConfig {
            local_uuid: local_uuid.into(),
            local_alias: local_alias.into(),
            remote_uuid: String::new(),
            remote_alias: String::new(),
            remote_vnet: String::new(),
            force_external: false,
            max_data_size,
            services: ServiceRegistry::default(),
        }
    }

    pub fn local_uuid(&self) -> &str {
        &self.local_uuid
    }
}

/// `serviceName -> set<serviceArea>`, as exchanged during handshake step 4.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceRegistry {
    services: HashMap<String, BTreeSet<u8>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `service_area` under `service_name`. Idempotent.
    pub fn add(&mut self, service_name: impl Into<String>, service_area: u8) {
        self.services.entry(service_name.into()).or_default().insert(service_area);
    }

    /// Remove `service_area` from `service_name`. If that was the last
    /// area registered, the service entry itself is pruned — the registry
    /// never holds an empty area set.
    pub fn remove(&mut self, service_name: &str, service_area: u8) {
        if let Some(areas) = self.services.get_mut(service_name) {
            areas.remove(&service_area);
            if areas.is_empty() {
                self.services.remove(service_name);
            }
        }
    }

    pub fn areas_for(&self, service_name: &str) -> Option<&BTreeSet<u8>> {
        self.services.get(service_name)
    }

    pub fn has(&self, service_name: &str, service_area: u8) -> bool {
        self.services
            .get(service_name)
            .map(|areas| areas.contains(&service_area))
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<u8>)> {
        self.services.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Replace this registry's contents with `other`'s. Used when a
    /// handshake's service-registry step completes — the local view of
    /// the peer's services is replaced wholesale, not merged.
    pub fn replace_with(&mut self, other: ServiceRegistry) {
        *self = other;
    }

    /// Encode as `entry_count: u32 BE`, then per entry:
    /// `name_len: u16 BE, name: utf8, area_count: u16 BE, areas: [u8]`.
    /// This is the length-prefixed tag scheme SPEC_FULL §3.4 allows in
    /// place of the original protobuf encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.services.len() as u32).to_be_bytes());
        for (name, areas) in &self.services {
            let name_bytes = name.as_bytes();
            out.extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
            out.extend_from_slice(name_bytes);
            out.extend_from_slice(&(areas.len() as u16).to_be_bytes());
            out.extend(areas.iter().copied());
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, ServiceRegistryDecodeError> {
        let mut registry = ServiceRegistry::default();
        if data.len() < 4 {
            return Err(ServiceRegistryDecodeError::Truncated);
        }
        let entry_count = u32::from_be_bytes(data[0..4].try_into().unwrap());
        let mut off = 4;
        for _ in 0..entry_count {
            if data.len() < off + 2 {
                return Err(ServiceRegistryDecodeError::Truncated);
            }
            let name_len = u16::from_be_bytes(data[off..off + 2].try_into().unwrap()) as usize;
            off += 2;
            if data.len() < off + name_len + 2 {
                return Err(ServiceRegistryDecodeError::Truncated);
            }
            let name = String::from_utf8(data[off..off + name_len].to_vec())
                .map_err(|_| ServiceRegistryDecodeError::InvalidUtf8)?;
            off += name_len;
            let area_count = u16::from_be_bytes(data[off..off + 2].try_into().unwrap()) as usize;
            off += 2;
            if data.len() < off + area_count {
                return Err(ServiceRegistryDecodeError::Truncated);
            }
            for &area in &data[off..off + area_count] {
                registry.add(name.clone(), area);
            }
            off += area_count;
        }
        Ok(registry)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceRegistryDecodeError {
    #[error("service registry encoding is truncated")]
    Truncated,
    #[error("service name is not valid utf-8")]
    InvalidUtf8,
}
