//! Request identity and rate limit key derivation.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// An already-authenticated caller, as resolved by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub roles: Vec<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id: id.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// The parts of an inbound request the gate looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub client_address: IpAddr,
    pub identity: Option<Identity>,
    pub api_key: Option<String>,
    pub route_path: String,
}

impl AdmissionRequest {
    /// An anonymous request with no API key.
    pub fn new(client_address: IpAddr, route_path: impl Into<String>) -> Self {
        Self {
            client_address,
            identity: None,
            api_key: None,
            route_path: route_path.into(),
        }
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Attach an API key. Blank keys are treated as absent.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into();
        self.api_key = (!api_key.trim().is_empty()).then_some(api_key);
        self
    }

    /// Pick the API key from the `X-API-Key` header, falling back to the
    /// `apiKey` query parameter.
    pub fn with_api_key_from(self, header: Option<&str>, query: Option<&str>) -> Self {
        match header.filter(|h| !h.trim().is_empty()).or(query) {
            Some(key) => self.with_api_key(key),
            None => self,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }
}

/// Which request attribute a rule keys its quota on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// User id, then API key, then client address.
    #[default]
    Identity,
    /// The API key, then the client address.
    ApiKey,
    /// Always the client address.
    ClientAddress,
}

/// A key that uniquely identifies one quota bucket: `{namespace}:{identity}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RateLimitKey {
    namespace: String,
    identity: String,
}

impl RateLimitKey {
    pub fn new(namespace: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            identity: identity.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The storage key for this bucket.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.namespace, self.identity)
    }

    /// A sibling key in the same bucket, e.g. a block marker.
    pub fn suffixed(&self, suffix: &str) -> String {
        format!("{}:{}", self.to_string_key(), suffix)
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.identity)
    }
}

/// Computes quota keys from requests. Pure and deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyDeriver;

impl KeyDeriver {
    /// Derive the key for `request` within `namespace`, preferring the
    /// authenticated user, then the API key, then the client address.
    pub fn derive(request: &AdmissionRequest, namespace: &str) -> RateLimitKey {
        Self::derive_with(request, namespace, KeySource::Identity)
    }

    pub fn derive_with(
        request: &AdmissionRequest,
        namespace: &str,
        source: KeySource,
    ) -> RateLimitKey {
        RateLimitKey::new(namespace, Self::identity_of(request, source))
    }

    fn identity_of(request: &AdmissionRequest, source: KeySource) -> String {
        if source == KeySource::Identity {
            if let Some(identity) = &request.identity {
                return format!("user:{}", identity.id);
            }
        }
        if source != KeySource::ClientAddress {
            if let Some(api_key) = &request.api_key {
                return format!("apikey:{}", api_key);
            }
        }
        client_address_key(request.client_address)
    }
}

/// Canonical text for a client address; IPv4-mapped IPv6 collapses to IPv4
/// so one client never owns two buckets.
pub fn client_address_key(addr: IpAddr) -> String {
    normalize(addr).to_string()
}

pub(crate) fn normalize(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}
