//! Routing instance identity and correlation id generation.
//!
//! An instance id partitions one physical channel into independent logical
//! server/client pairings. It is fixed at construction and only ever compared
//! against the `instanceId` tag of inbound envelopes.

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::protocol::now_ms;

const RANDOM_SUFFIX_LEN: usize = 9;

/// Which end of a pairing an instance id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

/// Generates `<role>_<epoch-ms>_<random>`, e.g. `server_1718000000000_k3j9x0q2m`.
pub fn generate_instance_id(role: Role) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{}_{}_{}", role.as_str(), now_ms(), suffix)
}

/// Fresh correlation id for an outbound request.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Inbound envelope predicate bound to one instance id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceFilter {
    own: String,
    accept_untagged: bool,
}

impl InstanceFilter {
    /// Strict filter: only envelopes tagged with `own` pass.
    pub fn strict(own: impl Into<String>) -> Self {
        Self {
            own: own.into(),
            accept_untagged: false,
        }
    }

    /// Compatibility filter: untagged envelopes pass as well.
    pub fn compat(own: impl Into<String>) -> Self {
        Self {
            own: own.into(),
            accept_untagged: true,
        }
    }

    pub fn new(own: impl Into<String>, accept_untagged: bool) -> Self {
        Self {
            own: own.into(),
            accept_untagged,
        }
    }

    pub fn own(&self) -> &str {
        &self.own
    }

    pub fn accepts_untagged(&self) -> bool {
        self.accept_untagged
    }

    pub fn accepts(&self, incoming: Option<&str>) -> bool {
        match incoming {
            Some(tag) => tag == self.own,
            None => self.accept_untagged,
        }
    }
}
