//! Where to find HTTP relays for an address.

use xchg_core::Address;

/// Ordered HTTP relay candidates (host:port) for an address.
pub trait NetworkProvider: Send + Sync {
    fn nodes_for_address(&self, address: &Address) -> Vec<String>;
}

/// Same relay list for every address.
#[derive(Debug, Clone, Default)]
pub struct StaticNetwork {
    hosts: Vec<String>,
}

impl StaticNetwork {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }
}

impl NetworkProvider for StaticNetwork {
    fn nodes_for_address(&self, _address: &Address) -> Vec<String> {
        self.hosts.clone()
    }
}
