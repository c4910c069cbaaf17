use crate::error::{BlockchainError, Result};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    addr: String,
}

impl Node {
    fn new(addr: String) -> Node {
        Node { addr }
    }

    pub fn get_addr(&self) -> String {
        self.addr.clone()
    }
}

/// Resolves `host:port`, accepting names such as `localhost`.
pub fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|e| BlockchainError::Network(format!("Invalid address {addr}: {e}")))?
        .next()
        .ok_or_else(|| BlockchainError::Network(format!("Address {addr} did not resolve")))
}

/// Peers this node has heard from, in first-seen order.
pub struct Nodes {
    inner: RwLock<Vec<Node>>,
}

impl Default for Nodes {
    fn default() -> Self {
        Self::new()
    }
}

impl Nodes {
    pub fn new() -> Nodes {
        Nodes {
            inner: RwLock::new(vec![]),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Node>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Node>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_node(&self, addr: String) {
        let mut inner = self.write();
        if !inner.iter().any(|x| x.addr == addr) {
            inner.push(Node::new(addr));
        }
    }

    pub fn evict_node(&self, addr: &str) {
        let mut inner = self.write();
        if let Some(idx) = inner.iter().position(|x| x.addr == addr) {
            inner.remove(idx);
        }
    }

    pub fn get_nodes(&self) -> Vec<Node> {
        self.read().to_vec()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn node_is_known(&self, addr: &str) -> bool {
        self.read().iter().any(|x| x.addr == addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_is_deduplicated_and_evict_removes() {
        let nodes = Nodes::new();
        nodes.add_node("127.0.0.1:2001".to_string());
        nodes.add_node("127.0.0.1:3000".to_string());
        nodes.add_node("127.0.0.1:2001".to_string());
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes.get_nodes()[0].get_addr(), "127.0.0.1:2001");

        nodes.evict_node("127.0.0.1:2001");
        assert!(!nodes.node_is_known("127.0.0.1:2001"));
        assert!(nodes.node_is_known("127.0.0.1:3000"));
        nodes.evict_node("127.0.0.1:9999");
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn test_resolve() {
        assert_eq!(resolve("127.0.0.1:2001").unwrap().port(), 2001);
        assert!(resolve("not an address").is_err());
    }
}
