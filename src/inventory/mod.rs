// Inventory module for host management

mod groups;

pub use groups::*;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use crate::output::errors::EngineError;

/// How a host authenticates
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CredentialsRef {
    /// ssh-agent identities, then the default key files
    #[default]
    Agent,
    /// A private key file on the controller
    KeyFile(PathBuf),
    /// Password (falls back to keyboard-interactive)
    Password(String),
}

/// A single host in the inventory
#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub user: String,
    pub credentials: CredentialsRef,
    /// Group tags
    pub tags: Vec<String>,
    pub vars: BTreeMap<String, Value>,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Host {
            address: name.clone(),
            name,
            port: 22,
            user: String::new(),
            credentials: CredentialsRef::Agent,
            tags: Vec::new(),
            vars: BTreeMap::new(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialsRef) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: Value) -> Self {
        self.vars.insert(key.into(), value);
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Get the SSH connection string (user@host:port)
    pub fn ssh_target(&self) -> String {
        if self.user.is_empty() {
            format!("{}:{}", self.address, self.port)
        } else {
            format!("{}@{}:{}", self.user, self.address, self.port)
        }
    }

    /// Check if this host should use a local connection
    pub fn is_local(&self) -> bool {
        if let Some(Value::String(conn)) = self.vars.get("connection") {
            if conn == "local" {
                return true;
            }
        }

        matches!(self.address.as_str(), "localhost" | "127.0.0.1" | "::1")
    }
}

/// The complete inventory. Hosts keep their insertion order.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    hosts: Vec<Arc<Host>>,
    index: HashMap<String, usize>,
}

impl Inventory {
    pub fn new() -> Self {
        Inventory::default()
    }

    /// Add a host. Names must be unique.
    pub fn add_host(&mut self, host: Host) -> Result<(), EngineError> {
        if self.index.contains_key(&host.name) {
            return Err(EngineError::Inventory {
                message: format!("duplicate host '{}'", host.name),
                suggestion: Some("Host names must be unique within an inventory".to_string()),
            });
        }
        self.index.insert(host.name.clone(), self.hosts.len());
        self.hosts.push(Arc::new(host));
        Ok(())
    }

    /// Tag an existing host with a group name
    pub fn add_to_group(&mut self, host_name: &str, group: &str) -> Result<(), EngineError> {
        let idx = *self.index.get(host_name).ok_or_else(|| EngineError::Inventory {
            message: format!("group '{}' references unknown host '{}'", group, host_name),
            suggestion: None,
        })?;
        let host = Arc::make_mut(&mut self.hosts[idx]);
        if !host.has_tag(group) {
            host.tags.push(group.to_string());
        }
        Ok(())
    }

    pub fn get_host(&self, name: &str) -> Option<&Arc<Host>> {
        self.index.get(name).map(|&i| &self.hosts[i])
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    /// Hosts matching a selector, in inventory order
    pub fn select(&self, selector: &HostSelector) -> Vec<Arc<Host>> {
        self.hosts
            .iter()
            .filter(|h| selector.matches(h))
            .cloned()
            .collect()
    }

    /// Names of every group tag in use
    pub fn group_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .hosts
            .iter()
            .flat_map(|h| h.tags.iter().map(String::as_str))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_creation() {
        let host = Host::new("web1")
            .with_address("192.168.1.10")
            .with_port(2222)
            .with_user("admin")
            .with_tag("webservers")
            .with_var("http_port", Value::from(80));

        assert_eq!(host.name, "web1");
        assert_eq!(host.ssh_target(), "admin@192.168.1.10:2222");
        assert!(host.has_tag("webservers"));
        assert!(!host.is_local());
    }

    #[test]
    fn test_local_detection() {
        assert!(Host::new("localhost").is_local());
        assert!(Host::new("box").with_address("127.0.0.1").is_local());
        assert!(Host::new("box")
            .with_var("connection", Value::from("local"))
            .is_local());
    }

    #[test]
    fn test_duplicate_host_rejected() {
        let mut inv = Inventory::new();
        inv.add_host(Host::new("web1")).unwrap();
        assert!(inv.add_host(Host::new("web1")).is_err());
    }

    #[test]
    fn test_groups_and_order() {
        let mut inv = Inventory::new();
        inv.add_host(Host::new("web2")).unwrap();
        inv.add_host(Host::new("web1")).unwrap();
        inv.add_host(Host::new("db1")).unwrap();
        inv.add_to_group("web1", "webservers").unwrap();
        inv.add_to_group("web2", "webservers").unwrap();
        assert!(inv.add_to_group("nope", "webservers").is_err());

        let webs = inv.select(&HostSelector::parse("webservers"));
        let names: Vec<_> = webs.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["web2", "web1"]);
        assert_eq!(inv.group_names(), vec!["webservers"]);
    }
}
