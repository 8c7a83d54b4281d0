//! Compute nodes.
//!
//! A `NodeDescription` is one host of the processing pool. The inventory file lists them either
//! as bare hostnames or as detailed mappings; hostnames may be handlebars templates expanded over
//! list-valued `params` (cartesian product), so `worker-{{idx}}` with `idx: [01, 02]` yields two
//! nodes.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::str::FromStr;

use itertools::sorted;
use serde::{Deserialize, Serialize};
use void::Void;

use crate::error::{ExecError, Result};
use crate::serde::{one_or_many, string_or_mapping};

/// Hardware flavor of a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Flavor {
    pub cpus: usize,
    pub memory_gb: u64,
    pub disk_gb: u64,
}

impl Flavor {
    pub fn memory_mb(&self) -> i64 {
        (self.memory_gb * 1024) as i64
    }
}

impl Default for Flavor {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory_gb: 1,
            disk_gb: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    #[default]
    Worker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    /// Hostname, also the node identity.
    pub hostname: String,
    /// SSH user. `None` uses the SSH config default.
    pub user: Option<String>,
    pub flavor: Flavor,
    pub role: NodeRole,
    pub active: bool,
    /// Template parameters this node was expanded from.
    pub params: HashMap<String, String>,
}

impl NodeDescription {
    pub fn new(hostname: impl Into<String>, flavor: Flavor) -> Self {
        Self {
            hostname: hostname.into(),
            user: None,
            flavor,
            role: NodeRole::Worker,
            active: true,
            params: HashMap::new(),
        }
    }

    pub fn master(hostname: impl Into<String>, flavor: Flavor) -> Self {
        Self {
            role: NodeRole::Master,
            ..Self::new(hostname, flavor)
        }
    }

    /// SSH destination, `user@host` when a user is set.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.hostname),
            None => self.hostname.clone(),
        }
    }

    pub fn is_master(&self) -> bool {
        self.role == NodeRole::Master
    }
}

impl fmt::Display for NodeDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.params.is_empty() {
            write!(f, "[{}]", self.hostname)?;
        } else {
            write!(f, "[{} (", self.hostname)?;
            for (i, (key, value)) in sorted(self.params.iter()).enumerate() {
                if i == 0 {
                    write!(f, "{}={}", key, value)?;
                } else {
                    write!(f, ",{}={}", key, value)?;
                }
            }
            write!(f, ")]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct NodeSpec(#[serde(deserialize_with = "string_or_mapping")] NodeSpecInner);

#[derive(Debug, Deserialize)]
struct NodeSpecInner {
    #[serde(deserialize_with = "one_or_many")]
    hostname: Vec<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    cpus: Option<usize>,
    #[serde(default)]
    memory_gb: Option<u64>,
    #[serde(default)]
    disk_gb: Option<u64>,
    #[serde(default)]
    role: NodeRole,
    #[serde(default = "default_active")]
    active: bool,
    #[serde(default)]
    params: HashMap<String, Vec<String>>,
}

fn default_active() -> bool {
    true
}

impl FromStr for NodeSpecInner {
    type Err = Void;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self {
            hostname: vec![s.to_string()],
            user: None,
            cpus: None,
            memory_gb: None,
            disk_gb: None,
            role: NodeRole::Worker,
            active: true,
            params: HashMap::new(),
        })
    }
}

/// Reads the node inventory file.
pub fn get_nodes(nodes_file: &str) -> Result<Vec<NodeDescription>> {
    let nodes_fd = File::open(nodes_file)?;
    let specs: Vec<NodeSpec> = serde_yaml::from_reader(nodes_fd)?;
    expand_specs(specs)
}

/// Parses node inventory YAML held in memory.
pub fn parse_nodes(yaml: &str) -> Result<Vec<NodeDescription>> {
    let specs: Vec<NodeSpec> = serde_yaml::from_str(yaml)?;
    expand_specs(specs)
}

fn expand_specs(specs: Vec<NodeSpec>) -> Result<Vec<NodeDescription>> {
    let mut registry = handlebars::Handlebars::new();
    registry.register_escape_fn(handlebars::no_escape);
    handlebars_misc_helpers::register(&mut registry);

    let mut nodes = Vec::with_capacity(specs.len());
    for NodeSpec(spec) in specs {
        if spec.hostname.is_empty() {
            return Err(ExecError::Config(
                "a node entry has an empty 'hostname'".to_string(),
            ));
        }
        let defaults = Flavor::default();
        let flavor = Flavor {
            cpus: spec.cpus.unwrap_or(defaults.cpus),
            memory_gb: spec.memory_gb.unwrap_or(defaults.memory_gb),
            disk_gb: spec.disk_gb.unwrap_or(defaults.disk_gb),
        };

        let mut expanded: Vec<NodeDescription> = spec
            .hostname
            .iter()
            .map(|hostname| NodeDescription {
                user: spec.user.clone(),
                role: spec.role,
                active: spec.active,
                ..NodeDescription::new(hostname.clone(), flavor)
            })
            .collect();
        // Every list-valued parameter multiplies the expanded set.
        for (key, values) in sorted(spec.params.iter()) {
            let mut part_expanded = Vec::with_capacity(expanded.len() * values.len());
            for node in expanded {
                for value in values {
                    let mut node = node.clone();
                    node.params.insert(key.clone(), value.clone());
                    part_expanded.push(node);
                }
            }
            expanded = part_expanded;
        }
        for node in expanded.iter_mut() {
            if !registry.has_template(&node.hostname) {
                registry.register_template_string(&node.hostname, &node.hostname)?;
            }
            node.hostname = registry.render(&node.hostname, &node.params)?;
        }
        nodes.extend(expanded);
    }

    tracing::info!(count = nodes.len(), "Nodes loaded");
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_hostname_defaults() {
        let nodes = parse_nodes("- localhost").unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].hostname, "localhost");
        assert_eq!(nodes[0].flavor, Flavor::default());
        assert!(nodes[0].active);
        assert_eq!(nodes[0].role, NodeRole::Worker);
    }

    #[test]
    fn test_detailed_entry() {
        let nodes = parse_nodes(
            r#"
- hostname: master.eo
  user: eo
  cpus: 16
  memory_gb: 64
  disk_gb: 500
  role: master
"#,
        )
        .unwrap();
        assert_eq!(nodes[0].destination(), "eo@master.eo");
        assert_eq!(nodes[0].flavor.memory_mb(), 64 * 1024);
        assert!(nodes[0].is_master());
    }

    #[test]
    fn test_parametrized_hostnames_expand() {
        let nodes = parse_nodes(
            r#"
- hostname: "worker-{{idx}}.eo"
  cpus: 8
  params:
    idx: ["01", "02", "03"]
"#,
        )
        .unwrap();
        let names: Vec<_> = nodes.iter().map(|n| n.hostname.as_str()).collect();
        assert_eq!(names, vec!["worker-01.eo", "worker-02.eo", "worker-03.eo"]);
        assert!(nodes.iter().all(|n| n.flavor.cpus == 8));
        assert_eq!(nodes[1].to_string(), "[worker-02.eo (idx=02)]");
    }

    #[test]
    fn test_multiple_hostnames_in_one_entry() {
        let nodes = parse_nodes("- hostname: [a, b]\n  active: false").unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| !n.active));
    }
}
