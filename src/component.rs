//! Processing components and the containers they run in.

use std::collections::HashMap;
use std::fs::File;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    #[default]
    File,
    Folder,
    /// Database connection string, passed to containers as an environment variable.
    DbConnection,
    Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    #[serde(default)]
    pub kind: DataKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub name: String,
    #[serde(default)]
    pub kind: DataKind,
    /// Output format, e.g. `GTiff`.
    #[serde(default)]
    pub data_format: Option<String>,
    /// Formats written as several sibling files (e.g. ENVI header + data).
    #[serde(default)]
    pub multi_file: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    pub name: String,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    pub id: String,
    /// Command line template rendered over the task's bindings.
    pub template: String,
    #[serde(default)]
    pub sources: Vec<SourceDescriptor>,
    #[serde(default)]
    pub targets: Vec<TargetDescriptor>,
    #[serde(default)]
    pub parameters: Vec<ParameterDescriptor>,
    /// Parallelism flag template inserted right after the executable, e.g. `--threads {{cpus}}`.
    #[serde(default)]
    pub parallel_flag: Option<String>,
    /// The tool writes into a temporary location that eoflow relocates afterwards.
    #[serde(default)]
    pub manages_output: bool,
    /// Container the component runs in, if any.
    #[serde(default)]
    pub container: Option<String>,
}

impl ComponentDescriptor {
    pub fn new(id: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            template: template.into(),
            sources: Vec::new(),
            targets: Vec::new(),
            parameters: Vec::new(),
            parallel_flag: None,
            manages_output: false,
            container: None,
        }
    }

    /// Outputs need recursive copy and removal.
    pub fn has_composite_outputs(&self) -> bool {
        self.targets
            .iter()
            .any(|t| t.kind == DataKind::Folder || t.multi_file)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    pub id: String,
    pub image: String,
    /// Memory a single application run needs, in MB.
    #[serde(default)]
    pub app_memory_mb: i64,
    /// Extra arguments appended to every invocation.
    #[serde(default)]
    pub common_parameters: Option<String>,
    /// Name of the argument selecting the output format, e.g. `-of`.
    #[serde(default)]
    pub format_parameter: Option<String>,
}

/// Resolves component ids to their descriptors.
pub trait ComponentRegistry: Send + Sync {
    fn component(&self, id: &str) -> Option<ComponentDescriptor>;

    fn container(&self, id: &str) -> Option<ContainerDescriptor>;
}

#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    components: Vec<ComponentDescriptor>,
    #[serde(default)]
    containers: Vec<ContainerDescriptor>,
}

/// Registry backed by a YAML file loaded at start-up.
#[derive(Debug, Default, Clone)]
pub struct StaticRegistry {
    components: HashMap<String, ComponentDescriptor>,
    containers: HashMap<String, ContainerDescriptor>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &str) -> Result<Self> {
        let file: RegistryFile = serde_yaml::from_reader(File::open(path)?)?;
        Ok(Self::from_file(file))
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        let file: RegistryFile = serde_yaml::from_str(yaml)?;
        Ok(Self::from_file(file))
    }

    fn from_file(file: RegistryFile) -> Self {
        let mut registry = Self::new();
        for component in file.components {
            registry.insert_component(component);
        }
        for container in file.containers {
            registry.insert_container(container);
        }
        tracing::info!(
            components = registry.components.len(),
            containers = registry.containers.len(),
            "Component registry loaded"
        );
        registry
    }

    pub fn insert_component(&mut self, component: ComponentDescriptor) {
        self.components.insert(component.id.clone(), component);
    }

    pub fn insert_container(&mut self, container: ContainerDescriptor) {
        self.containers.insert(container.id.clone(), container);
    }
}

impl ComponentRegistry for StaticRegistry {
    fn component(&self, id: &str) -> Option<ComponentDescriptor> {
        self.components.get(id).cloned()
    }

    fn container(&self, id: &str) -> Option<ContainerDescriptor> {
        self.containers.get(id).cloned()
    }
}
