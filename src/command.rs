//! Turning tasks into concrete command invocations.
//!
//! `CommandBuilder::build` renders the task's command template, injects parallelism flags,
//! optionally wraps the invocation in a container run, and optionally wraps everything in a shell
//! script that relocates outputs written to a temporary directory.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use handlebars::Handlebars;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::component::{ComponentDescriptor, ContainerDescriptor, DataKind};
use crate::error::{ExecError, Result};
use crate::selector::NodeData;
use crate::task::Task;

/// A concrete invocation: executable plus argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltCommand {
    pub executable: String,
    pub args: Vec<String>,
}

impl BuiltCommand {
    pub fn new(executable: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
        }
    }

    /// Shell-safe single line, suitable for `sh -c`.
    pub fn command_line(&self) -> String {
        std::iter::once(&self.executable)
            .chain(self.args.iter())
            .map(|token| shell_quote(token))
            .join(" ")
    }
}

impl fmt::Display for BuiltCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Splits a command line on whitespace, keeping double-quoted segments as single tokens.
pub fn tokenize(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    // A quoted empty string still yields a token.
    let mut has_token = false;
    for c in command.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

/// Quotes a token for POSIX shells when it contains anything beyond a safe character set.
pub fn shell_quote(token: &str) -> Cow<'_, str> {
    let safe = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,@%+".contains(c));
    if safe {
        Cow::Borrowed(token)
    } else {
        Cow::Owned(format!("'{}'", token.replace('\'', r"'\''")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMapping {
    pub host: String,
    pub container: String,
}

impl VolumeMapping {
    pub fn new(host: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
        }
    }
}

/// Host folders mounted into containers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMap {
    #[serde(default)]
    pub workspace: Option<VolumeMapping>,
    #[serde(default)]
    pub temp: Option<VolumeMapping>,
    #[serde(default)]
    pub config: Option<VolumeMapping>,
    #[serde(default)]
    pub additional: Vec<VolumeMapping>,
}

impl VolumeMap {
    pub fn mappings(&self) -> impl Iterator<Item = &VolumeMapping> {
        self.workspace
            .iter()
            .chain(self.temp.iter())
            .chain(self.config.iter())
            .chain(self.additional.iter())
    }

    /// Rewrites a host path (or the value of a `key=path` token) to its container-side path.
    /// The longest matching host prefix wins.
    pub fn to_container_path(&self, token: &str) -> String {
        let (prefix, path) = match token.split_once('=') {
            Some((key, value)) if value.starts_with('/') => (Some(key), value),
            _ => (None, token),
        };
        let best = self
            .mappings()
            .filter(|m| {
                path == m.host
                    || path
                        .strip_prefix(m.host.as_str())
                        .map_or(false, |rest| rest.starts_with('/') || m.host.ends_with('/'))
            })
            .max_by_key(|m| m.host.len());
        let translated = match best {
            Some(m) => format!("{}{}", m.container, &path[m.host.len()..]),
            None => path.to_string(),
        };
        match prefix {
            Some(key) => format!("{}={}", key, translated),
            None => translated,
        }
    }
}

/// Everything needed to build one task's invocation.
pub struct BuildRequest<'a> {
    pub task: &'a Task,
    pub component: Option<&'a ComponentDescriptor>,
    pub container: Option<&'a ContainerDescriptor>,
    pub node: &'a NodeData,
}

pub struct CommandBuilder {
    templates: Handlebars<'static>,
    /// Container runtime binary. `None` disables containerized execution.
    container_runtime: Option<String>,
    volumes: VolumeMap,
    temp_root: PathBuf,
}

impl CommandBuilder {
    pub fn new(container_runtime: Option<String>, volumes: VolumeMap, temp_root: PathBuf) -> Self {
        let mut templates = Handlebars::new();
        templates.register_escape_fn(handlebars::no_escape);
        handlebars_misc_helpers::register(&mut templates);
        Self {
            templates,
            container_runtime,
            volumes,
            temp_root,
        }
    }

    /// Host directory a component that manages its own output writes into.
    pub fn temp_dir(&self, task: &Task) -> PathBuf {
        let host_root = self
            .volumes
            .temp
            .as_ref()
            .map(|m| PathBuf::from(&m.host))
            .unwrap_or_else(|| self.temp_root.clone());
        host_root.join(work_name(task))
    }

    pub fn build(&self, request: &BuildRequest) -> Result<BuiltCommand> {
        let BuildRequest {
            task,
            component,
            container,
            node,
        } = *request;
        let template = task
            .command
            .as_deref()
            .or(component.map(|c| c.template.as_str()))
            .ok_or_else(|| {
                ExecError::Submission(format!(
                    "task {} has neither a command nor a component",
                    task.display_id()
                ))
            })?;

        let relocation = component
            .filter(|c| c.manages_output)
            .map(|c| self.relocation(task, c));

        let mut data: HashMap<String, String> = HashMap::new();
        if let Some(component) = component {
            for parameter in &component.parameters {
                if let Some(default) = &parameter.default {
                    data.insert(parameter.name.clone(), default.clone());
                }
            }
        }
        data.extend(task.inputs.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        for (key, value) in task.outputs.iter() {
            let value = match &relocation {
                Some(relocation) => relocation.temp_path(value),
                None => value.to_string(),
            };
            data.insert(key.to_string(), value);
        }
        data.extend(node.node.params.clone());
        data.insert("hostname".to_string(), node.node.hostname.clone());
        data.insert("cpus".to_string(), node.cpu_to_use.to_string());
        data.insert("memory_mb".to_string(), node.memory_to_use.to_string());

        let rendered = self.templates.render_template(template, &data)?;
        let mut tokens = tokenize(&rendered);
        if tokens.is_empty() {
            return Err(ExecError::Submission(format!(
                "task {} rendered an empty command",
                task.display_id()
            )));
        }

        if let Some(flag) = component.and_then(|c| c.parallel_flag.as_deref()) {
            let cpus = parallelism(node);
            let mut flag_data = HashMap::new();
            flag_data.insert("cpus", cpus.to_string());
            let flags = tokenize(&self.templates.render_template(flag, &flag_data)?);
            tokens.splice(1..1, flags);
        }

        if let Some(container) = container {
            if let Some(parameter) = container.format_parameter.as_deref() {
                let format = component
                    .and_then(|c| c.targets.iter().find_map(|t| t.data_format.clone()));
                if let Some(format) = format {
                    if !tokens.iter().any(|t| t == parameter) {
                        tokens.push(parameter.to_string());
                        tokens.push(format);
                    }
                }
            }
            if let Some(common) = container.common_parameters.as_deref() {
                tokens.extend(tokenize(common));
            }
        }

        let mut command = match (container, self.container_runtime.as_deref()) {
            (Some(container), Some(runtime)) => {
                self.containerize(runtime, container, component, task, node, tokens)
            }
            _ => {
                let executable = tokens.remove(0);
                BuiltCommand::new(executable, tokens)
            }
        };

        if let Some(relocation) = relocation {
            command = relocation.wrap(&command);
        }
        tracing::debug!(task = %task.display_id(), command = %command, "Command built");
        Ok(command)
    }

    fn containerize(
        &self,
        runtime: &str,
        container: &ContainerDescriptor,
        component: Option<&ComponentDescriptor>,
        task: &Task,
        node: &NodeData,
        tokens: Vec<String>,
    ) -> BuiltCommand {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            format!("eoflow-{}", work_name(task)),
        ];
        for mapping in self.volumes.mappings() {
            args.push("-v".to_string());
            args.push(format!("{}:{}", mapping.host, mapping.container));
        }
        if let Some(workspace) = &self.volumes.workspace {
            args.push("-w".to_string());
            args.push(workspace.container.clone());
        }
        args.push("--cpus".to_string());
        args.push(node.cpu_to_use.max(1).to_string());
        let memory = node.memory_to_use.max(container.app_memory_mb);
        if memory > 0 {
            args.push("--memory".to_string());
            args.push(format!("{}m", memory));
        }
        if let Some(component) = component {
            for source in component
                .sources
                .iter()
                .filter(|s| s.kind == DataKind::DbConnection)
            {
                if let Some(value) = task.inputs.get(&source.name) {
                    args.push("-e".to_string());
                    args.push(format!("{}={}", env_name(&source.name), value));
                }
            }
        }
        args.push(container.image.clone());
        args.extend(tokens.iter().map(|t| self.volumes.to_container_path(t)));
        BuiltCommand::new(runtime, args)
    }

    fn relocation(&self, task: &Task, component: &ComponentDescriptor) -> OutputRelocation {
        let temp_dir = self.temp_dir(task);
        let final_dir = task
            .outputs
            .iter()
            .next()
            .map(|(name, path)| {
                let path = Path::new(path);
                let is_folder = component
                    .targets
                    .iter()
                    .any(|t| t.name == name && t.kind == DataKind::Folder);
                if is_folder {
                    path.to_path_buf()
                } else {
                    path.parent().map(Path::to_path_buf).unwrap_or_default()
                }
            })
            .unwrap_or_default();
        OutputRelocation {
            temp_dir,
            final_dir,
            recursive: component.has_composite_outputs(),
        }
    }
}

/// Cores handed to a tool's parallelism flag.
fn parallelism(node: &NodeData) -> usize {
    if node.node.is_master() {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        available / 2 + 2
    } else {
        node.cpu_to_use.max(1)
    }
}

/// Temp directory and container name of a task.
pub fn work_name(task: &Task) -> String {
    match task.id {
        Some(id) => format!("task-{}", id),
        None => {
            let slug: String = task
                .name
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
                .collect();
            format!("task-{}", slug)
        }
    }
}

fn env_name(parameter: &str) -> String {
    parameter
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Temp-to-final output move wrapped around a command.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OutputRelocation {
    temp_dir: PathBuf,
    final_dir: PathBuf,
    /// Folder or multi-file outputs.
    recursive: bool,
}

impl OutputRelocation {
    fn temp_path(&self, final_path: &str) -> String {
        match Path::new(final_path).file_name() {
            Some(name) => self.temp_dir.join(name).to_string_lossy().into_owned(),
            None => self.temp_dir.to_string_lossy().into_owned(),
        }
    }

    fn wrap(&self, command: &BuiltCommand) -> BuiltCommand {
        let temp = self.temp_dir.to_string_lossy();
        let temp = shell_quote(&temp);
        let target = self.final_dir.to_string_lossy();
        let target = shell_quote(&target);
        let (copy, clean) = if self.recursive {
            (
                format!("cp -r {}/. {}/", temp, target),
                format!("rm -rf {}", temp),
            )
        } else {
            (
                format!("cp {}/* {}/", temp, target),
                format!("rm -f {}/* && rmdir {}", temp, temp),
            )
        };
        let script = format!(
            "mkdir -p {} {} && {} && {} && {}",
            temp,
            target,
            command.command_line(),
            copy,
            clean
        );
        BuiltCommand::new("sh", vec!["-c".to_string(), script])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{SourceDescriptor, TargetDescriptor};
    use crate::node::{Flavor, NodeDescription};

    fn worker(cpus: usize) -> NodeData {
        NodeData {
            node: NodeDescription::new(
                "worker-1",
                Flavor {
                    cpus,
                    memory_gb: 16,
                    disk_gb: 100,
                },
            ),
            cpu_to_use: cpus,
            memory_to_use: 4096,
        }
    }

    fn builder(runtime: Option<&str>) -> CommandBuilder {
        CommandBuilder::new(
            runtime.map(str::to_string),
            VolumeMap {
                workspace: Some(VolumeMapping::new("/data/ws", "/mnt/ws")),
                temp: Some(VolumeMapping::new("/data/tmp", "/mnt/tmp")),
                config: None,
                additional: vec![VolumeMapping::new("/data/aux", "/mnt/aux")],
            },
            PathBuf::from("/tmp/eoflow"),
        )
    }

    #[test]
    fn test_tokenize_keeps_quoted_segments() {
        assert_eq!(tokenize(r#"foo "bar baz" qux"#), vec!["foo", "bar baz", "qux"]);
    }

    #[test]
    fn test_tokenize_edge_cases() {
        assert_eq!(tokenize("  a   b  "), vec!["a", "b"]);
        assert_eq!(tokenize(r#"a "" b"#), vec!["a", "", "b"]);
        assert_eq!(tokenize(r#"--expr="A + B""#), vec!["--expr=A + B"]);
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/data/a.tif"), "/data/a.tif");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_command_line_round_trips_through_tokenize_for_simple_args() {
        let command = BuiltCommand::new("gdalinfo", vec!["-stats".into(), "/data/x.tif".into()]);
        assert_eq!(command.command_line(), "gdalinfo -stats /data/x.tif");
    }

    #[test]
    fn test_to_container_path() {
        let volumes = builder(None).volumes;
        assert_eq!(volumes.to_container_path("/data/ws/a.tif"), "/mnt/ws/a.tif");
        assert_eq!(volumes.to_container_path("/data/ws"), "/mnt/ws");
        assert_eq!(volumes.to_container_path("/data/wsx/a.tif"), "/data/wsx/a.tif");
        assert_eq!(volumes.to_container_path("out=/data/aux/b"), "out=/mnt/aux/b");
        assert_eq!(volumes.to_container_path("-of"), "-of");
    }

    #[test]
    fn test_build_plain_command() {
        let mut task = Task::new("t").with_command("gdalinfo {{src}}");
        task.set_input("src", "/data/ws/in file.tif");
        let command = builder(None)
            .build(&BuildRequest {
                task: &task,
                component: None,
                container: None,
                node: &worker(4),
            })
            .unwrap();
        assert_eq!(command.executable, "gdalinfo");
        assert_eq!(command.args, vec!["/data/ws/in", "file.tif"]);
    }

    #[test]
    fn test_build_without_command_fails() {
        let task = Task::new("t");
        let result = builder(None).build(&BuildRequest {
            task: &task,
            component: None,
            container: None,
            node: &worker(4),
        });
        assert!(matches!(result, Err(ExecError::Submission(_))));
    }

    #[test]
    fn test_parallel_flag_inserted_after_executable() {
        let mut component = ComponentDescriptor::new("otb", "otbcli_BandMath -il {{src}}");
        component.parallel_flag = Some("--threads {{cpus}}".to_string());
        let mut task = Task::new("t").with_component("otb");
        task.set_input("src", "/a.tif");
        let command = builder(None)
            .build(&BuildRequest {
                task: &task,
                component: Some(&component),
                container: None,
                node: &worker(6),
            })
            .unwrap();
        assert_eq!(command.executable, "otbcli_BandMath");
        assert_eq!(command.args, vec!["--threads", "6", "-il", "/a.tif"]);
    }

    #[test]
    fn test_parallel_flag_on_master_uses_half_the_processors_plus_two() {
        let mut component = ComponentDescriptor::new("otb", "tool");
        component.parallel_flag = Some("-j {{cpus}}".to_string());
        let task = Task::new("t");
        let mut node = worker(64);
        node.node = NodeDescription::master("master", node.node.flavor);
        let command = builder(None)
            .build(&BuildRequest {
                task: &task,
                component: Some(&component),
                container: None,
                node: &node,
            })
            .unwrap();
        let expected = std::thread::available_parallelism().unwrap().get() / 2 + 2;
        assert_eq!(command.args, vec!["-j".to_string(), expected.to_string()]);
    }

    #[test]
    fn test_containerized_command() {
        let mut component = ComponentDescriptor::new(
            "translate",
            r#"gdal_translate {{src}} {{out}} -co "COMPRESS=DEFLATE""#,
        );
        component.sources = vec![
            SourceDescriptor {
                name: "src".into(),
                kind: DataKind::File,
            },
            SourceDescriptor {
                name: "catalog-db".into(),
                kind: DataKind::DbConnection,
            },
        ];
        component.targets = vec![TargetDescriptor {
            name: "out".into(),
            kind: DataKind::File,
            data_format: Some("GTiff".into()),
            multi_file: false,
        }];
        let container = ContainerDescriptor {
            id: "gdal".into(),
            image: "osgeo/gdal:3.8".into(),
            app_memory_mb: 1024,
            common_parameters: Some("-q".into()),
            format_parameter: Some("-of".into()),
        };
        let mut task = Task::new("t");
        task.id = Some(42);
        task.set_input("src", "/data/ws/in.tif");
        task.set_input("catalog-db", "postgres://eo@db/catalog");
        task.set_output("out", "/data/ws/out.tif");

        let command = builder(Some("docker"))
            .build(&BuildRequest {
                task: &task,
                component: Some(&component),
                container: Some(&container),
                node: &worker(4),
            })
            .unwrap();
        assert_eq!(command.executable, "docker");
        let args = command.args.join(" ");
        assert!(args.starts_with("run --rm --name eoflow-task-42"), "{}", args);
        assert!(args.contains("-v /data/ws:/mnt/ws"));
        assert!(args.contains("-v /data/tmp:/mnt/tmp"));
        assert!(args.contains("-v /data/aux:/mnt/aux"));
        assert!(args.contains("--cpus 4 --memory 4096m"));
        assert!(args.contains("-e CATALOG_DB=postgres://eo@db/catalog"));
        let image_at = command.args.iter().position(|a| a == "osgeo/gdal:3.8").unwrap();
        assert_eq!(
            &command.args[image_at + 1..],
            &[
                "gdal_translate",
                "/mnt/ws/in.tif",
                "/mnt/ws/out.tif",
                "-co",
                "COMPRESS=DEFLATE",
                "-of",
                "GTiff",
                "-q"
            ]
        );
    }

    #[test]
    fn test_containerization_disabled_without_runtime() {
        let component = ComponentDescriptor::new("c", "tool {{src}}");
        let container = ContainerDescriptor {
            id: "img".into(),
            image: "img".into(),
            app_memory_mb: 0,
            common_parameters: None,
            format_parameter: None,
        };
        let mut task = Task::new("t");
        task.set_input("src", "/data/ws/a");
        let command = builder(None)
            .build(&BuildRequest {
                task: &task,
                component: Some(&component),
                container: Some(&container),
                node: &worker(2),
            })
            .unwrap();
        assert_eq!(command.executable, "tool");
        assert_eq!(command.args, vec!["/data/ws/a"]);
    }

    #[test]
    fn test_managed_output_single_file() {
        let mut component = ComponentDescriptor::new("c", "tool {{src}} {{out}}");
        component.manages_output = true;
        component.targets = vec![TargetDescriptor {
            name: "out".into(),
            kind: DataKind::File,
            data_format: None,
            multi_file: false,
        }];
        let mut task = Task::new("t");
        task.id = Some(7);
        task.set_input("src", "/in.tif");
        task.set_output("out", "/results/out.tif");
        let command = builder(None)
            .build(&BuildRequest {
                task: &task,
                component: Some(&component),
                container: None,
                node: &worker(2),
            })
            .unwrap();
        assert_eq!(command.executable, "sh");
        assert_eq!(command.args[0], "-c");
        assert_eq!(
            command.args[1],
            "mkdir -p /data/tmp/task-7 /results && tool /in.tif /data/tmp/task-7/out.tif \
             && cp /data/tmp/task-7/* /results/ && rm -f /data/tmp/task-7/* && rmdir /data/tmp/task-7"
        );
    }

    #[test]
    fn test_managed_output_multi_file_is_recursive() {
        let mut component = ComponentDescriptor::new("c", "tool {{out}}");
        component.manages_output = true;
        component.targets = vec![TargetDescriptor {
            name: "out".into(),
            kind: DataKind::File,
            data_format: Some("ENVI".into()),
            multi_file: true,
        }];
        let mut task = Task::new("t");
        task.id = Some(8);
        task.set_output("out", "/results/out.img");
        let command = builder(None)
            .build(&BuildRequest {
                task: &task,
                component: Some(&component),
                container: None,
                node: &worker(2),
            })
            .unwrap();
        assert!(command.args[1].contains("cp -r /data/tmp/task-8/. /results/"));
        assert!(command.args[1].ends_with("rm -rf /data/tmp/task-8"));
    }
}
