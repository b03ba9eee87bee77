// YAML front end: inventory and plan documents

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_yaml::{Mapping, Value as YamlValue};
use tracing::{debug, info};

use crate::config::RawRetry;
use crate::executor::RetryPolicy;
use crate::inventory::{CredentialsRef, Host, HostSelector, Inventory};
use crate::modules::{ModuleRegistry, Params};
use crate::output::errors::EngineError;
use crate::plan::{PlanBuilder, TaskPlan, TaskSpec};

/// Raw inventory structure (before conversion)
#[derive(Debug, Default, Deserialize)]
struct RawInventory {
    /// Kept as a mapping so hosts keep file order
    #[serde(default)]
    hosts: Mapping,
    #[serde(default)]
    groups: BTreeMap<String, RawGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHost {
    /// Address; defaults to the host's name
    hostname: Option<String>,
    username: Option<String>,
    password: Option<String>,
    key_file: Option<PathBuf>,
    port: Option<u16>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    variables: BTreeMap<String, YamlValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGroup {
    #[serde(default)]
    hosts: Vec<String>,
    #[serde(default)]
    variables: BTreeMap<String, YamlValue>,
}

/// Raw plan structure (before conversion)
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPlan {
    tasks: Vec<RawTask>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTask {
    name: Option<String>,
    module: String,
    /// Host selector pattern; defaults to all hosts
    hosts: Option<String>,
    #[serde(default)]
    params: BTreeMap<String, YamlValue>,
    /// Task timeout in seconds
    timeout: Option<u64>,
    retry: Option<RawRetry>,
}

fn yaml_error(what: &str, source: &str, e: serde_yaml::Error) -> String {
    match e.location() {
        Some(loc) => format!(
            "invalid {} YAML in {} at line {}, column {}: {}",
            what,
            source,
            loc.line(),
            loc.column(),
            e
        ),
        None => format!("invalid {} YAML in {}: {}", what, source, e),
    }
}

fn read_file(path: &Path, what: &str) -> Result<String, EngineError> {
    std::fs::read_to_string(path).map_err(|e| EngineError::Io {
        message: format!("Failed to read {} file: {}", what, e),
        path: Some(path.to_path_buf()),
    })
}

/// Convert YAML values to the JSON values hosts and tasks carry
fn yaml_to_json(value: YamlValue) -> Result<serde_json::Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

fn convert_vars(
    vars: BTreeMap<String, YamlValue>,
) -> Result<BTreeMap<String, serde_json::Value>, String> {
    vars.into_iter()
        .map(|(k, v)| Ok((k, yaml_to_json(v)?)))
        .collect()
}

pub fn load_inventory_file(path: &Path) -> Result<Inventory, EngineError> {
    let content = read_file(path, "inventory")?;
    let inventory = parse_inventory(&content, &path.display().to_string())?;
    info!(path = %path.display(), hosts = inventory.len(), "loaded inventory");
    Ok(inventory)
}

/// Parse an inventory document.
///
/// Group variables apply to member hosts; a host's own variables win.
pub fn parse_inventory(content: &str, source: &str) -> Result<Inventory, EngineError> {
    let inventory_error = |message: String| EngineError::Inventory {
        message,
        suggestion: Some("Check the inventory against `catalyst init` output".to_string()),
    };

    let raw: RawInventory = if content.trim().is_empty() {
        RawInventory::default()
    } else {
        serde_yaml::from_str(content).map_err(|e| inventory_error(yaml_error("inventory", source, e)))?
    };

    let mut parsed = Vec::with_capacity(raw.hosts.len());
    for (key, value) in raw.hosts {
        let name = match key {
            YamlValue::String(s) => s,
            other => {
                return Err(inventory_error(format!(
                    "host names must be strings, got {:?}",
                    other
                )))
            }
        };
        // `web1:` with no body is a host with all defaults
        let raw_host: RawHost = if value.is_null() {
            serde_yaml::from_value(YamlValue::Mapping(Mapping::new()))
        } else {
            serde_yaml::from_value(value)
        }
        .map_err(|e| inventory_error(format!("host '{}': {}", name, e)))?;
        parsed.push((name, raw_host));
    }

    // Group membership from both sides: host `groups:` and group `hosts:`
    for (group, raw_group) in &raw.groups {
        for member in &raw_group.hosts {
            let (_, host) = parsed
                .iter_mut()
                .find(|(name, _)| name == member)
                .ok_or_else(|| {
                    inventory_error(format!(
                        "group '{}' references unknown host '{}'",
                        group, member
                    ))
                })?;
            if !host.groups.contains(group) {
                host.groups.push(group.clone());
            }
        }
    }

    let mut inventory = Inventory::new();
    for (name, raw_host) in parsed {
        let host = convert_host(name, raw_host, &raw.groups).map_err(inventory_error)?;
        inventory.add_host(host)?;
    }

    debug!(
        hosts = inventory.len(),
        groups = inventory.group_names().len(),
        "parsed inventory"
    );
    Ok(inventory)
}

fn convert_host(
    name: String,
    raw: RawHost,
    groups: &BTreeMap<String, RawGroup>,
) -> Result<Host, String> {
    let mut vars = BTreeMap::new();
    for group in &raw.groups {
        if let Some(g) = groups.get(group) {
            vars.extend(convert_vars(g.variables.clone())?);
        }
    }
    vars.extend(convert_vars(raw.variables).map_err(|e| format!("host '{}': {}", name, e))?);

    let credentials = match (raw.key_file, raw.password) {
        (Some(path), _) => CredentialsRef::KeyFile(path),
        (None, Some(password)) => CredentialsRef::Password(password),
        (None, None) => CredentialsRef::Agent,
    };

    let mut host = Host::new(name.clone())
        .with_address(raw.hostname.unwrap_or(name))
        .with_port(raw.port.unwrap_or(22))
        .with_user(raw.username.unwrap_or_default())
        .with_credentials(credentials);
    for group in raw.groups {
        host = host.with_tag(group);
    }
    host.vars = vars;
    Ok(host)
}

/// Read and build a plan file; task retry blocks inherit from `default_retry`
pub fn load_plan_file(
    path: &Path,
    registry: &ModuleRegistry,
    default_retry: &RetryPolicy,
) -> Result<TaskPlan, EngineError> {
    let content = read_file(path, "plan")?;
    let plan = parse_plan_with_retry(&content, &path.display().to_string(), registry, default_retry)?;
    info!(path = %path.display(), tasks = plan.len(), "loaded plan");
    Ok(plan)
}

/// Parse a plan document, then resolve and validate it.
/// Task retry settings fill unset fields from `default_retry`.
pub fn parse_plan_with_retry(
    content: &str,
    source: &str,
    registry: &ModuleRegistry,
    default_retry: &RetryPolicy,
) -> Result<TaskPlan, EngineError> {
    let raw: RawPlan = serde_yaml::from_str(content).map_err(|e| EngineError::Plan {
        message: yaml_error("plan", source, e),
        suggestion: Some("A plan is a `tasks:` list of {name, module, hosts, params}".to_string()),
    })?;

    let mut builder = PlanBuilder::new(registry.clone());
    for (index, task) in raw.tasks.into_iter().enumerate() {
        builder.push(convert_task(index, task, default_retry)?);
    }
    builder.build()
}

pub fn parse_plan(
    content: &str,
    source: &str,
    registry: &ModuleRegistry,
) -> Result<TaskPlan, EngineError> {
    parse_plan_with_retry(content, source, registry, &RetryPolicy::default())
}

fn convert_task(
    index: usize,
    raw: RawTask,
    default_retry: &RetryPolicy,
) -> Result<TaskSpec, EngineError> {
    let label = raw
        .name
        .clone()
        .unwrap_or_else(|| format!("#{}", index + 1));
    let plan_error = |message: String| EngineError::Plan {
        message: format!("task '{}': {}", label, message),
        suggestion: None,
    };

    let mut params = Params::new();
    for (k, v) in raw.params {
        params.insert(k, yaml_to_json(v).map_err(plan_error)?);
    }

    Ok(TaskSpec {
        name: raw.name,
        module: raw.module,
        params,
        hosts: raw
            .hosts
            .as_deref()
            .map(HostSelector::parse)
            .unwrap_or_default(),
        timeout: raw.timeout.map(Duration::from_secs),
        retry: raw
            .retry
            .map(|r| r.convert(default_retry))
            .transpose()
            .map_err(|e| plan_error(e.to_string()))?,
    })
}

/// Sample inventory written by `catalyst init`
pub const SAMPLE_INVENTORY: &str = r#"# Catalyst inventory
hosts:
  local:
    hostname: localhost
    groups: [control]
  web1:
    hostname: web1.example.com
    username: admin
    key_file: ~/.ssh/id_rsa
    groups: [webservers, production]
    variables:
      http_port: 80
  db1:
    hostname: db1.example.com
    username: dbadmin
    groups: [databases, production]
    variables:
      db_port: 5432

groups:
  webservers:
    variables:
      nginx_enabled: true
  databases:
    hosts: [db1]
"#;

/// Sample plan written by `catalyst init`
pub const SAMPLE_PLAN: &str = r#"# Catalyst plan
tasks:
  - name: check connectivity
    module: ping

  - name: kernel version
    module: command
    hosts: production
    params:
      cmd: uname -a
    timeout: 30

  - name: create release directory
    module: command
    hosts: webservers:&production
    params:
      cmd: mkdir -p /srv/releases
      creates: /srv/releases
    retry:
      attempts: 3
      base_delay_ms: 100
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const INVENTORY: &str = r#"
hosts:
  web1:
    hostname: web1.example.com
    username: admin
    key_file: ~/.ssh/id_rsa
    groups: [webservers, production]
    variables:
      http_port: 80
  db1:
    hostname: db1.example.com
    username: dbadmin
    password: secure_password
    port: 2222
    groups: [databases]
  bare:
groups:
  webservers:
    variables:
      nginx_enabled: true
      http_port: 8080
  production:
    hosts: [db1]
"#;

    #[test]
    fn test_parse_inventory() {
        let inventory = parse_inventory(INVENTORY, "test").unwrap();
        let names: Vec<_> = inventory.hosts().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["web1", "db1", "bare"]);

        let web1 = inventory.get_host("web1").unwrap();
        assert_eq!(web1.address, "web1.example.com");
        assert_eq!(web1.credentials, CredentialsRef::KeyFile("~/.ssh/id_rsa".into()));
        // host variables win over group variables
        assert_eq!(web1.vars["http_port"], serde_json::json!(80));
        assert_eq!(web1.vars["nginx_enabled"], serde_json::json!(true));

        let db1 = inventory.get_host("db1").unwrap();
        assert_eq!(db1.port, 2222);
        assert!(db1.has_tag("production"));
        assert_eq!(db1.credentials, CredentialsRef::Password("secure_password".into()));

        let bare = inventory.get_host("bare").unwrap();
        assert_eq!(bare.address, "bare");
        assert_eq!(bare.credentials, CredentialsRef::Agent);
    }

    #[test]
    fn test_inventory_errors() {
        let err = parse_inventory("groups:\n  g:\n    hosts: [ghost]\n", "test").unwrap_err();
        assert!(err.to_string().contains("ghost"));

        let err = parse_inventory("hosts:\n  a:\n    hostnme: x\n", "test").unwrap_err();
        assert!(matches!(err, EngineError::Inventory { .. }));

        assert!(parse_inventory("hosts: [", "test").is_err());
        assert!(parse_inventory("", "test").unwrap().is_empty());
    }

    #[test]
    fn test_parse_plan() {
        let registry = ModuleRegistry::builtin();
        let plan = parse_plan(SAMPLE_PLAN, "plan.yaml", &registry).unwrap();

        assert_eq!(plan.len(), 3);
        let kernel = &plan.tasks()[1];
        assert_eq!(kernel.selector.as_str(), "production");
        assert_eq!(kernel.timeout, Some(Duration::from_secs(30)));
        assert_eq!(kernel.params["cmd"], serde_json::json!("uname -a"));

        let mkdir = &plan.tasks()[2];
        let retry = mkdir.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.base_delay, Duration::from_millis(100));
        assert_eq!(retry.max_delay, RetryPolicy::default().max_delay);
    }

    #[test]
    fn test_plan_errors() {
        let registry = ModuleRegistry::builtin();
        assert!(parse_plan("tasks:\n  - module: nope\n", "p", &registry).is_err());
        assert!(parse_plan("tasks:\n  - module: command\n", "p", &registry).is_err());
        assert!(parse_plan("tasks:\n  - modul: ping\n", "p", &registry).is_err());
        assert!(parse_plan(
            "tasks:\n  - module: ping\n    retry: { attempts: 0 }\n",
            "p",
            &registry
        )
        .is_err());
    }

    #[test]
    fn test_sample_inventory_loads() {
        let inventory = parse_inventory(SAMPLE_INVENTORY, "sample").unwrap();
        assert_eq!(inventory.len(), 3);
        assert!(inventory.get_host("local").unwrap().is_local());
        let prod = inventory.select(&HostSelector::parse("production"));
        assert_eq!(prod.len(), 2);
    }

    #[test]
    fn test_load_files() {
        let dir = tempfile::tempdir().unwrap();
        let inv_path = dir.path().join("inventory.yaml");
        let plan_path = dir.path().join("plan.yaml");
        std::fs::File::create(&inv_path)
            .unwrap()
            .write_all(SAMPLE_INVENTORY.as_bytes())
            .unwrap();
        std::fs::write(&plan_path, SAMPLE_PLAN).unwrap();

        assert_eq!(load_inventory_file(&inv_path).unwrap().len(), 3);
        let defaults = RetryPolicy::default().with_max_delay(Duration::from_secs(7));
        let plan = load_plan_file(&plan_path, &ModuleRegistry::builtin(), &defaults).unwrap();
        assert_eq!(plan.len(), 3);
        // The task's own retry block keeps its fields and inherits the rest
        let retry = plan.tasks()[2].retry.as_ref().unwrap();
        assert_eq!(retry.base_delay, Duration::from_millis(100));
        assert_eq!(retry.max_delay, Duration::from_secs(7));
        assert!(matches!(
            load_inventory_file(&dir.path().join("missing.yaml")),
            Err(EngineError::Io { .. })
        ));
        assert!(matches!(
            load_plan_file(&dir.path().join("missing.yaml"), &ModuleRegistry::builtin(), &defaults),
            Err(EngineError::Io { .. })
        ));
    }
}
