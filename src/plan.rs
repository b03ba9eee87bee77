// Validated, ordered task plan

use std::sync::Arc;
use std::time::Duration;

use crate::executor::RetryPolicy;
use crate::inventory::{HostSelector, Inventory};
use crate::modules::{Module, ModuleRegistry, Params};
use crate::output::errors::EngineError;

/// One step of the plan, with its module already resolved
#[derive(Clone)]
pub struct Task {
    /// Position in the plan
    pub index: usize,
    pub name: String,
    pub module_name: String,
    pub module: Arc<dyn Module>,
    pub params: Params,
    pub selector: HostSelector,
    pub timeout: Option<Duration>,
    /// Overrides the engine's default policy
    pub retry: Option<RetryPolicy>,
}

impl Task {
    pub fn new(index: usize, name: impl Into<String>, module: Arc<dyn Module>) -> Self {
        Task {
            index,
            name: name.into(),
            module_name: module.name().to_string(),
            module,
            params: Params::new(),
            selector: HostSelector::all(),
            timeout: None,
            retry: None,
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("module", &self.module_name)
            .field("selector", &self.selector.as_str())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Unresolved task description, as a front end produces it
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub name: Option<String>,
    pub module: String,
    pub params: Params,
    pub hosts: HostSelector,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl TaskSpec {
    pub fn new(module: impl Into<String>) -> Self {
        TaskSpec {
            module: module.into(),
            ..Default::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn on(mut self, pattern: &str) -> Self {
        self.hosts = HostSelector::parse(pattern);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Ordered sequence of tasks
#[derive(Debug, Clone, Default)]
pub struct TaskPlan {
    tasks: Vec<Task>,
}

impl TaskPlan {
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, index: usize) -> Option<&Task> {
        self.tasks.get(index)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Task> {
        self.tasks.iter()
    }

    /// Number of (task, host) pairs the plan selects from `inventory`
    pub fn units(&self, inventory: &Inventory) -> usize {
        self.tasks
            .iter()
            .map(|task| inventory.select(&task.selector).len())
            .sum()
    }
}

impl<'a> IntoIterator for &'a TaskPlan {
    type Item = &'a Task;
    type IntoIter = std::slice::Iter<'a, Task>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.iter()
    }
}

/// Resolves module names and validates parameters once, up front
pub struct PlanBuilder {
    registry: ModuleRegistry,
    specs: Vec<TaskSpec>,
}

impl PlanBuilder {
    pub fn new(registry: ModuleRegistry) -> Self {
        PlanBuilder {
            registry,
            specs: Vec::new(),
        }
    }

    pub fn task(mut self, spec: TaskSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn push(&mut self, spec: TaskSpec) {
        self.specs.push(spec);
    }

    pub fn build(self) -> Result<TaskPlan, EngineError> {
        let mut tasks = Vec::with_capacity(self.specs.len());

        for (index, spec) in self.specs.into_iter().enumerate() {
            let name = spec
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("{} #{}", spec.module, index + 1));

            let in_task = |e: EngineError| EngineError::Plan {
                message: format!("task {} '{}': {}", index + 1, name, e),
                suggestion: e.suggestion(),
            };

            let module = self.registry.get(&spec.module).map_err(in_task)?;
            module.validate(&spec.params).map_err(in_task)?;

            if spec.timeout == Some(Duration::ZERO) {
                return Err(in_task(EngineError::Config {
                    message: "timeout must be greater than zero".to_string(),
                }));
            }

            tasks.push(Task {
                index,
                module_name: spec.module,
                module,
                params: spec.params,
                selector: spec.hosts,
                timeout: spec.timeout,
                retry: spec.retry,
                name,
            });
        }

        Ok(TaskPlan { tasks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_resolves_in_order() {
        let plan = PlanBuilder::new(ModuleRegistry::builtin())
            .task(TaskSpec::new("ping"))
            .task(
                TaskSpec::new("command")
                    .named("uptime")
                    .with_param("cmd", json!("uptime"))
                    .on("webservers"),
            )
            .build()
            .unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan.tasks()[0].name, "ping #1");
        assert_eq!(plan.tasks()[1].index, 1);
        assert_eq!(plan.tasks()[1].module.name(), "command");
        assert_eq!(plan.tasks()[1].selector.as_str(), "webservers");
    }

    #[test]
    fn test_unknown_module_rejected() {
        let err = PlanBuilder::new(ModuleRegistry::builtin())
            .task(TaskSpec::new("ping"))
            .task(TaskSpec::new("packages").named("install"))
            .build()
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("task 2 'install'"), "{message}");
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn test_invalid_params_rejected() {
        let err = PlanBuilder::new(ModuleRegistry::builtin())
            .task(TaskSpec::new("command"))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::Plan { .. }));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = PlanBuilder::new(ModuleRegistry::builtin())
            .task(TaskSpec::new("ping").with_timeout(Duration::ZERO))
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn test_units_follow_each_selector() {
        let mut inventory = Inventory::new();
        inventory.add_host(crate::inventory::Host::new("web1").with_tag("web")).unwrap();
        inventory.add_host(crate::inventory::Host::new("web2").with_tag("web")).unwrap();
        inventory.add_host(crate::inventory::Host::new("db1").with_tag("db")).unwrap();

        let plan = PlanBuilder::new(ModuleRegistry::builtin())
            .task(TaskSpec::new("ping"))
            .task(TaskSpec::new("ping").on("web"))
            .task(TaskSpec::new("ping").on("db1"))
            .build()
            .unwrap();

        assert_eq!(plan.units(&inventory), 3 + 2 + 1);
        assert_eq!(TaskPlan::default().units(&inventory), 0);
    }
}
