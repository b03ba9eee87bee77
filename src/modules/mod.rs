// Module contract and the registry of built-in modules

mod command;
mod copy;
mod ping;

pub use command::{CommandModule, ShellCommand};
pub use copy::CopyModule;
pub use ping::PingModule;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::executor::{CommandResult, Session};
use crate::output::errors::EngineError;

/// Opaque task parameters, handed to the module unchanged
pub type Params = serde_json::Map<String, Value>;

/// What a module reports after running on one host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub changed: bool,
    /// Output was cut by the transport's capture limit
    pub truncated: bool,
}

impl ModuleOutcome {
    /// Nothing to do: the desired state already holds
    pub fn unchanged(message: impl Into<String>) -> Self {
        ModuleOutcome {
            stdout: message.into(),
            ..Default::default()
        }
    }

    pub fn from_command(result: CommandResult, changed: bool) -> Self {
        ModuleOutcome {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            changed,
            truncated: result.truncated,
        }
    }
}

/// A unit of remote work.
///
/// `validate` runs once when the plan is built; `run` runs once per host.
#[async_trait]
pub trait Module: Send + Sync {
    /// Module name
    fn name(&self) -> &'static str;

    fn validate(&self, _params: &Params) -> Result<(), EngineError> {
        Ok(())
    }

    async fn run(&self, session: &dyn Session, params: &Params)
        -> Result<ModuleOutcome, EngineError>;
}

/// Module lookup by name
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, Arc<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `command`, `copy` and `ping`
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CommandModule::new()));
        registry.register(Arc::new(CopyModule));
        registry.register(Arc::new(PingModule));
        registry
    }

    /// Add a module, replacing one with the same name
    pub fn register(&mut self, module: Arc<dyn Module>) {
        self.modules.insert(module.name().to_string(), module);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Module>, EngineError> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownModule {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.modules.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = ModuleRegistry::builtin();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["command", "copy", "ping"]);
        assert_eq!(registry.get("ping").unwrap().name(), "ping");
    }

    #[test]
    fn test_unknown_module() {
        let registry = ModuleRegistry::builtin();
        match registry.get("package") {
            Err(EngineError::UnknownModule { name }) => assert_eq!(name, "package"),
            other => panic!("expected UnknownModule, got {:?}", other.map(|m| m.name())),
        }
    }
}
