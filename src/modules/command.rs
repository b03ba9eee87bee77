// Command module - execute arbitrary shell commands

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;

use super::{Module, ModuleOutcome, Params};
use crate::executor::Session;
use crate::output::errors::EngineError;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandArgs {
    cmd: String,
    #[serde(default)]
    creates: Option<String>,
    #[serde(default)]
    removes: Option<String>,
    #[serde(default)]
    chdir: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    sudo: bool,
    /// If stdout contains this, the command changed nothing
    #[serde(default)]
    unchanged_marker: Option<String>,
}

pub struct CommandModule;

impl Default for CommandModule {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandModule {
    pub fn new() -> Self {
        CommandModule
    }

    fn parse(params: &Params) -> Result<CommandArgs, EngineError> {
        let args: CommandArgs = serde_json::from_value(serde_json::Value::Object(params.clone()))
            .map_err(|e| EngineError::InvalidParams {
                module: "command".to_string(),
                message: e.to_string(),
            })?;

        if args.cmd.trim().is_empty() {
            return Err(EngineError::InvalidParams {
                module: "command".to_string(),
                message: "'cmd' must not be empty".to_string(),
            });
        }

        if let Some(key) = args.env.keys().find(|k| !is_env_name(k)) {
            return Err(EngineError::InvalidParams {
                module: "command".to_string(),
                message: format!("invalid environment variable name '{}'", key),
            });
        }

        Ok(args)
    }
}

#[async_trait]
impl Module for CommandModule {
    fn name(&self) -> &'static str {
        "command"
    }

    fn validate(&self, params: &Params) -> Result<(), EngineError> {
        Self::parse(params).map(|_| ())
    }

    async fn run(
        &self,
        session: &dyn Session,
        params: &Params,
    ) -> Result<ModuleOutcome, EngineError> {
        let args = Self::parse(params)?;

        // Check 'creates' condition - skip if file exists
        if let Some(ref creates_path) = args.creates {
            let exists = session
                .exec(&format!("test -e {}", shell_quote(creates_path)))
                .await?
                .success();
            if exists {
                return Ok(ModuleOutcome::unchanged(format!(
                    "Skipped - {} already exists",
                    creates_path
                )));
            }
        }

        // Check 'removes' condition - skip if file doesn't exist
        if let Some(ref removes_path) = args.removes {
            let exists = session
                .exec(&format!("test -e {}", shell_quote(removes_path)))
                .await?
                .success();
            if !exists {
                return Ok(ModuleOutcome::unchanged(format!(
                    "Skipped - {} does not exist",
                    removes_path
                )));
            }
        }

        let mut command = ShellCommand::new(&args.cmd).sudo(args.sudo);
        for (k, v) in &args.env {
            command = command.env(k, v);
        }
        if let Some(ref dir) = args.chdir {
            command = command.cwd(dir);
        }

        let result = session.exec(&command.build()).await?;

        let changed = match args.unchanged_marker {
            Some(ref marker) => !result.stdout.contains(marker.as_str()),
            None => true,
        };
        Ok(ModuleOutcome::from_command(result, changed))
    }
}

/// Shell command builder for safer command construction
#[derive(Debug, Clone)]
pub struct ShellCommand {
    parts: Vec<String>,
    env: Vec<(String, String)>,
    cwd: Option<String>,
    sudo: bool,
}

impl ShellCommand {
    pub fn new(cmd: &str) -> Self {
        ShellCommand {
            parts: vec![cmd.to_string()],
            env: Vec::new(),
            cwd: None,
            sudo: false,
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.parts.push(shell_quote(arg));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn cwd(mut self, dir: &str) -> Self {
        self.cwd = Some(dir.to_string());
        self
    }

    /// Run the whole line through `sudo -n -- sh -c`
    pub fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    pub fn build(&self) -> String {
        let mut cmd = String::new();

        // Add directory change if specified
        if let Some(ref dir) = self.cwd {
            cmd.push_str(&format!("cd {} && ", shell_quote(dir)));
        }

        // Add environment variables
        for (k, v) in &self.env {
            cmd.push_str(&format!("{}={} ", k, shell_quote(v)));
        }

        cmd.push_str(&self.parts.join(" "));

        if self.sudo {
            format!("sudo -n -- sh -c {}", force_quote(&cmd))
        } else {
            cmd
        }
    }
}

fn shell_quote(s: &str) -> String {
    // If the string only contains safe characters, return as-is
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '/' || c == '.')
    {
        return s.to_string();
    }

    force_quote(s)
}

fn is_env_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn force_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
