// Copy module - place a file on the host

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use super::{Module, ModuleOutcome, Params};
use crate::executor::{transfer, Session};
use crate::output::errors::EngineError;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CopyArgs {
    dest: String,
    /// File on the controller
    #[serde(default)]
    src: Option<PathBuf>,
    /// Inline file contents
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    mode: Option<Mode>,
}

/// `"0644"` is read as octal; a bare integer is taken as the mode bits
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Mode {
    Octal(String),
    Bits(u32),
}

impl Mode {
    fn bits(&self) -> Result<u32, String> {
        let bits = match self {
            Mode::Octal(text) => u32::from_str_radix(text.trim_start_matches("0o"), 8)
                .map_err(|_| format!("'{}' is not an octal mode", text))?,
            Mode::Bits(bits) => *bits,
        };
        if bits > 0o7777 {
            return Err(format!("mode {:o} is out of range", bits));
        }
        Ok(bits)
    }
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::InvalidParams {
        module: "copy".to_string(),
        message: message.into(),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CopyModule;

impl CopyModule {
    fn parse(params: &Params) -> Result<(CopyArgs, Option<u32>), EngineError> {
        let args: CopyArgs = serde_json::from_value(serde_json::Value::Object(params.clone()))
            .map_err(|e| invalid(e.to_string()))?;

        if args.dest.trim().is_empty() {
            return Err(invalid("'dest' must not be empty"));
        }
        if args.src.is_some() == args.content.is_some() {
            return Err(invalid("exactly one of 'src' or 'content' is required"));
        }
        let mode = args.mode.as_ref().map(Mode::bits).transpose().map_err(invalid)?;

        Ok((args, mode))
    }
}

#[async_trait]
impl Module for CopyModule {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn validate(&self, params: &Params) -> Result<(), EngineError> {
        Self::parse(params).map(|_| ())
    }

    async fn run(
        &self,
        session: &dyn Session,
        params: &Params,
    ) -> Result<ModuleOutcome, EngineError> {
        let (args, mode) = Self::parse(params)?;

        let changed = match (&args.src, &args.content) {
            (Some(src), _) => transfer::upload(session, src, &args.dest, mode).await?,
            (None, Some(content)) => {
                transfer::put(session, &args.dest, content.as_bytes(), mode).await?
            }
            (None, None) => return Err(invalid("nothing to copy")),
        };

        if changed {
            Ok(ModuleOutcome {
                stdout: format!("wrote {}", args.dest),
                changed: true,
                ..Default::default()
            })
        } else {
            Ok(ModuleOutcome::unchanged(format!("{} already up to date", args.dest)))
        }
    }
}
