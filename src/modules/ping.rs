// Connectivity check

use async_trait::async_trait;

use super::{Module, ModuleOutcome, Params};
use crate::executor::Session;
use crate::output::errors::EngineError;

/// Runs `true` on the host; never changes anything
#[derive(Debug, Clone, Copy, Default)]
pub struct PingModule;

#[async_trait]
impl Module for PingModule {
    fn name(&self) -> &'static str {
        "ping"
    }

    async fn run(
        &self,
        session: &dyn Session,
        _params: &Params,
    ) -> Result<ModuleOutcome, EngineError> {
        let result = session.exec("true").await?;
        let mut outcome = ModuleOutcome::from_command(result, false);
        if outcome.exit_code == 0 {
            outcome.stdout = "pong".to_string();
        }
        Ok(outcome)
    }
}
