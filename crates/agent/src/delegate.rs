//! Delegation: run a sub-task on an isolated, non-delegating sub-agent.

use crate::controller::{AgentAnswer, AgentLoop, AnswerRequest};
use crate::prompts;
use crate::protocol::ToolSignature;
use crate::scheduler::{DelegationScheduler, DelegationTask};
use futures::future::BoxFuture;
use sleuth_core::error::{Error, Result};
use sleuth_core::message::SessionId;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Wire name of the delegation tool.
pub const DELEGATE_TOOL: &str = "delegate";

/// Signature the parser and prompt use for `delegate`.
pub fn delegate_signature() -> ToolSignature {
    ToolSignature::new(
        DELEGATE_TOOL,
        "Hand a self-contained research sub-task to a separate assistant and get its findings back. \
         Use for independent investigations; the assistant cannot see this conversation.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Complete description of the sub-task, including any context it needs"
                }
            },
            "required": ["task"]
        }),
    )
}

pub struct Delegator {
    scheduler: Arc<DelegationScheduler>,
    subagent: AgentLoop,
    timeout: Duration,
}

impl Delegator {
    /// `subagent` must not itself have delegation enabled.
    pub fn new(scheduler: Arc<DelegationScheduler>, subagent: AgentLoop, timeout: Duration) -> Self {
        debug_assert!(subagent.delegator().is_none(), "sub-agents cannot delegate");
        Self {
            scheduler,
            subagent,
            timeout,
        }
    }

    pub fn scheduler(&self) -> &Arc<DelegationScheduler> {
        &self.scheduler
    }

    /// Run `task` through the scheduler and return the sub-agent's answer.
    pub async fn delegate(
        &self,
        parent: &SessionId,
        task: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let task = DelegationTask::new(parent.clone(), task, self.timeout);
        debug!(task_id = %task.task_id, session_id = %parent, "Delegating sub-task");

        let child = cancel.child_token();
        self.scheduler
            .submit(task, |task| async move {
                let request = AnswerRequest::new(SessionId::new(), prompts::delegation_task(&task.payload));
                let answer = self.run_subagent(request, &child).await?;
                validate_output(answer.answer)
            })
            .await
    }

    fn run_subagent<'a>(
        &'a self,
        request: AnswerRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<AgentAnswer>> {
        Box::pin(self.subagent.answer(request, cancel))
    }
}

/// Reject blank or NUL-containing sub-agent output.
pub fn validate_output(output: String) -> Result<String> {
    if output.trim().is_empty() {
        return Err(Error::InvalidSubagentOutput("sub-agent returned an empty answer".into()));
    }
    if output.contains('\0') {
        return Err(Error::InvalidSubagentOutput(
            "sub-agent answer contains a null byte".into(),
        ));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_output() {
        assert!(matches!(validate_output(String::new()), Err(Error::InvalidSubagentOutput(_))));
        assert!(matches!(validate_output(" \n\t".into()), Err(Error::InvalidSubagentOutput(_))));
        assert!(matches!(validate_output("ok\0".into()), Err(Error::InvalidSubagentOutput(_))));
        assert_eq!(validate_output("found it".into()).unwrap(), "found it");
    }

    #[test]
    fn signature_requires_task() {
        let sig = delegate_signature();
        assert_eq!(sig.name, DELEGATE_TOOL);
        assert!(sig.is_required("task"));
    }
}
