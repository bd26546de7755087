//! Per-call loop state.

use tracing::debug;

/// Where the controller is within one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    AwaitingModel,
    ParsingResponse,
    ExecutingTool,
    Delegating,
    Correcting,
    Completed,
    Failed,
}

impl LoopPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopPhase::Completed | LoopPhase::Failed)
    }

    fn can_move_to(self, next: LoopPhase) -> bool {
        use LoopPhase::*;
        match (self, next) {
            (_, Failed) => !self.is_terminal(),
            (AwaitingModel, ParsingResponse) => true,
            (ParsingResponse, ExecutingTool | Delegating | AwaitingModel | Completed | Correcting) => {
                true
            }
            (ExecutingTool | Delegating, AwaitingModel) => true,
            // Budget exhausted: best-effort answer
            (AwaitingModel | ExecutingTool | Delegating, Completed) => true,
            (Correcting, Completed) => true,
            _ => false,
        }
    }
}

/// Iteration bookkeeping for one `answer()` call.
#[derive(Debug)]
pub struct IterationState {
    pub count: u32,
    pub budget: u32,
    pub completed: bool,
    pub final_answer: Option<String>,
    phase: LoopPhase,
    /// Most recent assistant reply that carried no tool call.
    last_plain_reply: Option<String>,
}

impl IterationState {
    pub fn new(budget: u32) -> Self {
        Self {
            count: 0,
            budget,
            completed: false,
            final_answer: None,
            phase: LoopPhase::AwaitingModel,
            last_plain_reply: None,
        }
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    /// Move to `next`. Illegal transitions are a programming error.
    pub fn advance(&mut self, next: LoopPhase) {
        debug_assert!(
            self.phase.can_move_to(next),
            "illegal loop transition {:?} -> {:?}",
            self.phase,
            next
        );
        debug!(from = ?self.phase, to = ?next, iteration = self.count, "Loop phase");
        self.phase = next;
    }

    /// Start the next round. Returns false once the budget is spent.
    pub fn begin_round(&mut self) -> bool {
        if self.count >= self.budget {
            return false;
        }
        self.count += 1;
        if self.phase != LoopPhase::AwaitingModel {
            self.advance(LoopPhase::AwaitingModel);
        }
        true
    }

    /// This round is the last one the budget allows.
    pub fn is_last_chance(&self) -> bool {
        self.count == self.budget
    }

    pub fn remember_plain_reply(&mut self, text: &str) {
        self.last_plain_reply = Some(text.to_string());
    }

    pub fn last_plain_reply(&self) -> Option<&str> {
        self.last_plain_reply.as_deref()
    }

    pub fn complete(&mut self, answer: String) {
        self.completed = true;
        self.final_answer = Some(answer);
    }
}
