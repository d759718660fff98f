//! Scripted reasoning service for tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::reasoning::{ReasonedAllocation, ReasoningError, ReasoningService};

/// Replays queued results in order; an exhausted queue answers with
/// [`ReasoningError::EmptyResponse`]. Every prompt is recorded.
pub(crate) struct MockReasoningService {
    responses: Mutex<VecDeque<Result<ReasonedAllocation, ReasoningError>>>,
    prompts: Mutex<Vec<String>>,
}

impl MockReasoningService {
    pub(crate) fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn returning(output: ReasonedAllocation) -> Self {
        let mock = Self::new();
        mock.push(Ok(output));
        mock
    }

    pub(crate) fn push(&self, response: Result<ReasonedAllocation, ReasoningError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub(crate) fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub(crate) fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ReasoningService for MockReasoningService {
    async fn generate(&self, prompt: &str) -> Result<ReasonedAllocation, ReasoningError> {
        self.prompts.lock().unwrap().push(prompt.to_string());

        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ReasoningError::EmptyResponse))
    }
}
