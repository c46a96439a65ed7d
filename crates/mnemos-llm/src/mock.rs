use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use mnemos_core::{
    LLMError, LLMProvider, ModelReply, ModelRequest, ModelTask, ModelUsage, estimate_tokens,
};

/// Scripted model for tests and offline runs.
///
/// Replies come from a per-task script when one is set, otherwise from the
/// shared script. A script either cycles or repeats its last reply once
/// exhausted. With nothing scripted every call answers `"Mock response"`.
#[derive(Clone)]
pub struct MockLLMProvider {
    name: String,
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct Script {
    replies: VecDeque<String>,
    cycle: bool,
    last: Option<String>,
}

impl Script {
    fn new(replies: Vec<String>, cycle: bool) -> Self {
        Self {
            replies: replies.into(),
            cycle,
            last: None,
        }
    }

    fn next(&mut self) -> Option<String> {
        match self.replies.pop_front() {
            Some(reply) => {
                if self.cycle {
                    self.replies.push_back(reply.clone());
                }
                self.last = Some(reply.clone());
                Some(reply)
            }
            None => self.last.clone(),
        }
    }
}

#[derive(Default)]
struct MockState {
    shared: Script,
    per_task: HashMap<ModelTask, Script>,
    calls: Vec<MockCall>,
    failing: Option<String>,
    fail_next: usize,
    latency_ms: u64,
}

#[derive(Debug, Clone)]
pub struct MockCall {
    pub request: ModelRequest,
    pub at: Instant,
}

impl MockLLMProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Answer every call with `reply`.
    pub fn set_response(&self, reply: impl Into<String>) {
        self.state.lock().shared = Script::new(vec![reply.into()], false);
    }

    pub fn set_responses(&self, replies: Vec<String>, cycle: bool) {
        self.state.lock().shared = Script::new(replies, cycle);
    }

    pub fn push_response(&self, reply: impl Into<String>) {
        self.state.lock().shared.replies.push_back(reply.into());
    }

    /// Script replies for one kind of call only.
    pub fn set_task_responses(&self, task: ModelTask, replies: Vec<String>) {
        self.state
            .lock()
            .per_task
            .insert(task, Script::new(replies, false));
    }

    /// Fail every call until [`clear_error`](Self::clear_error).
    pub fn set_error(&self, message: impl Into<String>) {
        self.state.lock().failing = Some(message.into());
    }

    pub fn clear_error(&self) {
        let mut state = self.state.lock();
        state.failing = None;
        state.fail_next = 0;
    }

    /// Fail the next `count` calls, then answer normally.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    pub fn set_latency(&self, latency_ms: u64) {
        self.state.lock().latency_ms = latency_ms;
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn call_history(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    pub fn last_call(&self) -> Option<MockCall> {
        self.state.lock().calls.last().cloned()
    }

    pub fn calls_for(&self, task: ModelTask) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.request.task == task)
            .count()
    }

    pub fn clear_history(&self) {
        self.state.lock().calls.clear();
    }

    /// Record the call and decide its outcome under one lock.
    fn script_call(&self, request: &ModelRequest) -> (u64, Result<String, LLMError>) {
        let mut state = self.state.lock();
        state.calls.push(MockCall {
            request: request.clone(),
            at: Instant::now(),
        });

        let outcome = if let Some(message) = state.failing.clone() {
            Err(LLMError::Unavailable(message))
        } else if state.fail_next > 0 {
            state.fail_next -= 1;
            Err(LLMError::Unavailable("scripted failure".to_string()))
        } else {
            let scripted = match state.per_task.get_mut(&request.task) {
                Some(script) => script.next(),
                None => None,
            };
            Ok(scripted
                .or_else(|| state.shared.next())
                .unwrap_or_else(|| "Mock response".to_string()))
        };
        (state.latency_ms, outcome)
    }
}

impl Default for MockLLMProvider {
    fn default() -> Self {
        Self::new("default")
    }
}

#[async_trait]
impl LLMProvider for MockLLMProvider {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelReply, LLMError> {
        let (latency_ms, outcome) = self.script_call(request);
        if latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(latency_ms)).await;
        }

        let text = outcome?;
        let usage = ModelUsage::new(estimate_tokens(&request.prompt), estimate_tokens(&text));
        Ok(ModelReply::new(text)
            .with_usage(usage)
            .with_latency_ms(latency_ms))
    }

    fn provider_name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extraction(prompt: &str) -> ModelRequest {
        ModelRequest::new(ModelTask::Extraction, prompt)
    }

    #[tokio::test]
    async fn test_unscripted_reply() {
        let mock = MockLLMProvider::new("test");
        let reply = mock.generate(&extraction("hello")).await.unwrap();
        assert_eq!(reply.text, "Mock response");
        assert!(reply.usage.total() > 0);
        assert_eq!(mock.name(), "test");
    }

    #[tokio::test]
    async fn test_script_repeats_last_reply() {
        let mock = MockLLMProvider::new("test");
        mock.set_responses(vec!["First".to_string(), "Second".to_string()], false);

        let request = extraction("hello");
        assert_eq!(mock.generate(&request).await.unwrap().text, "First");
        assert_eq!(mock.generate(&request).await.unwrap().text, "Second");
        assert_eq!(mock.generate(&request).await.unwrap().text, "Second");
    }

    #[tokio::test]
    async fn test_script_cycles() {
        let mock = MockLLMProvider::new("test");
        mock.set_responses(vec!["A".to_string(), "B".to_string()], true);

        let request = extraction("hello");
        assert_eq!(mock.generate(&request).await.unwrap().text, "A");
        assert_eq!(mock.generate(&request).await.unwrap().text, "B");
        assert_eq!(mock.generate(&request).await.unwrap().text, "A");
    }

    #[tokio::test]
    async fn test_per_task_script_takes_precedence() {
        let mock = MockLLMProvider::new("test");
        mock.set_response("shared");
        mock.set_task_responses(ModelTask::Classification, vec!["classified".to_string()]);

        let classify = ModelRequest::new(ModelTask::Classification, "compare");
        assert_eq!(mock.generate(&classify).await.unwrap().text, "classified");
        assert_eq!(mock.generate(&extraction("x")).await.unwrap().text, "shared");
        assert_eq!(mock.calls_for(ModelTask::Classification), 1);
    }

    #[tokio::test]
    async fn test_fail_next_then_recover() {
        let mock = MockLLMProvider::new("test");
        mock.set_response("ok");
        mock.fail_next(1);

        let request = extraction("hello");
        assert!(mock.generate(&request).await.is_err());
        assert_eq!(mock.generate(&request).await.unwrap().text, "ok");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_error_until_cleared() {
        let mock = MockLLMProvider::new("test");
        mock.set_error("model down");

        let err = mock.generate(&extraction("hello")).await.unwrap_err();
        assert!(err.to_string().contains("model down"));
        assert!(err.is_retryable());

        mock.clear_error();
        assert!(mock.generate(&extraction("hello")).await.is_ok());
    }

    #[tokio::test]
    async fn test_call_history() {
        let mock = MockLLMProvider::new("test");
        mock.generate(&extraction("First")).await.unwrap();
        mock.generate(&extraction("Second")).await.unwrap();

        assert_eq!(mock.call_history().len(), 2);
        assert_eq!(mock.last_call().unwrap().request.prompt, "Second");

        mock.clear_history();
        assert_eq!(mock.call_count(), 0);
    }
}
