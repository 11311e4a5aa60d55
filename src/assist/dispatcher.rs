use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;

use super::{AnalysisClient, AssistReply, AssistRequest, ConversationEntry, RequestKind, Role};
use crate::error::AssistError;

/// Answer recorded for a request dropped because the queue overflowed
pub const SKIPPED_TEXT: &str =
    "Skipped an earlier request because too many were waiting. Please ask again if it still matters.";

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Waiting requests kept; the oldest is dropped on overflow
    pub queue_capacity: usize,
    pub request_timeout: Duration,
    /// Transcript entries replayed in front of a chat prompt
    pub context_entries: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            request_timeout: Duration::from_secs(30),
            context_entries: 6,
        }
    }
}

/// Serializes analysis requests behind a single worker and owns the transcript.
///
/// Triage and chat requests share one FIFO queue; neither kind is prioritized.
#[derive(Clone)]
pub struct AssistDispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    client: Arc<dyn AnalysisClient>,
    config: DispatchConfig,
    replies: mpsc::UnboundedSender<AssistReply>,
    state: Mutex<DispatchState>,
}

#[derive(Default)]
struct DispatchState {
    queue: VecDeque<AssistRequest>,
    in_flight: bool,
    history: Vec<ConversationEntry>,
}

impl AssistDispatcher {
    pub fn new(
        client: Arc<dyn AnalysisClient>,
        config: DispatchConfig,
        replies: mpsc::UnboundedSender<AssistReply>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                replies,
                state: Mutex::new(DispatchState::default()),
            }),
        }
    }

    /// Queue a triage request for text the shell wrote to stderr
    pub fn report_error(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let mut state = self.inner.lock_state();
        let mark = state.history.len();
        self.inner
            .enqueue(&mut state, RequestKind::ErrorTriage, text.to_string(), mark);
    }

    /// Record the question in the transcript right away, then queue it
    pub fn ask(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let mut state = self.inner.lock_state();
        let mark = state.history.len();
        state.history.push(ConversationEntry::new(Role::User, text));
        self.inner
            .enqueue(&mut state, RequestKind::Chat, text.to_string(), mark);
    }

    pub fn history(&self) -> Vec<ConversationEntry> {
        self.inner.lock_state().history.clone()
    }

    /// Requests waiting behind the one in flight
    pub fn pending(&self) -> usize {
        self.inner
            .lock_state()
            .queue
            .iter()
            .filter(|r| !r.skipped)
            .count()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.lock_state().in_flight
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enqueue(
        self: &Arc<Self>,
        state: &mut DispatchState,
        kind: RequestKind,
        payload: String,
        history_mark: usize,
    ) {
        // Skipped requests keep their place so replies stay in request order
        let waiting = state.queue.iter().filter(|r| !r.skipped).count();
        if waiting >= self.config.queue_capacity {
            if let Some(dropped) = state.queue.iter_mut().find(|r| !r.skipped) {
                tracing::warn!(
                    kind = ?dropped.kind,
                    queued_at = %dropped.submitted_at,
                    "Assist queue full, skipping oldest request"
                );
                dropped.skipped = true;
                dropped.payload.clear();
            }
        }

        state.queue.push_back(AssistRequest {
            kind,
            payload,
            submitted_at: Utc::now(),
            history_mark,
            skipped: false,
        });

        if !state.in_flight {
            state.in_flight = true;
            tokio::spawn(Arc::clone(self).drain());
        }
    }

    /// The single worker: runs until the queue is empty
    async fn drain(self: Arc<Self>) {
        loop {
            let (request, prompt) = {
                let mut state = self.lock_state();
                let Some(request) = state.queue.pop_front() else {
                    state.in_flight = false;
                    return;
                };
                if request.skipped {
                    self.record_reply(&mut state, SKIPPED_TEXT.to_string());
                    continue;
                }
                let prompt = self.build_prompt(&state.history, &request);
                (request, prompt)
            };

            let started = Instant::now();
            tracing::debug!(kind = ?request.kind, "Analysis request started");
            let text = match self.call(prompt).await {
                Ok(reply) => {
                    tracing::debug!(
                        kind = ?request.kind,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Analysis request finished"
                    );
                    reply
                }
                Err(e) => {
                    tracing::warn!(kind = ?request.kind, "Analysis failed: {}", e);
                    request.kind.fallback_text().to_string()
                }
            };

            let mut state = self.lock_state();
            self.record_reply(&mut state, text);
        }
    }

    async fn call(&self, prompt: String) -> Result<String, AssistError> {
        let client = Arc::clone(&self.client);
        // A panicking client surfaces as a JoinError instead of killing the worker
        let mut task = tokio::spawn(async move { client.analyze(&prompt).await });
        let timeout = self.config.request_timeout;

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(reply))) if !reply.trim().is_empty() => Ok(reply),
            Ok(Ok(Ok(_))) => Err(AssistError::Malformed("empty reply".to_string())),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(join)) => Err(AssistError::Malformed(format!("client task failed: {join}"))),
            Err(_) => {
                task.abort();
                Err(AssistError::Timeout(timeout))
            }
        }
    }

    fn build_prompt(&self, history: &[ConversationEntry], request: &AssistRequest) -> String {
        match request.kind {
            RequestKind::ErrorTriage => format!(
                "Analyze this shell error and explain how to fix it in a clear and concise way:\n{}",
                request.payload
            ),
            RequestKind::Chat => {
                let end = request.history_mark.min(history.len());
                let start = end.saturating_sub(self.config.context_entries);
                let mut prompt = String::new();
                if start < end {
                    prompt.push_str("Conversation so far:\n");
                    for entry in &history[start..end] {
                        let who = match entry.role {
                            Role::User => "User",
                            Role::Assistant => "Assistant",
                        };
                        prompt.push_str(&format!("{}: {}\n", who, entry.text));
                    }
                    prompt.push('\n');
                }
                prompt.push_str(
                    "You are a helpful shell assistant. Please respond to this question or request:\n",
                );
                prompt.push_str(&request.payload);
                prompt
            }
        }
    }

    fn record_reply(&self, state: &mut DispatchState, text: String) {
        state
            .history
            .push(ConversationEntry::new(Role::Assistant, text.clone()));
        if self.replies.send(AssistReply { text }).is_err() {
            tracing::debug!("Reply receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Echoes the last prompt line after a delay and records call windows
    struct RecordingClient {
        delay: Duration,
        calls: Mutex<Vec<(String, Instant, Instant)>>,
    }

    impl RecordingClient {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AnalysisClient for RecordingClient {
        async fn analyze(&self, prompt: &str) -> Result<String, AssistError> {
            let start = Instant::now();
            tokio::time::sleep(self.delay).await;
            let end = Instant::now();
            self.calls
                .lock()
                .unwrap()
                .push((prompt.to_string(), start, end));
            Ok(format!("reply: {}", prompt.lines().last().unwrap_or_default()))
        }
    }

    struct FailingClient;

    #[async_trait]
    impl AnalysisClient for FailingClient {
        async fn analyze(&self, _prompt: &str) -> Result<String, AssistError> {
            Err(AssistError::Status {
                status: 503,
                body: "unavailable".to_string(),
            })
        }
    }

    struct PanickingClient;

    #[async_trait]
    impl AnalysisClient for PanickingClient {
        async fn analyze(&self, _prompt: &str) -> Result<String, AssistError> {
            panic!("client bug")
        }
    }

    fn dispatcher(
        client: Arc<dyn AnalysisClient>,
        config: DispatchConfig,
    ) -> (AssistDispatcher, mpsc::UnboundedReceiver<AssistReply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AssistDispatcher::new(client, config, tx), rx)
    }

    async fn next_reply(rx: &mut mpsc::UnboundedReceiver<AssistReply>) -> String {
        timeout(TEST_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for reply")
            .expect("dispatcher dropped")
            .text
    }

    #[tokio::test]
    async fn test_requests_run_strictly_one_at_a_time() {
        let client = RecordingClient::new(Duration::from_millis(50));
        let (assist, mut rx) = dispatcher(client.clone(), DispatchConfig::default());

        assist.report_error("first failure");
        assist.report_error("second failure");

        assert_eq!(next_reply(&mut rx).await, "reply: first failure");
        assert_eq!(next_reply(&mut rx).await, "reply: second failure");

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].2 <= calls[1].1, "second call began before the first ended");
    }

    #[tokio::test]
    async fn test_failing_client_yields_fallback_per_request_in_order() {
        let (assist, mut rx) = dispatcher(Arc::new(FailingClient), DispatchConfig::default());

        assist.ask("what is ls?");
        assist.report_error("command not found");
        assist.ask("and cd?");

        assert_eq!(next_reply(&mut rx).await, RequestKind::Chat.fallback_text());
        assert_eq!(next_reply(&mut rx).await, RequestKind::ErrorTriage.fallback_text());
        assert_eq!(next_reply(&mut rx).await, RequestKind::Chat.fallback_text());

        let assistant: Vec<_> = assist
            .history()
            .into_iter()
            .filter(|e| e.role == Role::Assistant)
            .map(|e| e.text)
            .collect();
        assert_eq!(
            assistant,
            vec![
                RequestKind::Chat.fallback_text(),
                RequestKind::ErrorTriage.fallback_text(),
                RequestKind::Chat.fallback_text(),
            ]
        );

        // Still draining after failures
        assist.ask("still there?");
        assert_eq!(next_reply(&mut rx).await, RequestKind::Chat.fallback_text());
        assert_eq!(assist.pending(), 0);
    }

    #[tokio::test]
    async fn test_question_is_recorded_before_reply() {
        let client = RecordingClient::new(Duration::from_millis(50));
        let (assist, mut rx) = dispatcher(client, DispatchConfig::default());

        assist.ask("  how do I list files?  ");
        let history = assist.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].text, "how do I list files?");

        next_reply(&mut rx).await;
        assert_eq!(assist.history().len(), 2);
    }

    #[tokio::test]
    async fn test_blank_input_is_ignored() {
        let (assist, _rx) = dispatcher(Arc::new(FailingClient), DispatchConfig::default());
        assist.ask("   ");
        assist.report_error("\n");
        assert!(assist.history().is_empty());
        assert!(!assist.is_busy());
    }

    #[tokio::test]
    async fn test_slow_client_times_out_to_fallback() {
        let client = RecordingClient::new(Duration::from_secs(10));
        let config = DispatchConfig {
            request_timeout: Duration::from_millis(50),
            ..DispatchConfig::default()
        };
        let (assist, mut rx) = dispatcher(client, config);

        assist.report_error("segfault");
        assert_eq!(next_reply(&mut rx).await, RequestKind::ErrorTriage.fallback_text());
    }

    #[tokio::test]
    async fn test_panicking_client_does_not_wedge_queue() {
        let (assist, mut rx) = dispatcher(Arc::new(PanickingClient), DispatchConfig::default());

        assist.ask("one");
        assist.ask("two");
        assert_eq!(next_reply(&mut rx).await, RequestKind::Chat.fallback_text());
        assert_eq!(next_reply(&mut rx).await, RequestKind::Chat.fallback_text());
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_waiting_request() {
        let client = RecordingClient::new(Duration::from_millis(10));
        let config = DispatchConfig {
            queue_capacity: 1,
            ..DispatchConfig::default()
        };
        let (assist, mut rx) = dispatcher(client, config);

        // The worker has not picked anything up yet, so the second request evicts the first
        assist.report_error("old");
        assist.report_error("new");

        assert_eq!(next_reply(&mut rx).await, SKIPPED_TEXT);
        assert_eq!(next_reply(&mut rx).await, "reply: new");
    }

    #[tokio::test]
    async fn test_overflow_behind_in_flight_request_keeps_reply_order() {
        let client = RecordingClient::new(Duration::from_millis(100));
        let config = DispatchConfig {
            queue_capacity: 1,
            ..DispatchConfig::default()
        };
        let (assist, mut rx) = dispatcher(client.clone(), config);

        assist.ask("A");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(assist.is_busy());
        assist.ask("B");
        assist.ask("C");
        assert_eq!(assist.pending(), 1);

        assert_eq!(next_reply(&mut rx).await, "reply: A");
        assert_eq!(next_reply(&mut rx).await, SKIPPED_TEXT);
        assert_eq!(next_reply(&mut rx).await, "reply: C");

        let transcript: Vec<(Role, String)> = assist
            .history()
            .into_iter()
            .map(|e| (e.role, e.text))
            .collect();
        assert_eq!(
            transcript,
            vec![
                (Role::User, "A".to_string()),
                (Role::User, "B".to_string()),
                (Role::User, "C".to_string()),
                (Role::Assistant, "reply: A".to_string()),
                (Role::Assistant, SKIPPED_TEXT.to_string()),
                (Role::Assistant, "reply: C".to_string()),
            ]
        );

        // The skipped question never reached the client
        let calls = client.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(prompt, _, _)| !prompt.ends_with("\nB")));
    }

    #[tokio::test]
    async fn test_chat_prompt_replays_recent_transcript() {
        let client = RecordingClient::new(Duration::ZERO);
        let (assist, mut rx) = dispatcher(client.clone(), DispatchConfig::default());

        assist.ask("first question");
        next_reply(&mut rx).await;
        assist.ask("second question");
        next_reply(&mut rx).await;

        let calls = client.calls.lock().unwrap();
        let prompt = &calls[1].0;
        assert!(prompt.starts_with("Conversation so far:\nUser: first question\n"));
        assert!(prompt.contains("Assistant: reply: first question"));
        assert!(!prompt.contains("User: second question"));
        assert!(prompt.ends_with("second question"));
    }
}
