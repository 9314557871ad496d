use super::*;
use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use crate::chat::message::Sender;
use crate::clock::ManualClock;
use crate::net::types::{
    AggregateAnswer, AnswerEnvelope, ChatbotEntry, ExplanationEntry, ExplanationResponse, HistoryRecord, TopicAnswer,
    TopicAnswerBody, TopicSource,
};

// =============================================================
// Mocks
// =============================================================

#[derive(Default)]
struct MockApi {
    history: Mutex<HashMap<String, Vec<HistoryRecord>>>,
    history_fails: AtomicBool,
    history_gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    history_calls: Mutex<Vec<HistoryQuery>>,
    answer: Mutex<Option<AnswerEnvelope>>,
    ask_gate: Mutex<Option<Arc<Semaphore>>>,
    asks: Mutex<Vec<AnswerRequest>>,
    explanation: Mutex<Option<ExplanationResponse>>,
    explains: Mutex<Vec<ExplanationRequest>>,
    cleared: Mutex<Option<u64>>,
    clears: Mutex<Vec<(String, String)>>,
}

impl MockApi {
    fn with_history(self, source: &str, records: Vec<HistoryRecord>) -> Self {
        self.history.lock().unwrap().insert(source.to_owned(), records);
        self
    }

    fn answering(self, text: &str) -> Self {
        *self.answer.lock().unwrap() = Some(topic_answer(text));
        self
    }

    fn gate_history(&self, source: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.history_gates.lock().unwrap().insert(source.to_owned(), Arc::clone(&gate));
        gate
    }

    fn gate_asks(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.ask_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }
}

#[async_trait]
impl ChatApi for MockApi {
    async fn fetch_catalog(&self) -> Result<Vec<ChatbotEntry>, ApiError> {
        Ok(vec![ChatbotEntry { id: 3, name: "Finance".to_owned(), source: "finance".to_owned(), quiz_topic: None }])
    }

    async fn fetch_history(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>, ApiError> {
        self.history_calls.lock().unwrap().push(query.clone());
        let gate = self.history_gates.lock().unwrap().get(&query.source).cloned();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.unwrap();
        }
        if self.history_fails.load(Ordering::SeqCst) {
            return Err(ApiError::Request("connection refused".to_owned()));
        }
        Ok(self.history.lock().unwrap().get(&query.source).cloned().unwrap_or_default())
    }

    async fn clear_history(&self, user: &str, source: &str) -> Result<u64, ApiError> {
        self.clears.lock().unwrap().push((user.to_owned(), source.to_owned()));
        self.cleared.lock().unwrap().ok_or(ApiError::Status { status: 500, body: String::new() })
    }

    async fn ask(&self, request: &AnswerRequest) -> Result<AnswerEnvelope, ApiError> {
        self.asks.lock().unwrap().push(request.clone());
        let gate = self.ask_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.unwrap();
        }
        self.answer.lock().unwrap().clone().ok_or_else(|| ApiError::Request("connection refused".to_owned()))
    }

    async fn explain(&self, request: &ExplanationRequest) -> Result<ExplanationResponse, ApiError> {
        self.explains.lock().unwrap().push(request.clone());
        self.explanation.lock().unwrap().clone().ok_or_else(|| ApiError::Parse("not json".to_owned()))
    }
}

#[derive(Default)]
struct RecordingSpeaker {
    spoken: Mutex<Vec<String>>,
}

impl Speaker for RecordingSpeaker {
    fn speak(&self, text: &str) {
        self.spoken.lock().unwrap().push(text.to_owned());
    }
}

#[derive(Default)]
struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

// =============================================================
// Helpers
// =============================================================

const NOW: i64 = 1_700_000_000_000;

fn topic_answer(text: &str) -> AnswerEnvelope {
    AnswerEnvelope::Topic(TopicAnswer {
        answer: TopicAnswerBody {
            response: text.to_owned(),
            sources: vec![TopicSource { file_name: "notes.pdf".to_owned(), text: "p.1".to_owned(), score: None }],
        },
    })
}

fn record(id: &str, message: &str, response: &str) -> HistoryRecord {
    HistoryRecord {
        id: id.to_owned(),
        message: message.to_owned(),
        response: json!(response),
        timestamp: Some("2023-11-14T00:00:00Z".to_owned()),
    }
}

fn topic(source: &str) -> ConversationEndpoint {
    ConversationEndpoint::new(1, source.to_uppercase(), source)
}

fn controller(api: &Arc<MockApi>) -> Arc<ConversationController> {
    let api: Arc<dyn ChatApi> = Arc::clone(api) as Arc<dyn ChatApi>;
    Arc::new(
        ConversationController::new(api, SessionContext::in_memory(), Arc::new(ManualClock::new(NOW)))
            .with_user("alice"),
    )
}

async fn wait_for_phase(controller: &ConversationController, phase: Phase) {
    while controller.phase() != phase {
        tokio::task::yield_now().await;
    }
}

fn texts(controller: &ConversationController) -> Vec<String> {
    controller.view().messages.into_iter().map(|m| m.text).collect()
}

// =============================================================
// History loading
// =============================================================

#[tokio::test]
async fn starts_idle_and_rejects_sends() {
    let api = Arc::new(MockApi::default());
    let controller = controller(&api);
    assert_eq!(controller.phase(), Phase::Idle);
    assert!(!controller.view().is_empty_state);
    assert_eq!(controller.send_message("hi").await, SendOutcome::Rejected(RejectReason::NotReady));
    assert!(api.asks.lock().unwrap().is_empty());
}

#[tokio::test]
async fn select_loads_history_in_chronological_order() {
    let api = Arc::new(MockApi::default().with_history(
        "marketing",
        vec![record("r2", "second?", "second!"), record("r1", "first?", "first!")],
    ));
    let controller = controller(&api);

    let outcome = controller.select_endpoint(topic("marketing")).await;
    assert_eq!(outcome, LoadOutcome::Loaded { count: 4 });
    assert_eq!(controller.phase(), Phase::Ready);
    assert_eq!(texts(&controller), ["first?", "first!", "second?", "second!"]);

    let calls = api.history_calls.lock().unwrap();
    assert_eq!(calls[0], HistoryQuery { user: "alice".to_owned(), source: "marketing".to_owned(), limit: 50, skip: 0 });
}

#[tokio::test]
async fn loaded_history_preserves_sender_and_has_unique_history_ids() {
    let api = Arc::new(MockApi::default().with_history(
        "marketing",
        vec![record("r2", "b", "B"), record("r1", "a", "A")],
    ));
    let controller = controller(&api);
    controller.select_endpoint(topic("marketing")).await;

    let messages = controller.view().messages;
    assert_eq!(messages[0].sender, Sender::User);
    assert_eq!(messages[1].sender, Sender::Bot);
    assert_eq!(messages[1].text, "A");
    let ids: std::collections::HashSet<String> = messages.iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids.len(), messages.len());
}

#[tokio::test]
async fn empty_history_is_ready_and_empty() {
    let api = Arc::new(MockApi::default());
    let controller = controller(&api);

    assert_eq!(controller.select_endpoint(topic("marketing")).await, LoadOutcome::Empty);
    let view = controller.view();
    assert_eq!(view.phase, Phase::Ready);
    assert!(view.messages.is_empty());
    assert!(view.is_empty_state);
}

#[tokio::test]
async fn history_failure_degrades_to_empty_ready() {
    let api = Arc::new(MockApi::default().with_history("marketing", vec![record("r1", "a", "A")]));
    api.history_fails.store(true, Ordering::SeqCst);
    let controller = controller(&api);

    assert_eq!(controller.select_endpoint(topic("marketing")).await, LoadOutcome::Failed);
    assert_eq!(controller.phase(), Phase::Ready);
    assert!(controller.view().messages.is_empty());
}

#[tokio::test]
async fn without_user_history_is_skipped() {
    let api = Arc::new(MockApi::default());
    let api_dyn: Arc<dyn ChatApi> = Arc::clone(&api) as Arc<dyn ChatApi>;
    let controller =
        ConversationController::new(api_dyn, SessionContext::in_memory(), Arc::new(ManualClock::new(NOW)));

    assert_eq!(controller.select_endpoint(topic("marketing")).await, LoadOutcome::NoUser);
    assert_eq!(controller.phase(), Phase::Ready);
    assert!(api.history_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn history_page_size_is_configurable() {
    let api = Arc::new(MockApi::default());
    let api_dyn: Arc<dyn ChatApi> = Arc::clone(&api) as Arc<dyn ChatApi>;
    let controller = ConversationController::new(api_dyn, SessionContext::in_memory(), Arc::new(ManualClock::new(NOW)))
        .with_user("alice")
        .with_history_page_size(10);
    controller.select_endpoint(topic("marketing")).await;
    assert_eq!(api.history_calls.lock().unwrap()[0].limit, 10);
}

// =============================================================
// Sending
// =============================================================

#[tokio::test]
async fn send_appends_user_and_bot_messages() {
    let api = Arc::new(MockApi::default().answering("Four Ps."));
    let controller = controller(&api);
    controller.select_endpoint(topic("marketing")).await;

    assert_eq!(controller.send_message("  What is the marketing mix?  ").await, SendOutcome::Answered);

    let view = controller.view();
    assert_eq!(view.phase, Phase::Ready);
    assert!(view.thinking.is_none());
    assert_eq!(view.messages.len(), 2);
    assert_eq!(view.messages[0].sender, Sender::User);
    assert_eq!(view.messages[0].text, "What is the marketing mix?");
    assert_eq!(view.messages[1].sender, Sender::Bot);
    assert_eq!(view.messages[1].text, "Four Ps.");
    assert_eq!(view.messages[1].sources.as_ref().unwrap()[0].to_string(), "notes.pdf: p.1");

    let asks = api.asks.lock().unwrap();
    assert_eq!(
        asks[0],
        AnswerRequest::Topic {
            query: "What is the marketing mix?".to_owned(),
            source: "marketing".to_owned(),
            user: "alice".to_owned(),
        }
    );
}

#[tokio::test]
async fn aggregate_endpoint_uses_aggregate_request() {
    let api = Arc::new(MockApi::default());
    let mut source = serde_json::Map::new();
    source.insert("finance.pdf".to_owned(), json!("NPV"));
    *api.answer.lock().unwrap() = Some(AnswerEnvelope::Aggregate(AggregateAnswer { text: "Combined".to_owned(), source }));
    let controller = controller(&api);
    controller.select_endpoint(ConversationEndpoint::new(0, "All", "tonghop")).await;

    assert_eq!(controller.send_message("overview").await, SendOutcome::Answered);
    assert_eq!(api.asks.lock().unwrap()[0], AnswerRequest::Aggregate { query: "overview".to_owned() });
    let bot = controller.view().messages.pop().unwrap();
    assert_eq!(bot.text, "Combined");
    assert_eq!(bot.sources.unwrap()[0].to_string(), "finance.pdf: NPV");
}

#[tokio::test]
async fn send_failure_appends_exactly_one_fallback() {
    let api = Arc::new(MockApi::default().with_history("marketing", vec![record("r1", "a", "A")]));
    let speaker = Arc::new(RecordingSpeaker::default());
    let api_dyn: Arc<dyn ChatApi> = Arc::clone(&api) as Arc<dyn ChatApi>;
    let controller = ConversationController::new(api_dyn, SessionContext::in_memory(), Arc::new(ManualClock::new(NOW)))
        .with_user("alice")
        .with_speaker(Arc::clone(&speaker) as Arc<dyn Speaker>);
    controller.set_voice_output(true);
    controller.select_endpoint(topic("marketing")).await;
    let before = controller.view().messages.len();

    assert_eq!(controller.send_message("hello").await, SendOutcome::Failed);

    let view = controller.view();
    assert_eq!(view.messages.len(), before + 2);
    let last = view.messages.last().unwrap();
    assert_eq!(last.sender, Sender::Bot);
    assert_eq!(last.text, SEND_FAILURE_TEXT);
    assert_eq!(view.phase, Phase::Ready);
    assert!(speaker.spoken.lock().unwrap().is_empty());
}

#[tokio::test]
async fn blank_send_is_rejected() {
    let api = Arc::new(MockApi::default().answering("x"));
    let controller = controller(&api);
    controller.select_endpoint(topic("marketing")).await;

    assert_eq!(controller.send_message("   ").await, SendOutcome::Rejected(RejectReason::Blank));
    assert!(controller.view().messages.is_empty());
    assert!(api.asks.lock().unwrap().is_empty());
}

#[tokio::test]
async fn second_send_while_pending_is_a_no_op() {
    let api = Arc::new(MockApi::default().answering("answer"));
    let gate = api.gate_asks();
    let controller = controller(&api);
    controller.select_endpoint(topic("marketing")).await;

    let first = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.send_message("first").await }
    });
    wait_for_phase(&controller, Phase::Sending).await;
    assert_eq!(controller.view().messages.len(), 1);

    assert_eq!(controller.send_message("second").await, SendOutcome::Rejected(RejectReason::Busy));
    assert_eq!(controller.view().messages.len(), 1);

    gate.add_permits(1);
    assert_eq!(first.await.unwrap(), SendOutcome::Answered);
    assert_eq!(texts(&controller), ["first", "answer"]);
    assert_eq!(api.asks.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn voice_output_speaks_successful_replies() {
    let api = Arc::new(MockApi::default().answering("spoken answer"));
    let speaker = Arc::new(RecordingSpeaker::default());
    let api_dyn: Arc<dyn ChatApi> = Arc::clone(&api) as Arc<dyn ChatApi>;
    let controller = ConversationController::new(api_dyn, SessionContext::in_memory(), Arc::new(ManualClock::new(NOW)))
        .with_user("alice")
        .with_speaker(Arc::clone(&speaker) as Arc<dyn Speaker>);
    controller.select_endpoint(topic("marketing")).await;

    controller.send_message("quiet").await;
    assert!(speaker.spoken.lock().unwrap().is_empty());

    controller.set_voice_output(true);
    controller.send_message("loud").await;
    assert_eq!(*speaker.spoken.lock().unwrap(), ["spoken answer"]);
}

#[tokio::test]
async fn send_during_history_load_is_rejected_then_succeeds() {
    let api = Arc::new(MockApi::default().with_history("topic-a", vec![record("r1", "old q", "old a")]).answering("new a"));
    let gate = api.gate_history("topic-a");
    let controller = controller(&api);

    let load = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.select_endpoint(topic("topic-a")).await }
    });
    wait_for_phase(&controller, Phase::LoadingHistory).await;

    assert_eq!(controller.send_message("hi").await, SendOutcome::Rejected(RejectReason::NotReady));
    assert!(controller.view().messages.is_empty());

    gate.add_permits(1);
    assert_eq!(load.await.unwrap(), LoadOutcome::Loaded { count: 2 });

    assert_eq!(controller.send_message("hi").await, SendOutcome::Answered);
    assert_eq!(texts(&controller), ["old q", "old a", "hi", "new a"]);
}

// =============================================================
// Endpoint switching
// =============================================================

#[tokio::test]
async fn late_reply_from_previous_endpoint_is_discarded() {
    let api = Arc::new(
        MockApi::default()
            .with_history("topic-b", vec![record("b1", "b question", "b answer")])
            .answering("a answer"),
    );
    let gate = api.gate_asks();
    let controller = controller(&api);
    controller.select_endpoint(topic("topic-a")).await;

    let send = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.send_message("a question").await }
    });
    wait_for_phase(&controller, Phase::Sending).await;

    assert_eq!(controller.select_endpoint(topic("topic-b")).await, LoadOutcome::Loaded { count: 2 });
    gate.add_permits(1);
    assert_eq!(send.await.unwrap(), SendOutcome::Discarded);

    let view = controller.view();
    assert_eq!(view.phase, Phase::Ready);
    assert!(view.thinking.is_none());
    assert_eq!(view.endpoint.unwrap().source_key, "topic-b");
    assert_eq!(texts(&controller), ["b question", "b answer"]);
}

#[tokio::test]
async fn late_history_from_previous_endpoint_is_discarded() {
    let api = Arc::new(
        MockApi::default()
            .with_history("topic-a", vec![record("a1", "a q", "a a")])
            .with_history("topic-b", vec![record("b1", "b q", "b a")]),
    );
    let gate = api.gate_history("topic-a");
    let controller = controller(&api);

    let load_a = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.select_endpoint(topic("topic-a")).await }
    });
    wait_for_phase(&controller, Phase::LoadingHistory).await;

    assert_eq!(controller.select_endpoint(topic("topic-b")).await, LoadOutcome::Loaded { count: 2 });
    gate.add_permits(1);
    assert_eq!(load_a.await.unwrap(), LoadOutcome::Discarded);
    assert_eq!(texts(&controller), ["b q", "b a"]);
}

#[tokio::test]
async fn switching_clears_previous_transcript() {
    let api = Arc::new(MockApi::default().answering("a answer"));
    let controller = controller(&api);
    controller.select_endpoint(topic("topic-a")).await;
    controller.send_message("a question").await;
    assert_eq!(controller.view().messages.len(), 2);

    controller.select_endpoint(topic("topic-b")).await;
    assert!(controller.view().messages.is_empty());
}

// =============================================================
// Cancellation and indicator
// =============================================================

#[tokio::test]
async fn cancelled_send_returns_to_ready_with_fallback() {
    let api = Arc::new(MockApi::default().answering("never"));
    let _gate = api.gate_asks();
    let controller = controller(&api);
    controller.select_endpoint(topic("marketing")).await;

    let send = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.send_message("hello").await }
    });
    wait_for_phase(&controller, Phase::Sending).await;
    send.abort();
    assert!(send.await.unwrap_err().is_cancelled());

    let view = controller.view();
    assert_eq!(view.phase, Phase::Ready);
    assert!(view.thinking.is_none());
    assert_eq!(texts(&controller), ["hello", SEND_FAILURE_TEXT]);
}

#[tokio::test(start_paused = true)]
async fn thinking_indicator_rotates_while_sending() {
    let api = Arc::new(MockApi::default().answering("done"));
    let gate = api.gate_asks();
    let controller = controller(&api);
    controller.select_endpoint(topic("marketing")).await;
    assert!(controller.view().thinking.is_none());

    let send = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.send_message("slow question").await }
    });
    wait_for_phase(&controller, Phase::Sending).await;
    assert_eq!(controller.view().thinking, Some(crate::chat::thinking::THINKING_FRAMES[0]));

    tokio::time::sleep(Duration::from_millis(2_100)).await;
    assert_eq!(controller.view().thinking, Some(crate::chat::thinking::THINKING_FRAMES[1]));

    gate.add_permits(1);
    assert_eq!(send.await.unwrap(), SendOutcome::Answered);
    assert!(controller.view().thinking.is_none());
}

// =============================================================
// Explanations
// =============================================================

fn review() -> QuizReview {
    QuizReview {
        question: "What is NPV?".to_owned(),
        user_answer: Some("A ratio".to_owned()),
        correct_answer: "A present value".to_owned(),
        options: vec!["A ratio".to_owned(), "A present value".to_owned(), "A rate".to_owned()],
    }
}

#[tokio::test]
async fn explanation_appends_bot_reply_routed_by_source_key() {
    let api = Arc::new(MockApi::default());
    *api.explanation.lock().unwrap() = Some(ExplanationResponse {
        explanations: vec![ExplanationEntry {
            explanation: json!(json!({"response": "NPV discounts cash flows.", "sources": []}).to_string()),
        }],
    });
    let controller = controller(&api);
    let mut endpoint = topic("finance");
    endpoint.quiz_topic_key = Some("finance-quiz".to_owned());
    controller.select_endpoint(endpoint).await;

    assert_eq!(controller.request_explanation(&review()).await, SendOutcome::Answered);
    assert_eq!(texts(&controller), ["NPV discounts cash flows."]);

    let explains = api.explains.lock().unwrap();
    // Routed by the chatbot's own source, not its quiz topic.
    assert_eq!(explains[0].source, "finance");
    assert!(!explains[0].explanations[0].is_correct);
    assert_eq!(explains[0].explanations[0].remaining_answers, ["A rate"]);
}

#[tokio::test]
async fn explanation_failure_appends_fallback() {
    let api = Arc::new(MockApi::default());
    let controller = controller(&api);
    controller.select_endpoint(topic("finance")).await;

    assert_eq!(controller.request_explanation(&review()).await, SendOutcome::Failed);
    assert_eq!(texts(&controller), [EXPLANATION_FAILURE_TEXT]);
    assert_eq!(api.explains.lock().unwrap()[0].source, "finance");
}

// =============================================================
// Clearing history
// =============================================================

fn controller_with_notifier(api: &Arc<MockApi>) -> (ConversationController, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::default());
    let api: Arc<dyn ChatApi> = Arc::clone(api) as Arc<dyn ChatApi>;
    let controller = ConversationController::new(api, SessionContext::in_memory(), Arc::new(ManualClock::new(NOW)))
        .with_user("alice")
        .with_notifier(Arc::clone(&notifier) as Arc<dyn Notifier>);
    (controller, notifier)
}

#[tokio::test]
async fn clear_empties_transcript_and_notifies_count() {
    let api = Arc::new(MockApi::default().with_history("marketing", vec![record("r1", "a", "A")]));
    *api.cleared.lock().unwrap() = Some(3);
    let (controller, notifier) = controller_with_notifier(&api);
    controller.select_endpoint(topic("marketing")).await;

    assert_eq!(controller.clear_history().await, ClearOutcome::Cleared { deleted: 3 });
    assert!(controller.view().messages.is_empty());
    assert_eq!(controller.phase(), Phase::Ready);
    assert_eq!(
        *notifier.notices.lock().unwrap(),
        [Notice { kind: NoticeKind::Success, text: "Deleted 3 chat messages.".to_owned() }]
    );
    assert_eq!(*api.clears.lock().unwrap(), [("alice".to_owned(), "marketing".to_owned())]);
}

#[tokio::test]
async fn clear_failure_keeps_transcript_and_notifies_error() {
    let api = Arc::new(MockApi::default().with_history("marketing", vec![record("r1", "a", "A")]));
    let (controller, notifier) = controller_with_notifier(&api);
    controller.select_endpoint(topic("marketing")).await;

    assert_eq!(controller.clear_history().await, ClearOutcome::Failed);
    assert_eq!(controller.view().messages.len(), 2);
    assert_eq!(controller.phase(), Phase::Ready);
    assert_eq!(notifier.notices.lock().unwrap()[0].kind, NoticeKind::Error);
    assert_eq!(notifier.notices.lock().unwrap()[0].text, CLEAR_FAILURE_NOTICE);
}

#[tokio::test]
async fn clear_before_selection_is_rejected() {
    let api = Arc::new(MockApi::default());
    let (controller, notifier) = controller_with_notifier(&api);
    assert_eq!(controller.clear_history().await, ClearOutcome::Rejected(RejectReason::NotReady));
    assert!(notifier.notices.lock().unwrap().is_empty());
}

// =============================================================
// Catalog
// =============================================================

#[tokio::test]
async fn catalog_maps_entries_to_endpoints() {
    let api = Arc::new(MockApi::default());
    let controller = controller(&api);
    let endpoints = controller.catalog().await.unwrap();
    assert_eq!(endpoints, [ConversationEndpoint::new(3, "Finance", "finance")]);
}
