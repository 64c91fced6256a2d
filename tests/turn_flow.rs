//! Integration tests for streamed turns
//!
//! These drive the chat service end to end against in-memory stores and a
//! scripted upstream, checking frames, history and allowance together.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use turn_relay::{
    chat::{
        ChatService, Conversation, ConversationStore, FailureReason, MemoryConversationStore,
        MemoryLedgerStore, QuotaLedger, StreamHandle, Turn, TurnOutcome, TurnSettings,
    },
    error::RelayError,
    upstream::{EventStream, UpstreamClient, UpstreamError, UpstreamEvent},
};

/// Upstream that replays a fixed event script for every run
struct ScriptedUpstream {
    events: Vec<UpstreamEvent>,
    /// Keep the stream open after the script instead of ending it
    hang: bool,
    fail_post: bool,
    posted: Mutex<Vec<(String, String)>>,
    runs: Mutex<usize>,
}

impl ScriptedUpstream {
    fn new(events: Vec<UpstreamEvent>) -> Self {
        Self {
            events,
            hang: false,
            fail_post: false,
            posted: Mutex::new(Vec::new()),
            runs: Mutex::new(0),
        }
    }

    fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    fn failing_post(mut self) -> Self {
        self.fail_post = true;
        self
    }

    fn posted(&self) -> Vec<(String, String)> {
        self.posted.lock().unwrap().clone()
    }

    fn runs(&self) -> usize {
        *self.runs.lock().unwrap()
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    async fn post_message(&self, thread_id: &str, content: &str) -> Result<(), UpstreamError> {
        if self.fail_post {
            return Err(UpstreamError::Status {
                status: 500,
                body: "unavailable".into(),
            });
        }
        self.posted
            .lock()
            .unwrap()
            .push((thread_id.to_string(), content.to_string()));
        Ok(())
    }

    async fn stream_run(
        &self,
        _thread_id: &str,
        _assistant_id: &str,
    ) -> Result<EventStream, UpstreamError> {
        *self.runs.lock().unwrap() += 1;
        let scripted = stream::iter(self.events.clone());
        if self.hang {
            Ok(Box::pin(scripted.chain(stream::pending())))
        } else {
            Ok(Box::pin(scripted))
        }
    }
}

fn reply_script() -> Vec<UpstreamEvent> {
    vec![
        UpstreamEvent::Created("Hi".into()),
        UpstreamEvent::Delta("Hi".into()),
        UpstreamEvent::Delta(" there".into()),
        UpstreamEvent::End,
    ]
}

struct Fixture {
    service: ChatService,
    conversations: Arc<MemoryConversationStore>,
    ledgers: Arc<MemoryLedgerStore>,
    upstream: Arc<ScriptedUpstream>,
}

async fn fixture(upstream: ScriptedUpstream, remaining: Option<i64>, settings: TurnSettings) -> Fixture {
    let conversations = Arc::new(MemoryConversationStore::new());
    let ledgers = Arc::new(MemoryLedgerStore::new());
    let upstream = Arc::new(upstream);

    conversations
        .insert(
            Conversation::new("acct_1")
                .with_id("c1")
                .with_upstream("thread_1", "asst_1"),
        )
        .await;
    if let Some(remaining) = remaining {
        ledgers.insert(QuotaLedger::active("acct_1", remaining)).await;
    }

    let service = ChatService::new(
        conversations.clone(),
        ledgers.clone(),
        upstream.clone(),
        settings,
    );
    Fixture {
        service,
        conversations,
        ledgers,
        upstream,
    }
}

async fn drain(mut handle: StreamHandle) -> (Vec<String>, TurnOutcome) {
    let mut frames = Vec::new();
    while let Some(frame) = handle.frames.recv().await {
        frames.push(String::from_utf8(frame.to_vec()).unwrap());
    }
    let outcome = handle.task.await.unwrap();
    (frames, outcome)
}

async fn history(fx: &Fixture) -> Vec<Turn> {
    fx.conversations.get("c1").await.unwrap().unwrap().turns
}

#[tokio::test]
async fn test_turn_streams_commits_and_charges() {
    let fx = fixture(ScriptedUpstream::new(reply_script()), Some(3), TurnSettings::default()).await;

    fx.service.submit_message("c1", "Hello").await.unwrap();
    assert_eq!(fx.upstream.posted(), vec![("thread_1".to_string(), "Hello".to_string())]);

    let handle = fx.service.open_stream("c1").await.unwrap();
    let (frames, outcome) = drain(handle).await;

    assert_eq!(
        frames,
        vec![
            "data: {\"content\":\"Hi\"}\n\n".to_string(),
            "data: {\"content\":\" there\"}\n\n".to_string(),
        ]
    );
    match outcome {
        TurnOutcome::Completed { ai_text, history_len } => {
            assert_eq!(ai_text, "Hi there");
            assert_eq!(history_len, 2);
        }
        other => panic!("expected completion, got {:?}", other),
    }

    assert_eq!(history(&fx).await, vec![Turn::human("Hello"), Turn::ai("Hi there")]);
    assert_eq!(fx.ledgers.remaining("acct_1").await, Some(2));
    let conversation = fx.service.fetch("c1").await.unwrap();
    assert!(conversation.pending_message.is_none());
    assert!(!fx.service.is_busy("c1"));
}

#[tokio::test]
async fn test_exhausted_allowance_is_denied_before_upstream() {
    let fx = fixture(ScriptedUpstream::new(reply_script()), Some(0), TurnSettings::default()).await;

    let result = fx.service.submit_message("c1", "Hello").await;
    assert!(matches!(result, Err(RelayError::QuotaDenied)));
    assert!(fx.upstream.posted().is_empty());
    assert_eq!(fx.upstream.runs(), 0);
    assert!(fx.service.fetch("c1").await.unwrap().pending_message.is_none());
}

#[tokio::test]
async fn test_missing_ledger_is_denied() {
    let fx = fixture(ScriptedUpstream::new(reply_script()), None, TurnSettings::default()).await;

    let result = fx.service.submit_message("c1", "Hello").await;
    assert!(matches!(result, Err(RelayError::QuotaDenied)));
}

#[tokio::test]
async fn test_missing_thread_is_rejected() {
    let fx = fixture(ScriptedUpstream::new(reply_script()), Some(3), TurnSettings::default()).await;
    fx.conversations
        .insert(Conversation::new("acct_1").with_id("c3"))
        .await;

    match fx.service.submit_message("c3", "Hello").await {
        Err(RelayError::InvalidState(msg)) => assert_eq!(msg, "Thread ID is null for chat c3"),
        other => panic!("expected InvalidState, got {:?}", other),
    }
    assert!(fx.upstream.posted().is_empty());
}

#[tokio::test]
async fn test_unknown_conversation_is_not_found() {
    let fx = fixture(ScriptedUpstream::new(reply_script()), Some(3), TurnSettings::default()).await;

    assert!(matches!(
        fx.service.submit_message("missing", "Hello").await,
        Err(RelayError::NotFound(_))
    ));
    assert!(matches!(fx.service.open_stream("missing").await, Err(RelayError::NotFound(_))));
}

#[tokio::test]
async fn test_empty_message_is_rejected() {
    let fx = fixture(ScriptedUpstream::new(reply_script()), Some(3), TurnSettings::default()).await;

    assert!(matches!(
        fx.service.submit_message("c1", "   ").await,
        Err(RelayError::Validation(_))
    ));
}

#[tokio::test]
async fn test_stream_without_pending_message_is_rejected() {
    let fx = fixture(ScriptedUpstream::new(reply_script()), Some(3), TurnSettings::default()).await;

    assert!(matches!(
        fx.service.open_stream("c1").await,
        Err(RelayError::InvalidState(_))
    ));
    assert_eq!(fx.upstream.runs(), 0);
}

#[tokio::test]
async fn test_second_submission_while_pending_conflicts() {
    let fx = fixture(ScriptedUpstream::new(reply_script()), Some(3), TurnSettings::default()).await;

    fx.service.submit_message("c1", "Hello").await.unwrap();
    assert!(matches!(
        fx.service.submit_message("c1", "Again").await,
        Err(RelayError::Conflict(_))
    ));
    assert_eq!(fx.upstream.posted().len(), 1);
}

#[tokio::test]
async fn test_failed_post_leaves_no_pending_message() {
    let fx = fixture(
        ScriptedUpstream::new(reply_script()).failing_post(),
        Some(3),
        TurnSettings::default(),
    )
    .await;

    let result = fx.service.submit_message("c1", "Hello").await;
    assert!(matches!(result, Err(RelayError::UpstreamFailure(_))));
    assert!(fx.service.fetch("c1").await.unwrap().pending_message.is_none());
    assert!(!fx.service.is_busy("c1"));
}

#[tokio::test]
async fn test_duplicate_end_commits_once() {
    let script = vec![
        UpstreamEvent::Created("Hi".into()),
        UpstreamEvent::End,
        UpstreamEvent::End,
    ];
    let fx = fixture(ScriptedUpstream::new(script), Some(3), TurnSettings::default()).await;

    let handle = fx.service.run_turn("c1", "Hello").await.unwrap();
    let (frames, outcome) = drain(handle).await;

    assert_eq!(frames.len(), 1);
    assert!(matches!(outcome, TurnOutcome::Completed { history_len: 2, .. }));
    assert_eq!(history(&fx).await.len(), 2);
    assert_eq!(fx.ledgers.remaining("acct_1").await, Some(2));
}

#[tokio::test]
async fn test_upstream_error_reports_in_band_without_commit() {
    let script = vec![
        UpstreamEvent::Created("Hi".into()),
        UpstreamEvent::Error(UpstreamError::RunFailed("server_error".into())),
        UpstreamEvent::End,
    ];
    let fx = fixture(ScriptedUpstream::new(script), Some(3), TurnSettings::default()).await;

    let handle = fx.service.run_turn("c1", "Hello").await.unwrap();
    let (frames, outcome) = drain(handle).await;

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0], "data: {\"content\":\"Hi\"}\n\n");
    assert!(frames[1].starts_with("data: {\"error\":"));
    assert!(frames[1].contains("server_error"));
    assert!(matches!(outcome, TurnOutcome::Failed(FailureReason::Upstream(_))));

    assert!(history(&fx).await.is_empty());
    assert_eq!(fx.ledgers.remaining("acct_1").await, Some(3));
    // The message stays pending so the reply can be retried
    let conversation = fx.service.fetch("c1").await.unwrap();
    assert_eq!(conversation.pending_message.as_deref(), Some("Hello"));
}

#[tokio::test]
async fn test_truncated_stream_fails() {
    let script = vec![UpstreamEvent::Created("Hi".into())];
    let fx = fixture(ScriptedUpstream::new(script), Some(3), TurnSettings::default()).await;

    let handle = fx.service.run_turn("c1", "Hello").await.unwrap();
    let (_, outcome) = drain(handle).await;

    assert!(matches!(outcome, TurnOutcome::Failed(FailureReason::Truncated)));
    assert!(history(&fx).await.is_empty());
}

#[tokio::test]
async fn test_failed_turn_can_be_retried() {
    let fx = fixture(
        ScriptedUpstream::new(vec![UpstreamEvent::Created("partial".into())]),
        Some(3),
        TurnSettings::default(),
    )
    .await;
    fx.service.submit_message("c1", "Hello").await.unwrap();
    let (_, outcome) = drain(fx.service.open_stream("c1").await.unwrap()).await;
    assert!(matches!(outcome, TurnOutcome::Failed(_)));

    // Second attempt against a healthy upstream on the same stores
    let retry = ChatService::new(
        fx.conversations.clone(),
        fx.ledgers.clone(),
        Arc::new(ScriptedUpstream::new(reply_script())),
        TurnSettings::default(),
    );
    let (_, outcome) = drain(retry.open_stream("c1").await.unwrap()).await;
    assert!(matches!(outcome, TurnOutcome::Completed { history_len: 2, .. }));
    assert_eq!(history(&fx).await, vec![Turn::human("Hello"), Turn::ai("Hi there")]);
}

#[tokio::test]
async fn test_disconnect_aborts_without_commit() {
    let script = vec![UpstreamEvent::Created("Hi".into())];
    let fx = fixture(
        ScriptedUpstream::new(script).hanging(),
        Some(3),
        TurnSettings::default(),
    )
    .await;

    let mut handle = fx.service.run_turn("c1", "Hello").await.unwrap();
    let first: Bytes = handle.frames.recv().await.unwrap();
    assert_eq!(first, Bytes::from("data: {\"content\":\"Hi\"}\n\n"));

    drop(handle.frames);
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.task)
        .await
        .expect("session should notice the disconnect")
        .unwrap();

    assert!(matches!(outcome, TurnOutcome::Failed(FailureReason::Disconnected)));
    assert!(history(&fx).await.is_empty());
    assert_eq!(fx.ledgers.remaining("acct_1").await, Some(3));
    assert!(!fx.service.is_busy("c1"));
}

#[tokio::test]
async fn test_stalled_upstream_times_out() {
    let settings = TurnSettings {
        turn_timeout: Duration::from_millis(50),
        ..TurnSettings::default()
    };
    let fx = fixture(
        ScriptedUpstream::new(vec![UpstreamEvent::Created("Hi".into())]).hanging(),
        Some(3),
        settings,
    )
    .await;

    let handle = fx.service.run_turn("c1", "Hello").await.unwrap();
    let (frames, outcome) = tokio::time::timeout(Duration::from_secs(5), drain(handle))
        .await
        .expect("turn should hit its deadline");

    assert!(matches!(outcome, TurnOutcome::Failed(FailureReason::Timeout(_))));
    assert!(frames.last().unwrap().starts_with("data: {\"error\":"));
    assert!(history(&fx).await.is_empty());
}

#[tokio::test]
async fn test_stalled_reader_still_times_out_and_frees_conversation() {
    let settings = TurnSettings {
        turn_timeout: Duration::from_millis(100),
        channel_capacity: 1,
        ..TurnSettings::default()
    };
    let script = vec![
        UpstreamEvent::Created("a".into()),
        UpstreamEvent::Delta("b".into()),
        UpstreamEvent::Delta("c".into()),
    ];
    let fx = fixture(ScriptedUpstream::new(script).hanging(), Some(3), settings).await;

    // Keep the receiver alive but never read from it
    let handle = fx.service.run_turn("c1", "Hello").await.unwrap();
    let _frames = handle.frames;

    let outcome = tokio::time::timeout(Duration::from_secs(3), handle.task)
        .await
        .expect("session should end at its deadline")
        .unwrap();

    assert!(matches!(outcome, TurnOutcome::Failed(FailureReason::Timeout(_))));
    assert!(!fx.service.is_busy("c1"));
    assert!(history(&fx).await.is_empty());
    assert_eq!(fx.ledgers.remaining("acct_1").await, Some(3));

    let retry = fx.service.open_stream("c1").await.unwrap();
    drop(retry.frames);
    retry.task.await.unwrap();
}

#[tokio::test]
async fn test_shared_allowance_is_not_overdrawn() {
    let fx = fixture(ScriptedUpstream::new(reply_script()), Some(1), TurnSettings::default()).await;
    fx.conversations
        .insert(
            Conversation::new("acct_1")
                .with_id("c2")
                .with_upstream("thread_2", "asst_1"),
        )
        .await;

    // Both submissions pass the read-only check
    fx.service.submit_message("c1", "First").await.unwrap();
    fx.service.submit_message("c2", "Second").await.unwrap();

    let first = fx.service.open_stream("c1").await.unwrap();
    assert!(matches!(fx.service.open_stream("c2").await, Err(RelayError::QuotaDenied)));

    let (_, outcome) = drain(first).await;
    assert!(matches!(outcome, TurnOutcome::Completed { .. }));
    assert_eq!(fx.ledgers.remaining("acct_1").await, Some(0));

    let c2 = fx.service.fetch("c2").await.unwrap();
    assert!(c2.turns.is_empty());
    assert_eq!(c2.pending_message.as_deref(), Some("Second"));
}

#[tokio::test]
async fn test_failed_turn_refunds_allowance() {
    let fx = fixture(
        ScriptedUpstream::new(vec![UpstreamEvent::Created("partial".into())]),
        Some(1),
        TurnSettings::default(),
    )
    .await;

    let handle = fx.service.run_turn("c1", "Hello").await.unwrap();
    let (_, outcome) = drain(handle).await;
    assert!(matches!(outcome, TurnOutcome::Failed(FailureReason::Truncated)));
    assert_eq!(fx.ledgers.remaining("acct_1").await, Some(1));
}

#[tokio::test]
async fn test_tool_output_is_relayed_but_not_committed() {
    let script = vec![
        UpstreamEvent::ToolOutput("code_interpreter".into()),
        UpstreamEvent::ToolOutput("\noutput >\n".into()),
        UpstreamEvent::ToolOutput("4".into()),
        UpstreamEvent::Created("The answer is 4".into()),
        UpstreamEvent::Delta("The answer is 4".into()),
        UpstreamEvent::End,
    ];
    let fx = fixture(ScriptedUpstream::new(script), Some(3), TurnSettings::default()).await;

    let handle = fx.service.run_turn("c1", "What is 2+2?").await.unwrap();
    let (frames, outcome) = drain(handle).await;

    assert_eq!(frames.len(), 4);
    assert_eq!(frames[0], "data: {\"content\":\"code_interpreter\"}\n\n");
    assert!(matches!(outcome, TurnOutcome::Completed { .. }));
    assert_eq!(
        history(&fx).await,
        vec![Turn::human("What is 2+2?"), Turn::ai("The answer is 4")]
    );
}

#[tokio::test]
async fn test_concurrent_stream_is_rejected() {
    let fx = fixture(
        ScriptedUpstream::new(vec![UpstreamEvent::Created("Hi".into())]).hanging(),
        Some(3),
        TurnSettings::default(),
    )
    .await;

    let mut handle = fx.service.run_turn("c1", "Hello").await.unwrap();
    assert!(fx.service.is_busy("c1"));
    // The run is open once its first frame arrives
    handle.frames.recv().await.unwrap();

    assert!(matches!(fx.service.open_stream("c1").await, Err(RelayError::Conflict(_))));
    assert!(matches!(
        fx.service.submit_message("c1", "Another").await,
        Err(RelayError::Conflict(_))
    ));
    assert_eq!(fx.upstream.runs(), 1);

    drop(handle.frames);
    handle.task.await.unwrap();
    assert!(!fx.service.is_busy("c1"));
}

#[tokio::test]
async fn test_consecutive_turns_grow_history_in_pairs() {
    let fx = fixture(ScriptedUpstream::new(reply_script()), Some(10), TurnSettings::default()).await;

    for n in 1..=3 {
        let handle = fx.service.run_turn("c1", &format!("Question {}", n)).await.unwrap();
        let (_, outcome) = drain(handle).await;
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
    }

    let turns = history(&fx).await;
    assert_eq!(turns.len(), 6);
    assert_eq!(turns[2], Turn::human("Question 2"));
    assert_eq!(turns[5], Turn::ai("Hi there"));
    assert_eq!(fx.ledgers.remaining("acct_1").await, Some(7));
}
