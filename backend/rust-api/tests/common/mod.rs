#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use proctor_api::attempt::broadcast::ValueStream;
use proctor_api::attempt::{
    AttemptMonitor, AttemptSurface, BroadcastStore, GatewayError, ItemSequence, ItemView,
    LocalBroadcast, LocalBroadcastHub, SessionGateway, StartedSession, TerminalView,
};
use proctor_api::config::{AttemptConfig, Config};
use proctor_api::create_router;
use proctor_api::models::{
    AnswerRecord, AttemptResult, AuditEventType, AuditRequest, Item, ParticipantRef, Subject,
    SubjectKind,
};
use proctor_api::services::question_bank::InMemoryQuestionBank;
use proctor_api::services::session_store::InMemorySessionStore;
use proctor_api::services::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ACCESS_CODE: &str = "ALG-101";
pub const SUBJECT_ID: &str = "algebra-basics";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// `count` items, each with options a/b/c where "a" is correct.
pub fn sample_items(count: usize, time_limit_seconds: u32) -> Vec<Item> {
    (0..count)
        .map(|i| Item {
            id: format!("item-{}", i),
            text: format!("Question {}", i + 1),
            options: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            correct_answer: "a".to_string(),
            points: 1,
            time_limit_seconds,
        })
        .collect()
}

pub fn sample_subject(items: Vec<Item>) -> Subject {
    Subject {
        id: SUBJECT_ID.to_string(),
        code: ACCESS_CODE.to_string(),
        kind: SubjectKind::Quiz,
        title: "Algebra basics".to_string(),
        items,
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub store: Arc<InMemorySessionStore>,
}

/// Router over in-memory storage seeded with one three-item subject.
pub fn create_test_app() -> TestApp {
    init_tracing();

    let bank = Arc::new(InMemoryQuestionBank::new());
    bank.insert(sample_subject(sample_items(3, 300)));
    let store = Arc::new(InMemorySessionStore::new());

    let state = Arc::new(AppState::with_store(
        Config::in_memory(),
        store.clone(),
        bank,
    ));

    TestApp {
        router: create_router(state.clone()),
        state,
        store,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    Start,
    FetchItems,
    Audit(AuditEventType),
    Lock,
    Submit(Vec<AnswerRecord>),
}

/// Scripted gateway that records every call in order.
pub struct RecordingGateway {
    session_id: String,
    items: Vec<Item>,
    calls: Mutex<Vec<GatewayCall>>,
    fail_audit: AtomicBool,
    fail_lock: AtomicBool,
    fail_submit: AtomicBool,
    delay: Option<Duration>,
}

impl RecordingGateway {
    pub fn new(session_id: &str, items: Vec<Item>) -> Self {
        Self {
            session_id: session_id.to_string(),
            items,
            calls: Mutex::new(Vec::new()),
            fail_audit: AtomicBool::new(false),
            fail_lock: AtomicBool::new(false),
            fail_submit: AtomicBool::new(false),
            delay: None,
        }
    }

    /// Audit, lock and submit each take `delay` before answering.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_audit(self) -> Self {
        self.fail_audit.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_lock_and_submit(self) -> Self {
        self.fail_lock.store(true, Ordering::SeqCst);
        self.fail_submit.store(true, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn audit_types(&self) -> Vec<AuditEventType> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                GatewayCall::Audit(event_type) => Some(event_type),
                _ => None,
            })
            .collect()
    }

    pub fn lock_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, GatewayCall::Lock))
            .count()
    }

    pub fn submissions(&self) -> Vec<Vec<AnswerRecord>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                GatewayCall::Submit(answers) => Some(answers),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: GatewayCall) {
        self.calls.lock().unwrap().push(call);
    }

    async fn respond(&self) {
        match self.delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
    }
}

#[async_trait]
impl SessionGateway for RecordingGateway {
    async fn start(
        &self,
        code: &str,
        _participant: &ParticipantRef,
    ) -> Result<StartedSession, GatewayError> {
        self.record(GatewayCall::Start);
        if code != ACCESS_CODE {
            return Err(GatewayError::InvalidCode);
        }
        Ok(StartedSession {
            subject_id: SUBJECT_ID.to_string(),
            session_id: self.session_id.clone(),
        })
    }

    async fn fetch_items(&self, _subject_id: &str) -> Result<ItemSequence, GatewayError> {
        self.record(GatewayCall::FetchItems);
        Ok(ItemSequence::new(self.items.clone()))
    }

    async fn audit(&self, _session_id: &str, event: &AuditRequest) -> Result<(), GatewayError> {
        self.record(GatewayCall::Audit(event.event_type));
        self.respond().await;
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(GatewayError::Network("audit endpoint unreachable".into()));
        }
        Ok(())
    }

    async fn lock(&self, _session_id: &str) -> Result<(), GatewayError> {
        self.record(GatewayCall::Lock);
        self.respond().await;
        if self.fail_lock.load(Ordering::SeqCst) {
            return Err(GatewayError::Network("lock endpoint unreachable".into()));
        }
        Ok(())
    }

    async fn submit(
        &self,
        _session_id: &str,
        answers: &[AnswerRecord],
    ) -> Result<AttemptResult, GatewayError> {
        self.record(GatewayCall::Submit(answers.to_vec()));
        self.respond().await;
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(GatewayError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        let correct = answers.iter().filter(|a| a.is_correct).count() as u32;
        Ok(AttemptResult {
            score_points: correct,
            max_points: self.items.iter().map(|item| item.points).sum(),
            correct_answers: correct,
            total_items: self.items.len() as u32,
        })
    }
}

/// Surface that keeps everything it was asked to show.
#[derive(Default)]
pub struct RecordingSurface {
    items: Mutex<Vec<ItemView>>,
    terminals: Mutex<Vec<TerminalView>>,
    aborted: Mutex<Vec<String>>,
    exclusive_log: Mutex<Vec<&'static str>>,
}

impl RecordingSurface {
    pub fn items(&self) -> Vec<ItemView> {
        self.items.lock().unwrap().clone()
    }

    pub fn terminal_views(&self) -> Vec<TerminalView> {
        self.terminals.lock().unwrap().clone()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.aborted.lock().unwrap().clone()
    }

    /// "enter" / "release" in call order.
    pub fn exclusive_log(&self) -> Vec<&'static str> {
        self.exclusive_log.lock().unwrap().clone()
    }

    pub fn exclusive_entered(&self) -> usize {
        self.exclusive_log()
            .iter()
            .filter(|e| **e == "enter")
            .count()
    }

    pub fn exclusive_released(&self) -> usize {
        self.exclusive_log()
            .iter()
            .filter(|e| **e == "release")
            .count()
    }
}

impl AttemptSurface for RecordingSurface {
    fn show_item(&self, view: &ItemView) {
        self.items.lock().unwrap().push(view.clone());
    }

    fn show_terminal(&self, view: &TerminalView) {
        self.terminals.lock().unwrap().push(view.clone());
    }

    fn show_aborted(&self, reason: &str) {
        self.aborted.lock().unwrap().push(reason.to_string());
    }

    fn enter_exclusive_mode(&self) -> anyhow::Result<()> {
        self.exclusive_log.lock().unwrap().push("enter");
        Ok(())
    }

    fn release_exclusive_mode(&self) -> anyhow::Result<()> {
        self.exclusive_log.lock().unwrap().push("release");
        // Release failures must not affect termination
        Err(anyhow::anyhow!("exclusive mode already left"))
    }
}

/// Local broadcast handle that yields before every write, so other tasks can
/// run while an instance announces itself.
pub struct YieldingBroadcast(pub LocalBroadcast);

#[async_trait]
impl BroadcastStore for YieldingBroadcast {
    async fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        self.0.put(key, value).await
    }

    async fn clear(&self, key: &str) -> anyhow::Result<()> {
        self.0.clear(key).await
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.0.get(key).await
    }

    async fn subscribe(&self, key: &str) -> anyhow::Result<ValueStream> {
        self.0.subscribe(key).await
    }
}

pub fn attempt_settings() -> AttemptConfig {
    AttemptConfig {
        tick_interval_ms: 1000,
        ..AttemptConfig::default()
    }
}

pub fn build_monitor(
    gateway: Arc<dyn SessionGateway>,
    hub: &LocalBroadcastHub,
) -> (Arc<AttemptMonitor>, Arc<RecordingSurface>) {
    let surface = Arc::new(RecordingSurface::default());
    let monitor = AttemptMonitor::new(
        gateway,
        Arc::new(hub.handle()),
        surface.clone(),
        attempt_settings(),
    );
    (monitor, surface)
}

pub fn guest() -> ParticipantRef {
    ParticipantRef::guest("student@example.com")
}
