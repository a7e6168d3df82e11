use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::broadcast::BroadcastStore;
use super::gateway::{audit_best_effort, GatewayError, SessionGateway, StartedSession};
use super::phase::{AttemptPhase, PhaseCell};
use super::sentinel::CrossTabSentinel;
use super::surface::{AttemptSurface, ItemView, TerminalView};
use super::timer::ItemTimer;
use super::violations::{IntegritySignal, SignalClass, ViolationAggregator, ViolationDecision};
use crate::config::AttemptConfig;
use crate::models::{AnswerRecord, AuditEventType, AuditRequest, Item, ParticipantRef};

/// Why an attempt left the active phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    NaturalFinish,
    RecoverableLimit,
    DuplicateInstance,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::NaturalFinish => "natural_finish",
            TerminationReason::RecoverableLimit => "recoverable_limit",
            TerminationReason::DuplicateInstance => "duplicate_instance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    Running(u32),
    Expired,
    /// The tick belongs to an item that is no longer current.
    Stale,
}

#[derive(Default)]
struct Progress {
    session_id: Option<String>,
    items: Vec<Item>,
    index: usize,
    remaining: u32,
    /// Set by the tick that reached zero; later ticks of the item are stale.
    expired: bool,
    pending: Option<String>,
    answers: Vec<AnswerRecord>,
    advisory_points: u32,
}

impl Progress {
    fn view(&self) -> Option<ItemView> {
        self.items.get(self.index).map(|item| ItemView {
            index: self.index,
            total: self.items.len(),
            text: item.text.clone(),
            options: item.options.clone(),
            remaining_seconds: self.remaining,
        })
    }

    fn max_points(&self) -> u32 {
        self.items.iter().map(|item| item.points).sum()
    }
}

/// State machine of one running attempt.
///
/// Owns progress (current item, countdown, answers) and the single guarded
/// lock/submit transition, and composes the violation aggregator and the
/// cross-tab sentinel. All entry points take `&self`; the monitor lives in an
/// `Arc` so timer tasks and the event loop can share it.
pub struct AttemptMonitor {
    me: Weak<AttemptMonitor>,
    gateway: Arc<dyn SessionGateway>,
    surface: Arc<dyn AttemptSurface>,
    settings: AttemptConfig,
    phase: Arc<PhaseCell>,
    phase_tx: watch::Sender<AttemptPhase>,
    done_tx: watch::Sender<bool>,
    starting: AtomicBool,
    /// Consumed by the first `lock_and_submit` before any await.
    guard: AtomicBool,
    progress: Mutex<Progress>,
    timer: ItemTimer,
    sentinel: CrossTabSentinel,
    aggregator: ViolationAggregator,
    signal_tx: mpsc::UnboundedSender<IntegritySignal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<IntegritySignal>>>,
    terminal: Mutex<Option<TerminalView>>,
}

impl AttemptMonitor {
    pub fn new(
        gateway: Arc<dyn SessionGateway>,
        broadcast: Arc<dyn BroadcastStore>,
        surface: Arc<dyn AttemptSurface>,
        settings: AttemptConfig,
    ) -> Arc<Self> {
        let phase = Arc::new(PhaseCell::new());
        let (phase_tx, _) = watch::channel(AttemptPhase::Loading);
        let (done_tx, _) = watch::channel(false);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let aggregator =
            ViolationAggregator::new(gateway.clone(), phase.clone(), settings.max_recoverable);
        let sentinel = CrossTabSentinel::new(broadcast, settings.broadcast_key.clone());

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            gateway,
            surface,
            settings,
            phase,
            phase_tx,
            done_tx,
            starting: AtomicBool::new(false),
            guard: AtomicBool::new(false),
            progress: Mutex::new(Progress::default()),
            timer: ItemTimer::new(),
            sentinel,
            aggregator,
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            terminal: Mutex::new(None),
        })
    }

    /// Verifies the code, opens the session and loads the items. On failure the
    /// attempt ends in `FailedInit` and the error is returned to the caller.
    pub async fn start(&self, code: &str, participant: &ParticipantRef) -> Result<(), GatewayError> {
        if self
            .starting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Attempt start ignored: already started");
            return Ok(());
        }

        let (started, items) = match self.initialize(code, participant).await {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!("Attempt initialization failed: {}", e);
                if self.transition(AttemptPhase::Loading, AttemptPhase::FailedInit) {
                    self.surface.show_aborted(&e.to_string());
                    self.done_tx.send_replace(true);
                }
                return Err(e);
            }
        };

        {
            let mut progress = self.progress();
            progress.session_id = Some(started.session_id.clone());
            progress.remaining = items[0].time_limit_seconds;
            progress.items = items;

            if !self.transition(AttemptPhase::Loading, AttemptPhase::Active) {
                return Ok(());
            }
            // Entered under the progress lock: a racing lock_and_submit releases
            // only after it has snapshotted progress
            if let Err(e) = self.surface.enter_exclusive_mode() {
                tracing::debug!("Exclusive mode unavailable: {}", e);
            }
            if let Some(view) = progress.view() {
                self.surface.show_item(&view);
            }
            self.schedule_timer(0);
        }

        tracing::info!(
            "Attempt active: session={}, subject={}, instance={}",
            started.session_id,
            started.subject_id,
            self.sentinel.instance_id()
        );

        if let Err(e) = self
            .sentinel
            .arm(&started.session_id, self.signal_tx.clone())
            .await
        {
            tracing::warn!("Duplicate-session detection unavailable: {}", e);
        }
        // A lock may have raced the arming; leave nothing behind
        if self.phase.load().is_terminal() {
            self.sentinel.disarm().await;
        }

        Ok(())
    }

    async fn initialize(
        &self,
        code: &str,
        participant: &ParticipantRef,
    ) -> Result<(StartedSession, Vec<Item>), GatewayError> {
        let started = self.gateway.start(code, participant).await?;
        let items: Vec<Item> = self.gateway.fetch_items(&started.subject_id).await?.collect();
        if items.is_empty() {
            return Err(GatewayError::EmptySubject(started.subject_id));
        }
        Ok((started, items))
    }

    /// Stores the pending choice for the current item. Active only.
    pub fn record_answer(&self, choice: impl Into<String>) -> bool {
        let mut progress = self.progress();
        if self.phase.load() != AttemptPhase::Active {
            return false;
        }
        progress.pending = Some(choice.into());
        true
    }

    /// Records the current item and moves on. On the last item the attempt
    /// completes and is submitted.
    pub async fn advance(&self) -> bool {
        self.advance_item(None, false).await
    }

    /// One countdown step for the current item. At zero the item is advanced
    /// exactly once. Returns the remaining seconds, or `None` when not active.
    pub async fn tick(&self) -> Option<u32> {
        let index = self.progress().index;
        match self.tick_item(index) {
            TickOutcome::Running(remaining) => Some(remaining),
            TickOutcome::Expired => {
                self.advance_item(Some(index), true).await;
                Some(0)
            }
            TickOutcome::Stale => None,
        }
    }

    fn tick_item(&self, index: usize) -> TickOutcome {
        let mut progress = self.progress();
        if self.phase.load() != AttemptPhase::Active
            || progress.index != index
            || index >= progress.items.len()
        {
            return TickOutcome::Stale;
        }
        if progress.expired {
            return TickOutcome::Stale;
        }
        progress.remaining = progress.remaining.saturating_sub(1);
        if progress.remaining == 0 {
            progress.expired = true;
            TickOutcome::Expired
        } else {
            TickOutcome::Running(progress.remaining)
        }
    }

    /// `expected` pins the advance to one item index so a late timer cannot
    /// skip the item that replaced it.
    async fn advance_item(&self, expected: Option<usize>, timed_out: bool) -> bool {
        let (finished_item, last) = {
            let mut progress = self.progress();
            if self.phase.load() != AttemptPhase::Active {
                return false;
            }
            if expected.is_some_and(|index| index != progress.index) {
                return false;
            }
            let Some(item) = progress.items.get(progress.index).cloned() else {
                return false;
            };

            let given = progress.pending.take();
            let is_correct = given
                .as_deref()
                .map(|choice| item.is_correct(choice))
                .unwrap_or(false);
            let time_taken_seconds = item.time_limit_seconds.saturating_sub(progress.remaining);
            if is_correct {
                progress.advisory_points += item.points;
            }
            progress.answers.push(AnswerRecord {
                item_id: item.id.clone(),
                given,
                is_correct,
                time_taken_seconds,
            });

            progress.index += 1;
            progress.expired = false;
            let next_index = progress.index;
            match progress.items.get(next_index).map(|next| next.time_limit_seconds) {
                Some(limit) => {
                    progress.remaining = limit;
                    if let Some(view) = progress.view() {
                        self.surface.show_item(&view);
                    }
                    self.schedule_timer(next_index);
                    (item.id, false)
                }
                None => {
                    progress.remaining = 0;
                    (item.id, true)
                }
            }
        };

        if last {
            if !self.transition(AttemptPhase::Active, AttemptPhase::Completed) {
                return true;
            }
            self.timer.cancel();
        }

        if timed_out {
            if let Some(session_id) = self.session_id() {
                audit_best_effort(
                    self.gateway.as_ref(),
                    &session_id,
                    AuditRequest::now(
                        AuditEventType::ItemTimedOut,
                        serde_json::json!({ "item_id": finished_item }),
                    ),
                )
                .await;
            }
        }

        if last {
            self.lock_and_submit(TerminationReason::NaturalFinish).await;
        }
        true
    }

    fn schedule_timer(&self, index: usize) {
        let monitor = self.me.clone();
        let period = self.settings.tick_interval();

        self.timer.schedule(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(current) = monitor.upgrade() else {
                    return;
                };
                match current.tick_item(index) {
                    TickOutcome::Running(_) => continue,
                    TickOutcome::Stale => return,
                    TickOutcome::Expired => {
                        // Detached: scheduling the next item aborts this task
                        tokio::spawn(async move {
                            current.advance_item(Some(index), true).await;
                        });
                        return;
                    }
                }
            }
        });
    }

    /// Entry point for environment signals. Audits, consults the aggregator and
    /// terminates the attempt when the policy says so.
    pub async fn report_signal(&self, signal: IntegritySignal) -> ViolationDecision {
        let Some(session_id) = self.session_id() else {
            tracing::debug!("Signal {:?} before session start dropped", signal);
            return ViolationDecision::Ignored;
        };

        let decision = self.aggregator.on_signal(&session_id, signal).await;
        if decision == ViolationDecision::Lock {
            let reason = match signal.class() {
                SignalClass::ZeroTolerance => TerminationReason::DuplicateInstance,
                SignalClass::Recoverable => TerminationReason::RecoverableLimit,
            };
            self.lock_and_submit(reason).await;
        }
        decision
    }

    /// Locks (unless already completed) and submits. Only the first call does
    /// anything; the terminal view is shown whatever the gateway returns.
    pub async fn lock_and_submit(&self, reason: TerminationReason) -> bool {
        if !matches!(
            self.phase.load(),
            AttemptPhase::Active | AttemptPhase::Completed
        ) {
            return false;
        }
        if self
            .guard
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.transition(AttemptPhase::Active, AttemptPhase::Locked);
        let final_phase = self.phase.load();

        let (session_id, answers, advisory_score, max_points) = {
            let progress = self.progress();
            (
                progress.session_id.clone(),
                progress.answers.clone(),
                progress.advisory_points,
                progress.max_points(),
            )
        };
        self.timer.cancel();

        tracing::info!(
            "Terminating attempt: session={}, reason={}, phase={}, answers={}",
            session_id.as_deref().unwrap_or("-"),
            reason.as_str(),
            final_phase.as_str(),
            answers.len()
        );

        let mut confirmed = None;
        if let Some(session_id) = session_id {
            let lock_requested = AuditRequest::now(
                AuditEventType::LockRequested,
                serde_json::json!({ "reason": reason.as_str() }),
            );
            // The audit goes out first but is not waited on before lock and submit
            let ((), lock_result, submit_result) = tokio::join!(
                audit_best_effort(self.gateway.as_ref(), &session_id, lock_requested),
                self.gateway.lock(&session_id),
                self.gateway.submit(&session_id, &answers)
            );
            if let Err(e) = lock_result {
                tracing::warn!("Lock request failed: session={}, error={}", session_id, e);
            }
            match submit_result {
                Ok(result) => confirmed = Some(result),
                Err(e) => {
                    tracing::warn!("Submit request failed: session={}, error={}", session_id, e)
                }
            }
        }

        self.sentinel.disarm().await;
        if let Err(e) = self.surface.release_exclusive_mode() {
            tracing::debug!("Exclusive mode release failed: {}", e);
        }

        let view = if final_phase == AttemptPhase::Completed {
            TerminalView::Completed {
                advisory_score,
                max_points,
                confirmed,
            }
        } else {
            TerminalView::Locked
        };
        self.surface.show_terminal(&view);
        *self.terminal.lock().unwrap_or_else(|p| p.into_inner()) = Some(view);
        self.done_tx.send_replace(true);
        true
    }

    /// Consumes environment signals until the attempt reaches a terminal phase.
    /// Only the first call gets the signal stream.
    pub async fn run(&self) {
        let Some(mut signals) = self
            .signal_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        else {
            tracing::warn!("Attempt event loop already running");
            return;
        };
        let mut phases = self.phase_tx.subscribe();

        while !self.phase.load().is_terminal() {
            tokio::select! {
                Some(signal) = signals.recv() => {
                    self.report_signal(signal).await;
                }
                changed = phases.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Attempt event loop finished in {}", self.phase.load().as_str());
    }

    /// Resolves once the terminal view has been shown or initialization failed.
    pub async fn finished(&self) {
        let mut done = self.done_tx.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }

    fn transition(&self, from: AttemptPhase, to: AttemptPhase) -> bool {
        if self.phase.transition(from, to) {
            self.phase_tx.send_replace(to);
            true
        } else {
            false
        }
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn phase(&self) -> AttemptPhase {
        self.phase.load()
    }

    pub fn watch_phase(&self) -> watch::Receiver<AttemptPhase> {
        self.phase_tx.subscribe()
    }

    pub fn signal_sender(&self) -> mpsc::UnboundedSender<IntegritySignal> {
        self.signal_tx.clone()
    }

    pub fn instance_id(&self) -> Uuid {
        self.sentinel.instance_id()
    }

    pub fn session_id(&self) -> Option<String> {
        self.progress().session_id.clone()
    }

    pub fn answers(&self) -> Vec<AnswerRecord> {
        self.progress().answers.clone()
    }

    /// Index of the item on screen while active.
    pub fn current_item(&self) -> Option<usize> {
        let progress = self.progress();
        (self.phase.load() == AttemptPhase::Active && progress.index < progress.items.len())
            .then_some(progress.index)
    }

    pub fn current_view(&self) -> Option<ItemView> {
        let progress = self.progress();
        if self.phase.load() != AttemptPhase::Active {
            return None;
        }
        progress.view()
    }

    pub fn remaining_seconds(&self) -> u32 {
        self.progress().remaining
    }

    pub fn advisory_score(&self) -> u32 {
        self.progress().advisory_points
    }

    pub fn terminal_view(&self) -> Option<TerminalView> {
        self.terminal.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}
