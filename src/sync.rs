//! Polling timeline synchronization for the active conversation.
//!
//! One engine owns the timeline and the growth cursor. At most one poll
//! loop runs at a time; starting a new one aborts the previous loop and
//! bumps the engine epoch, so any response still in flight for the old
//! conversation is dropped instead of merged.
//!
//! Callers that switch conversations pass the selector's `Selection` to
//! [`SyncEngine::apply`] in the same call, so the cursor and timeline are
//! reset before the selector call returns. [`SyncEngine::follow`] applies
//! whatever selections were not applied that way; each generation is
//! applied at most once.
//!
//! Every poll replaces the timeline with the fetched list. Growth is
//! judged only by message count: a poll that returns more messages than
//! the cursor raises the notifier, unless the cursor is still zero (first
//! load after a switch). The user's own messages count as growth too.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::api::MessageStore;
use crate::models::{Message, UserId};
use crate::notify::{GrowthEvent, Notifier};
use crate::selector::{Selection, Target};

/// What observers see after every committed change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimelineSnapshot {
    pub epoch: u64,
    pub target: Option<Target>,
    pub messages: Vec<Message>,
    pub cursor: usize,
    /// False until a poll has been merged for this epoch.
    pub fetched: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Merged { messages: usize, notified: bool },
    Failed,
    Stale,
    Inactive,
}

#[derive(Default)]
struct SyncState {
    epoch: u64,
    active: Option<Target>,
    timeline: Vec<Message>,
    cursor: usize,
    fetched: bool,
    applied_generation: u64,
}

impl SyncState {
    fn snapshot(&self) -> TimelineSnapshot {
        TimelineSnapshot {
            epoch: self.epoch,
            target: self.active,
            messages: self.timeline.clone(),
            cursor: self.cursor,
            fetched: self.fetched,
        }
    }
}

pub struct SyncEngine<S, N> {
    me: UserId,
    store: Arc<S>,
    notifier: N,
    interval: Duration,
    state: Mutex<SyncState>,
    poll_gate: tokio::sync::Mutex<()>,
    poll_loop: Mutex<Option<JoinHandle<()>>>,
    snapshots: watch::Sender<TimelineSnapshot>,
}

impl<S, N> SyncEngine<S, N>
where
    S: MessageStore + 'static,
    N: Notifier + 'static,
{
    pub fn new(me: UserId, store: Arc<S>, notifier: N, interval: Duration) -> Self {
        let (snapshots, _) = watch::channel(TimelineSnapshot::default());
        Self {
            me,
            store,
            notifier,
            interval,
            state: Mutex::new(SyncState::default()),
            poll_gate: tokio::sync::Mutex::new(()),
            poll_loop: Mutex::new(None),
            snapshots,
        }
    }

    /// Begin polling `target`, replacing whatever was polled before.
    pub fn start(self: &Arc<Self>, target: Target) {
        let mut poll_loop = lock(&self.poll_loop);
        self.start_locked(&mut poll_loop, target);
    }

    pub fn stop(&self) {
        let mut poll_loop = lock(&self.poll_loop);
        self.stop_locked(&mut poll_loop);
    }

    /// Apply a selector transition: every new selection restarts the loop,
    /// including a re-selection of the same conversation. Returns false for
    /// a generation that was already applied.
    pub fn apply(self: &Arc<Self>, selection: Selection) -> bool {
        let mut poll_loop = lock(&self.poll_loop);
        {
            let mut state = lock(&self.state);
            if selection.generation <= state.applied_generation {
                return false;
            }
            state.applied_generation = selection.generation;
        }
        match selection.target {
            Some(target) => self.start_locked(&mut poll_loop, target),
            None => self.stop_locked(&mut poll_loop),
        }
        true
    }

    /// Drive the engine from a selector until the selector goes away.
    pub fn follow(self: &Arc<Self>, mut selections: watch::Receiver<Selection>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let selection = *selections.borrow_and_update();
                engine.apply(selection);
                if selections.changed().await.is_err() {
                    break;
                }
            }
            engine.stop();
        })
    }

    /// One fetch-and-merge cycle for `target`.
    pub async fn poll_once(&self, target: Target) -> PollOutcome {
        let Some(epoch) = self.epoch_for(target) else {
            return PollOutcome::Inactive;
        };

        let _gate = self.poll_gate.lock().await;
        if self.epoch_for(target) != Some(epoch) {
            return PollOutcome::Stale;
        }

        match self.store.fetch_timeline(self.me, target).await {
            Ok(messages) => self.commit(target, epoch, messages),
            Err(err) => {
                tracing::warn!(conversation = %target, error = %err, "poll failed; retrying next tick");
                PollOutcome::Failed
            }
        }
    }

    /// Poll the active conversation now, outside the regular tick.
    pub async fn force_refresh(&self) -> PollOutcome {
        match self.active() {
            Some(target) => self.poll_once(target).await,
            None => PollOutcome::Inactive,
        }
    }

    pub fn active(&self) -> Option<Target> {
        lock(&self.state).active
    }

    pub fn cursor(&self) -> usize {
        lock(&self.state).cursor
    }

    pub fn timeline(&self) -> Vec<Message> {
        lock(&self.state).timeline.clone()
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.poll_loop)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn subscribe(&self) -> watch::Receiver<TimelineSnapshot> {
        self.snapshots.subscribe()
    }

    /// Reset timeline and cursor for a new conversation (or none).
    fn activate(&self, target: Option<Target>) -> u64 {
        let mut state = lock(&self.state);
        state.epoch += 1;
        state.active = target;
        state.timeline.clear();
        state.cursor = 0;
        state.fetched = false;
        let snapshot = state.snapshot();
        let epoch = state.epoch;
        drop(state);
        self.snapshots.send_replace(snapshot);
        epoch
    }

    // Caller holds the `poll_loop` lock across abort, activate and spawn.
    fn start_locked(self: &Arc<Self>, poll_loop: &mut Option<JoinHandle<()>>, target: Target) {
        if let Some(handle) = poll_loop.take() {
            handle.abort();
        }
        let epoch = self.activate(Some(target));
        tracing::debug!(conversation = %target, epoch, "poll loop starting");

        let engine = Arc::clone(self);
        let interval = self.interval;
        *poll_loop = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                engine.poll_once(target).await;
            }
        }));
    }

    fn stop_locked(&self, poll_loop: &mut Option<JoinHandle<()>>) {
        let was_polling = match poll_loop.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        };
        let epoch = self.activate(None);
        if was_polling {
            tracing::debug!(epoch, "poll loop stopped");
        }
    }

    fn epoch_for(&self, target: Target) -> Option<u64> {
        let state = lock(&self.state);
        (state.active == Some(target)).then_some(state.epoch)
    }

    fn commit(&self, target: Target, epoch: u64, messages: Vec<Message>) -> PollOutcome {
        let mut state = lock(&self.state);
        if state.epoch != epoch || state.active != Some(target) {
            tracing::debug!(conversation = %target, epoch, "dropping stale poll result");
            return PollOutcome::Stale;
        }

        let previous = state.cursor;
        let count = messages.len();
        let grew = previous > 0 && count > previous;
        if previous == 0 || count > previous {
            state.cursor = count;
        }
        state.timeline = messages;
        state.fetched = true;
        let snapshot = state.snapshot();
        drop(state);

        tracing::trace!(conversation = %target, count, cursor = snapshot.cursor, "timeline merged");
        self.snapshots.send_replace(snapshot);
        if grew {
            self.notifier.notify(&GrowthEvent {
                target,
                previous,
                current: count,
            });
        }
        PollOutcome::Merged {
            messages: count,
            notified: grew,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::{ApiError, OutboundMessage};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    pub(crate) fn message(id: i64, sender_id: UserId, content: &str) -> Message {
        Message {
            id,
            sender_id,
            receiver_id: None,
            content: content.to_string(),
            file_url: None,
            file_name: None,
            voice_url: None,
            voice_duration: None,
            is_read: None,
            created_at: "2026-01-28T15:04:05".to_string(),
            sender_name: format!("user{sender_id}"),
            sender_avatar: None,
        }
    }

    pub(crate) fn messages(count: usize) -> Vec<Message> {
        (1..=count as i64).map(|id| message(id, 2, "hello")).collect()
    }

    /// In-memory store double with failure and pause switches.
    #[derive(Default)]
    pub(crate) struct FakeStore {
        pub timelines: Mutex<HashMap<Target, Vec<Message>>>,
        pub sent: Mutex<Vec<(Target, OutboundMessage)>>,
        pub fetches: AtomicUsize,
        pub fail: AtomicBool,
        pub fail_sends: AtomicBool,
        pub pause: AtomicBool,
        pub fetch_started: Notify,
        pub release: Notify,
    }

    impl FakeStore {
        pub(crate) fn set(&self, target: Target, messages: Vec<Message>) {
            lock(&self.timelines).insert(target, messages);
        }

        pub(crate) fn sent(&self) -> Vec<(Target, OutboundMessage)> {
            lock(&self.sent).clone()
        }
    }

    impl MessageStore for FakeStore {
        async fn fetch_timeline(&self, _me: UserId, target: Target) -> Result<Vec<Message>, ApiError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.pause.load(Ordering::SeqCst) {
                self.fetch_started.notify_one();
                self.release.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(ApiError::Status(502));
            }
            Ok(lock(&self.timelines).get(&target).cloned().unwrap_or_default())
        }

        async fn send_message(&self, me: UserId, target: Target, message: &OutboundMessage) -> Result<(), ApiError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(ApiError::Status(500));
            }
            lock(&self.sent).push((target, message.clone()));
            let mut timelines = lock(&self.timelines);
            let timeline = timelines.entry(target).or_default();
            let id = timeline.len() as i64 + 1;
            timeline.push(message_from(id, me, message));
            Ok(())
        }
    }

    fn message_from(id: i64, me: UserId, outbound: &OutboundMessage) -> Message {
        Message {
            file_url: outbound.file_url.clone(),
            file_name: outbound.file_name.clone(),
            voice_url: outbound.voice_url.clone(),
            voice_duration: outbound.voice_duration,
            ..message(id, me, &outbound.content)
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingNotifier {
        pub count: Arc<AtomicUsize>,
    }

    impl Notifier for CountingNotifier {
        fn notify(&self, _event: &GrowthEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn engine(store: Arc<FakeStore>, interval: Duration) -> (Arc<SyncEngine<FakeStore, CountingNotifier>>, Arc<AtomicUsize>) {
        let notifier = CountingNotifier::default();
        let count = Arc::clone(&notifier.count);
        (Arc::new(SyncEngine::new(1, store, notifier, interval)), count)
    }

    const PEER_B: Target = Target::Direct(2);
    const GROUP_1: Target = Target::Group(10);

    #[tokio::test]
    async fn first_poll_after_switch_does_not_notify() {
        let store = Arc::new(FakeStore::default());
        store.set(PEER_B, messages(4));
        let (engine, notified) = engine(Arc::clone(&store), Duration::from_secs(3600));

        engine.activate(Some(PEER_B));
        let outcome = engine.poll_once(PEER_B).await;

        assert_eq!(outcome, PollOutcome::Merged { messages: 4, notified: false });
        assert_eq!(engine.cursor(), 4);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn growth_from_three_to_five_notifies_once() {
        let store = Arc::new(FakeStore::default());
        store.set(PEER_B, messages(3));
        let (engine, notified) = engine(Arc::clone(&store), Duration::from_secs(3600));
        engine.activate(Some(PEER_B));
        engine.poll_once(PEER_B).await;
        assert_eq!(engine.cursor(), 3);

        store.set(PEER_B, messages(5));
        let outcome = engine.poll_once(PEER_B).await;

        assert_eq!(outcome, PollOutcome::Merged { messages: 5, notified: true });
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(engine.cursor(), 5);
        assert_eq!(engine.timeline().len(), 5);
    }

    #[tokio::test]
    async fn same_count_replaces_timeline_without_notifying() {
        let store = Arc::new(FakeStore::default());
        store.set(PEER_B, messages(2));
        let (engine, notified) = engine(Arc::clone(&store), Duration::from_secs(3600));
        engine.activate(Some(PEER_B));
        engine.poll_once(PEER_B).await;

        store.set(PEER_B, vec![message(1, 2, "edited"), message(3, 2, "replaced")]);
        let outcome = engine.poll_once(PEER_B).await;

        assert_eq!(outcome, PollOutcome::Merged { messages: 2, notified: false });
        assert_eq!(notified.load(Ordering::SeqCst), 0);
        let timeline = engine.timeline();
        assert_eq!(timeline[0].content, "edited");
        assert_eq!(timeline[1].id, 3);
    }

    #[tokio::test]
    async fn shrinking_fetch_never_decrements_cursor() {
        let store = Arc::new(FakeStore::default());
        store.set(PEER_B, messages(6));
        let (engine, _) = engine(Arc::clone(&store), Duration::from_secs(3600));
        engine.activate(Some(PEER_B));
        engine.poll_once(PEER_B).await;

        store.set(PEER_B, messages(4));
        engine.poll_once(PEER_B).await;

        assert_eq!(engine.cursor(), 6);
        assert_eq!(engine.timeline().len(), 4);
    }

    #[tokio::test]
    async fn switching_group_to_peer_resets_cursor() {
        let store = Arc::new(FakeStore::default());
        store.set(GROUP_1, messages(7));
        store.set(PEER_B, messages(2));
        let (engine, notified) = engine(Arc::clone(&store), Duration::from_secs(3600));
        engine.activate(Some(GROUP_1));
        engine.poll_once(GROUP_1).await;
        assert_eq!(engine.cursor(), 7);

        engine.activate(Some(PEER_B));
        assert_eq!(engine.cursor(), 0);
        assert!(engine.timeline().is_empty());

        let outcome = engine.poll_once(PEER_B).await;
        assert_eq!(outcome, PollOutcome::Merged { messages: 2, notified: false });
        assert_eq!(engine.cursor(), 2);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_state_untouched() {
        let store = Arc::new(FakeStore::default());
        store.set(PEER_B, messages(3));
        let (engine, notified) = engine(Arc::clone(&store), Duration::from_secs(3600));
        engine.activate(Some(PEER_B));
        engine.poll_once(PEER_B).await;

        store.fail.store(true, Ordering::SeqCst);
        store.set(PEER_B, messages(9));
        assert_eq!(engine.poll_once(PEER_B).await, PollOutcome::Failed);
        assert_eq!(engine.cursor(), 3);
        assert_eq!(engine.timeline().len(), 3);

        store.fail.store(false, Ordering::SeqCst);
        assert_eq!(
            engine.poll_once(PEER_B).await,
            PollOutcome::Merged { messages: 9, notified: true }
        );
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn late_response_for_previous_target_is_dropped() {
        let store = Arc::new(FakeStore::default());
        store.set(PEER_B, messages(5));
        let (engine, _) = engine(Arc::clone(&store), Duration::from_secs(3600));
        engine.activate(Some(PEER_B));

        store.pause.store(true, Ordering::SeqCst);
        let in_flight = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.poll_once(PEER_B).await }
        });
        store.fetch_started.notified().await;

        engine.activate(Some(GROUP_1));
        store.release.notify_one();

        assert_eq!(in_flight.await.expect("join"), PollOutcome::Stale);
        assert_eq!(engine.active(), Some(GROUP_1));
        assert!(engine.timeline().is_empty());
        assert_eq!(engine.cursor(), 0);
    }

    #[tokio::test]
    async fn poll_for_inactive_target_is_ignored() {
        let store = Arc::new(FakeStore::default());
        let (engine, _) = engine(Arc::clone(&store), Duration::from_secs(3600));
        assert_eq!(engine.force_refresh().await, PollOutcome::Inactive);

        engine.activate(Some(PEER_B));
        assert_eq!(engine.poll_once(GROUP_1).await, PollOutcome::Inactive);
        assert_eq!(store.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn loop_polls_on_interval_until_stopped() {
        let store = Arc::new(FakeStore::default());
        store.set(PEER_B, messages(1));
        let (engine, _) = engine(Arc::clone(&store), Duration::from_millis(20));

        engine.start(PEER_B);
        assert!(engine.is_polling());
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.fetches.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("loop keeps polling");

        engine.stop();
        assert!(engine.active().is_none());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_stop = store.fetches.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.fetches.load(Ordering::SeqCst), after_stop);
        assert!(!engine.is_polling());
    }

    #[tokio::test]
    async fn restart_keeps_a_single_loop() {
        let store = Arc::new(FakeStore::default());
        let (engine, _) = engine(Arc::clone(&store), Duration::from_secs(3600));

        engine.start(PEER_B);
        engine.start(GROUP_1);
        engine.start(PEER_B);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // each loop polls once immediately; aborted loops must not keep going
        assert!(store.fetches.load(Ordering::SeqCst) <= 3);
        assert_eq!(engine.active(), Some(PEER_B));
        engine.stop();
    }

    #[tokio::test]
    async fn follows_selector_transitions() {
        let store = Arc::new(FakeStore::default());
        store.set(GROUP_1, messages(7));
        store.set(PEER_B, messages(2));
        let (engine, notified) = engine(Arc::clone(&store), Duration::from_secs(3600));
        let selector = crate::selector::ConversationSelector::new();
        let mut snapshots = engine.subscribe();
        let supervisor = engine.follow(selector.subscribe());

        selector.select_group(10);
        wait_for(&mut snapshots, |snapshot| snapshot.target == Some(GROUP_1) && snapshot.cursor == 7).await;

        selector.select_direct(2);
        wait_for(&mut snapshots, |snapshot| snapshot.target == Some(PEER_B) && snapshot.cursor == 2).await;
        assert_eq!(notified.load(Ordering::SeqCst), 0);

        drop(selector);
        supervisor.await.expect("supervisor exits");
        assert!(engine.active().is_none());
    }

    #[tokio::test]
    async fn applied_selection_resets_engine_before_returning() {
        let store = Arc::new(FakeStore::default());
        store.set(GROUP_1, messages(7));
        store.set(PEER_B, messages(2));
        let (engine, notified) = engine(Arc::clone(&store), Duration::from_secs(3600));
        let selector = crate::selector::ConversationSelector::new();
        let mut snapshots = engine.subscribe();
        let supervisor = engine.follow(selector.subscribe());

        let steps = [(GROUP_1, 7), (PEER_B, 2), (PEER_B, 2), (GROUP_1, 7), (GROUP_1, 7)];
        for (round, (target, count)) in steps.into_iter().enumerate() {
            let selection = match target {
                Target::Direct(peer) => selector.select_direct(peer),
                Target::Group(group) => selector.select_group(group),
            };
            assert!(engine.apply(selection));
            assert_eq!(engine.active(), selector.active());
            assert_eq!(engine.cursor(), 0);
            assert!(engine.timeline().is_empty());
            assert_eq!(snapshots.borrow().epoch, round as u64 + 1);

            wait_for(&mut snapshots, |snapshot| {
                snapshot.target == Some(target) && snapshot.fetched && snapshot.cursor == count
            })
            .await;
            assert_eq!(engine.active(), selector.active());
        }

        // the follower saw every generation already applied
        assert_eq!(snapshots.borrow().epoch, steps.len() as u64);
        assert_eq!(notified.load(Ordering::SeqCst), 0);

        drop(selector);
        supervisor.await.expect("supervisor exits");
        assert!(engine.active().is_none());
    }

    #[tokio::test]
    async fn older_selection_is_not_reapplied() {
        let store = Arc::new(FakeStore::default());
        let (engine, _) = engine(Arc::clone(&store), Duration::from_secs(3600));
        let selector = crate::selector::ConversationSelector::new();

        let first = selector.select(GROUP_1);
        let second = selector.select(PEER_B);
        assert!(engine.apply(second));
        assert!(!engine.apply(first));
        assert!(!engine.apply(second));
        assert_eq!(engine.active(), Some(PEER_B));
        assert_eq!(engine.subscribe().borrow().epoch, 1);
        engine.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_leave_no_orphan_loop() {
        let store = Arc::new(FakeStore::default());
        store.set(PEER_B, messages(1));
        store.set(GROUP_1, messages(1));
        let (engine, _) = engine(Arc::clone(&store), Duration::from_millis(5));

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    for round in 0..50 {
                        let target = if (worker + round) % 2 == 0 { PEER_B } else { GROUP_1 };
                        engine.start(target);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.await.expect("join");
        }

        engine.stop();
        assert!(!engine.is_polling());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_stop = store.fetches.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.fetches.load(Ordering::SeqCst), after_stop);
    }

    async fn wait_for(
        snapshots: &mut watch::Receiver<TimelineSnapshot>,
        done: impl Fn(&TimelineSnapshot) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(5), snapshots.wait_for(|snapshot| done(snapshot)))
            .await
            .expect("snapshot in time")
            .expect("engine alive");
    }
}
