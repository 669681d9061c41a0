//! TaskRecorder - agent task の append-only event log
//!
//! # 保存形式
//! - `task:{id}`: 集計カウンタつきの TaskRecord
//! - `task:{id}:events`: TaskEvent の追記専用リスト
//! - `task-events:{id}`: live 表示用の pub/sub チャンネル
//!
//! 同じ task への追記はプロセス内で task ごとの async Mutex により直列化し、
//! カウンタの更新は CAS で行う（別プロセスからの追記とも失われない）。
//!
//! # 追記の手順
//! 1. TaskRecord を CAS で更新する（カウンタ・`last_seq`・`pending_event`）。ここが確定点
//! 2. event log に push し、`pending_event` を片付ける
//!
//! 2 が失敗しても event は record 側に残り、recall はそれを見せる。次の追記が
//! log への push をやり直す。1 が失敗すれば何も見えない。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::domain::{
    AggregateStatus, EventError, PipelineError, Result, TaskDetail, TaskEvent, TaskEventType,
    TaskId, TaskRecord,
};
use crate::ports::{Clock, IdGenerator, SharedStore, StoreError, Subscription};
use crate::status::EntityStatusMachine;
use crate::store::record::{Update, parse_ids, read_record, update_record, write_record};
use crate::store::{StorePool, keys};

type TaskLocks = HashMap<TaskId, Arc<tokio::sync::Mutex<()>>>;

/// Rounds of the commit loop before giving up on a busy task record.
const MAX_COMMIT_ROUNDS: usize = 16;

enum Commit {
    Done,
    /// Another append is committed but not yet in the log.
    Blocked(TaskEvent),
    Gone,
    Rejected(EventError),
}

#[derive(Clone)]
pub struct TaskRecorder {
    pool: StorePool,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    locks: Arc<Mutex<TaskLocks>>,
}

impl TaskRecorder {
    pub fn new(pool: StorePool, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            pool,
            clock,
            ids,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn locks(&self) -> MutexGuard<'_, TaskLocks> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn task_lock(&self, task_id: TaskId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks().entry(task_id).or_default())
    }

    /// Forget the lock once nobody else is waiting on it.
    fn release_task_lock(&self, task_id: TaskId, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks();
        // map と自分の 2 つだけなら他に待ち手はいない
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(&task_id);
        }
    }

    pub async fn create_task(&self, user_id: &str, name: &str) -> Result<TaskRecord> {
        let conn = self.pool.acquire().await?;
        let store: &dyn SharedStore = &*conn;

        let task = TaskRecord::new(self.ids.generate_task_id(), user_id, name, self.clock.now());
        write_record(store, &keys::task(task.task_id), &task).await?;

        let id = task.task_id.to_string();
        store.list_push(keys::TASKS, &id).await?;
        store.list_push(&keys::user_tasks(user_id), &id).await?;
        info!(task_id = %task.task_id, user_id, name, "task created");
        Ok(task)
    }

    /// Append an event and fold it into the task's counters.
    ///
    /// Fails with `NotFound` for unknown tasks and `InvalidEvent` for a
    /// `status_change` without a valid status; neither appends anything.
    pub async fn record_event(
        &self,
        task_id: TaskId,
        event_type: TaskEventType,
        data: serde_json::Value,
    ) -> Result<TaskEvent> {
        let lock = self.task_lock(task_id);
        let guard = lock.lock().await;
        let result = self.append(task_id, event_type, data).await;
        drop(guard);
        self.release_task_lock(task_id, lock);
        result
    }

    async fn append(
        &self,
        task_id: TaskId,
        event_type: TaskEventType,
        data: serde_json::Value,
    ) -> Result<TaskEvent> {
        let conn = self.pool.acquire().await?;
        let store: &dyn SharedStore = &*conn;
        let key = keys::task(task_id);

        let Some(task) = read_record::<TaskRecord>(store, &key).await? else {
            return Err(PipelineError::not_found("task", task_id));
        };

        let mut event = TaskEvent {
            id: self.ids.generate_event_id(),
            task_id,
            seq: 0,
            timestamp: self.clock.now(),
            event_type,
            data,
        };
        // seq を消費する前に検証する
        task.clone().apply(&event)?;

        event.seq = store.incr_by(&keys::task_seq(task_id), 1).await?.max(0) as u64;
        let encoded = serde_json::to_string(&event)?;
        self.commit(store, &key, &event).await?;

        if let Err(e) = self.flush(store, &event).await {
            warn!(task_id = %task_id, seq = event.seq, error = %e, "event committed; log append deferred");
        }
        if let Err(e) = store.publish(&keys::task_channel(task_id), &encoded).await {
            warn!(task_id = %task_id, seq = event.seq, error = %e, "task event not published");
        }
        debug!(task_id = %task_id, event_type = ?event.event_type, seq = event.seq, "task event recorded");
        Ok(event)
    }

    /// Fold `event` into the record. Another append still waiting for the log
    /// is flushed first.
    async fn commit(&self, store: &dyn SharedStore, key: &str, event: &TaskEvent) -> Result<()> {
        for _ in 0..MAX_COMMIT_ROUNDS {
            let outcome = update_record(store, key, |current: Option<TaskRecord>| {
                let Some(mut task) = current else {
                    return Update::skip(Commit::Gone);
                };
                if let Some(pending) = &task.pending_event {
                    return Update::skip(Commit::Blocked(pending.clone()));
                }
                match task.commit(event) {
                    Ok(()) => Update::write(task, Commit::Done),
                    Err(e) => Update::skip(Commit::Rejected(e)),
                }
            })
            .await?;

            match outcome {
                Commit::Done => return Ok(()),
                Commit::Blocked(pending) => self.flush(store, &pending).await?,
                Commit::Gone => return Err(PipelineError::not_found("task", event.task_id)),
                Commit::Rejected(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Unavailable(format!("task `{}` is too contended", event.task_id)).into())
    }

    /// Push a committed event onto the log and clear it from the record.
    async fn flush(&self, store: &dyn SharedStore, event: &TaskEvent) -> Result<()> {
        let encoded = serde_json::to_string(event)?;
        store
            .list_push(&keys::task_events(event.task_id), &encoded)
            .await?;
        update_record(store, &keys::task(event.task_id), |current: Option<TaskRecord>| {
            match current {
                Some(mut task) if task.pending_event.as_ref().is_some_and(|p| p.seq == event.seq) => {
                    task.pending_event = None;
                    Update::write(task, ())
                }
                _ => Update::skip(()),
            }
        })
        .await
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
        let conn = self.pool.acquire().await?;
        read_record(&*conn, &keys::task(task_id)).await
    }

    /// Task with its full event log, or `None` for unknown ids.
    pub async fn recall_task(&self, task_id: TaskId) -> Result<Option<TaskDetail>> {
        let conn = self.pool.acquire().await?;
        let store: &dyn SharedStore = &*conn;

        let Some(task) = read_record::<TaskRecord>(store, &keys::task(task_id)).await? else {
            return Ok(None);
        };
        let mut logged = Vec::new();
        for raw in store.list_range(&keys::task_events(task_id)).await? {
            match serde_json::from_str::<TaskEvent>(&raw) {
                Ok(event) => logged.push(event),
                Err(e) => warn!(task_id = %task_id, error = %e, "skipping unreadable task event"),
            }
        }
        let events = task.committed_events(logged);
        Ok(Some(TaskDetail::from_events(task, events)))
    }

    /// Tasks of `user_id`, newest first.
    pub async fn list_tasks(&self, user_id: &str, include_archived: bool) -> Result<Vec<TaskRecord>> {
        let conn = self.pool.acquire().await?;
        let store: &dyn SharedStore = &*conn;

        let ids: Vec<TaskId> = parse_ids(store.list_range(&keys::user_tasks(user_id)).await?);
        let mut tasks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = read_record::<TaskRecord>(store, &keys::task(id)).await?
                && (include_archived || !task.archived)
            {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    /// Hide a task from default listings. `false` for unknown ids.
    pub async fn archive_task(&self, task_id: TaskId) -> Result<bool> {
        let conn = self.pool.acquire().await?;
        update_record(&*conn, &keys::task(task_id), |current: Option<TaskRecord>| {
            match current {
                Some(task) if task.archived => Update::skip(true),
                Some(mut task) => {
                    task.archived = true;
                    Update::write(task, true)
                }
                None => Update::skip(false),
            }
        })
        .await
    }

    /// Live feed of events appended to `task_id` from now on.
    pub async fn subscribe_task(&self, task_id: TaskId) -> Result<TaskEventStream> {
        let conn = self.pool.acquire().await?;
        let sub = conn.subscribe(&keys::task_channel(task_id)).await?;
        Ok(TaskEventStream { sub })
    }

    /// Unarchived tasks still pending or running.
    pub async fn active_tasks(&self) -> Result<Vec<TaskRecord>> {
        let conn = self.pool.acquire().await?;
        let store: &dyn SharedStore = &*conn;

        let ids: Vec<TaskId> = parse_ids(store.list_range(keys::TASKS).await?);
        let mut active = Vec::new();
        for id in ids {
            if let Some(task) = read_record::<TaskRecord>(store, &keys::task(id)).await?
                && task.status.is_active()
                && !task.archived
            {
                active.push(task);
            }
        }
        Ok(active)
    }

    /// Snapshot for status endpoints. Scans every record; call sparingly.
    pub async fn aggregate_status(
        &self,
        statuses: &EntityStatusMachine,
        summarizer_enabled: bool,
    ) -> Result<AggregateStatus> {
        let mut snapshot = AggregateStatus {
            summarizer_enabled,
            ..AggregateStatus::default()
        };
        for record in statuses.in_flight().await? {
            snapshot.active_conversations += 1;
            snapshot.observe_activity(record.last_activity_at);
        }
        for task in self.active_tasks().await? {
            snapshot.active_tasks += 1;
            snapshot.tokens_active += task.tokens_total();
            snapshot.observe_activity(task.last_activity_at);
        }
        Ok(snapshot)
    }
}

/// Events of one task as they are recorded.
pub struct TaskEventStream {
    sub: Subscription,
}

impl TaskEventStream {
    /// Next event, or `None` once the store goes away.
    pub async fn next(&mut self) -> Option<TaskEvent> {
        loop {
            let raw = self.sub.recv().await?;
            match serde_json::from_str(&raw) {
                Ok(event) => return Some(event),
                Err(e) => warn!(error = %e, "dropping malformed task event"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntityId, TaskStatus};
    use crate::test_support::{Faults, Harness};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn events_update_the_task_counters() {
        let h = Harness::new();
        let recorder = h.recorder();
        let task = recorder.create_task("user-1", "research").await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        recorder
            .record_event(task.task_id, TaskEventType::StatusChange, json!({"status": "running"}))
            .await
            .unwrap();
        recorder
            .record_event(task.task_id, TaskEventType::ToolCall, json!({"tool_name": "web_search"}))
            .await
            .unwrap();
        let last = recorder
            .record_event(task.task_id, TaskEventType::TokenUsage, json!({"tokens_in": 100, "tokens_out": 20}))
            .await
            .unwrap();
        assert_eq!(last.seq, 3);

        let task = recorder.get_task(task.task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.tool_call_count, 1);
        assert_eq!(task.tool_name.as_deref(), Some("web_search"));
        assert_eq!(task.tokens_total(), 120);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let h = Harness::new();
        let err = h
            .recorder()
            .record_event(h.ids.generate_task_id(), TaskEventType::Log, json!({}))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn invalid_status_change_appends_nothing() {
        let h = Harness::new();
        let recorder = h.recorder();
        let task = recorder.create_task("user-1", "research").await.unwrap();

        let err = recorder
            .record_event(task.task_id, TaskEventType::StatusChange, json!({"status": "exploded"}))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidEvent(_)));

        let detail = recorder.recall_task(task.task_id).await.unwrap().unwrap();
        assert!(detail.events.is_empty());
        let next = recorder
            .record_event(task.task_id, TaskEventType::Log, json!({}))
            .await
            .unwrap();
        assert_eq!(next.seq, 1);
    }

    #[tokio::test]
    async fn recall_rebuilds_messages_and_sections() {
        let h = Harness::new();
        let recorder = h.recorder();
        let task = recorder.create_task("user-1", "research").await.unwrap();
        let id = task.task_id;

        recorder
            .record_event(id, TaskEventType::Message, json!({"role": "user", "content": "find papers"}))
            .await
            .unwrap();
        recorder
            .record_event(id, TaskEventType::Section, json!({"title": "Sources", "content": "..."}))
            .await
            .unwrap();
        recorder
            .record_event(id, TaskEventType::Message, json!({"role": "assistant", "content": "done"}))
            .await
            .unwrap();

        let detail = recorder.recall_task(id).await.unwrap().unwrap();
        assert_eq!(detail.events.len(), 3);
        assert_eq!(detail.task.message_count, 2);
        let contents: Vec<_> = detail.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["find papers", "done"]);
        assert_eq!(detail.sections[0].title, "Sources");

        assert!(recorder.recall_task(h.ids.generate_task_id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_tool_calls_are_all_counted() {
        let h = Harness::new();
        let recorder = h.recorder();
        let task_id = recorder.create_task("user-1", "crawl").await.unwrap().task_id;

        let mut handles = Vec::new();
        for n in 0..20 {
            let recorder = recorder.clone();
            handles.push(tokio::spawn(async move {
                recorder
                    .record_event(task_id, TaskEventType::ToolCall, json!({"tool_name": format!("tool-{n}")}))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let detail = recorder.recall_task(task_id).await.unwrap().unwrap();
        assert_eq!(detail.task.tool_call_count, 20);
        let mut seqs: Vec<_> = detail.events.iter().map(|e| e.seq).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=20).collect::<Vec<_>>());
        assert!(recorder.locks().is_empty());
    }

    #[tokio::test]
    async fn failed_log_append_keeps_counters_and_events_in_step() {
        let h = Harness::new();
        let faults = Faults::default();
        let recorder = TaskRecorder::new(h.faulty_pool(&faults), h.clock(), Arc::clone(&h.ids));
        let task_id = recorder.create_task("user-1", "crawl").await.unwrap().task_id;

        faults.break_writes_to(keys::task_events(task_id));
        let first = recorder
            .record_event(task_id, TaskEventType::ToolCall, json!({"tool_name": "search"}))
            .await
            .unwrap();

        let detail = recorder.recall_task(task_id).await.unwrap().unwrap();
        assert_eq!(detail.task.tool_call_count, 1);
        assert_eq!(detail.events, vec![first]);

        faults.heal();
        recorder
            .record_event(task_id, TaskEventType::ToolCall, json!({"tool_name": "fetch"}))
            .await
            .unwrap();

        let detail = recorder.recall_task(task_id).await.unwrap().unwrap();
        assert_eq!(detail.task.tool_call_count, 2);
        assert_eq!(detail.task.pending_event, None);
        let seqs: Vec<u64> = detail.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        let conn = h.pool.acquire().await.unwrap();
        assert_eq!(conn.list_len(&keys::task_events(task_id)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_commit_leaves_no_event() {
        let h = Harness::new();
        let faults = Faults::default();
        let recorder = TaskRecorder::new(h.faulty_pool(&faults), h.clock(), Arc::clone(&h.ids));
        let task_id = recorder.create_task("user-1", "crawl").await.unwrap().task_id;

        faults.break_writes_to(keys::task(task_id));
        let err = recorder
            .record_event(task_id, TaskEventType::Message, json!({"role": "user", "content": "hi"}))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Store(_)));

        faults.heal();
        let detail = recorder.recall_task(task_id).await.unwrap().unwrap();
        assert_eq!(detail.task.message_count, 0);
        assert!(detail.events.is_empty());
    }

    #[tokio::test]
    async fn listing_is_newest_first_and_hides_archived() {
        let h = Harness::new();
        let recorder = h.recorder();
        let older = recorder.create_task("user-1", "first").await.unwrap();
        h.advance(Duration::from_secs(5));
        let newer = recorder.create_task("user-1", "second").await.unwrap();
        recorder.create_task("user-2", "elsewhere").await.unwrap();

        let names: Vec<_> = recorder
            .list_tasks("user-1", false)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, ["second", "first"]);

        assert!(recorder.archive_task(newer.task_id).await.unwrap());
        assert!(recorder.archive_task(newer.task_id).await.unwrap());
        assert!(!recorder.archive_task(h.ids.generate_task_id()).await.unwrap());

        let visible = recorder.list_tasks("user-1", false).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].task_id, older.task_id);
        assert_eq!(recorder.list_tasks("user-1", true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn subscribers_see_new_events() {
        let h = Harness::new();
        let recorder = h.recorder();
        let task = recorder.create_task("user-1", "research").await.unwrap();
        let mut stream = recorder.subscribe_task(task.task_id).await.unwrap();

        let recorded = recorder
            .record_event(task.task_id, TaskEventType::Log, json!({"line": "starting"}))
            .await
            .unwrap();
        assert_eq!(stream.next().await, Some(recorded));
    }

    #[tokio::test]
    async fn aggregate_counts_active_work() {
        let h = Harness::new();
        let recorder = h.recorder();
        let machine = h.machine();

        machine.retry(&EntityId::new("conv-1")).await.unwrap();
        let running = recorder.create_task("user-1", "research").await.unwrap();
        recorder
            .record_event(running.task_id, TaskEventType::TokenUsage, json!({"tokens_in": 40, "tokens_out": 2}))
            .await
            .unwrap();
        let done = recorder.create_task("user-1", "old").await.unwrap();
        recorder
            .record_event(done.task_id, TaskEventType::StatusChange, json!({"status": "completed"}))
            .await
            .unwrap();

        let snapshot = recorder.aggregate_status(&machine, true).await.unwrap();
        assert_eq!(snapshot.active_conversations, 1);
        assert_eq!(snapshot.active_tasks, 1);
        assert_eq!(snapshot.tokens_active, 42);
        assert_eq!(snapshot.last_activity_at, Some(h.clock.now()));
        assert!(snapshot.summarizer_enabled);
    }
}
