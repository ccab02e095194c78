//! # Task Manager
//!
//! In-process scheduler for long-running analyses. Submissions return
//! immediately with a short opaque id; a bounded pool of workers drains the
//! queue. Tasks support cooperative cancellation, owner-filtered listing,
//! and age-based reaping of finished entries.
//!
//! ## State machine
//!
//! `pending → running → completed | cancelled | failed`, with one extra
//! transition: a task cancelled before a worker picks it up goes straight
//! from `pending` to `cancelled` without its run function ever executing.
//!
//! ## Ordering guarantee
//!
//! `completed_at` is written before the terminal status, inside the same
//! table-shard critical section, so any reader that observes a terminal
//! status also observes all timing fields.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use workbench_plugin_sdk::{AnalysisResult, CancelToken, TaskStatus};

/// A background computation task.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub owner: String,
    pub status: TaskStatus,
    pub plugin_name: String,
    pub game_id: String,
    pub config: Map<String, Value>,
    pub result: Option<AnalysisResult>,
    pub error: Option<String>,
    #[serde(skip)]
    pub cancel: CancelToken,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The function a worker executes for a task. It receives the task's config
/// and cancel token; an `Err` marks the task failed with that message.
pub type RunFn =
    Box<dyn FnOnce(Map<String, Value>, CancelToken) -> BoxFuture<'static, Result<AnalysisResult, String>> + Send>;

/// Scheduler for background analysis tasks.
pub struct TaskManager {
    tasks: Arc<DashMap<String, Task>>,
    workers: Arc<Semaphore>,
    accepting: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
    id_length: usize,
}

impl TaskManager {
    pub fn new(max_workers: usize, id_length: usize) -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
            accepting: AtomicBool::new(true),
            handles: Mutex::new(Vec::new()),
            id_length,
        }
    }

    /// Submit a task for background execution; returns its id immediately,
    /// or `None` once the manager is shutting down.
    pub fn submit(
        &self,
        owner: &str,
        game_id: &str,
        plugin_name: &str,
        config: Map<String, Value>,
        run_fn: RunFn,
    ) -> Option<String> {
        if !self.accepting.load(Ordering::SeqCst) {
            return None;
        }

        let task_id = new_task_id(self.id_length);
        let task = Task {
            id: task_id.clone(),
            owner: owner.to_string(),
            status: TaskStatus::Pending,
            plugin_name: plugin_name.to_string(),
            game_id: game_id.to_string(),
            config: config.clone(),
            result: None,
            error: None,
            cancel: CancelToken::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let cancel = task.cancel.clone();
        self.tasks.insert(task_id.clone(), task);

        let tasks = Arc::clone(&self.tasks);
        let workers = Arc::clone(&self.workers);
        let id = task_id.clone();
        let handle = tokio::spawn(async move {
            let permit = workers.acquire_owned().await;

            // Cancelled while still queued (or the pool is gone): terminal
            // without ever invoking the run function.
            if permit.is_err() || cancel.is_set() {
                finalize(&tasks, &id, |task| {
                    task.status = TaskStatus::Cancelled;
                });
                tracing::info!(task = %id, "task cancelled before start");
                return;
            }

            if let Some(mut task) = tasks.get_mut(&id) {
                task.started_at = Some(Utc::now());
                task.status = TaskStatus::Running;
            }
            tracing::info!(task = %id, "task started");

            let outcome = run_fn(config, cancel.clone()).await;

            finalize(&tasks, &id, |task| match outcome {
                Ok(result) => {
                    // A cancelled run may still carry a partial result.
                    task.result = Some(result);
                    task.status = if cancel.is_set() {
                        TaskStatus::Cancelled
                    } else {
                        TaskStatus::Completed
                    };
                }
                Err(message) => {
                    task.error = Some(message);
                    task.status = TaskStatus::Failed;
                }
            });
            tracing::info!(task = %id, "task finished");
        });

        let mut handles = self.handles.lock().unwrap();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);

        tracing::info!(task = %task_id, plugin = plugin_name, game = game_id, "task submitted");
        Some(task_id)
    }

    /// Snapshot of a task by id.
    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.get(task_id).map(|t| t.value().clone())
    }

    /// Request cancellation. Returns `false` for unknown or already-terminal
    /// tasks.
    pub fn cancel(&self, task_id: &str) -> bool {
        let Some(task) = self.tasks.get(task_id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }
        task.cancel.set();
        tracing::info!(task = %task_id, "task cancellation requested");
        true
    }

    /// Tasks, optionally filtered by owner, newest first.
    pub fn list(&self, owner: Option<&str>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| owner.map_or(true, |o| t.owner == o))
            .map(|t| t.value().clone())
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// Remove terminal tasks whose completion is older than `max_age`.
    /// Returns how many were removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let stale: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| {
                t.status.is_terminal()
                    && t.completed_at.is_some_and(|done| {
                        (now - done).to_std().unwrap_or_default() > max_age
                    })
            })
            .map(|t| t.id.clone())
            .collect();

        let mut removed = 0;
        for id in stale {
            if self.tasks.remove(&id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "cleaned up old tasks");
        }
        removed
    }

    /// Stop accepting submissions; optionally cancel all in-flight work and
    /// wait for the workers to drain.
    pub async fn shutdown(&self, wait: bool, cancel_futures: bool) {
        self.accepting.store(false, Ordering::SeqCst);

        if cancel_futures {
            for task in self.tasks.iter() {
                if !task.status.is_terminal() {
                    task.cancel.set();
                }
            }
        }

        if wait {
            let handles: Vec<JoinHandle<()>> = {
                let mut handles = self.handles.lock().unwrap();
                handles.drain(..).collect()
            };
            for handle in handles {
                let _ = handle.await;
            }
        }
    }
}

/// Apply the terminal mutation for a task. `completed_at` is stamped before
/// the closure writes the terminal status; both happen under the same shard
/// guard.
fn finalize(tasks: &DashMap<String, Task>, task_id: &str, apply: impl FnOnce(&mut Task)) {
    if let Some(mut task) = tasks.get_mut(task_id) {
        task.completed_at = Some(Utc::now());
        apply(&mut task);
    }
}

fn new_task_id(length: usize) -> String {
    let full = uuid::Uuid::new_v4().simple().to_string();
    full[..length.min(full.len())].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok_run(result: AnalysisResult) -> RunFn {
        Box::new(move |_config, _cancel| Box::pin(async move { Ok(result) }))
    }

    fn sample_result(summary: &str) -> AnalysisResult {
        AnalysisResult {
            summary: summary.to_string(),
            details: Map::new(),
        }
    }

    async fn wait_terminal(manager: &TaskManager, id: &str) -> Task {
        for _ in 0..500 {
            let task = manager.get(id).unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn completed_task_has_ordered_timestamps() {
        let manager = TaskManager::new(2, 8);
        let id = manager
            .submit("alice", "g1", "Nash", Map::new(), ok_run(sample_result("done")))
            .unwrap();
        assert_eq!(id.len(), 8);

        let task = wait_terminal(&manager, &id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.unwrap().summary, "done");

        let started = task.started_at.unwrap();
        let completed = task.completed_at.unwrap();
        assert!(task.created_at <= started);
        assert!(started <= completed);
    }

    #[tokio::test]
    async fn failing_run_marks_task_failed() {
        let manager = TaskManager::new(2, 8);
        let id = manager
            .submit(
                "alice",
                "g1",
                "Nash",
                Map::new(),
                Box::new(|_, _| Box::pin(async { Err("solver panicked: bad payoff".to_string()) })),
            )
            .unwrap();

        let task = wait_terminal(&manager, &id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("solver panicked: bad payoff"));
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn cancel_before_start_never_invokes_run_fn() {
        let manager = TaskManager::new(1, 8);
        let gate = Arc::new(tokio::sync::Notify::new());

        // Occupy the single worker slot.
        let release = Arc::clone(&gate);
        let blocker = manager
            .submit(
                "alice",
                "g0",
                "Nash",
                Map::new(),
                Box::new(move |_, _| {
                    Box::pin(async move {
                        release.notified().await;
                        Ok(sample_result("unblocked"))
                    })
                }),
            )
            .unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let ran_probe = Arc::clone(&ran);
        let queued = manager
            .submit(
                "alice",
                "g1",
                "Nash",
                Map::new(),
                Box::new(move |_, _| {
                    ran_probe.store(true, Ordering::SeqCst);
                    Box::pin(async { Ok(sample_result("should not run")) })
                }),
            )
            .unwrap();

        assert!(manager.cancel(&queued));
        gate.notify_one();

        let cancelled = wait_terminal(&manager, &queued).await;
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.result.is_none());
        assert!(cancelled.completed_at.is_some());
        assert!(!ran.load(Ordering::SeqCst));

        let finished = wait_terminal(&manager, &blocker).await;
        assert_eq!(finished.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_during_run_keeps_partial_result() {
        let manager = TaskManager::new(1, 8);
        let id = manager
            .submit(
                "alice",
                "g1",
                "Nash",
                Map::new(),
                Box::new(|_, cancel| {
                    Box::pin(async move {
                        while !cancel.is_set() {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                        Ok(AnalysisResult {
                            summary: "partial".to_string(),
                            details: serde_json::from_value(json!({"progress": 0.4})).unwrap(),
                        })
                    })
                }),
            )
            .unwrap();

        // Give the worker a moment to enter running.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.cancel(&id));

        let task = wait_terminal(&manager, &id).await;
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.result.unwrap().summary, "partial");
    }

    #[tokio::test]
    async fn cancel_on_terminal_task_is_a_no_op() {
        let manager = TaskManager::new(1, 8);
        let id = manager
            .submit("alice", "g1", "Nash", Map::new(), ok_run(sample_result("done")))
            .unwrap();
        wait_terminal(&manager, &id).await;

        assert!(!manager.cancel(&id));
        assert!(!manager.cancel("nonexistent"));
    }

    #[tokio::test]
    async fn list_filters_by_owner() {
        let manager = TaskManager::new(2, 8);
        manager
            .submit("alice", "g1", "Nash", Map::new(), ok_run(sample_result("a")))
            .unwrap();
        manager
            .submit("bob", "g2", "Nash", Map::new(), ok_run(sample_result("b")))
            .unwrap();

        assert_eq!(manager.list(None).len(), 2);
        let alice = manager.list(Some("alice"));
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].owner, "alice");
        assert!(manager.list(Some("carol")).is_empty());
    }

    #[tokio::test]
    async fn cleanup_reaps_only_old_terminal_tasks() {
        let manager = TaskManager::new(2, 8);
        let done = manager
            .submit("alice", "g1", "Nash", Map::new(), ok_run(sample_result("a")))
            .unwrap();
        wait_terminal(&manager, &done).await;

        // Still younger than an hour: kept.
        assert_eq!(manager.cleanup(Duration::from_secs(3600)), 0);
        assert!(manager.get(&done).is_some());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.cleanup(Duration::ZERO), 1);
        assert!(manager.get(&done).is_none());
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work_and_cancels_in_flight() {
        let manager = TaskManager::new(1, 8);
        let id = manager
            .submit(
                "alice",
                "g1",
                "Nash",
                Map::new(),
                Box::new(|_, cancel| {
                    Box::pin(async move {
                        while !cancel.is_set() {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                        Ok(sample_result("interrupted"))
                    })
                }),
            )
            .unwrap();

        manager.shutdown(true, true).await;

        let task = manager.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(manager
            .submit("alice", "g2", "Nash", Map::new(), ok_run(sample_result("late")))
            .is_none());
    }
}
