//! Shared, rate-limited view of the cluster queue.
//!
//! One [`StatusWatcher`] is shared by every job of a scheduler family. Instead
//! of asking the scheduler about each job separately, it asks about every
//! tracked job in a single call, at most once per `delay`, and serves
//! everyone from the cached answer. All jobs of a run must hold the same
//! `Arc<StatusWatcher>` for the rate limit to mean anything.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::HoplaError;
use crate::family::{state_of, SchedulerFamily, StatusRecord};
use crate::shell::Shell;

#[derive(Debug)]
struct WatcherState {
    registered: HashSet<String>,
    /// Always a subset of `registered`. Only grows.
    finished: HashSet<String>,
    info: HashMap<String, StatusRecord>,
    last_check: Instant,
    num_calls: usize,
}

impl WatcherState {
    fn new() -> Self {
        Self {
            registered: HashSet::new(),
            finished: HashSet::new(),
            info: HashMap::new(),
            last_check: Instant::now(),
            num_calls: 0,
        }
    }

    fn state(&self, job_id: &str) -> String {
        self.info
            .get(job_id)
            .map(state_of)
            .unwrap_or_else(|| crate::family::UNKNOWN_STATE.to_string())
    }
}

pub struct StatusWatcher {
    family: Arc<dyn SchedulerFamily>,
    shell: Arc<dyn Shell>,
    delay: Duration,
    state: Mutex<WatcherState>,
}

impl StatusWatcher {
    pub fn new(family: Arc<dyn SchedulerFamily>, shell: Arc<dyn Shell>, delay: Duration) -> Self {
        Self {
            family,
            shell,
            delay,
            state: Mutex::new(WatcherState::new()),
        }
    }

    pub fn family(&self) -> &Arc<dyn SchedulerFamily> {
        &self.family
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Forgets every job and every cached status.
    pub async fn clear(&self) {
        *self.state.lock().await = WatcherState::new();
    }

    /// Tracks a remote id in the next status queries.
    pub async fn register(&self, job_id: &str) {
        self.state.lock().await.registered.insert(job_id.to_string());
    }

    /// Last known status record of a job, refreshed first if the cache is
    /// older than `delay`. Empty when the scheduler never reported the job.
    pub async fn get_info(&self, job_id: &str) -> StatusRecord {
        let mut state = self.state.lock().await;
        state.registered.insert(job_id.to_string());
        if state.last_check.elapsed() > self.delay {
            self.update_locked(&mut state).await;
        }
        state.info.get(job_id).cloned().unwrap_or_default()
    }

    /// Last known state label of a job, `UNKNOWN` when nothing is known.
    pub async fn get_state(&self, job_id: &str) -> String {
        state_of(&self.get_info(job_id).await)
    }

    /// Whether the job left the scheduler's active states.
    pub async fn is_done(&self, job_id: &str) -> bool {
        let state = self.get_state(job_id).await;
        !self.is_active(&state)
    }

    fn is_active(&self, state: &str) -> bool {
        let state = state.to_uppercase();
        self.family.active_states().contains(&state.as_str())
    }

    /// Queries the scheduler now, regardless of `delay`.
    pub async fn update(&self) {
        let mut state = self.state.lock().await;
        self.update_locked(&mut state).await;
    }

    async fn update_locked(&self, state: &mut WatcherState) {
        if state.registered.is_empty() {
            return;
        }
        let mut active: Vec<String> = state
            .registered
            .difference(&state.finished)
            .cloned()
            .collect();
        active.sort();
        if !active.is_empty() {
            state.num_calls += 1;
            match self.query(&active).await {
                Ok(info) => state.info.extend(info),
                Err(error) => tracing::warn!(
                    family = self.family.name(),
                    call = state.num_calls,
                    %error,
                    "bypassing status query error, status may be inaccurate"
                ),
            }
        }
        state.last_check = Instant::now();
        for job_id in active {
            if !self.is_active(&state.state(&job_id)) {
                tracing::debug!(job_id = %job_id, state = %state.state(&job_id), "job finished");
                state.finished.insert(job_id);
            }
        }
    }

    async fn query(&self, ids: &[String]) -> Result<HashMap<String, StatusRecord>, HoplaError> {
        let (program, args) = self.family.status_command(ids);
        let output = self.shell.check_output(&program, &args).await?;
        self.family.parse_status(&output)
    }

    /// Number of live queries issued so far.
    pub async fn query_count(&self) -> usize {
        self.state.lock().await.num_calls
    }

    pub async fn registered(&self) -> HashSet<String> {
        self.state.lock().await.registered.clone()
    }

    pub async fn finished(&self) -> HashSet<String> {
        self.state.lock().await.finished.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};

    use async_trait::async_trait;

    use super::*;
    use crate::family::{Ccc, Pbs};

    /// Answers every command with the next queued reply.
    #[derive(Default)]
    struct MockShell {
        replies: std::sync::Mutex<VecDeque<(i32, String)>>,
        calls: std::sync::Mutex<Vec<Vec<String>>>,
    }

    impl MockShell {
        fn reply(&self, code: i32, stdout: &str) {
            self.replies
                .lock()
                .unwrap()
                .push_back((code, stdout.to_string()));
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Shell for MockShell {
        async fn run(&self, program: &str, args: &[String]) -> Result<Output, HoplaError> {
            let mut call = vec![program.to_string()];
            call.extend(args.iter().cloned());
            self.calls.lock().unwrap().push(call);
            let (code, stdout) = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or((1, String::new()));
            Ok(Output {
                status: ExitStatus::from_raw(code << 8),
                stdout: stdout.into_bytes(),
                stderr: b"mock failure".to_vec(),
            })
        }
    }

    fn qstat(states: &[(&str, &str)]) -> String {
        let jobs: serde_json::Map<String, serde_json::Value> = states
            .iter()
            .map(|(id, state)| {
                (
                    format!("{}.server", id),
                    serde_json::json!({ "job_state": state }),
                )
            })
            .collect();
        serde_json::json!({ "Jobs": jobs }).to_string()
    }

    fn pbs_watcher(delay: u64) -> (Arc<MockShell>, StatusWatcher) {
        let shell = Arc::new(MockShell::default());
        let watcher = StatusWatcher::new(Arc::new(Pbs), shell.clone(), Duration::from_secs(delay));
        (shell, watcher)
    }

    #[tokio::test]
    async fn test_update_without_jobs_is_a_noop() {
        let (shell, watcher) = pbs_watcher(0);
        watcher.update().await;
        assert_eq!(watcher.query_count().await, 0);
        assert!(shell.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_done() {
        let (_, watcher) = pbs_watcher(60);
        assert_eq!(watcher.get_state("12").await, "UNKNOWN");
        assert!(!watcher.is_done("12").await);
        assert!(watcher.registered().await.contains("12"));
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (_, watcher) = pbs_watcher(60);
        watcher.register("12").await;
        watcher.register("12").await;
        assert_eq!(watcher.registered().await.len(), 1);
    }

    #[tokio::test]
    async fn test_one_batched_query_for_all_jobs() {
        let (shell, watcher) = pbs_watcher(60);
        for id in ["3", "1", "2"] {
            watcher.register(id).await;
        }
        shell.reply(0, &qstat(&[("1", "R"), ("2", "Q"), ("3", "F")]));
        watcher.update().await;
        assert_eq!(
            shell.calls(),
            vec![vec!["qstat", "-fx", "-F", "json", "1", "2", "3"]]
        );
        assert_eq!(watcher.get_state("1").await, "R");
        assert!(watcher.is_done("3").await);
        assert_eq!(watcher.finished().await, HashSet::from(["3".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queries_are_rate_limited() {
        let (shell, watcher) = pbs_watcher(60);
        watcher.register("1").await;
        for _ in 0..100 {
            watcher.get_info("1").await;
            watcher.get_state("1").await;
        }
        assert_eq!(watcher.query_count().await, 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        shell.reply(0, &qstat(&[("1", "R")]));
        for _ in 0..100 {
            assert_eq!(watcher.get_state("1").await, "R");
        }
        assert_eq!(watcher.query_count().await, 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        watcher.is_done("1").await;
        assert_eq!(watcher.query_count().await, 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        shell.reply(0, &qstat(&[("1", "F")]));
        assert!(watcher.is_done("1").await);
        assert_eq!(watcher.query_count().await, 2);
    }

    #[tokio::test]
    async fn test_failed_query_keeps_cache() {
        let (shell, watcher) = pbs_watcher(60);
        watcher.register("1").await;
        shell.reply(0, &qstat(&[("1", "R")]));
        watcher.update().await;
        let before = watcher.get_info("1").await;

        shell.reply(1, "");
        watcher.update().await;
        shell.reply(0, "qstat: garbage");
        watcher.update().await;
        assert_eq!(watcher.query_count().await, 3);
        assert_eq!(watcher.get_info("1").await, before);
        assert_eq!(watcher.get_state("1").await, "R");
    }

    #[tokio::test]
    async fn test_finished_jobs_are_not_queried_again() {
        let (shell, watcher) = pbs_watcher(60);
        watcher.register("1").await;
        watcher.register("2").await;
        shell.reply(0, &qstat(&[("1", "F"), ("2", "R")]));
        watcher.update().await;
        // The scheduler forgot job 1: it must stay finished.
        shell.reply(0, &qstat(&[("2", "R")]));
        watcher.update().await;
        assert_eq!(shell.calls()[1], vec!["qstat", "-fx", "-F", "json", "2"]);
        let finished = watcher.finished().await;
        assert!(finished.contains("1"));
        assert!(finished.is_subset(&watcher.registered().await));
    }

    #[tokio::test]
    async fn test_all_jobs_finished_skips_query() {
        let (shell, watcher) = pbs_watcher(60);
        watcher.register("1").await;
        shell.reply(0, &qstat(&[("1", "F")]));
        watcher.update().await;
        watcher.update().await;
        assert_eq!(shell.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_list_states_use_last_element() {
        let shell = Arc::new(MockShell::default());
        let watcher = StatusWatcher::new(Arc::new(Ccc), shell.clone(), Duration::from_secs(60));
        watcher.register("7").await;
        shell.reply(
            0,
            r#"{"jobs": [{"job_id": 7, "job_state": ["PENDING", "completed"]}]}"#,
        );
        watcher.update().await;
        assert_eq!(shell.calls()[0], vec!["squeue", "--states=all", "--json", "-j", "7"]);
        assert_eq!(watcher.get_state("7").await, "completed");
        assert!(watcher.is_done("7").await);
    }

    #[tokio::test]
    async fn test_clear_forgets_everything() {
        let (shell, watcher) = pbs_watcher(60);
        watcher.register("1").await;
        shell.reply(0, &qstat(&[("1", "F")]));
        watcher.update().await;
        watcher.clear().await;
        assert!(watcher.registered().await.is_empty());
        assert!(watcher.finished().await.is_empty());
        assert_eq!(watcher.query_count().await, 0);
    }
}
