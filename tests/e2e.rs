//! End-to-end tests for Hopla runs, locally and against a fake cluster.

use std::collections::{BTreeMap, HashMap};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use hopla::{
    ClusterParameters, HoplaError, JobCommand, JobFile, Mode, ProcessExecutor, Scheduler, Shell,
};

/// State of one job known to the fake cluster.
#[derive(Debug, Clone)]
struct FakeJob {
    /// Status queries answered so far for this job.
    queries: usize,
}

/// Shell standing in for a PBS or CCC front-end.
///
/// `qsub`/`ccc_msub` accept a script and immediately write its stdout log as
/// if the job had run; a script mentioning `fail-me` runs without reaching the
/// completion marker and one mentioning `reject-me` is refused. Each job is
/// reported running on its first status query and finished afterwards.
#[derive(Default)]
struct FakeCluster {
    next_id: Mutex<usize>,
    jobs: Mutex<HashMap<String, FakeJob>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl FakeCluster {
    fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|call| call[0] == program)
            .collect()
    }

    fn submit(&self, script_path: &str, marker: &str) -> (i32, String, String) {
        let script = std::fs::read_to_string(script_path).unwrap();
        if script.contains("reject-me") {
            return (1, String::new(), "Job rejected by server".to_string());
        }
        let stdout_path = script
            .lines()
            .find_map(|line| line.strip_prefix(marker))
            .unwrap()
            .trim()
            .to_string();
        let id = {
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            (1000 + *next_id).to_string()
        };
        let mut log = format!("{}\nnode01\n", id);
        if !script.contains("fail-me") {
            log.push_str("HOPLASAY-DONE\n");
        }
        std::fs::write(stdout_path, log).unwrap();
        self.jobs
            .lock()
            .unwrap()
            .insert(id.clone(), FakeJob { queries: 0 });
        (0, format!("Submitted batch job {}\n", id), String::new())
    }

    /// Next state of every job in `ids`, bumping their query counters.
    fn states(&self, ids: &[&str], running: &str, finished: &str) -> Vec<(String, String)> {
        let mut jobs = self.jobs.lock().unwrap();
        ids.iter()
            .filter_map(|id| {
                let job = jobs.get_mut(*id)?;
                job.queries += 1;
                let state = if job.queries == 1 { running } else { finished };
                Some((id.to_string(), state.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl Shell for FakeCluster {
    async fn run(&self, program: &str, args: &[String]) -> Result<Output, HoplaError> {
        let mut call = vec![program.to_string()];
        call.extend(args.iter().cloned());
        self.calls.lock().unwrap().push(call);

        let (code, stdout, stderr) = match program {
            "qsub" => self.submit(&args[0], "#PBS -o "),
            "ccc_msub" => self.submit(&args[0], "#MSUB -o "),
            "qstat" => {
                let ids: Vec<&str> = args[3..].iter().map(String::as_str).collect();
                let jobs: serde_json::Map<String, serde_json::Value> = self
                    .states(&ids, "R", "F")
                    .into_iter()
                    .map(|(id, state)| (format!("{}.fake", id), json!({ "job_state": state })))
                    .collect();
                (0, json!({ "Jobs": jobs }).to_string(), String::new())
            }
            "squeue" => {
                let ids: Vec<&str> = args[3].split(',').collect();
                let jobs: Vec<serde_json::Value> = self
                    .states(&ids, "RUNNING", "COMPLETED")
                    .into_iter()
                    .map(|(id, state)| json!({ "job_id": id.parse::<u64>().unwrap(), "job_state": [state] }))
                    .collect();
                (0, json!({ "jobs": jobs }).to_string(), String::new())
            }
            "pcocc-rs" => (
                0,
                "NAME  TYPE\n----\nbrainprep  docker\n----\n".to_string(),
                String::new(),
            ),
            "qdel" | "ccc_mqdel" => (0, String::new(), String::new()),
            other => (127, String::new(), format!("{}: command not found", other)),
        };
        Ok(Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: stdout.into_bytes(),
            stderr: stderr.into_bytes(),
        })
    }
}

fn cmd(words: &[&str]) -> JobCommand {
    JobCommand::new(words.iter().copied()).unwrap()
}

/// Lists `$0` into the trace as `files`.
const LIST_DIR: &str = r#"out=""; for f in $(ls "$0"); do out="$out${out:+, }\"$f\""; done; printf '{"files": [%s], "dir": "%s"}' "$out" "$0" > "$HOPLA_TRACE_FILE""#;

#[tokio::test]
async fn test_e2e_local_jobs_list_known_directory() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["a.txt", "b.txt", "c.nii.gz"] {
        std::fs::write(dir.path().join(name), "").unwrap();
    }
    let dir_arg = dir.path().to_str().unwrap();
    let commands = vec![cmd(&["sh", "-c", LIST_DIR, dir_arg]); 5];

    let report = Scheduler::new(Mode::Local)
        .with_workers(20)
        .with_executor(Arc::new(ProcessExecutor))
        .run(commands)
        .await
        .unwrap();

    assert_eq!(report.status.len(), 5);
    for (name, result) in &report.status {
        assert_eq!(result.exitcode(), "0", "{} failed: {:?}", name, result.info);
        assert_eq!(
            result.info["files"],
            json!(["a.txt", "b.txt", "c.nii.gz"])
        );
        assert_eq!(result.info["dir"], json!(dir_arg));
        assert_eq!(result.info["cmd"], json!(["sh", "-c", LIST_DIR, dir_arg]));
    }
}

#[tokio::test]
async fn test_e2e_local_failures_do_not_stop_the_batch() {
    let commands = vec![
        cmd(&["sh", "-c", "exit 0"]),
        cmd(&["sh", "-c", "echo broken >&2; exit 3"]),
        cmd(&["/nonexistent/hopla-binary"]),
        cmd(&["true"]),
    ];
    let report = Scheduler::new(Mode::Local)
        .with_workers(2)
        .run(commands)
        .await
        .unwrap();
    assert_eq!(
        report.exitcodes,
        BTreeMap::from([
            ("job_0".to_string(), 0),
            ("job_1".to_string(), 1),
            ("job_2".to_string(), 1),
            ("job_3".to_string(), 0),
        ])
    );
    assert!(report.status["job_1"].exitcode().starts_with("1 - '"));
    assert!(report.status["job_1"].exitcode().contains("broken"));
}

#[tokio::test]
async fn test_e2e_job_file_drives_a_local_run() {
    let dir = tempfile::tempdir().unwrap();
    let job_file: JobFile = r#"
commands:
  - sh -c 'exit 0'
  - [sh, -c, "exit 1"]
script: "true"
iterative: [n]
kwargs:
  n: ["1", "2"]
  verbose: true
"#
    .parse()
    .unwrap();
    let commands = job_file.into_commands().unwrap();
    assert_eq!(commands.len(), 4);
    assert_eq!(commands[2], cmd(&["true", "-n", "1", "--verbose"]));

    let report = Scheduler::new(Mode::Local)
        .with_workers(4)
        .with_outputdir(dir.path())
        .run(commands)
        .await
        .unwrap();
    assert_eq!(report.failures(), 1);
    assert!(dir.path().join("status.json").is_file());
    assert!(dir.path().join("exitcodes.json").is_file());
}

#[tokio::test(start_paused = true)]
async fn test_e2e_pbs_run() {
    let dir = tempfile::tempdir().unwrap();
    let logdir = dir.path().join("logs");
    let cluster = Arc::new(FakeCluster::default());
    let params = ClusterParameters {
        queue: Some("short".to_string()),
        ..Default::default()
    };

    let report = Scheduler::new(Mode::Pbs)
        .with_params(params)
        .with_logdir(&logdir)
        .with_shell(cluster.clone())
        .with_delay(Duration::from_secs(60))
        .with_poll_interval(Duration::from_secs(5))
        .run(vec![
            cmd(&["echo", "one"]),
            cmd(&["echo", "fail-me"]),
            cmd(&["echo", "reject-me"]),
            cmd(&["echo", "four"]),
        ])
        .await
        .unwrap();

    assert_eq!(
        report.exitcodes,
        BTreeMap::from([
            ("job_0".to_string(), 0),
            ("job_1".to_string(), 1),
            ("job_2".to_string(), 1),
            ("job_3".to_string(), 0),
        ])
    );
    assert_eq!(report.status["job_0"].info["submission_id"], json!("1001"));
    assert_eq!(report.status["job_2"].info["submission_id"], json!("EXIT"));
    assert!(report.status["job_2"]
        .exitcode()
        .contains("Job rejected by server"));
    assert!(report.status["job_1"]
        .exitcode()
        .contains("no completion marker"));

    // One submission per job, then batched status queries of the live jobs.
    assert_eq!(cluster.calls_to("qsub").len(), 4);
    let queries = cluster.calls_to("qstat");
    assert_eq!(queries.len(), 2);
    assert_eq!(
        queries[0],
        vec!["qstat", "-fx", "-F", "json", "1001", "1002", "1003"]
    );
    assert!(cluster.calls_to("qdel").is_empty());
    assert!(logdir.join("submissions/job_0_submission.sh").is_file());
}

#[tokio::test(start_paused = true)]
async fn test_e2e_ccc_grouped_run() {
    let dir = tempfile::tempdir().unwrap();
    let logdir = dir.path().join("logs");
    let cluster = Arc::new(FakeCluster::default());
    let params = ClusterParameters {
        queue: Some("rome".to_string()),
        image: Some("brainprep".to_string()),
        group_size: 2,
        ..Default::default()
    };

    let report = Scheduler::new(Mode::Ccc)
        .with_params(params)
        .with_logdir(&logdir)
        .with_shell(cluster.clone())
        .with_delay(Duration::from_secs(10))
        .run(vec![cmd(&["a"]), cmd(&["b"]), cmd(&["c"])])
        .await
        .unwrap();

    assert_eq!(report.status.len(), 2);
    assert_eq!(report.failures(), 0);
    assert_eq!(
        report.status["job_0"].info["cmd"],
        json!([["a"], ["b"]])
    );
    assert_eq!(report.status["job_1"].info["status"], json!("COMPLETED"));
    // The image is already on the hub: nothing to import.
    assert_eq!(
        cluster.calls_to("pcocc-rs"),
        vec![vec!["pcocc-rs", "image", "list", "-r", "n4h00001rs"]]
    );
    assert_eq!(cluster.calls_to("squeue")[0][4], "1001,1002");
    assert!(logdir.join("submissions/job_0_tasks.txt").is_file());
}
