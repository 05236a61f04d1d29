// tests/docker_e2e.rs
//
// True end-to-end scenarios against a local Docker daemon. Ignored by
// default: they need /var/run/docker.sock and the openjdk:17-alpine image
// pulled. Run with `cargo test --test docker_e2e -- --ignored`.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crucible::core::InputFile;
use crucible::{Config, DockerRuntime, Job, JobSeed, JobStatus, JobStore, Supervisor};

fn docker_engine(dir: &tempfile::TempDir, deadline_ms: u64) -> (Arc<JobStore>, Supervisor) {
    let config = Config {
        deadline_ms,
        ..Config::default()
    };
    let store = Arc::new(JobStore::open(dir.path().join("e2e.db")).unwrap());
    let runtime = Arc::new(DockerRuntime::connect(&config.runtime_socket).unwrap());
    let supervisor = Supervisor::new(store.clone(), runtime, Arc::new(config));
    (store, supervisor)
}

fn seed(source: &str, args: Vec<&str>, input_files: Vec<InputFile>) -> JobSeed {
    JobSeed {
        owner: "e2e".into(),
        source: source.into(),
        args: args.into_iter().map(String::from).collect(),
        input_files,
    }
}

async fn run_to_done(store: &JobStore, supervisor: &Supervisor, seed: &JobSeed) -> Job {
    let id = supervisor.submit(seed).unwrap();
    wait_done(store, id, 120).await
}

async fn wait_done(store: &JobStore, id: Uuid, secs: u64) -> Job {
    for _ in 0..secs * 2 {
        let job = store.get(id, None).unwrap();
        if job.status == JobStatus::Done {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("job {id} did not finish within {secs}s");
}

#[tokio::test]
#[ignore = "requires a local Docker daemon and the openjdk:17-alpine image"]
async fn hello_world() {
    let dir = tempfile::tempdir().unwrap();
    let (store, supervisor) = docker_engine(&dir, 10_000);

    let job = run_to_done(
        &store,
        &supervisor,
        &seed(
            "public class Main { public static void main(String[] a) { System.out.println(\"hi\"); } }",
            vec![],
            vec![],
        ),
    )
    .await;

    assert!(!job.crashed, "stderr: {}", String::from_utf8_lossy(&job.stderr));
    assert!(!job.timed_out);
    assert_eq!(job.stdout, b"hi\n");
    assert!(job.execution_ms < 10_000);
}

#[tokio::test]
#[ignore = "requires a local Docker daemon and the openjdk:17-alpine image"]
async fn argument_passing() {
    let dir = tempfile::tempdir().unwrap();
    let (store, supervisor) = docker_engine(&dir, 10_000);

    let source = r#"
public class Main {
    public static void main(String[] a) {
        System.out.println(a.length);
        for (String s : a) System.out.println(s);
    }
}"#;
    let job = run_to_done(
        &store,
        &supervisor,
        &seed(source, vec!["x", "y", "z with space"], vec![]),
    )
    .await;

    assert!(!job.crashed, "stderr: {}", String::from_utf8_lossy(&job.stderr));
    let stdout = String::from_utf8_lossy(&job.stdout);
    assert_eq!(stdout, "3\nx\ny\nz with space\n");
}

#[tokio::test]
#[ignore = "requires a local Docker daemon and the openjdk:17-alpine image"]
async fn input_file_reading() {
    let dir = tempfile::tempdir().unwrap();
    let (store, supervisor) = docker_engine(&dir, 10_000);

    let source = r#"
import java.nio.file.*;
public class Main {
    public static void main(String[] a) throws Exception {
        String text = new String(Files.readAllBytes(Paths.get("numbers.txt")));
        int sum = 0;
        for (String part : text.trim().split("\\s+")) sum += Integer.parseInt(part);
        System.out.println("Sum: " + sum);
    }
}"#;
    let job = run_to_done(
        &store,
        &supervisor,
        &seed(
            source,
            vec![],
            vec![InputFile {
                name: "numbers.txt".into(),
                content: "10 20 30 40 50".into(),
            }],
        ),
    )
    .await;

    assert!(!job.crashed, "stderr: {}", String::from_utf8_lossy(&job.stderr));
    assert!(String::from_utf8_lossy(&job.stdout).contains("Sum: 150"));
}

#[tokio::test]
#[ignore = "requires a local Docker daemon and the openjdk:17-alpine image"]
async fn deadline_enforcement() {
    let dir = tempfile::tempdir().unwrap();
    let (store, supervisor) = docker_engine(&dir, 10_000);

    let source = r#"
public class Main {
    public static void main(String[] a) throws Exception {
        for (int i = 0; i < 20; i++) {
            System.out.println("tick " + i);
            Thread.sleep(1000);
        }
    }
}"#;
    let job = run_to_done(&store, &supervisor, &seed(source, vec![], vec![])).await;

    assert!(job.timed_out);
    assert!(!job.crashed);
    assert!(job.execution_ms >= 10_000);
    // Output produced before the kill was captured.
    assert!(String::from_utf8_lossy(&job.stdout).contains("tick 0"));
}

#[tokio::test]
#[ignore = "requires a local Docker daemon and the openjdk:17-alpine image"]
async fn uncaught_exception_is_a_crash() {
    let dir = tempfile::tempdir().unwrap();
    let (store, supervisor) = docker_engine(&dir, 10_000);

    let source = r#"
public class Main {
    public static void main(String[] a) {
        throw new RuntimeException("boom");
    }
}"#;
    let job = run_to_done(&store, &supervisor, &seed(source, vec![], vec![])).await;

    assert!(job.crashed);
    assert!(!job.timed_out);
    assert!(String::from_utf8_lossy(&job.stderr).contains("boom"));
}

#[tokio::test]
#[ignore = "requires a local Docker daemon and the openjdk:17-alpine image"]
async fn resource_peaks_are_observed() {
    let dir = tempfile::tempdir().unwrap();
    let (store, supervisor) = docker_engine(&dir, 10_000);

    let source = r#"
public class Main {
    public static void main(String[] a) {
        byte[][] blocks = new byte[10][];
        for (int i = 0; i < 10; i++) blocks[i] = new byte[1024 * 1024];
        long acc = 0;
        for (long i = 0; i < 2_000_000_000L; i++) acc += i ^ blocks[(int) (i % 10)].length;
        System.out.println(acc);
    }
}"#;
    let job = run_to_done(&store, &supervisor, &seed(source, vec![], vec![])).await;

    assert!(job.peak_memory_mb >= 10.0, "peak memory: {}", job.peak_memory_mb);
    assert!(job.peak_cpu_pct > 0.0, "peak cpu: {}", job.peak_cpu_pct);
}
