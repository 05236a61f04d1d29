// src/supervisor.rs
//
// =============================================================================
// CRUCIBLE: EXECUTION SUPERVISOR
// =============================================================================
//
// One run per job. Drives the sandbox through its lifecycle:
//
//   hydrate -> mark running -> stage inputs -> create -> upload
//     -> attach -> sample -> start -> race(wait, deadline) -> drain
//     -> classify -> finalize -> remove
//
// Every failure branch funnels into one finalize-on-error path, and the
// sandbox (if one was created) is removed no matter which branch ran.
// Store failures are the exception: they abort the run and leave the
// record for the startup sweeper to reconcile.

use crate::config::{Config, MAIN_SOURCE, WORK_DIR};
use crate::core::{Job, JobOutcome, JobStatus};
use crate::demux::drain_attach;
use crate::monitor::{sample_stats, PeakTracker};
use crate::sandbox::{SandboxRuntime, SandboxSpec, LABEL_JOB_ID, LABEL_PROJECT};
use crate::store::{JobStore, StoreError};

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

/// How long to keep waiting for an exit code after the deadline kill.
const POST_KILL_GRACE: Duration = Duration::from_secs(10);

/// How long the output drain may lag behind sandbox exit.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

const FINALIZE_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

// ============================================================================
// 1. THE SUPERVISOR
// ============================================================================

#[derive(Clone)]
pub struct Supervisor {
    store: Arc<JobStore>,
    runtime: Arc<dyn SandboxRuntime>,
    config: Arc<Config>,
}

impl Supervisor {
    pub fn new(store: Arc<JobStore>, runtime: Arc<dyn SandboxRuntime>, config: Arc<Config>) -> Self {
        Self {
            store,
            runtime,
            config,
        }
    }

    /// Persist a seed and launch its run, detached. The job always runs to
    /// completion or timeout; nothing upstream can cancel it.
    pub fn submit(&self, seed: &crate::core::JobSeed) -> Result<Uuid, StoreError> {
        let id = self.store.create(seed)?;
        self.spawn(id);
        Ok(id)
    }

    pub fn spawn(&self, id: Uuid) {
        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.run(id).await });
    }

    /// The full lifecycle for one job. Never panics the task; every exit
    /// leaves the record out of `running` (or flagged for the sweeper) and
    /// the sandbox removed.
    pub async fn run(&self, id: Uuid) {
        // Hydrate. A record that already progressed is somebody else's run.
        let job = match self.store.get(id, None) {
            Ok(job) => job,
            Err(e) => {
                log::error!("job {id}: cannot hydrate: {e}");
                return;
            }
        };
        if job.status != JobStatus::NotStarted {
            log::warn!(
                "job {id}: refusing to run, status is already {}",
                job.status.as_str()
            );
            return;
        }

        let mut sandbox_id: Option<String> = None;
        match self.execute(&job, &mut sandbox_id).await {
            Ok(()) => {}
            Err(RunError::Store(e)) => {
                // The one failure the engine cannot paper over. The record
                // stays as-is; the sweeper reconciles after restart.
                log::error!("job {id}: store failure aborted the run: {e}");
            }
            Err(RunError::Runtime(e)) => {
                log::error!("job {id}: sandbox failure: {e:#}");
                self.finalize_with_retry(id, &JobOutcome::crashed(format!("{e:#}")))
                    .await;
            }
        }

        // Removal is unconditional once a sandbox exists; failure is logged
        // and left to the sweeper, never surfaced into the record.
        if let Some(sid) = sandbox_id {
            if let Err(e) = self.runtime.remove(&sid, true).await {
                log::warn!("job {id}: failed to remove sandbox {sid}: {e:#}");
            }
        }
    }

    async fn execute(&self, job: &Job, sandbox_id: &mut Option<String>) -> Result<(), RunError> {
        let id = job.id;
        let cfg = &self.config;

        self.store.mark_running(id)?;

        let archive = build_archive(job)?;

        let spec = SandboxSpec {
            image: cfg.sandbox_image.clone(),
            command: cfg.build_command(&job.args),
            working_dir: WORK_DIR.into(),
            memory_bytes: cfg.memory_limit_bytes,
            cpu_weight: cfg.cpu_weight,
            labels: HashMap::from([
                (LABEL_PROJECT.into(), cfg.project_label.clone()),
                (LABEL_JOB_ID.into(), id.to_string()),
            ]),
        };
        let sid = self.runtime.create(&spec).await?;
        *sandbox_id = Some(sid.clone());
        self.store.attach_sandbox(id, &sid)?;

        self.runtime.upload(&sid, archive, WORK_DIR).await?;

        // Observers first, then start: attach before start so the first
        // output bytes are captured, sampler before start so no stats
        // frame is missed.
        let attach = self.runtime.attach(&sid).await?;
        let drain = tokio::spawn(drain_attach(attach, cfg.output_cap_bytes));

        let tracker = Arc::new(Mutex::new(PeakTracker::new()));
        let stats = self.runtime.stats(&sid).await?;
        let sampler = tokio::spawn(sample_stats(stats, tracker.clone()));

        // The deadline clock is armed before start, so the counted window
        // begins at sandbox start, not at timer scheduling.
        let started = Instant::now();
        let deadline = started + Duration::from_millis(cfg.deadline_ms);

        let waited: Result<(i64, bool), RunError> = async {
            self.runtime.start(&sid).await?;

            let wait = self.runtime.wait(&sid);
            tokio::pin!(wait);

            let (exit_code, timed_out) = tokio::select! {
                exit = &mut wait => (exit?, false),
                _ = tokio::time::sleep_until(deadline) => {
                    log::info!(
                        "job {id}: deadline of {} ms elapsed, killing sandbox {sid}",
                        cfg.deadline_ms
                    );
                    if let Err(e) = self.runtime.kill(&sid).await {
                        log::warn!("job {id}: kill failed (sandbox may be gone): {e:#}");
                    }
                    // Do not abandon the wait: the exit code still arrives.
                    let exit = tokio::time::timeout(POST_KILL_GRACE, &mut wait)
                        .await
                        .map_err(|_| anyhow::anyhow!("sandbox did not exit after kill"))??;
                    (exit, true)
                }
            };
            Ok((exit_code, timed_out))
        }
        .await;
        let execution_ms = started.elapsed().as_millis() as u64;

        // Tear down observers before touching their buffers. Aborting the
        // sampler closes the stats stream; joining it is the barrier that
        // makes the tracker safe to read.
        sampler.abort();
        let _ = sampler.await;

        let (exit_code, timed_out) = match waited {
            Ok(outcome) => outcome,
            Err(e) => {
                drain.abort();
                let _ = drain.await;
                return Err(e);
            }
        };

        // The sandbox exited, so the attach stream is closing; give the
        // drain a moment to finish decoding.
        let (stdout, stderr) = match tokio::time::timeout(DRAIN_GRACE, drain).await {
            Ok(Ok(buffers)) => buffers,
            Ok(Err(e)) => {
                log::warn!("job {id}: output drain task failed: {e}");
                (Vec::new(), Vec::new())
            }
            Err(_) => {
                log::warn!("job {id}: output drain did not finish, dropping buffers");
                (Vec::new(), Vec::new())
            }
        };

        let tracker = tracker.lock().await;
        let outcome = JobOutcome {
            stdout,
            stderr,
            // Timeout dominates: a killed program's exit code says nothing.
            crashed: !timed_out && exit_code != 0,
            timed_out,
            peak_memory_mb: tracker.peak_memory_mb(),
            peak_cpu_pct: tracker.peak_cpu_pct(),
            execution_ms,
        };
        drop(tracker);

        self.finalize_with_retry(id, &outcome).await;
        Ok(())
    }

    /// Terminal write with bounded linear backoff. `InvalidTransition`
    /// means someone already finalized this id; the first write stands.
    async fn finalize_with_retry(&self, id: Uuid, outcome: &JobOutcome) {
        for attempt in 1..=FINALIZE_ATTEMPTS {
            match self.store.finalize(id, outcome) {
                Ok(()) => return,
                Err(StoreError::InvalidTransition { status, .. }) => {
                    log::warn!("job {id}: already finalized (status {status}), keeping the first write");
                    return;
                }
                Err(e) if attempt < FINALIZE_ATTEMPTS => {
                    log::warn!("job {id}: finalize attempt {attempt} failed: {e}, retrying");
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                Err(e) => {
                    log::error!(
                        "job {id}: finalize failed after {FINALIZE_ATTEMPTS} attempts: {e}; \
                         record stays running until the sweeper reconciles"
                    );
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Startup sweeper
    // -------------------------------------------------------------------------

    /// Remove every sandbox carrying the project label and close out jobs a
    /// previous process left in `running`. Runs before the service accepts
    /// submissions.
    pub async fn sweep(&self) -> Result<()> {
        let stale = self
            .runtime
            .list_labeled(LABEL_PROJECT, &self.config.project_label)
            .await
            .context("sweeper could not list sandboxes")?;

        for sid in &stale {
            match self.runtime.remove(sid, true).await {
                Ok(()) => log::info!("sweeper removed stale sandbox {sid}"),
                Err(e) => log::warn!("sweeper could not remove sandbox {sid}: {e:#}"),
            }
        }

        for id in self.store.running_jobs()? {
            log::warn!("sweeper closing job {id} left running by a previous process");
            self.finalize_with_retry(
                id,
                &JobOutcome::crashed("service restarted while the job was running"),
            )
            .await;
        }

        if !stale.is_empty() {
            log::info!("sweeper removed {} stale sandbox(es)", stale.len());
        }
        Ok(())
    }
}

// ============================================================================
// 2. INPUT STAGING
// ============================================================================

/// In-memory tar archive: the source under its fixed name, then each input
/// file under its submitted name. Names were validated at the boundary.
fn build_archive(job: &Job) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    append_entry(&mut builder, MAIN_SOURCE, job.source.as_bytes())?;
    for file in &job.input_files {
        append_entry(&mut builder, &file.name, file.content.as_bytes())?;
    }
    builder.into_inner().context("failed to finish input archive")
}

fn append_entry(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, name, data)
        .with_context(|| format!("failed to add {name} to the input archive"))
}

// ============================================================================
// TESTS
// ============================================================================
