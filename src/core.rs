// src/core.rs
//
// =============================================================================
// CRUCIBLE: CORE SCHEMA AUTHORITY
// =============================================================================
//
// Data contracts shared by the store, the engine and the HTTP surface.
//
// Design principles:
// 1. One Job record, column-per-field (mirrors the jobs table).
// 2. Status is monotonic: not_started -> running -> done. Never undone.
// 3. Terminal fields (buffers, flags, peaks) are written exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// 1. JOB LIFECYCLE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    NotStarted,
    Running,
    Done,
}

impl JobStatus {
    /// Column representation. Must stay in sync with `parse`.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::NotStarted => "not_started",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(JobStatus::NotStarted),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            _ => None,
        }
    }
}

// ============================================================================
// 2. SUBMISSION INPUTS
// ============================================================================

/// A companion file staged next to the main source inside the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputFile {
    pub name: String,
    pub content: String,
}

/// Everything a client provides at submission, plus the owner tag the
/// authentication layer resolved for it.
#[derive(Debug, Clone)]
pub struct JobSeed {
    pub owner: String,
    pub source: String,
    pub args: Vec<String>,
    pub input_files: Vec<InputFile>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("source must not be empty")]
    EmptySource,

    #[error("invalid input file name: {0:?}")]
    BadFileName(String),
}

impl JobSeed {
    /// Boundary validation. Rejected seeds never reach the engine.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.source.is_empty() {
            return Err(ValidationError::EmptySource);
        }
        for file in &self.input_files {
            if !is_safe_file_name(&file.name) {
                return Err(ValidationError::BadFileName(file.name.clone()));
            }
        }
        Ok(())
    }
}

/// A file name is safe when it stays inside the sandbox working directory:
/// no separators, no parent traversal, not empty.
pub fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

// ============================================================================
// 3. TERMINAL OUTCOME
// ============================================================================

/// The atomic payload of `finalize`. Buffers arrive already capped by the
/// demultiplexer; `completed_at` is stamped by the store at the transition.
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub crashed: bool,
    pub timed_out: bool,
    pub peak_memory_mb: f64,
    pub peak_cpu_pct: f64,
    pub execution_ms: u64,
}

impl JobOutcome {
    /// Engine-level failure: the program never produced a verdict of its
    /// own, so the error text becomes stderr.
    pub fn crashed(error_text: impl Into<String>) -> Self {
        Self {
            stderr: error_text.into().into_bytes(),
            crashed: true,
            ..Self::default()
        }
    }
}

// ============================================================================
// 4. THE JOB RECORD
// ============================================================================

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub owner: String,
    pub status: JobStatus,

    // Inputs (immutable after creation)
    pub source: String,
    pub args: Vec<String>,
    pub input_files: Vec<InputFile>,

    // Runtime handle (set once the sandbox exists)
    pub sandbox_id: Option<String>,

    // Terminal fields (set once, at finalize)
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub crashed: bool,
    pub timed_out: bool,
    pub peak_memory_mb: f64,
    pub peak_cpu_pct: f64,
    pub execution_ms: u64,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ============================================================================
// 5. VIEW MODELS
// ============================================================================

/// Listing row. Terminal flags are present only once the job is done.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crashed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<bool>,
}

/// Aggregates for the admin CLI.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub total_jobs: u64,
    pub not_started: u64,
    pub running: u64,
    pub done: u64,
    pub crashed: u64,
    pub timed_out: u64,
    pub api_keys: u64,
}

// ============================================================================
// TESTS
// ============================================================================
