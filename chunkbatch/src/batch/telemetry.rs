//! Telemetry for batch execution observability.
//!
//! The engine emits structured [`BatchEvent`]s through a [`TelemetrySink`]
//! and never decides how they are presented. Consumers (logs, metrics, a
//! progress display) implement the sink.
//!
//! # Example
//!
//! ```ignore
//! use chunkbatch::batch::telemetry::{BatchEvent, TelemetrySink};
//!
//! struct CountingSink(std::sync::atomic::AtomicUsize);
//!
//! impl TelemetrySink for CountingSink {
//!     fn emit(&self, _event: BatchEvent) {
//!         self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use super::status::BatchStatus;

// =============================================================================
// Batch Events
// =============================================================================

/// Events emitted while jobs, steps and chunks run.
#[derive(Clone, Debug)]
pub enum BatchEvent {
    // -------------------------------------------------------------------------
    // Job Lifecycle Events
    // -------------------------------------------------------------------------
    /// A job execution started.
    JobStarted {
        job: String,
        execution_id: u64,
        parameters: String,
    },

    /// A job execution reached a terminal status.
    JobCompleted {
        job: String,
        execution_id: u64,
        status: BatchStatus,
        exit_code: String,
        duration: Duration,
    },

    /// A stop was requested for a running job execution.
    JobStopRequested { job: String, execution_id: u64 },

    // -------------------------------------------------------------------------
    // Step Lifecycle Events
    // -------------------------------------------------------------------------
    /// A step execution started.
    StepStarted {
        step: String,
        step_execution_id: u64,
        job_execution_id: u64,
    },

    /// A step was not run because it already completed in an earlier execution.
    StepSkipped { step: String, job_execution_id: u64 },

    /// A step execution finished.
    StepCompleted {
        step: String,
        step_execution_id: u64,
        status: BatchStatus,
        exit_code: String,
        read: u64,
        written: u64,
        filtered: u64,
        skipped: u64,
        commits: u64,
        rollbacks: u64,
        duration: Duration,
    },

    // -------------------------------------------------------------------------
    // Chunk Events
    // -------------------------------------------------------------------------
    /// A chunk transaction committed.
    ChunkCommitted {
        step: String,
        chunk: u64,
        worker: usize,
        read: u64,
        written: u64,
        filtered: u64,
        skipped: u64,
    },

    /// A chunk transaction rolled back for good.
    ChunkRolledBack {
        step: String,
        chunk: u64,
        worker: usize,
        error: String,
    },

    // -------------------------------------------------------------------------
    // Flow and Partition Events
    // -------------------------------------------------------------------------
    /// The flow engine chose the next node.
    FlowTransition {
        flow: String,
        from: String,
        exit_code: String,
        to: String,
    },

    /// A partitioned step handed out its partitions.
    PartitionsCreated {
        step: String,
        partitions: usize,
        throttle_limit: usize,
    },

    /// Every worker of a partitioned step finished.
    PartitionsCompleted {
        step: String,
        status: BatchStatus,
        failed_workers: usize,
    },
}

impl BatchEvent {
    /// Returns the step this event concerns, if any.
    pub fn step_name(&self) -> Option<&str> {
        match self {
            Self::StepStarted { step, .. }
            | Self::StepSkipped { step, .. }
            | Self::StepCompleted { step, .. }
            | Self::ChunkCommitted { step, .. }
            | Self::ChunkRolledBack { step, .. }
            | Self::PartitionsCreated { step, .. }
            | Self::PartitionsCompleted { step, .. } => Some(step),
            Self::JobStarted { .. }
            | Self::JobCompleted { .. }
            | Self::JobStopRequested { .. }
            | Self::FlowTransition { .. } => None,
        }
    }

    /// Returns a short name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::JobStarted { .. } => "job_started",
            Self::JobCompleted { .. } => "job_completed",
            Self::JobStopRequested { .. } => "job_stop_requested",
            Self::StepStarted { .. } => "step_started",
            Self::StepSkipped { .. } => "step_skipped",
            Self::StepCompleted { .. } => "step_completed",
            Self::ChunkCommitted { .. } => "chunk_committed",
            Self::ChunkRolledBack { .. } => "chunk_rolled_back",
            Self::FlowTransition { .. } => "flow_transition",
            Self::PartitionsCreated { .. } => "partitions_created",
            Self::PartitionsCompleted { .. } => "partitions_completed",
        }
    }
}

// =============================================================================
// Telemetry Sink Trait
// =============================================================================

/// Sink for batch events.
///
/// Events may be emitted from several workers at once, so implementations
/// must be thread-safe. `emit` should be fast and must not block.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: BatchEvent);
}

// =============================================================================
// Built-in Sink Implementations
// =============================================================================

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTelemetrySink;

impl TelemetrySink for NullTelemetrySink {
    fn emit(&self, _event: BatchEvent) {}
}

/// Sink that logs events using the `tracing` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn emit(&self, event: BatchEvent) {
        match &event {
            BatchEvent::JobStarted {
                job,
                execution_id,
                parameters,
            } => {
                tracing::info!(
                    job = %job,
                    execution_id = execution_id,
                    parameters = %parameters,
                    "Job started"
                );
            }
            BatchEvent::JobCompleted {
                job,
                execution_id,
                status,
                exit_code,
                duration,
            } => {
                tracing::info!(
                    job = %job,
                    execution_id = execution_id,
                    status = %status,
                    exit_code = %exit_code,
                    duration_ms = duration.as_millis() as u64,
                    "Job completed"
                );
            }
            BatchEvent::JobStopRequested { job, execution_id } => {
                tracing::info!(job = %job, execution_id = execution_id, "Job stop requested");
            }
            BatchEvent::StepStarted {
                step,
                step_execution_id,
                job_execution_id,
            } => {
                tracing::info!(
                    step = %step,
                    step_execution_id = step_execution_id,
                    job_execution_id = job_execution_id,
                    "Step started"
                );
            }
            BatchEvent::StepSkipped {
                step,
                job_execution_id,
            } => {
                tracing::info!(
                    step = %step,
                    job_execution_id = job_execution_id,
                    "Step already complete, not re-run"
                );
            }
            BatchEvent::StepCompleted {
                step,
                step_execution_id,
                status,
                exit_code,
                read,
                written,
                filtered,
                skipped,
                commits,
                rollbacks,
                duration,
            } => {
                tracing::info!(
                    step = %step,
                    step_execution_id = step_execution_id,
                    status = %status,
                    exit_code = %exit_code,
                    read = read,
                    written = written,
                    filtered = filtered,
                    skipped = skipped,
                    commits = commits,
                    rollbacks = rollbacks,
                    duration_ms = duration.as_millis() as u64,
                    "Step completed"
                );
            }
            BatchEvent::ChunkCommitted {
                step,
                chunk,
                worker,
                read,
                written,
                filtered,
                skipped,
            } => {
                tracing::debug!(
                    step = %step,
                    chunk = chunk,
                    worker = worker,
                    read = read,
                    written = written,
                    filtered = filtered,
                    skipped = skipped,
                    "Chunk committed"
                );
            }
            BatchEvent::ChunkRolledBack {
                step,
                chunk,
                worker,
                error,
            } => {
                tracing::warn!(
                    step = %step,
                    chunk = chunk,
                    worker = worker,
                    error = %error,
                    "Chunk rolled back"
                );
            }
            BatchEvent::FlowTransition {
                flow,
                from,
                exit_code,
                to,
            } => {
                tracing::debug!(
                    flow = %flow,
                    from = %from,
                    exit_code = %exit_code,
                    to = %to,
                    "Flow transition"
                );
            }
            BatchEvent::PartitionsCreated {
                step,
                partitions,
                throttle_limit,
            } => {
                tracing::info!(
                    step = %step,
                    partitions = partitions,
                    throttle_limit = throttle_limit,
                    "Partitions created"
                );
            }
            BatchEvent::PartitionsCompleted {
                step,
                status,
                failed_workers,
            } => {
                tracing::info!(
                    step = %step,
                    status = %status,
                    failed_workers = failed_workers,
                    "Partitions completed"
                );
            }
        }
    }
}

/// Sink that forwards events to multiple sinks.
pub struct MultiTelemetrySink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl MultiTelemetrySink {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn TelemetrySink>) {
        self.sinks.push(sink);
    }
}

impl TelemetrySink for MultiTelemetrySink {
    fn emit(&self, event: BatchEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

impl std::fmt::Debug for MultiTelemetrySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiTelemetrySink")
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

/// Records every event in memory. Handy in tests and for post-run summaries.
#[derive(Debug, Default)]
pub struct RecordingTelemetrySink {
    events: parking_lot::Mutex<Vec<BatchEvent>>,
}

impl RecordingTelemetrySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BatchEvent> {
        self.events.lock().clone()
    }

    /// Event type names in emission order.
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(BatchEvent::event_type).collect()
    }
}

impl TelemetrySink for RecordingTelemetrySink {
    fn emit(&self, event: BatchEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chunk_committed() -> BatchEvent {
        BatchEvent::ChunkCommitted {
            step: "load".to_string(),
            chunk: 1,
            worker: 0,
            read: 3,
            written: 3,
            filtered: 0,
            skipped: 0,
        }
    }

    #[test]
    fn test_null_sink() {
        NullTelemetrySink.emit(chunk_committed());
    }

    #[test]
    fn test_tracing_sink() {
        TracingTelemetrySink.emit(chunk_committed());
    }

    #[test]
    fn test_event_step_name() {
        assert_eq!(chunk_committed().step_name(), Some("load"));

        let event = BatchEvent::JobStopRequested {
            job: "job".to_string(),
            execution_id: 1,
        };
        assert_eq!(event.step_name(), None);
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(chunk_committed().event_type(), "chunk_committed");
        assert_eq!(
            BatchEvent::StepSkipped {
                step: "s".to_string(),
                job_execution_id: 1
            }
            .event_type(),
            "step_skipped"
        );
    }

    #[test]
    fn test_multi_sink() {
        struct CountingSink(AtomicUsize);

        impl TelemetrySink for CountingSink {
            fn emit(&self, _event: BatchEvent) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let sink1 = Arc::new(CountingSink(AtomicUsize::new(0)));
        let sink2 = Arc::new(CountingSink(AtomicUsize::new(0)));

        let multi = MultiTelemetrySink::new(vec![
            Arc::clone(&sink1) as Arc<dyn TelemetrySink>,
            Arc::clone(&sink2) as Arc<dyn TelemetrySink>,
        ]);
        multi.emit(chunk_committed());

        assert_eq!(sink1.0.load(Ordering::Relaxed), 1);
        assert_eq!(sink2.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingTelemetrySink::new();
        sink.emit(chunk_committed());
        sink.emit(BatchEvent::JobStopRequested {
            job: "job".to_string(),
            execution_id: 7,
        });
        assert_eq!(sink.event_types(), vec!["chunk_committed", "job_stop_requested"]);
    }
}
