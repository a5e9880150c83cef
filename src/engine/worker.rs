// Job tracking for export workers and inbound connections

use chrono::{DateTime, Local};
use crossbeam::channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::core::{ExportJob, FormatTag, JobFailure, JobReport, JobStatus};

/// Message from a worker to whoever is watching jobs
#[derive(Debug, Clone, PartialEq)]
pub enum JobMessage {
    /// Job accepted and waiting to run
    JobStarted {
        job_id: Uuid,
        channel: String,
        format: FormatTag,
    },

    /// Job moved to a new non-terminal status
    StatusChanged { job_id: Uuid, status: JobStatus },

    /// Job completed successfully
    JobCompleted { job_id: Uuid, bytes_sent: u64 },

    /// Job failed or was cancelled
    JobFailed { job_id: Uuid, reason: JobFailure },
}

/// Cooperative cancellation flag shared with a running job
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancelled, for use with `?` between phases
    pub fn check(&self) -> Result<(), JobFailure> {
        if self.is_cancelled() {
            Err(JobFailure::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Caller's side of a submitted job
#[derive(Debug)]
pub struct JobHandle {
    pub id: Uuid,
    channel: String,
    format: FormatTag,
    submitted_at: DateTime<Local>,
    rx: Receiver<JobReport>,
}

impl JobHandle {
    /// Block until the job reaches a terminal status
    pub fn wait(self) -> JobReport {
        match self.rx.recv() {
            Ok(report) => report,
            Err(_) => self.lost(),
        }
    }

    /// Block for at most `timeout`; `None` if the job is still running
    pub fn wait_timeout(&self, timeout: Duration) -> Option<JobReport> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Terminal report if the job has already finished
    pub fn try_report(&self) -> Option<JobReport> {
        self.rx.try_recv().ok()
    }

    /// Report for a job whose worker vanished without reporting
    fn lost(&self) -> JobReport {
        JobReport {
            id: self.id,
            channel: self.channel.clone(),
            format: self.format,
            status: JobStatus::Failed(JobFailure::Cancelled),
            bytes_sent: 0,
            submitted_at: self.submitted_at,
            finished_at: Local::now(),
        }
    }
}

struct Tracked {
    job: ExportJob,
    cancel: CancelToken,
    stream: Option<TcpStream>,
    done: Sender<JobReport>,
}

#[derive(Default)]
struct TrackerState {
    jobs: HashMap<Uuid, Tracked>,
    connections: HashMap<u64, TcpStream>,
    next_connection: u64,
}

impl TrackerState {
    fn is_idle(&self) -> bool {
        self.jobs.is_empty() && self.connections.is_empty()
    }
}

/// Keeps track of running export jobs and open connections so the service
/// can drain them on stop and force-cancel whatever is left.
pub struct JobTracker {
    state: Mutex<TrackerState>,
    idle: Condvar,
    subscribers: Mutex<Vec<Sender<JobMessage>>>,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            idle: Condvar::new(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Receive every job event from now on
    pub fn subscribe(&self) -> Receiver<JobMessage> {
        let (tx, rx) = crossbeam::channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    fn publish(&self, message: JobMessage) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(message.clone()).is_ok());
    }

    /// Register a job. The payload must already be taken out of it.
    pub fn begin(&self, job: ExportJob) -> (CancelToken, JobHandle) {
        let (done, rx) = crossbeam::channel::bounded(1);
        let cancel = CancelToken::default();
        let handle = JobHandle {
            id: job.id,
            channel: job.target.id.clone(),
            format: job.format,
            submitted_at: job.submitted_at,
            rx,
        };
        let started = JobMessage::JobStarted {
            job_id: job.id,
            channel: job.target.id.clone(),
            format: job.format,
        };

        self.state.lock().jobs.insert(
            job.id,
            Tracked {
                job,
                cancel: cancel.clone(),
                stream: None,
                done,
            },
        );
        self.publish(started);
        (cancel, handle)
    }

    pub fn set_status(&self, job_id: Uuid, status: JobStatus) {
        {
            let mut state = self.state.lock();
            let Some(tracked) = state.jobs.get_mut(&job_id) else {
                return;
            };
            tracked.job.status = status.clone();
        }
        self.publish(JobMessage::StatusChanged { job_id, status });
    }

    /// Remember the job's outbound socket so a forced cancel can shut it
    pub fn attach_stream(&self, job_id: Uuid, stream: &TcpStream) {
        let mut state = self.state.lock();
        let Some(tracked) = state.jobs.get_mut(&job_id) else {
            let _ = stream.shutdown(Shutdown::Both);
            return;
        };
        match stream.try_clone() {
            Ok(clone) => tracked.stream = Some(clone),
            Err(e) => tracing::debug!("Cannot track socket of job {}: {}", job_id, e),
        }
    }

    /// Record the outcome of a job and hand its report to the caller.
    ///
    /// A job cancelled while running always ends as `Failed(Cancelled)`.
    pub fn finish(&self, job_id: Uuid, outcome: Result<u64, JobFailure>) {
        let Some(mut tracked) = self.state.lock().jobs.remove(&job_id) else {
            tracing::debug!("Job {} finished after it was cancelled", job_id);
            return;
        };

        let outcome = if tracked.cancel.is_cancelled() {
            Err(JobFailure::Cancelled)
        } else {
            outcome
        };

        let (status, bytes_sent, message) = match outcome {
            Ok(bytes_sent) => (
                JobStatus::Done,
                bytes_sent,
                JobMessage::JobCompleted { job_id, bytes_sent },
            ),
            Err(reason) => (
                JobStatus::Failed(reason.clone()),
                0,
                JobMessage::JobFailed { job_id, reason },
            ),
        };
        tracked.job.status = status;
        let _ = tracked.done.send(tracked.job.report(bytes_sent));

        self.idle.notify_all();
        self.publish(message);
    }

    /// Track an inbound connection until the returned guard is dropped
    pub fn open_connection(self: &Arc<Self>, stream: &TcpStream) -> ConnectionGuard {
        let mut state = self.state.lock();
        let id = state.next_connection;
        state.next_connection += 1;
        if let Ok(clone) = stream.try_clone() {
            state.connections.insert(id, clone);
        }
        ConnectionGuard {
            tracker: self.clone(),
            id,
        }
    }

    fn close_connection(&self, id: u64) {
        let mut state = self.state.lock();
        if state.connections.remove(&id).is_some() && state.is_idle() {
            self.idle.notify_all();
        }
    }

    pub fn active_jobs(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn active_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Wait until no job or connection is left; `false` if `deadline` passed first
    pub fn wait_idle(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        while !state.is_idle() {
            if self.idle.wait_until(&mut state, deadline).timed_out() {
                return state.is_idle();
            }
        }
        true
    }

    /// Cancel everything still running.
    ///
    /// Each job is reported `Failed(Cancelled)` right away and its socket is
    /// shut down; workers notice the token and exit on their own.
    pub fn cancel_all(&self) -> usize {
        let (jobs, connections) = {
            let mut state = self.state.lock();
            let jobs: Vec<Tracked> = state.jobs.drain().map(|(_, t)| t).collect();
            let connections: Vec<TcpStream> = state.connections.drain().map(|(_, s)| s).collect();
            (jobs, connections)
        };

        for stream in &connections {
            let _ = stream.shutdown(Shutdown::Both);
        }

        let cancelled = jobs.len();
        for mut tracked in jobs {
            tracked.cancel.cancel();
            if let Some(stream) = &tracked.stream {
                let _ = stream.shutdown(Shutdown::Both);
            }
            tracked.job.status = JobStatus::Failed(JobFailure::Cancelled);
            let _ = tracked.done.send(tracked.job.report(0));
            self.publish(JobMessage::JobFailed {
                job_id: tracked.job.id,
                reason: JobFailure::Cancelled,
            });
        }

        self.idle.notify_all();
        cancelled
    }
}

/// Removes its connection from the tracker when dropped
pub struct ConnectionGuard {
    tracker: Arc<JobTracker>,
    id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.close_connection(self.id);
    }
}
