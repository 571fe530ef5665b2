//! Background grading worker
//!
//! A dedicated OS thread runs a current-thread runtime that owns the
//! orchestrator, and with it every connection. Callers submit jobs over a
//! channel and wait on a oneshot reply, either from async code or blocking.

use crate::orchestrator::{GradeError, GradingRequest, Orchestrator};
use mathgrade_shared::GradingResult;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("failed to start grading worker: {0}")]
    Startup(String),

    #[error("grading worker stopped")]
    Stopped,

    #[error(transparent)]
    Grade(#[from] GradeError),
}

struct Job {
    request: GradingRequest,
    reply: oneshot::Sender<Result<GradingResult, GradeError>>,
}

pub struct GradingService {
    jobs: Option<mpsc::UnboundedSender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl GradingService {
    pub fn spawn(orchestrator: Orchestrator) -> Result<Self, ServiceError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ServiceError::Startup(e.to_string()))?;
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();

        let thread = std::thread::Builder::new()
            .name("mathgrade-worker".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    info!("grading worker started");
                    while let Some(job) = rx.recv().await {
                        let result = orchestrator.grade(job.request).await;
                        if job.reply.send(result).is_err() {
                            debug!("caller went away before the result was ready");
                        }
                    }
                    orchestrator.shutdown().await;
                    info!("grading worker stopped");
                });
            })
            .map_err(|e| ServiceError::Startup(e.to_string()))?;

        Ok(Self {
            jobs: Some(jobs),
            thread: Some(thread),
        })
    }

    fn submit(
        &self,
        request: GradingRequest,
    ) -> Result<oneshot::Receiver<Result<GradingResult, GradeError>>, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .as_ref()
            .ok_or(ServiceError::Stopped)?
            .send(Job { request, reply })
            .map_err(|_| ServiceError::Stopped)?;
        Ok(rx)
    }

    pub async fn grade(&self, request: GradingRequest) -> Result<GradingResult, ServiceError> {
        let rx = self.submit(request)?;
        Ok(rx.await.map_err(|_| ServiceError::Stopped)??)
    }

    /// Blocking variant. Must not be called from inside an async runtime.
    pub fn grade_blocking(&self, request: GradingRequest) -> Result<GradingResult, ServiceError> {
        let rx = self.submit(request)?;
        Ok(rx.blocking_recv().map_err(|_| ServiceError::Stopped)??)
    }

    /// Finish queued jobs, close connections and join the worker thread
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for GradingService {
    fn drop(&mut self) {
        self.stop();
    }
}
