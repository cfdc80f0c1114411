use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender, bounded};
use tracing::{debug, error, info};

use crate::engine::cache::ranges::{CacheChunk, FileId};
use crate::engine::errors::StreamError;

use super::chunk::StreamChunk;
use super::compressed_reader::CompressedReader;

/// One unit of decode work: a stream region plus the chunks covering it.
pub struct ReadTask {
    pub file: FileId,
    pub chunks: Vec<StreamChunk>,
    pub start: u64,
    pub end: u64,
    pub base_offset: u64,
}

pub type TaskResult = Result<Vec<CacheChunk>, StreamError>;

enum PipelineMessage {
    Task(ReadTask, Sender<TaskResult>),
    Shutdown,
}

/// Bounded producer/consumer decode stage: readers submit tasks, a worker
/// thread materializes them in submission order, and the queue capacity
/// provides backpressure.
pub struct DecodePipeline {
    sender: Sender<PipelineMessage>,
    worker: Option<JoinHandle<()>>,
}

impl DecodePipeline {
    pub fn spawn(reader: Arc<CompressedReader>, depth: usize) -> Self {
        let (tx, rx) = bounded::<PipelineMessage>(depth.max(1));
        info!(target: "striadb::pipeline", depth, "Starting decode pipeline");

        let worker = std::thread::spawn(move || {
            while let Ok(message) = rx.recv() {
                match message {
                    PipelineMessage::Task(task, respond) => {
                        debug!(
                            target: "striadb::pipeline",
                            file = task.file,
                            start = task.start,
                            end = task.end,
                            "Decoding stream region"
                        );
                        let result = reader.read_compressed(
                            task.file,
                            &task.chunks,
                            task.start,
                            task.end,
                            task.base_offset,
                        );
                        if respond.send(result).is_err() {
                            error!(
                                target: "striadb::pipeline",
                                "Submitter dropped its result receiver"
                            );
                        }
                    }
                    PipelineMessage::Shutdown => break,
                }
            }
            info!(target: "striadb::pipeline", "Decode pipeline exited");
        });

        Self {
            sender: tx,
            worker: Some(worker),
        }
    }

    /// Queues a task, blocking when the pipeline is at capacity. The returned
    /// receiver yields the task's result; receivers resolve in submission
    /// order.
    pub fn submit(&self, task: ReadTask) -> Receiver<TaskResult> {
        let (tx, rx) = bounded(1);
        if self.sender.send(PipelineMessage::Task(task, tx)).is_err() {
            error!(target: "striadb::pipeline", "Submit after pipeline shutdown");
        }
        rx
    }
}

impl Drop for DecodePipeline {
    fn drop(&mut self) {
        let _ = self.sender.send(PipelineMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
