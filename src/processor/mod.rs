//! The command processor facade.
//!
//! Producers record secondary command buffers, then hand typed [`Task`]s to
//! [`CommandProcessor::queue_command`]. Tasks execute strictly in enqueue
//! order on a dedicated worker thread ([`ProcessingMode::Threaded`]) or
//! inline on the calling thread ([`ProcessingMode::Inline`]); renderer-visible
//! semantics are identical in both modes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace_span;

pub(crate) mod submission;
pub(crate) mod worker;

pub use submission::IN_FLIGHT_LIMIT;

use crate::backend::{GpuBackend, PresentResult, SharedFence};
use crate::error::{ErrorReport, ErrorSink};
use crate::serial::{Serial, SerialFactory};
use crate::task::Task;
use submission::SubmissionEngine;
use worker::TaskRunner;

/// Where tasks execute.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum ProcessingMode {
    /// A dedicated worker thread consumes the task queue.
    #[default]
    Threaded,
    /// Tasks run on the calling thread, at enqueue time.
    Inline,
}

pub(crate) struct TaskQueueState<B: GpuBackend> {
    tasks: VecDeque<Task<B>>,
    worker_idle: bool,
}

/// Bounded-depth FIFO of tasks plus the worker-idle flag, shared between the
/// facade and the worker. Depth stays bounded through the in-flight throttle:
/// the worker stops consuming while it waits out an excess submission.
pub(crate) struct TaskQueue<B: GpuBackend> {
    state: Mutex<TaskQueueState<B>>,
    work_available: Condvar,
    idle: Condvar,
}

impl<B: GpuBackend> TaskQueue<B> {
    fn new() -> TaskQueue<B> {
        TaskQueue {
            state: Mutex::new(TaskQueueState {
                tasks: VecDeque::new(),
                worker_idle: true,
            }),
            work_available: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskQueueState<B>> {
        self.state.lock()
    }

    /// Blocks the caller until the queue is drained and the worker reports
    /// idle.
    fn wait_idle(&self, state: &mut MutexGuard<'_, TaskQueueState<B>>) {
        self.idle
            .wait_while(state, |state| !(state.tasks.is_empty() && state.worker_idle));
    }

    /// Worker side: block until a task is available, then move-pop it.
    pub(crate) fn wait_pop(&self) -> Task<B> {
        let mut state = self.state.lock();
        if state.tasks.is_empty() {
            state.worker_idle = true;
            self.idle.notify_all();
            self.work_available
                .wait_while(&mut state, |state| state.tasks.is_empty());
        }
        state.worker_idle = false;
        state.tasks.pop_front().expect("woken with an empty task queue")
    }

    pub(crate) fn set_idle(&self) {
        let mut state = self.state.lock();
        state.worker_idle = true;
        self.idle.notify_all();
    }
}

struct SerialState {
    last_submitted: Serial,
    current: Serial,
}

/// Serializes GPU command-buffer recording, queue submission, presentation
/// and fence-based reclamation onto a single consumer.
pub struct CommandProcessor<B: GpuBackend> {
    mode: ProcessingMode,
    queue: Arc<TaskQueue<B>>,
    serials: Mutex<SerialState>,
    factory: SerialFactory,
    engine: Arc<SubmissionEngine<B>>,
    errors: Arc<ErrorSink>,
    /// Inline mode only: the runner invoked on the producer thread.
    inline: Option<Mutex<TaskRunner<B>>>,
    worker: Option<JoinHandle<()>>,
    terminated: bool,
}

impl<B: GpuBackend> CommandProcessor<B> {
    pub fn new(backend: Arc<B>, mode: ProcessingMode) -> CommandProcessor<B> {
        let factory = SerialFactory::new();
        let serials = Mutex::new(SerialState {
            last_submitted: factory.generate(),
            current: factory.generate(),
        });
        let engine = Arc::new(SubmissionEngine::new(backend.clone()));
        let errors = Arc::new(ErrorSink::new());
        let queue = Arc::new(TaskQueue::new());

        let (worker, inline) = match mode {
            ProcessingMode::Threaded => {
                let runner = TaskRunner::new(backend, engine.clone(), errors.clone());
                let worker_queue = queue.clone();
                let handle = thread::Builder::new()
                    .name("gpu-command-worker".into())
                    .spawn(move || runner.run(worker_queue))
                    .expect("failed to spawn command worker thread");
                (Some(handle), None)
            }
            ProcessingMode::Inline => {
                let runner = TaskRunner::new(backend, engine.clone(), errors.clone());
                (None, Some(Mutex::new(runner)))
            }
        };

        CommandProcessor {
            mode,
            queue,
            serials,
            factory,
            engine,
            errors,
            inline,
            worker,
            terminated: false,
        }
    }

    pub fn mode(&self) -> ProcessingMode {
        self.mode
    }

    /// Enqueues one task.
    ///
    /// Submission tasks are assigned their serial here, under the queue lock,
    /// so the task-to-serial mapping matches the order tasks enter the queue:
    /// no other producer can claim the next serial between the assignment and
    /// the push.
    pub fn queue_command(&self, mut task: Task<B>) {
        let _span = trace_span!("queue_command", kind = task.kind()).entered();
        let mut state = self.queue.lock();

        if task.is_submission() {
            let serial = {
                let mut serials = self.serials.lock();
                let serial = serials.current;
                serials.last_submitted = serial;
                serials.current = self.factory.generate();
                serial
            };
            match &mut task {
                Task::FlushAndSubmit(submit) => {
                    submit.serial = serial;
                    submit.resource_uses.release(serial);
                }
                Task::OneOffSubmit(submit) => {
                    submit.serial = serial;
                    submit.resource_uses.release(serial);
                }
                _ => unreachable!(),
            }
        }

        match self.mode {
            ProcessingMode::Threaded => {
                state.tasks.push_back(task);
                self.queue.work_available.notify_one();
            }
            ProcessingMode::Inline => {
                // The queue lock stays held: inline producers serialize on it
                // exactly like enqueues do.
                let mut runner = self.inline.as_ref().expect("inline runner").lock();
                runner.dispatch(task);
            }
        }
    }

    /// Enqueues a finish up to `serial` and, in threaded mode, blocks until
    /// the worker has executed it (including the completion sweep).
    pub fn finish_to_serial(&self, serial: Serial) {
        self.queue_command(Task::finish_to_serial(serial));
        self.wait_for_work_complete();
    }

    /// Full barrier: finish every submission made so far.
    pub fn finish_all_work(&self) {
        self.finish_to_serial(Serial::INFINITE);
    }

    /// Non-blocking sweep of completed submissions.
    pub fn check_completed_commands(&self) {
        self.queue_command(Task::check_completed());
    }

    /// Blocks until the task queue is drained and the worker is idle. A
    /// no-op in inline mode, where every task has already run at enqueue
    /// time. Pending errors stay in the sink; drain them with
    /// [`CommandProcessor::take_pending_error`].
    pub fn wait_for_work_complete(&self) {
        if self.mode == ProcessingMode::Threaded {
            let mut state = self.queue.lock();
            self.queue.wait_idle(&mut state);
        }
    }

    /// The fence of the most recent in-flight submission, if any. In
    /// threaded mode this waits for the queue to drain first, so the fence
    /// really is the one of the last *submitted* batch.
    pub fn last_submitted_fence(&self) -> Option<SharedFence<B>> {
        let mut state = self.queue.lock();
        if self.mode == ProcessingMode::Threaded {
            self.queue.wait_idle(&mut state);
        }
        self.engine.last_submitted_fence()
    }

    /// Serial of the most recently enqueued submission.
    pub fn last_submitted_serial(&self) -> Serial {
        self.serials.lock().last_submitted
    }

    /// Serial the next submission will be assigned.
    pub fn current_serial(&self) -> Serial {
        self.serials.lock().current
    }

    pub fn has_pending_error(&self) -> bool {
        self.errors.has_pending()
    }

    /// Removes and returns the oldest recorded worker error.
    pub fn take_pending_error(&self) -> Option<ErrorReport> {
        self.errors.take()
    }

    /// Blocks until a present result exists for `swapchain`, then consumes
    /// it. Independent across swapchains.
    pub fn take_present_result(&self, swapchain: B::Swapchain) -> PresentResult {
        self.engine.swapchains.take(swapchain)
    }

    /// Waits for the worker to go idle, then tears down all in-flight state.
    /// Safe to call from any producer thread after a device loss has been
    /// observed.
    pub fn handle_device_lost(&self) {
        self.wait_for_work_complete();
        self.engine.handle_device_lost();
    }

    /// Drains all outstanding work, tears down recording state, and joins
    /// the worker. Idempotent; also invoked from `Drop`.
    pub fn shutdown(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.queue_command(Task::exit());
        if let Some(worker) = self.worker.take() {
            self.wait_for_work_complete();
            let _ = worker.join();
        }
    }
}

impl<B: GpuBackend> Drop for CommandProcessor<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
