//! Task execution.
//!
//! A [`TaskRunner`] owns the recording state (the primary being recorded and
//! the command pool that will be handed to the next batch) and dispatches one
//! task at a time. In threaded mode it is moved onto the worker thread and
//! loops in [`TaskRunner::run`]; in inline mode the facade calls
//! [`TaskRunner::dispatch`] on the producer thread.

use std::sync::Arc;

use tracing::{trace_span, warn};

use crate::backend::{CommandPoolKind, GpuBackend, PresentResult};
use crate::error::{DeviceError, ErrorReport, ErrorSink};
use crate::processor::submission::SubmissionEngine;
use crate::processor::TaskQueue;
use crate::serial::Serial;
use crate::task::Task;

fn into_report(operation: &'static str) -> impl FnOnce(DeviceError) -> ErrorReport {
    move |error| ErrorReport::new(error, operation)
}

/// The primary currently being recorded, plus the command pool the next batch
/// will take ownership of.
struct Recording<B: GpuBackend> {
    primary: B::Primary,
    pool: B::Pool,
}

pub(crate) struct TaskRunner<B: GpuBackend> {
    backend: Arc<B>,
    engine: Arc<SubmissionEngine<B>>,
    errors: Arc<ErrorSink>,
    recording: Option<Recording<B>>,
}

impl<B: GpuBackend> TaskRunner<B> {
    pub(crate) fn new(
        backend: Arc<B>,
        engine: Arc<SubmissionEngine<B>>,
        errors: Arc<ErrorSink>,
    ) -> TaskRunner<B> {
        TaskRunner {
            backend,
            engine,
            errors,
            recording: None,
        }
    }

    /// Worker-thread entry point: consume tasks in enqueue order until the
    /// terminal task arrives. The queue lock is never held across dispatch.
    pub(crate) fn run(mut self, queue: Arc<TaskQueue<B>>) {
        loop {
            let task = queue.wait_pop();
            let exit = matches!(task, Task::Exit);
            self.dispatch(task);
            if exit {
                queue.set_idle();
                return;
            }
        }
    }

    /// Executes one task. Errors are recorded, never propagated: the worker
    /// keeps draining so shutdown stays reachable. Device loss (including a
    /// fence-wait timeout) additionally tears down in-flight state.
    pub(crate) fn dispatch(&mut self, task: Task<B>) {
        let _span = trace_span!("task", kind = task.kind()).entered();
        if let Err(report) = self.process(task) {
            if report.is_device_loss() {
                warn!(error = %report, "device lost while processing task");
                self.engine.handle_device_lost();
            }
            self.errors.push(report);
        }
    }

    fn process(&mut self, task: Task<B>) -> Result<(), ErrorReport> {
        match task {
            Task::ProcessCommands {
                mut commands,
                render_pass,
            } => {
                debug_assert!(
                    !self.backend.secondary_is_empty(&commands),
                    "flushing an empty secondary command buffer"
                );
                if let Err(report) = self.ensure_recording() {
                    // The secondary still belongs to its pool; hand it back
                    // before bailing.
                    self.backend.recycle_secondary(commands);
                    return Err(report);
                }
                let recording = self.recording.as_mut().expect("recording state missing");
                self.backend
                    .flush_secondary(&mut commands, &mut recording.primary, render_pass.as_ref())
                    .map_err(into_report("flush secondary commands"))?;
                debug_assert!(self.backend.secondary_is_empty(&commands));
                self.backend.recycle_secondary(commands);
                Ok(())
            }
            Task::FlushAndSubmit(mut task) => {
                self.ensure_recording()?;
                let Recording { mut primary, pool } =
                    self.recording.take().expect("recording state missing");
                if let Err(err) = self.backend.end_primary(&mut primary) {
                    self.backend.destroy_primary(primary);
                    self.backend.destroy_command_pool(pool);
                    return Err(ErrorReport::new(err, "end primary command buffer"));
                }
                // Missing wait-stage masks default to an all-commands wait.
                if task.wait_stage_masks.len() < task.wait_semaphores.len() {
                    task.wait_stage_masks
                        .resize(task.wait_semaphores.len(), B::ALL_COMMANDS);
                }
                let result = self
                    .engine
                    .submit_commands(
                        task.priority,
                        primary,
                        pool,
                        &task.wait_semaphores,
                        &task.wait_stage_masks,
                        task.signal_semaphore,
                        task.garbage,
                        task.serial,
                    )
                    .map_err(into_report("queue submit"));
                // Begin the next primary even after a failed submit; the
                // worker keeps recording.
                let begin = self.ensure_recording();
                result.and(begin)
            }
            Task::OneOffSubmit(task) => self
                .engine
                .submit_one_off(task.priority, task.commands.as_ref(), task.fence.as_deref())
                .map_err(into_report("one-off queue submit")),
            Task::Present { priority, info } => match self.engine.present(priority, info) {
                PresentResult::Success | PresentResult::Suboptimal | PresentResult::OutOfDate => {
                    Ok(())
                }
                PresentResult::Failure(err) => Err(ErrorReport::new(err, "queue present")),
            },
            Task::FinishToSerial(serial) => self
                .engine
                .finish_to_serial(serial)
                .map_err(into_report("finish to serial")),
            Task::CheckCompleted => self
                .engine
                .check_completed()
                .map_err(into_report("check completed commands")),
            Task::Exit => {
                let result = self
                    .engine
                    .finish_to_serial(Serial::INFINITE)
                    .map_err(into_report("finish on shutdown"));
                if result.is_err() {
                    // Whatever the final wait died of, batches are still in
                    // flight; force the drain so shutdown leaves both the
                    // in-flight list and the garbage queue empty.
                    self.engine.handle_device_lost();
                }
                // Teardown runs regardless so shutdown always terminates.
                if let Some(Recording { primary, pool }) = self.recording.take() {
                    self.backend.destroy_primary(primary);
                    self.backend.destroy_command_pool(pool);
                }
                self.engine.destroy();
                result
            }
        }
    }

    /// Opens the recording state if none is active: a primary allocated from
    /// the persistent pool and begun, plus a transient pool for the batch.
    fn ensure_recording(&mut self) -> Result<(), ErrorReport> {
        if self.recording.is_some() {
            return Ok(());
        }
        let mut primary = self
            .engine
            .acquire_primary()
            .map_err(into_report("allocate primary command buffer"))?;
        if let Err(err) = self.backend.begin_primary(&mut primary) {
            self.backend.destroy_primary(primary);
            return Err(ErrorReport::new(err, "begin primary command buffer"));
        }
        let pool = match self.backend.create_command_pool(CommandPoolKind::Transient) {
            Ok(pool) => pool,
            Err(err) => {
                self.backend.destroy_primary(primary);
                return Err(ErrorReport::new(err, "create command pool"));
            }
        };
        self.recording = Some(Recording { primary, pool });
        Ok(())
    }
}
