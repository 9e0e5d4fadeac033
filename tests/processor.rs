//! Scenario tests for the command processor, driven through an instrumented
//! in-memory backend with manually signaled fences.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread;

use parking_lot::{Mutex, MutexGuard};

use graphite::{
    CommandPoolKind, CommandProcessor, DeviceError, FenceStatus, GpuBackend, PresentInfo,
    PresentResult, ProcessingMode, QueuePriority, ResourceUse, ResourceUseList, Serial,
    SharedFence, SubmitDescriptor, Task, IN_FLIGHT_LIMIT,
};

// --- mock backend -----------------------------------------------------------

struct MockPrimary {
    ops: Vec<String>,
}

struct MockSecondary {
    id: u64,
    ops: Vec<String>,
}

struct MockFence {
    id: u64,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    /// Fence ids in the order their submissions reached the queue.
    submit_order: Vec<u64>,
    signaled: HashSet<u64>,
    /// Newly acquired fences signal at submit time, modeling trivially
    /// completing work.
    auto_signal: bool,
    fail_next_submit: bool,
    fail_next_wait: Option<DeviceError>,

    events: Vec<String>,
    submits: usize,
    one_off_submits: usize,
    submitted_primary_ops: Vec<Vec<String>>,
    completed: Vec<Serial>,
    last_completed: Serial,
    live_batches: usize,
    max_live_batches: usize,
    destroyed_garbage: Vec<u64>,
    recycled_secondaries: Vec<u64>,
    scripted_presents: HashMap<u64, VecDeque<PresentResult>>,
    presents: Vec<(u64, u32)>,
}

impl MockState {
    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn event(&mut self, event: impl Into<String>) {
        self.events.push(event.into());
    }
}

struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    fn new() -> Arc<MockBackend> {
        Arc::new(MockBackend {
            state: Mutex::new(MockState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock()
    }

    fn set_auto_signal(&self, auto: bool) {
        self.state().auto_signal = auto;
    }

    fn fail_next_submit(&self) {
        self.state().fail_next_submit = true;
    }

    fn fail_next_wait(&self, error: DeviceError) {
        self.state().fail_next_wait = Some(error);
    }

    fn script_present(&self, swapchain: u64, result: PresentResult) {
        self.state()
            .scripted_presents
            .entry(swapchain)
            .or_default()
            .push_back(result);
    }

    fn secondary(&self, ops: &[&str]) -> MockSecondary {
        let id = self.state().fresh_id();
        MockSecondary {
            id,
            ops: ops.iter().map(|op| op.to_string()).collect(),
        }
    }
}

impl GpuBackend for MockBackend {
    type Primary = MockPrimary;
    type Secondary = MockSecondary;
    type OneOffCommands = u64;
    type Pool = u64;
    type Fence = MockFence;
    type Semaphore = u64;
    type StageMask = u32;
    type Swapchain = u64;
    type RenderPass = u64;
    type Garbage = u64;

    const ALL_COMMANDS: u32 = u32::MAX;

    fn create_command_pool(&self, kind: CommandPoolKind) -> Result<u64, DeviceError> {
        let mut state = self.state();
        let id = state.fresh_id();
        state.event(format!("create_pool:{kind:?}"));
        Ok(id)
    }

    fn destroy_command_pool(&self, _pool: u64) {
        self.state().event("destroy_pool");
    }

    fn allocate_primary(&self, _pool: &u64) -> Result<MockPrimary, DeviceError> {
        self.state().event("allocate_primary");
        Ok(MockPrimary { ops: Vec::new() })
    }

    fn begin_primary(&self, primary: &mut MockPrimary) -> Result<(), DeviceError> {
        primary.ops.clear();
        self.state().event("begin_primary");
        Ok(())
    }

    fn end_primary(&self, _primary: &mut MockPrimary) -> Result<(), DeviceError> {
        self.state().event("end_primary");
        Ok(())
    }

    fn reset_primary(&self, primary: &mut MockPrimary) -> Result<(), DeviceError> {
        primary.ops.clear();
        self.state().event("reset_primary");
        Ok(())
    }

    fn destroy_primary(&self, _primary: MockPrimary) {
        self.state().event("destroy_primary");
    }

    fn flush_secondary(
        &self,
        commands: &mut MockSecondary,
        primary: &mut MockPrimary,
        _render_pass: Option<&u64>,
    ) -> Result<(), DeviceError> {
        primary.ops.append(&mut commands.ops);
        self.state().event("flush_secondary");
        Ok(())
    }

    fn recycle_secondary(&self, commands: MockSecondary) {
        let mut state = self.state();
        state.recycled_secondaries.push(commands.id);
        state.event("recycle_secondary");
    }

    fn secondary_is_empty(&self, commands: &MockSecondary) -> bool {
        commands.ops.is_empty()
    }

    fn next_submit_fence(&self) -> Result<SharedFence<Self>, DeviceError> {
        let mut state = self.state();
        let id = state.fresh_id();
        state.event("acquire_fence");
        Ok(Arc::new(MockFence { id }))
    }

    fn fence_status(&self, fence: &MockFence) -> Result<FenceStatus, DeviceError> {
        Ok(if self.state().signaled.contains(&fence.id) {
            FenceStatus::Signaled
        } else {
            FenceStatus::NotReady
        })
    }

    fn wait_fence(&self, fence: &MockFence, _timeout_ns: u64) -> Result<(), DeviceError> {
        let mut state = self.state();
        if let Some(error) = state.fail_next_wait.take() {
            return Err(error);
        }
        if state.signaled.contains(&fence.id) {
            return Ok(());
        }
        // The GPU retires submissions in order: waiting a fence out signals
        // it together with every earlier one.
        match state.submit_order.iter().position(|&id| id == fence.id) {
            Some(position) => {
                let retired: Vec<u64> = state.submit_order[..=position].to_vec();
                state.signaled.extend(retired);
                Ok(())
            }
            None => Err(DeviceError::Timeout),
        }
    }

    fn recycle_fence(&self, fence: SharedFence<Self>) {
        self.state().event("recycle_fence");
        drop(fence);
    }

    fn fence_wait_timeout_ns(&self) -> u64 {
        1_000_000
    }

    fn queue_submit(
        &self,
        _priority: QueuePriority,
        submit: SubmitDescriptor<'_, Self>,
        fence: Option<&MockFence>,
    ) -> Result<(), DeviceError> {
        let mut state = self.state();
        if state.fail_next_submit {
            state.fail_next_submit = false;
            state.event("queue_submit_failed");
            return Err(DeviceError::DeviceLost);
        }
        assert_eq!(submit.wait_semaphores.len(), submit.wait_stage_masks.len());
        let ops = submit
            .commands
            .map(|primary| primary.ops.clone())
            .unwrap_or_default();
        state.submitted_primary_ops.push(ops);
        if let Some(fence) = fence {
            state.submit_order.push(fence.id);
            if state.auto_signal {
                state.signaled.insert(fence.id);
            }
        }
        state.submits += 1;
        state.live_batches += 1;
        state.max_live_batches = state.max_live_batches.max(state.live_batches);
        state.event("queue_submit");
        Ok(())
    }

    fn queue_submit_one_off(
        &self,
        _priority: QueuePriority,
        _commands: Option<&u64>,
        fence: Option<&MockFence>,
    ) -> Result<(), DeviceError> {
        let mut state = self.state();
        if state.fail_next_submit {
            state.fail_next_submit = false;
            state.event("queue_submit_failed");
            return Err(DeviceError::DeviceLost);
        }
        if let Some(fence) = fence {
            state.submit_order.push(fence.id);
            if state.auto_signal {
                state.signaled.insert(fence.id);
            }
        }
        state.one_off_submits += 1;
        state.event("one_off_submit");
        Ok(())
    }

    fn queue_present(&self, _priority: QueuePriority, present: &PresentInfo<Self>) -> PresentResult {
        let mut state = self.state();
        state.presents.push((present.swapchain, present.image_index));
        state.event(format!("present:{}", present.swapchain));
        state
            .scripted_presents
            .get_mut(&present.swapchain)
            .and_then(|results| results.pop_front())
            .unwrap_or(PresentResult::Success)
    }

    fn on_completed_serial(&self, serial: Serial) {
        let mut state = self.state();
        state.completed.push(serial);
        state.last_completed = state.last_completed.max(serial);
        state.live_batches -= 1;
        state.event(format!("completed:{serial:?}"));
    }

    fn last_completed_serial(&self) -> Serial {
        self.state().last_completed
    }

    fn destroy_garbage(&self, garbage: u64) {
        let mut state = self.state();
        state.destroyed_garbage.push(garbage);
        state.event("destroy_garbage");
    }
}

// --- fixture ----------------------------------------------------------------

struct Fixture {
    backend: Arc<MockBackend>,
    processor: CommandProcessor<MockBackend>,
}

impl Fixture {
    fn new(mode: ProcessingMode) -> Fixture {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let backend = MockBackend::new();
        let processor = CommandProcessor::new(backend.clone(), mode);
        Fixture { backend, processor }
    }

    fn with_auto_signal(mode: ProcessingMode) -> Fixture {
        let fixture = Fixture::new(mode);
        fixture.backend.set_auto_signal(true);
        fixture
    }

    fn submit(&self) {
        self.submit_with_garbage(Vec::new());
    }

    fn submit_with_garbage(&self, garbage: Vec<u64>) {
        self.processor.queue_command(Task::flush_and_submit(
            QueuePriority::default(),
            Vec::new(),
            Vec::new(),
            None,
            garbage,
            ResourceUseList::new(),
        ));
    }

    fn present(&self, swapchain: u64) {
        self.processor.queue_command(Task::present(
            QueuePriority::default(),
            PresentInfo {
                swapchain,
                image_index: 0,
                wait_semaphore: None,
                regions: None,
            },
        ));
    }
}

// --- scenarios --------------------------------------------------------------

#[test]
fn submit_and_finish_to_serial() {
    let fixture = Fixture::new(ProcessingMode::Threaded);

    fixture.submit();
    let submitted = fixture.processor.last_submitted_serial();
    fixture.processor.finish_to_serial(submitted);

    let state = fixture.backend.state();
    assert_eq!(state.submits, 1);
    assert_eq!(state.completed, vec![submitted]);
    assert_eq!(state.live_batches, 0);
    drop(state);

    assert_eq!(
        fixture.processor.last_submitted_serial().raw(),
        fixture.processor.current_serial().raw() - 1
    );
    assert!(fixture.processor.last_submitted_fence().is_none());
    assert!(!fixture.processor.has_pending_error());
}

#[test]
fn throttle_bounds_in_flight_submissions() {
    // Inline mode so the in-flight depth can be observed after every call.
    let fixture = Fixture::new(ProcessingMode::Inline);

    let mut previous = Serial::ZERO;
    for _ in 0..150 {
        fixture.submit();
        let submitted = fixture.processor.last_submitted_serial();
        assert!(submitted > previous);
        previous = submitted;
        assert!(fixture.backend.state().live_batches <= IN_FLIGHT_LIMIT);
    }
    fixture.processor.finish_all_work();

    let state = fixture.backend.state();
    assert_eq!(state.submits, 150);
    assert_eq!(state.completed.len(), 150);
    assert_eq!(state.live_batches, 0);
    // The list only ever overshoots by the one batch that triggers the
    // throttle.
    assert!(state.max_live_batches <= IN_FLIGHT_LIMIT + 1);
    assert!(state.completed.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn present_results_are_isolated_per_swapchain() {
    let fixture = Fixture::with_auto_signal(ProcessingMode::Threaded);
    fixture.backend.script_present(1, PresentResult::Suboptimal);
    fixture.backend.script_present(2, PresentResult::Success);

    fixture.present(1);
    fixture.present(2);

    assert_eq!(
        fixture.processor.take_present_result(1),
        PresentResult::Suboptimal
    );
    assert_eq!(
        fixture.processor.take_present_result(2),
        PresentResult::Success
    );
    assert!(!fixture.processor.has_pending_error());

    // A second read on the same swapchain blocks until the next present.
    let fixture = Arc::new(fixture);
    let reader = {
        let fixture = fixture.clone();
        thread::spawn(move || fixture.processor.take_present_result(1))
    };
    fixture.present(1);
    assert_eq!(reader.join().unwrap(), PresentResult::Success);
}

#[test]
fn device_loss_is_reported_and_shutdown_terminates() {
    let mut fixture = Fixture::new(ProcessingMode::Threaded);

    fixture.submit();
    fixture.backend.fail_next_submit();
    fixture.submit();
    fixture.processor.wait_for_work_complete();

    let report = fixture
        .processor
        .take_pending_error()
        .expect("device loss must be recorded");
    assert_eq!(report.error, DeviceError::DeviceLost);
    assert!(report.is_device_loss());
    assert!(fixture.processor.take_pending_error().is_none());

    // The in-flight list was drained without recycling; completed serials
    // were never reported for the torn-down batch.
    assert!(fixture.backend.state().completed.is_empty());

    // Shutdown still terminates after an error.
    fixture.processor.shutdown();
    assert_eq!(fixture.backend.state().submits, 1);
}

#[test]
fn shutdown_drains_in_flight_work_on_any_wait_failure() {
    let mut fixture = Fixture::new(ProcessingMode::Threaded);

    fixture.submit_with_garbage(vec![3]);
    fixture.backend.fail_next_wait(DeviceError::OutOfMemory);
    fixture.processor.shutdown();

    let report = fixture
        .processor
        .take_pending_error()
        .expect("wait failure must be recorded");
    assert_eq!(report.error, DeviceError::OutOfMemory);
    assert!(!report.is_device_loss());

    // The batch and its garbage were force-drained, not abandoned: the
    // in-flight list and garbage queue are empty by the time the worker
    // joins, even though the shutdown wait itself failed.
    let state = fixture.backend.state();
    assert_eq!(state.destroyed_garbage, vec![3]);
    assert!(state.completed.is_empty());
}

#[test]
fn secondaries_flush_into_the_submitted_primary() {
    let fixture = Fixture::with_auto_signal(ProcessingMode::Threaded);

    let secondary = fixture.backend.secondary(&["draw", "blit"]);
    let secondary_id = secondary.id;
    fixture
        .processor
        .queue_command(Task::process_commands(secondary, None));
    fixture.submit();
    fixture.processor.finish_all_work();

    let state = fixture.backend.state();
    assert_eq!(state.submits, 1);
    assert_eq!(state.submitted_primary_ops[0], vec!["draw", "blit"]);
    assert_eq!(state.recycled_secondaries, vec![secondary_id]);
}

#[test]
fn concurrent_producers_get_ordered_serials() {
    let fixture = Fixture::with_auto_signal(ProcessingMode::Threaded);

    thread::scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|| {
                for _ in 0..1000 {
                    fixture.submit();
                }
            });
        }
    });
    fixture.processor.finish_all_work();

    let state = fixture.backend.state();
    assert_eq!(state.submits, 2000);
    assert_eq!(state.completed.len(), 2000);
    // Batches complete in in-flight order; strictly increasing serials mean
    // every submission entered the list in the order its serial was assigned.
    assert!(state.completed.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn inline_and_threaded_modes_are_equivalent() {
    fn run(mode: ProcessingMode) -> Vec<String> {
        let mut fixture = Fixture::with_auto_signal(mode);
        let secondary = fixture.backend.secondary(&["draw"]);
        fixture
            .processor
            .queue_command(Task::process_commands(secondary, None));
        fixture.submit();
        fixture.present(1);
        fixture.processor.check_completed_commands();
        fixture.processor.finish_all_work();
        fixture.processor.shutdown();
        let events = fixture.backend.state().events.clone();
        events
    }

    assert_eq!(
        run(ProcessingMode::Threaded),
        run(ProcessingMode::Inline)
    );
}

#[test]
fn garbage_waits_for_its_serial() {
    let fixture = Fixture::new(ProcessingMode::Threaded);

    fixture.submit_with_garbage(vec![7, 8]);
    fixture.processor.wait_for_work_complete();
    assert!(fixture.backend.state().destroyed_garbage.is_empty());

    fixture.processor.finish_all_work();
    assert_eq!(fixture.backend.state().destroyed_garbage, vec![7, 8]);
}

#[test]
fn resource_uses_are_tagged_at_enqueue() {
    let fixture = Fixture::with_auto_signal(ProcessingMode::Threaded);

    let resource = Arc::new(ResourceUse::new());
    let mut uses = ResourceUseList::new();
    uses.add(&resource);
    assert!(!uses.is_empty());

    fixture.processor.queue_command(Task::flush_and_submit(
        QueuePriority::default(),
        Vec::new(),
        Vec::new(),
        None,
        Vec::new(),
        uses,
    ));

    let submitted = fixture.processor.last_submitted_serial();
    assert_eq!(resource.last_used_serial(), submitted);
    assert!(!resource.is_unused_at(Serial::ZERO));

    fixture.processor.finish_all_work();
    assert!(resource.is_unused_at(fixture.backend.last_completed_serial()));
}

#[test]
fn one_off_submit_bypasses_batch_bookkeeping() {
    let fixture = Fixture::new(ProcessingMode::Threaded);

    let before = fixture.processor.last_submitted_serial();
    let fence = Arc::new(MockFence { id: 9999 });
    fixture
        .processor
        .queue_command(Task::one_off_submit(
            QueuePriority::High,
            Some(42),
            Some(fence),
        ));
    fixture.processor.wait_for_work_complete();

    let state = fixture.backend.state();
    assert_eq!(state.one_off_submits, 1);
    assert_eq!(state.submits, 0);
    assert_eq!(state.live_batches, 0);
    assert!(state.completed.is_empty());
    drop(state);

    // One-off submits still consume a serial.
    assert!(fixture.processor.last_submitted_serial() > before);
    assert!(!fixture.processor.has_pending_error());
}

#[test]
fn finish_with_nothing_in_flight_returns_immediately() {
    let fixture = Fixture::new(ProcessingMode::Threaded);
    fixture.processor.finish_all_work();
    assert!(!fixture.processor.has_pending_error());
    assert!(fixture.processor.last_submitted_fence().is_none());
}

#[test]
fn last_submitted_fence_tracks_the_newest_batch() {
    let fixture = Fixture::new(ProcessingMode::Threaded);

    fixture.submit();
    fixture.submit();

    let fence = fixture
        .processor
        .last_submitted_fence()
        .expect("two batches are in flight");
    let newest = *fixture.backend.state().submit_order.last().unwrap();
    assert_eq!(fence.id, newest);
    drop(fence);

    fixture.processor.finish_all_work();
    assert!(fixture.processor.last_submitted_fence().is_none());
}
