//! Persistent pool of command recording workers.
//!
//! Each frame the object list is split into contiguous ranges, one per worker.
//! Workers receive a [`RecordTask`] over a channel, record their range into a
//! secondary command buffer and report back; the primary thread collects the
//! replies in worker order.

use std::ops::Range;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use framewise_core::FrameSlot;
use framewise_gpu::RenderTarget;

use crate::error::{RenderError, Result};
use crate::object::RenderObject;
use crate::pipeline_directory::PipelineDirectory;
use crate::view::ResourceView;

/// Split `len` items into `workers` contiguous ranges of `ceil(len / workers)`.
///
/// Always returns `workers` ranges; trailing ones may be short or empty.
pub fn partition(len: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1);
    let chunk = len.div_ceil(workers);
    (0..workers)
        .map(|i| {
            let start = (i * chunk).min(len);
            let end = (start + chunk).min(len);
            start..end
        })
        .collect()
}

/// Where a frame's draws land.
#[derive(Clone, Copy, Debug)]
pub struct FrameTarget {
    pub slot: FrameSlot,
    pub image_index: u32,
    pub render: RenderTarget,
}

/// One worker's share of a frame.
pub struct RecordTask {
    pub target: FrameTarget,
    pub objects: Arc<[Arc<RenderObject>]>,
    pub range: Range<usize>,
    pub view: Arc<ResourceView>,
    pub directory: Arc<PipelineDirectory>,
}

impl RecordTask {
    /// Objects in this task's range, in frame order.
    pub fn objects(&self) -> &[Arc<RenderObject>] {
        &self.objects[self.range.clone()]
    }
}

/// Records one range of objects into a command buffer.
pub trait SecondaryRecorder: Send + 'static {
    /// Handle of the recorded buffer.
    type Output: Send + 'static;

    /// Record `task`; `None` when nothing was recorded.
    fn record(&mut self, task: &RecordTask) -> Result<Option<Self::Output>>;
}

enum WorkerRequest {
    Record(RecordTask),
    Shutdown,
}

type WorkerReply<T> = Result<Option<T>>;

struct WorkerHandle<R: SecondaryRecorder> {
    request_tx: Sender<WorkerRequest>,
    result_rx: Receiver<WorkerReply<R::Output>>,
    thread: Option<JoinHandle<R>>,
}

impl<R: SecondaryRecorder> WorkerHandle<R> {
    fn spawn(index: usize, recorder: R) -> Result<Self> {
        let (request_tx, request_rx) = channel::bounded::<WorkerRequest>(1);
        let (result_tx, result_rx) = channel::bounded::<WorkerReply<R::Output>>(1);

        let thread = thread::Builder::new()
            .name(format!("framewise-record-{index}"))
            .spawn(move || worker_loop(index, recorder, &request_rx, &result_tx))
            .map_err(|e| RenderError::WorkerSpawn(e.to_string()))?;

        Ok(Self {
            request_tx,
            result_rx,
            thread: Some(thread),
        })
    }

    fn join(&mut self, index: usize) -> Option<R> {
        let _ = self.request_tx.send(WorkerRequest::Shutdown);
        match self.thread.take()?.join() {
            Ok(recorder) => Some(recorder),
            Err(_) => {
                tracing::error!("Recording worker {} panicked", index);
                None
            }
        }
    }
}

fn worker_loop<R: SecondaryRecorder>(
    index: usize,
    mut recorder: R,
    request_rx: &Receiver<WorkerRequest>,
    result_tx: &Sender<WorkerReply<R::Output>>,
) -> R {
    tracing::info!("Recording worker {} started", index);
    while let Ok(WorkerRequest::Record(task)) = request_rx.recv() {
        let reply = recorder.record(&task);
        drop(task);
        if result_tx.send(reply).is_err() {
            break;
        }
    }
    tracing::info!("Recording worker {} stopped", index);
    recorder
}

/// Fixed pool of recording threads.
pub struct CommandDispatcher<R: SecondaryRecorder> {
    workers: Vec<WorkerHandle<R>>,
}

impl<R: SecondaryRecorder> CommandDispatcher<R> {
    /// Spawn `workers` threads, each owning the recorder `factory` builds for
    /// its index.
    pub fn new(workers: usize, mut factory: impl FnMut(usize) -> Result<R>) -> Result<Self> {
        let mut dispatcher = Self {
            workers: Vec::with_capacity(workers.max(1)),
        };
        for index in 0..workers.max(1) {
            let recorder = factory(index)?;
            dispatcher.workers.push(WorkerHandle::spawn(index, recorder)?);
        }
        Ok(dispatcher)
    }

    /// Number of workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Record `objects` across the pool and wait for every worker.
    ///
    /// Returns the recorded buffers in worker order. Workers whose range is
    /// empty are not woken. If any worker fails or has stopped, the first
    /// error is returned after every pending reply has been collected.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn dispatch(
        &self,
        target: FrameTarget,
        objects: &Arc<[Arc<RenderObject>]>,
        view: &Arc<ResourceView>,
        directory: &Arc<PipelineDirectory>,
    ) -> Result<Vec<R::Output>> {
        let ranges = partition(objects.len(), self.workers.len());

        let mut busy = Vec::with_capacity(self.workers.len());
        let mut first_error = None;
        for (index, (worker, range)) in self.workers.iter().zip(ranges).enumerate() {
            if range.is_empty() {
                continue;
            }
            let task = RecordTask {
                target,
                objects: Arc::clone(objects),
                range,
                view: Arc::clone(view),
                directory: Arc::clone(directory),
            };
            if worker.request_tx.send(WorkerRequest::Record(task)).is_err() {
                // Replies of workers already sent a task are still collected
                first_error = Some(RenderError::WorkerDisconnected(index));
                break;
            }
            busy.push(index);
        }

        let mut outputs = Vec::with_capacity(busy.len());
        for index in busy {
            let reply = self.workers[index]
                .result_rx
                .recv()
                .map_err(|_| RenderError::WorkerDisconnected(index))
                .and_then(|reply| reply);
            match reply {
                Ok(Some(output)) => outputs.push(output),
                Ok(None) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::trace!("Collected {} secondary buffers", outputs.len());
        first_error.map_or(Ok(outputs), Err)
    }

    /// Stop every worker and hand back their recorders.
    pub fn shutdown(&mut self) -> Vec<R> {
        self.workers
            .iter_mut()
            .enumerate()
            .filter_map(|(index, worker)| worker.join(index))
            .collect()
    }
}

impl<R: SecondaryRecorder> Drop for CommandDispatcher<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;
    use framewise_core::PipelineKind;
    use parking_lot::Mutex;

    use crate::object::{DrawCall, RenderObjectDesc};

    /// Records the pipeline kinds of its range as its "command buffer".
    struct KindRecorder {
        worker: usize,
        seen: Arc<Mutex<Vec<(usize, Vec<u32>)>>>,
    }

    impl SecondaryRecorder for KindRecorder {
        type Output = (usize, Vec<u32>);

        fn record(&mut self, task: &RecordTask) -> Result<Option<Self::Output>> {
            let kinds: Vec<u32> = task.objects().iter().map(|o| o.kind().0).collect();
            self.seen.lock().push((self.worker, kinds.clone()));
            Ok((!kinds.is_empty()).then_some((self.worker, kinds)))
        }
    }

    struct FailingRecorder;

    impl SecondaryRecorder for FailingRecorder {
        type Output = ();

        fn record(&mut self, task: &RecordTask) -> Result<Option<()>> {
            if task.range.start == 0 {
                Err(RenderError::NoFramePrepared)
            } else {
                Ok(Some(()))
            }
        }
    }

    /// Panics on its first task when it is worker 1.
    struct CrashingRecorder {
        worker: usize,
    }

    impl SecondaryRecorder for CrashingRecorder {
        type Output = usize;

        fn record(&mut self, _task: &RecordTask) -> Result<Option<usize>> {
            assert!(self.worker != 1, "recorder crashed");
            Ok(Some(self.worker))
        }
    }

    fn objects(count: u32) -> Arc<[Arc<RenderObject>]> {
        (0..count)
            .map(|i| {
                Arc::new(RenderObject::new(
                    RenderObjectDesc::new(PipelineKind(i)).draw(DrawCall::vertices(3, 0)),
                ))
            })
            .collect()
    }

    fn target() -> FrameTarget {
        FrameTarget {
            slot: FrameSlot::ZERO,
            image_index: 0,
            render: RenderTarget {
                render_pass: vk::RenderPass::null(),
                framebuffer: vk::Framebuffer::null(),
                extent: vk::Extent2D {
                    width: 800,
                    height: 600,
                },
                generation: 0,
            },
        }
    }

    fn dispatch_kinds(count: u32, workers: usize) -> Vec<(usize, Vec<u32>)> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = CommandDispatcher::new(workers, |worker| {
            Ok(KindRecorder {
                worker,
                seen: Arc::clone(&seen),
            })
        })
        .unwrap();
        dispatcher
            .dispatch(
                target(),
                &objects(count),
                &Arc::new(ResourceView::new()),
                &Arc::new(PipelineDirectory::new()),
            )
            .unwrap()
    }

    #[test]
    fn partition_gives_ceil_sized_contiguous_ranges() {
        assert_eq!(partition(4, 2), vec![0..2, 2..4]);
        assert_eq!(partition(5, 2), vec![0..3, 3..5]);
        assert_eq!(partition(5, 3), vec![0..2, 2..4, 4..5]);
        assert_eq!(partition(2, 4), vec![0..1, 1..2, 2..2, 2..2]);
        assert_eq!(partition(0, 3), vec![0..0, 0..0, 0..0]);
    }

    #[test]
    fn partition_covers_every_index_once() {
        for len in 0..40 {
            for workers in 1..9 {
                let flat: Vec<usize> = partition(len, workers).into_iter().flatten().collect();
                assert_eq!(flat, (0..len).collect::<Vec<_>>());
            }
        }
    }

    #[test]
    fn four_objects_two_workers() {
        assert_eq!(
            dispatch_kinds(4, 2),
            vec![(0, vec![0, 1]), (1, vec![2, 3])]
        );
    }

    #[test]
    fn five_objects_two_workers() {
        assert_eq!(
            dispatch_kinds(5, 2),
            vec![(0, vec![0, 1, 2]), (1, vec![3, 4])]
        );
    }

    #[test]
    fn idle_workers_are_not_woken() {
        assert_eq!(dispatch_kinds(1, 4), vec![(0, vec![0])]);
        assert!(dispatch_kinds(0, 4).is_empty());
    }

    #[test]
    fn workers_persist_across_frames() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = CommandDispatcher::new(2, |worker| {
            Ok(KindRecorder {
                worker,
                seen: Arc::clone(&seen),
            })
        })
        .unwrap();
        let view = Arc::new(ResourceView::new());
        let directory = Arc::new(PipelineDirectory::new());
        for _ in 0..3 {
            dispatcher
                .dispatch(target(), &objects(2), &view, &directory)
                .unwrap();
        }
        assert_eq!(seen.lock().len(), 6);

        let recorders = dispatcher.shutdown();
        assert_eq!(recorders.len(), 2);
        assert_eq!(recorders[1].worker, 1);
    }

    #[test]
    fn worker_error_is_reported_after_all_replies() {
        let dispatcher = CommandDispatcher::new(2, |_| Ok(FailingRecorder)).unwrap();
        let result = dispatcher.dispatch(
            target(),
            &objects(4),
            &Arc::new(ResourceView::new()),
            &Arc::new(PipelineDirectory::new()),
        );
        assert!(matches!(result, Err(RenderError::NoFramePrepared)));

        // The pool is still usable for the next frame
        let result = dispatcher.dispatch(
            target(),
            &objects(4),
            &Arc::new(ResourceView::new()),
            &Arc::new(PipelineDirectory::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn stopped_worker_leaves_no_stale_replies() {
        let dispatcher = CommandDispatcher::new(2, |worker| Ok(CrashingRecorder { worker })).unwrap();
        let view = Arc::new(ResourceView::new());
        let directory = Arc::new(PipelineDirectory::new());

        // Worker 1 dies while recording
        let result = dispatcher.dispatch(target(), &objects(4), &view, &directory);
        assert!(matches!(result, Err(RenderError::WorkerDisconnected(1))));

        // Worker 0 gets a task before the send to worker 1 fails
        for _ in 0..3 {
            let result = dispatcher.dispatch(target(), &objects(4), &view, &directory);
            assert!(matches!(result, Err(RenderError::WorkerDisconnected(1))));
            assert!(dispatcher.workers.iter().all(|w| w.result_rx.is_empty()));
        }
    }
}
