//! Drives the frame cycle and the buffer manager together against a simulated
//! GPU that only retires a slot's work when the CPU waits on its fence.

use std::cell::RefCell;
use std::rc::Rc;

use ash::vk::{self, Handle};
use framewise_core::{Extent, FrameSlot};
use framewise_gpu::{
    AcquireOutcome, BufferBackend, FrameCycle, FramePlatform, PresentOutcome, Result as GpuResult,
    SwapchainInfo,
};
use framewise_render::{BufferManager, ResourceId, ResourceKind};
use hashbrown::{HashMap, HashSet};

#[derive(Default)]
struct World {
    /// Slots whose last submission has not been observed complete.
    busy: HashSet<usize>,
    /// Buffers read by each slot's last submission.
    reads: HashMap<usize, HashSet<u64>>,
    /// Buffers the next submission reads.
    bound: HashSet<u64>,
    live: HashMap<u64, Vec<u8>>,
    next_id: u64,
    violations: Vec<String>,
    recreated: Vec<Extent>,
}

impl World {
    fn retire(&mut self, slot: usize) {
        self.busy.remove(&slot);
        self.reads.remove(&slot);
    }

    fn check_not_in_flight(&mut self, id: u64, action: &str) {
        let readers: Vec<usize> = self
            .reads
            .iter()
            .filter(|(slot, ids)| self.busy.contains(*slot) && ids.contains(&id))
            .map(|(slot, _)| *slot)
            .collect();
        if !readers.is_empty() {
            self.violations
                .push(format!("{action} buffer {id} while slots {readers:?} may read it"));
        }
    }
}

type Shared = Rc<RefCell<World>>;

struct SimPlatform {
    world: Shared,
    info: SwapchainInfo,
    next_image: u32,
}

impl FramePlatform for SimPlatform {
    fn swapchain_info(&self) -> SwapchainInfo {
        self.info
    }

    fn wait_slot(&mut self, slot: FrameSlot) -> GpuResult<()> {
        self.world.borrow_mut().retire(slot.index());
        Ok(())
    }

    fn reset_slot(&mut self, _slot: FrameSlot) -> GpuResult<()> {
        Ok(())
    }

    fn acquire(&mut self, _slot: FrameSlot) -> GpuResult<AcquireOutcome> {
        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.info.image_count as u32;
        Ok(AcquireOutcome::Image {
            index,
            suboptimal: false,
        })
    }

    fn begin_upload(&mut self, _image: u32) -> GpuResult<()> {
        Ok(())
    }

    fn end_upload(&mut self, _image: u32) -> GpuResult<()> {
        Ok(())
    }

    fn submit(&mut self, slot: FrameSlot, _image: u32) -> GpuResult<()> {
        let mut world = self.world.borrow_mut();
        assert!(
            !world.busy.contains(&slot.index()),
            "submitted to {slot} before its fence was waited on"
        );
        let bound = std::mem::take(&mut world.bound);
        world.reads.insert(slot.index(), bound);
        world.busy.insert(slot.index());
        Ok(())
    }

    fn present(&mut self, _slot: FrameSlot, _image: u32) -> GpuResult<PresentOutcome> {
        Ok(PresentOutcome::Presented)
    }

    fn recreate(&mut self, extent: Extent) -> GpuResult<SwapchainInfo> {
        let mut world = self.world.borrow_mut();
        world.busy.clear();
        world.reads.clear();
        world.recreated.push(extent);
        self.info.extent = extent;
        self.next_image = 0;
        Ok(self.info)
    }

    fn wait_idle(&mut self) -> GpuResult<()> {
        let mut world = self.world.borrow_mut();
        world.busy.clear();
        world.reads.clear();
        Ok(())
    }
}

struct SimBuffer {
    id: u64,
}

struct SimBackend {
    world: Shared,
}

impl BufferBackend for SimBackend {
    type Buffer = SimBuffer;

    fn create_host_buffer(
        &mut self,
        size: u64,
        _usage: vk::BufferUsageFlags,
        _name: &str,
    ) -> GpuResult<SimBuffer> {
        let mut world = self.world.borrow_mut();
        world.next_id += 1;
        let id = world.next_id;
        world.live.insert(id, vec![0; size as usize]);
        Ok(SimBuffer { id })
    }

    fn destroy_buffer(&mut self, buffer: SimBuffer) -> GpuResult<()> {
        let mut world = self.world.borrow_mut();
        world.check_not_in_flight(buffer.id, "destroyed");
        world.live.remove(&buffer.id);
        Ok(())
    }

    fn write_buffer(&mut self, buffer: &mut SimBuffer, data: &[u8]) -> GpuResult<()> {
        let mut world = self.world.borrow_mut();
        world.check_not_in_flight(buffer.id, "wrote");
        if let Some(memory) = world.live.get_mut(&buffer.id) {
            memory[..data.len()].copy_from_slice(data);
        }
        Ok(())
    }

    fn raw_buffer(buffer: &SimBuffer) -> vk::Buffer {
        vk::Buffer::from_raw(buffer.id)
    }

    fn wait_idle(&mut self) -> GpuResult<()> {
        let mut world = self.world.borrow_mut();
        world.busy.clear();
        world.reads.clear();
        Ok(())
    }
}

struct Harness {
    world: Shared,
    cycle: FrameCycle<SimPlatform>,
    backend: SimBackend,
    manager: BufferManager<SimBackend>,
}

impl Harness {
    fn new(frames_in_flight: usize, image_count: usize, extent: Extent) -> Self {
        let world = Shared::default();
        let platform = SimPlatform {
            world: Rc::clone(&world),
            info: SwapchainInfo {
                extent,
                image_count,
            },
            next_image: 0,
        };
        Self {
            cycle: FrameCycle::new(platform, frames_in_flight).unwrap(),
            backend: SimBackend {
                world: Rc::clone(&world),
            },
            manager: BufferManager::new(frames_in_flight),
            world,
        }
    }

    /// Run one frame drawing `referenced`; `write` runs between prep and
    /// recording, like application updates.
    fn frame(
        &mut self,
        extent: Extent,
        referenced: &[ResourceId],
        write: impl FnOnce(&mut BufferManager<SimBackend>, u64),
    ) -> FrameSlot {
        let frame = self
            .cycle
            .prep_next_frame(extent)
            .unwrap()
            .expect("non-empty extent yields a frame");
        write(&mut self.manager, frame.frame_number);
        let view = self
            .manager
            .prepare(
                frame.slot,
                referenced.iter().copied(),
                frame.frame_number,
                &mut self.backend,
            )
            .unwrap();

        let bound: HashSet<u64> = referenced
            .iter()
            .filter_map(|id| view.buffer(*id))
            .map(|binding| binding.buffer.as_raw())
            .collect();
        self.world.borrow_mut().bound = bound;

        self.cycle.swap(extent).unwrap();
        frame.slot.slot()
    }

    fn contents(&self, slot: FrameSlot, id: ResourceId) -> Option<Vec<u8>> {
        let binding = *self.manager.view(slot).buffer(id)?;
        self.world.borrow().live.get(&binding.buffer.as_raw()).cloned()
    }
}

const EXTENT: Extent = Extent::new(800, 600);

#[test]
fn no_copy_is_touched_while_its_slot_is_in_flight() {
    let mut harness = Harness::new(2, 3, EXTENT);
    let mesh = harness.manager.create_vertex("mesh", &[0.0f32; 9]);
    let camera = harness.manager.create_uniform("camera", &[0.0f32; 16]);
    let indices = harness.manager.create_index("indices", &[0u32, 1, 2]).unwrap();
    let transient = harness.manager.create_vertex("transient", &[1u8; 16]);

    for n in 0..48u64 {
        let extent = if n < 20 { EXTENT } else { Extent::new(1920, 1080) };
        let mut referenced = vec![mesh, camera, indices];
        if n < 10 {
            referenced.push(transient);
        }
        harness.frame(extent, &referenced, |manager, frame| {
            manager.set_data(camera, &[frame as f32; 16]).unwrap();
            if frame % 3 == 0 {
                let grown = vec![frame as f32; 9 + (frame as usize % 4) * 3];
                manager.set_data(mesh, &grown).unwrap();
            }
            if frame % 7 == 0 {
                manager
                    .set_data_immediate(indices, &[0u32, 1, 2, 2, 3, 0])
                    .unwrap();
            }
        });
    }

    let world = harness.world.borrow();
    assert!(world.violations.is_empty(), "{:#?}", world.violations);
    assert_eq!(world.recreated, vec![Extent::new(1920, 1080)]);
    drop(world);

    assert!(!harness.manager.contains(transient));
    assert_eq!(harness.manager.retired_count(), 0);
}

#[test]
fn every_slot_catches_up_within_frames_in_flight() {
    for frames_in_flight in 1..=4 {
        let mut harness = Harness::new(frames_in_flight, 3, EXTENT);
        let light = harness.manager.create_uniform("light", &[0u32; 4]);
        harness.frame(EXTENT, &[light], |_, _| {});

        harness.frame(EXTENT, &[light], |manager, _| {
            manager.set_data(light, &[7u32; 4]).unwrap();
        });
        let mut touched = Vec::new();
        for _ in 0..frames_in_flight {
            touched.push(harness.frame(EXTENT, &[light], |_, _| {}));
        }

        let expected: Vec<u8> = bytemuck::cast_slice(&[7u32; 4]).to_vec();
        for index in 0..frames_in_flight {
            let slot = FrameSlot::new(index, frames_in_flight).unwrap();
            assert!(touched.contains(&slot));
            assert_eq!(harness.contents(slot, light), Some(expected.clone()));
        }

        // Revisiting the first refreshed slot settles the marker
        harness.frame(EXTENT, &[light], |_, _| {});
        assert_eq!(
            harness.manager.resource(light).unwrap().dirty(),
            framewise_render::DirtyMarker::Clean
        );
    }
}

#[test]
fn empty_resource_allocates_only_once_data_arrives() {
    let mut harness = Harness::new(2, 2, EXTENT);
    let points = harness.manager.create(ResourceKind::Vertex, "points");

    for _ in 0..4 {
        harness.frame(EXTENT, &[points], |_, _| {});
    }
    assert!(harness.world.borrow().live.is_empty());

    harness.frame(EXTENT, &[points], |manager, _| {
        manager.set_data(points, &[1.0f32, 2.0, 3.0]).unwrap();
    });
    assert_eq!(harness.world.borrow().live.len(), 1);
    harness.frame(EXTENT, &[points], |_, _| {});
    assert_eq!(harness.world.borrow().live.len(), 2);
}

#[test]
fn write_during_a_frame_is_drawn_by_that_frame() {
    let mut harness = Harness::new(2, 3, EXTENT);
    let camera = harness.manager.create_uniform("camera", &[0u32; 4]);
    harness.frame(EXTENT, &[camera], |_, _| {});

    for frame in 1..6u32 {
        let slot = harness.frame(EXTENT, &[camera], |manager, _| {
            manager.set_data(camera, &[frame; 4]).unwrap();
        });
        let expected: Vec<u8> = bytemuck::cast_slice(&[frame; 4]).to_vec();
        assert_eq!(harness.contents(slot, camera), Some(expected));
    }

    // A resource created mid-frame is drawable in that frame too
    let mut created = None;
    let slot = harness.frame(EXTENT, &[], |manager, _| {
        created = Some(manager.create_vertex("late", &[1.0f32; 3]));
    });
    let late = created.unwrap();
    assert!(harness.contents(slot, late).is_some());
}

#[test]
fn resize_reports_new_extent_and_generation() {
    let mut harness = Harness::new(2, 3, EXTENT);
    let frame = harness.cycle.prep_next_frame(EXTENT).unwrap().unwrap();
    assert_eq!(frame.extent, EXTENT);
    harness.cycle.swap(EXTENT).unwrap();

    let large = Extent::new(1920, 1080);
    let frame = harness.cycle.prep_next_frame(large).unwrap().unwrap();
    assert_eq!(frame.extent, large);
    assert_eq!(frame.generation, 1);
    harness.cycle.swap(large).unwrap();

    let frame = harness.cycle.prep_next_frame(large).unwrap().unwrap();
    assert_eq!(frame.generation, 1);
    assert!(frame.image_index < 3);
}

#[test]
fn minimised_window_skips_frames() {
    let mut harness = Harness::new(2, 3, EXTENT);
    assert!(harness
        .cycle
        .prep_next_frame(Extent::new(0, 0))
        .unwrap()
        .is_none());
    let frame = harness.cycle.prep_next_frame(EXTENT).unwrap().unwrap();
    assert_eq!(frame.frame_number, 0);
}
