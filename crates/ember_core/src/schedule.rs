//! Frame Pipeline Scheduler.
//!
//! Per frame: acquire a gate permit and a presentation target, prepare the
//! next ring slot, encode the fixed pass sequence
//!
//! ```text
//! Generate -> { IntersectNearest -> Shade -> IntersectShadow -> ShadowTest } x bounces
//!          -> Accumulate -> Present
//! ```
//!
//! into one ordered command stream, then submit it together with the permit.
//! The backend releases the permit from its completion callback. All passes
//! share one stream, so submission order is the only ordering needed between
//! a stage and its consumer.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::RendererConfig;
use crate::error::{FrameError, InitError, PreconditionError};
use crate::gate::{FrameGate, FramePermit, GateStats};
use crate::pool::{PoolSizes, Viewport};
use crate::ring::{FrameRing, FrameTicket, RingLayout, SlotBytes};
use crate::scene::Scene;
use crate::uniforms::UniformBuilder;

/// One GPU stage of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Camera rays into the primary ray buffer, emissive seed into the render target
    GeneratePrimaryRays,
    /// Nearest-hit query for the primary/bounce rays
    IntersectNearest { bounce: u32 },
    /// Shade hits, emit shadow rays, write the next bounce direction
    Shade { bounce: u32 },
    /// Any-hit query for the shadow rays
    IntersectShadow { bounce: u32 },
    /// Add unoccluded shadow-ray contributions to the render target
    ShadowTest { bounce: u32 },
    /// Fold the render target into the running average
    Accumulate,
    /// Copy the accumulation target to the display surface
    Present,
}

/// The fixed pass sequence for a given bounce count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePlan {
    passes: Vec<Pass>,
}

impl FramePlan {
    pub fn new(bounce_count: u32) -> Self {
        let mut passes = Vec::with_capacity(3 + 4 * bounce_count as usize);
        passes.push(Pass::GeneratePrimaryRays);
        for bounce in 0..bounce_count {
            passes.push(Pass::IntersectNearest { bounce });
            passes.push(Pass::Shade { bounce });
            passes.push(Pass::IntersectShadow { bounce });
            passes.push(Pass::ShadowTest { bounce });
        }
        passes.push(Pass::Accumulate);
        passes.push(Pass::Present);
        Self { passes }
    }

    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }
}

/// Everything a backend needs to encode one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    pub ticket: FrameTicket,
    pub viewport: Viewport,
}

impl FrameContext {
    /// Index (0 or 1) of the accumulation target this frame writes.
    /// The other one holds the previous running average.
    pub fn accumulation_parity(&self) -> usize {
        (self.ticket.frame_index % 2) as usize
    }
}

/// A device the scheduler drives.
///
/// Implementations own the GPU-side resources (ring buffers, ray and
/// intersection scratch, render targets) and the injected intersection
/// service.
pub trait FrameBackend {
    /// Presentation target for one frame (e.g. a swap-chain texture)
    type Target;
    /// Command recording state for one frame
    type Encoder;

    /// Layout of the ring buffers this backend allocated. Must equal the
    /// scheduler's layout, since tickets carry offsets into them.
    fn ring_layout(&self) -> RingLayout;

    /// Reallocate size-dependent resources. Called only when no frame is in flight.
    fn resize(&mut self, viewport: Viewport);

    /// Block until at least the oldest outstanding submission has completed
    /// and its callback has run. Returns immediately when nothing is outstanding.
    fn wait_for_completion(&mut self);

    /// Block until every submitted frame has completed and released its permit.
    fn wait_idle(&mut self);

    /// Obtain the surface this frame will present to.
    fn acquire_target(&mut self) -> Result<Self::Target, FrameError>;

    /// Start recording; stage the prepared ring slot at its offsets.
    fn begin_frame(&mut self, ctx: &FrameContext, slot: SlotBytes<'_>) -> Self::Encoder;

    /// Record one pass.
    fn encode(&mut self, encoder: &mut Self::Encoder, ctx: &FrameContext, pass: Pass, target: &Self::Target);

    /// Submit the recorded stream as one unit, arrange for `permit` to be
    /// released when the device finishes it, and present.
    ///
    /// On error nothing was queued and `permit` has been released.
    fn submit(&mut self, encoder: Self::Encoder, target: Self::Target, permit: FramePermit) -> Result<(), FrameError>;
}

/// Result of one `draw_frame` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Submitted(FrameTicket),
    /// The frame never reached the device and its permit was released.
    /// A failed target acquisition leaves ring state untouched; a failed
    /// submit has already consumed the frame's ring slot.
    Skipped(FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub submitted: u64,
    pub skipped: u64,
    pub last_frame_index: Option<u32>,
    pub gate: GateStats,
}

pub struct FrameScheduler<B: FrameBackend> {
    backend: B,
    config: RendererConfig,
    gate: FrameGate,
    ring: FrameRing,
    uniforms: UniformBuilder,
    plan: FramePlan,
    viewport: Option<Viewport>,
    rng: StdRng,
    submitted: u64,
    skipped: u64,
    last_frame_index: Option<u32>,
}

impl<B: FrameBackend> FrameScheduler<B> {
    pub fn new(backend: B, scene: &Scene, config: RendererConfig) -> Result<Self, InitError> {
        config.validate()?;

        let layout = RingLayout::new(config.max_frames_in_flight, config.uniform_alignment);
        let backend_layout = backend.ring_layout();
        if backend_layout != layout {
            return Err(PreconditionError::RingLayoutMismatch {
                scheduler: layout,
                backend: backend_layout,
            }
            .into());
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        log::info!(
            "Frame scheduler: {} frames in flight, {} bounces, uniform slot {} B, random slot {} B",
            config.max_frames_in_flight,
            config.bounce_count,
            layout.uniform_slot_size,
            layout.random_slot_size
        );

        Ok(Self {
            backend,
            gate: FrameGate::new(config.max_frames_in_flight),
            ring: FrameRing::new(layout),
            uniforms: UniformBuilder::new(scene.camera, scene.light, config.field_of_view()),
            plan: FramePlan::new(config.bounce_count),
            viewport: None,
            rng,
            submitted: 0,
            skipped: 0,
            last_frame_index: None,
            config,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn plan(&self) -> &FramePlan {
        &self.plan
    }

    pub fn ring_layout(&self) -> &RingLayout {
        self.ring.layout()
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.viewport
    }

    /// Frame index the next prepared frame will carry.
    pub fn frame_index(&self) -> u32 {
        self.ring.frame_index()
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            submitted: self.submitted,
            skipped: self.skipped,
            last_frame_index: self.last_frame_index,
            gate: self.gate.stats(),
        }
    }

    /// Block until every submitted frame has completed.
    pub fn drain(&mut self) {
        if self.gate.stats().in_flight() > 0 {
            self.backend.wait_idle();
        }
        self.gate.wait_idle();
    }

    /// Drain in-flight frames, reallocate size-dependent resources and
    /// restart progressive accumulation at frame 0.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), PreconditionError> {
        let viewport = Viewport::new(width, height)?;
        self.drain();
        self.backend.resize(viewport);
        self.ring.reset();
        self.viewport = Some(viewport);

        let sizes = PoolSizes::for_viewport(viewport);
        log::info!(
            "Resized to {}x{}: rays {} B, shadow rays {} B, intersections {} B",
            width,
            height,
            sizes.primary_rays,
            sizes.shadow_rays,
            sizes.intersections
        );
        Ok(())
    }

    /// Run one frame through the pipeline.
    ///
    /// Transient failures are reported as [`FrameOutcome::Skipped`] after the
    /// permit has been released. Calling this before [`resize`](Self::resize)
    /// is a precondition violation.
    pub fn draw_frame(&mut self) -> Result<FrameOutcome, PreconditionError> {
        let viewport = self.viewport.ok_or(PreconditionError::NotResized)?;

        // Acquiring
        let permit = self.acquire_permit();
        let target = match self.backend.acquire_target() {
            Ok(target) => target,
            Err(err) => {
                drop(permit);
                self.skipped += 1;
                log::warn!("Skipping frame {}: {}", self.ring.frame_index(), err);
                return Ok(FrameOutcome::Skipped(err));
            }
        };

        // Preparing
        let ticket = self.uniforms.prepare(&mut self.ring, viewport, &mut self.rng);
        let ctx = FrameContext { ticket, viewport };

        // Generating .. Accumulating, Presenting
        let slot = self.ring.slot_bytes(ticket.slot)?;
        let mut encoder = self.backend.begin_frame(&ctx, slot);
        for &pass in self.plan.passes() {
            self.backend.encode(&mut encoder, &ctx, pass, &target);
        }
        if let Err(err) = self.backend.submit(encoder, target, permit) {
            self.skipped += 1;
            log::error!("Frame {} was not submitted: {}", ticket.frame_index, err);
            return Ok(FrameOutcome::Skipped(err));
        }

        self.submitted += 1;
        self.last_frame_index = Some(ticket.frame_index);
        if self.config.log_interval_frames > 0 && self.submitted % self.config.log_interval_frames == 0 {
            let stats = self.stats();
            log::debug!(
                "Frames submitted {}, skipped {}, in flight {}, frame index {}",
                stats.submitted,
                stats.skipped,
                stats.gate.in_flight(),
                ticket.frame_index
            );
        }
        Ok(FrameOutcome::Submitted(ticket))
    }

    fn acquire_permit(&mut self) -> FramePermit {
        if let Some(permit) = self.gate.try_acquire() {
            return permit;
        }
        self.backend.wait_for_completion();
        self.gate.acquire()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Resize(u32, u32),
        Begin { frame_index: u32, slot: usize },
        Encode(Pass),
        Submit,
    }

    /// How submitted frames complete.
    enum Completion {
        /// Release the permit inside `submit`
        Immediate,
        /// Hand the permit to a worker thread that releases it later
        Worker(mpsc::Sender<(usize, FramePermit)>),
    }

    struct MockBackend {
        events: Vec<Event>,
        layout: RingLayout,
        failures: VecDeque<FrameError>,
        submit_failures: VecDeque<FrameError>,
        completion: Completion,
        outstanding_slots: Arc<Mutex<Vec<usize>>>,
    }

    impl MockBackend {
        fn immediate() -> Self {
            Self {
                events: Vec::new(),
                layout: default_layout(),
                failures: VecDeque::new(),
                submit_failures: VecDeque::new(),
                completion: Completion::Immediate,
                outstanding_slots: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Completes frames in order on another thread after `delay`.
        fn threaded(delay: Duration) -> (Self, thread::JoinHandle<()>) {
            let (tx, rx) = mpsc::channel::<(usize, FramePermit)>();
            let outstanding = Arc::new(Mutex::new(Vec::new()));
            let worker_outstanding = Arc::clone(&outstanding);
            let handle = thread::spawn(move || {
                for (slot, permit) in rx {
                    thread::sleep(delay);
                    {
                        let mut slots = worker_outstanding.lock();
                        let pos = slots.iter().position(|&s| s == slot).unwrap();
                        slots.remove(pos);
                    }
                    permit.release();
                }
            });
            let backend = Self {
                events: Vec::new(),
                layout: default_layout(),
                failures: VecDeque::new(),
                submit_failures: VecDeque::new(),
                completion: Completion::Worker(tx),
                outstanding_slots: outstanding,
            };
            (backend, handle)
        }

        fn frame_starts(&self) -> Vec<(u32, usize)> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::Begin { frame_index, slot } => Some((*frame_index, *slot)),
                    _ => None,
                })
                .collect()
        }
    }

    fn default_layout() -> RingLayout {
        let config = RendererConfig::default();
        RingLayout::new(config.max_frames_in_flight, config.uniform_alignment)
    }

    struct MockEncoder {
        slot: usize,
    }

    impl FrameBackend for MockBackend {
        type Target = ();
        type Encoder = MockEncoder;

        fn ring_layout(&self) -> RingLayout {
            self.layout
        }

        fn resize(&mut self, viewport: Viewport) {
            self.events.push(Event::Resize(viewport.width(), viewport.height()));
        }

        fn wait_for_completion(&mut self) {}

        fn wait_idle(&mut self) {}

        fn acquire_target(&mut self) -> Result<(), FrameError> {
            match self.failures.pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        fn begin_frame(&mut self, ctx: &FrameContext, slot: SlotBytes<'_>) -> MockEncoder {
            let uniforms: &crate::layout::Uniforms =
                bytemuck::from_bytes(&slot.uniforms[..crate::layout::Uniforms::SIZE as usize]);
            assert_eq!(uniforms.frame_index, ctx.ticket.frame_index);

            let mut outstanding = self.outstanding_slots.lock();
            assert!(
                !outstanding.contains(&ctx.ticket.slot),
                "slot {} reused while still in flight",
                ctx.ticket.slot
            );
            outstanding.push(ctx.ticket.slot);
            drop(outstanding);

            self.events.push(Event::Begin {
                frame_index: ctx.ticket.frame_index,
                slot: ctx.ticket.slot,
            });
            MockEncoder { slot: ctx.ticket.slot }
        }

        fn encode(&mut self, _encoder: &mut MockEncoder, _ctx: &FrameContext, pass: Pass, _target: &()) {
            self.events.push(Event::Encode(pass));
        }

        fn submit(&mut self, encoder: MockEncoder, _target: (), permit: FramePermit) -> Result<(), FrameError> {
            if let Some(err) = self.submit_failures.pop_front() {
                self.outstanding_slots.lock().retain(|&s| s != encoder.slot);
                drop(permit);
                return Err(err);
            }
            self.events.push(Event::Submit);
            match &self.completion {
                Completion::Immediate => {
                    let mut slots = self.outstanding_slots.lock();
                    slots.retain(|&s| s != encoder.slot);
                    drop(slots);
                    permit.release();
                }
                Completion::Worker(tx) => tx.send((encoder.slot, permit)).unwrap(),
            }
            Ok(())
        }
    }

    fn scheduler(backend: MockBackend, config: RendererConfig) -> FrameScheduler<MockBackend> {
        let scene = Scene::cornell_box().unwrap();
        FrameScheduler::new(backend, &scene, config.with_seed(3)).unwrap()
    }

    #[test]
    fn test_plan_order_three_bounces() {
        let plan = FramePlan::new(3);
        let passes = plan.passes();
        assert_eq!(passes.len(), 3 + 4 * 3);
        assert_eq!(passes[0], Pass::GeneratePrimaryRays);
        for bounce in 0..3u32 {
            let base = 1 + 4 * bounce as usize;
            assert_eq!(passes[base], Pass::IntersectNearest { bounce });
            assert_eq!(passes[base + 1], Pass::Shade { bounce });
            assert_eq!(passes[base + 2], Pass::IntersectShadow { bounce });
            assert_eq!(passes[base + 3], Pass::ShadowTest { bounce });
        }
        assert_eq!(passes[13], Pass::Accumulate);
        assert_eq!(passes[14], Pass::Present);
    }

    #[test]
    fn test_plan_without_bounces() {
        let plan = FramePlan::new(0);
        assert_eq!(
            plan.passes(),
            &[Pass::GeneratePrimaryRays, Pass::Accumulate, Pass::Present]
        );
    }

    #[test]
    fn test_draw_before_resize_is_precondition_error() {
        let mut scheduler = scheduler(MockBackend::immediate(), RendererConfig::default());
        assert_eq!(scheduler.draw_frame(), Err(PreconditionError::NotResized));
        assert_eq!(scheduler.stats().gate.acquired, 0);
    }

    #[test]
    fn test_degenerate_resize_rejected() {
        let mut scheduler = scheduler(MockBackend::immediate(), RendererConfig::default());
        assert!(matches!(
            scheduler.resize(0, 100),
            Err(PreconditionError::DegenerateViewport { .. })
        ));
        assert!(scheduler.backend().events.is_empty());
    }

    #[test]
    fn test_oversized_resize_rejected() {
        let mut scheduler = scheduler(MockBackend::immediate(), RendererConfig::default());
        assert!(matches!(
            scheduler.resize(u32::MAX, 1),
            Err(PreconditionError::ViewportTooLarge { .. })
        ));
        assert!(scheduler.backend().events.is_empty());
        assert_eq!(scheduler.draw_frame(), Err(PreconditionError::NotResized));
    }

    #[test]
    fn test_mismatched_backend_layout_fails_construction() {
        let scene = Scene::cornell_box().unwrap();
        let config = RendererConfig {
            max_frames_in_flight: 4,
            ..Default::default()
        };
        let result = FrameScheduler::new(MockBackend::immediate(), &scene, config);
        match result {
            Err(InitError::Precondition(PreconditionError::RingLayoutMismatch { scheduler, backend })) => {
                assert_eq!(scheduler.slot_count, 4);
                assert_eq!(backend.slot_count, 3);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("construction should fail"),
        }
    }

    #[test]
    fn test_submit_failure_is_reported_as_skipped() {
        let mut backend = MockBackend::immediate();
        backend.submit_failures.push_back(FrameError::DeviceLost("queue stopped".into()));
        let mut scheduler = scheduler(backend, RendererConfig::default());
        scheduler.resize(8, 8).unwrap();

        let first = scheduler.draw_frame().unwrap();
        assert_eq!(first, FrameOutcome::Skipped(FrameError::DeviceLost("queue stopped".into())));
        let stats = scheduler.stats();
        assert_eq!(stats.submitted, 0);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.last_frame_index, None);
        assert_eq!(stats.gate.in_flight(), 0);

        // The next frame takes the following slot
        let second = scheduler.draw_frame().unwrap();
        assert!(matches!(second, FrameOutcome::Submitted(t) if t.frame_index == 1 && t.slot == 1));
        assert_eq!(scheduler.stats().submitted, 1);
        let submits = scheduler.backend().events.iter().filter(|e| **e == Event::Submit).count();
        assert_eq!(submits, 1);
    }

    #[test]
    fn test_frame_index_counts_from_resize() {
        let mut scheduler = scheduler(MockBackend::immediate(), RendererConfig::default());
        scheduler.resize(32, 16).unwrap();

        for f in 0..7u32 {
            assert_eq!(scheduler.frame_index(), f);
            let outcome = scheduler.draw_frame().unwrap();
            match outcome {
                FrameOutcome::Submitted(ticket) => {
                    assert_eq!(ticket.frame_index, f);
                    assert_eq!(ticket.slot, f as usize % 3);
                    assert_eq!(ticket.uniform_offset, ticket.slot as u64 * scheduler.ring_layout().uniform_slot_size);
                }
                FrameOutcome::Skipped(err) => panic!("unexpected skip: {err}"),
            }
        }

        scheduler.resize(64, 64).unwrap();
        assert_eq!(scheduler.frame_index(), 0);
        scheduler.draw_frame().unwrap();
        assert_eq!(scheduler.stats().last_frame_index, Some(0));
    }

    #[test]
    fn test_each_frame_encodes_full_plan_in_order() {
        let mut scheduler = scheduler(MockBackend::immediate(), RendererConfig::default());
        scheduler.resize(8, 8).unwrap();
        scheduler.draw_frame().unwrap();

        let events = &scheduler.backend().events;
        assert_eq!(events[0], Event::Resize(8, 8));
        assert!(matches!(events[1], Event::Begin { frame_index: 0, slot: 0 }));
        let encoded: Vec<Pass> = events
            .iter()
            .filter_map(|e| match e {
                Event::Encode(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(encoded, FramePlan::new(3).passes());
        assert_eq!(events.last(), Some(&Event::Submit));
    }

    #[test]
    fn test_transient_failure_releases_permit_and_keeps_ring() {
        let mut backend = MockBackend::immediate();
        backend.failures.push_back(FrameError::SurfaceUnavailable("timeout".into()));
        backend.failures.push_back(FrameError::SurfaceLost);
        let mut scheduler = scheduler(backend, RendererConfig::default());
        scheduler.resize(16, 16).unwrap();

        let first = scheduler.draw_frame().unwrap();
        assert!(matches!(first, FrameOutcome::Skipped(FrameError::SurfaceUnavailable(_))));
        let second = scheduler.draw_frame().unwrap();
        assert_eq!(second, FrameOutcome::Skipped(FrameError::SurfaceLost));
        assert_eq!(scheduler.frame_index(), 0);

        let third = scheduler.draw_frame().unwrap();
        assert!(matches!(third, FrameOutcome::Submitted(t) if t.frame_index == 0 && t.slot == 0));

        let stats = scheduler.stats();
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.gate.acquired, 3);
        assert_eq!(stats.gate.released, 3);
    }

    #[test]
    fn test_repeated_failures_never_starve_gate() {
        let mut backend = MockBackend::immediate();
        for _ in 0..10 {
            backend.failures.push_back(FrameError::SurfaceOutdated);
        }
        let mut scheduler = scheduler(backend, RendererConfig::default());
        scheduler.resize(4, 4).unwrap();

        // More failures than gate capacity: a leaked permit would deadlock here.
        for _ in 0..10 {
            assert!(matches!(scheduler.draw_frame().unwrap(), FrameOutcome::Skipped(_)));
        }
        assert!(matches!(scheduler.draw_frame().unwrap(), FrameOutcome::Submitted(_)));
        assert_eq!(scheduler.stats().gate.in_flight(), 0);
    }

    #[test]
    fn test_pipelined_frames_never_share_a_slot() {
        let (backend, worker) = MockBackend::threaded(Duration::from_millis(2));
        let mut scheduler = scheduler(backend, RendererConfig::default());
        scheduler.resize(8, 8).unwrap();

        let mut max_in_flight = 0;
        for _ in 0..30 {
            scheduler.draw_frame().unwrap();
            let stats = scheduler.stats().gate;
            assert!(stats.in_flight() <= 3);
            assert!(stats.released <= stats.acquired);
            max_in_flight = max_in_flight.max(stats.in_flight());
        }
        assert!(max_in_flight >= 2, "frames never overlapped");

        let starts = scheduler.backend().frame_starts();
        for (i, (frame_index, slot)) in starts.iter().enumerate() {
            assert_eq!(*frame_index, i as u32);
            assert_eq!(*slot, i % 3);
        }

        scheduler.drain();
        assert_eq!(scheduler.stats().gate.in_flight(), 0);
        drop(scheduler);
        worker.join().unwrap();
    }

    #[test]
    fn test_resize_drains_outstanding_frames() {
        let (backend, worker) = MockBackend::threaded(Duration::from_millis(5));
        let mut scheduler = scheduler(backend, RendererConfig::default());
        scheduler.resize(8, 8).unwrap();
        for _ in 0..3 {
            scheduler.draw_frame().unwrap();
        }

        scheduler.resize(16, 8).unwrap();
        assert_eq!(scheduler.stats().gate.in_flight(), 0);
        assert!(scheduler.backend().outstanding_slots.lock().is_empty());
        assert_eq!(scheduler.frame_index(), 0);

        drop(scheduler);
        worker.join().unwrap();
    }
}
