//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use framewise_core::Extent;
use framewise_gpu::GpuContextBuilder;
use framewise_render::{Renderer, RendererConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
#[cfg(feature = "profiling-tracy")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::FramewiseApp;
use crate::context::AppContext;
use crate::frame::FrameContext;

/// Application configuration.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Enable vsync.
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Renderer settings; `vsync` above overrides its field.
    pub renderer: RendererConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Framewise".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: true,
            validation: cfg!(debug_assertions),
            renderer: RendererConfig::default(),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    #[must_use]
    pub const fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the target FPS.
    #[must_use]
    pub const fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Enable or disable vsync.
    #[must_use]
    pub const fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub const fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Set frames in flight.
    #[must_use]
    pub const fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.renderer = self.renderer.with_frames_in_flight(frames);
        self
    }

    /// Set the number of recording workers.
    #[must_use]
    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.renderer = self.renderer.with_worker_threads(workers);
        self
    }

    /// Set the clear color.
    #[must_use]
    pub const fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.renderer = self.renderer.with_clear_color(color);
        self
    }

    fn renderer_config(&self) -> RendererConfig {
        self.renderer.with_vsync(self.vsync)
    }
}

fn init_tracing() {
    #[cfg(feature = "profiling-tracy")]
    {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,framewise_app=trace,framewise_render=trace,framewise_gpu=trace")
        });

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .try_init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .try_init();
    }
}

/// Run a [`FramewiseApp`] with the given configuration.
///
/// Initializes logging, creates the window, GPU context and renderer, and
/// runs the event loop until the window closes or a frame fails.
pub fn run_app<A: FramewiseApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    init_tracing();
    config.renderer_config().validate()?;

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        failure: None,
    };

    event_loop.run_app(&mut runner)?;

    match runner.failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct AppRunner<A: FramewiseApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    failure: Option<anyhow::Error>,
}

struct AppState<A: FramewiseApp> {
    // Dropped before ctx so the app releases its objects first
    app: A,
    ctx: AppContext,
    target_frame_time: Option<Duration>,
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl<A: FramewiseApp + 'static> AppRunner<A> {
    fn fail(&mut self, event_loop: &ActiveEventLoop, context: &str, e: anyhow::Error) {
        error!("{context}: {e:#}");
        if let Some(mut state) = self.state.take() {
            state.cleanup();
        }
        self.failure.get_or_insert(e);
        event_loop.exit();
    }

    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let gpu = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .build(&*window)?;

        let size = window.inner_size();
        let renderer = Renderer::new(
            Arc::new(gpu),
            self.config.renderer_config(),
            Extent::new(size.width, size.height),
            &A::pipelines(),
        )?;

        let mut ctx = AppContext::new(renderer, window);
        let app = A::init(&mut ctx)?;

        let target_frame_time = self
            .config
            .target_fps
            .filter(|fps| *fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)));

        Ok(AppState {
            app,
            ctx,
            target_frame_time,
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        })
    }
}

impl<A: FramewiseApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => self.fail(event_loop, "Failed to initialize application", e),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(mut state) = self.state.take() {
                    state.cleanup();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                match state.render_frame() {
                    Ok(()) => state.ctx.window.request_redraw(),
                    Err(e) => self.fail(event_loop, "Render error", e),
                }
            }
            WindowEvent::Resized(size) => {
                let Some(state) = &mut self.state else {
                    return;
                };
                if let Err(e) = state.handle_resize(Extent::new(size.width, size.height)) {
                    self.fail(event_loop, "Resize error", e);
                }
            }
            _ => {}
        }
    }

    fn device_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        device_id: DeviceId,
        event: DeviceEvent,
    ) {
        if let Some(state) = &mut self.state {
            state.app.on_device_event(device_id, &event);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: FramewiseApp> AppState<A> {
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();
        let extent = self.ctx.extent();

        let frame = {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.prep").entered();
            self.ctx.renderer.prep_next_frame(extent)?
        };
        // Minimised: nothing to draw until the window has area again
        let Some(frame) = frame else {
            return Ok(());
        };

        let dt = {
            let now = Instant::now();
            let dt = now.duration_since(self.ctx.last_frame_time).as_secs_f32();
            self.ctx.last_frame_time = now;

            if dt > 0.0 {
                let fps = 1.0 / f64::from(dt);
                self.min_fps = self.min_fps.min(fps);
                self.max_fps = self.max_fps.max(fps);
                self.fps_sum += fps;
            }
            dt
        };

        let frame_ctx = FrameContext {
            dt,
            frame_number: frame.frame_number,
            slot: frame.slot.slot(),
            extent: frame.extent,
        };

        {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.update").entered();
            self.app.update(&mut self.ctx, &frame_ctx)?;
        }

        {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.record").entered();
            self.ctx
                .renderer
                .process_objects(self.app.objects(), frame.extent)?;
        }

        {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.swap").entered();
            self.ctx.renderer.swap(extent)?;
        }
        self.ctx.frame_count += 1;

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                #[cfg(feature = "profiling-tracy")]
                let _span = tracing::trace_span!("frame.pacing").entered();
                thread::sleep(target - elapsed);
            }
        }

        Ok(())
    }

    fn handle_resize(&mut self, extent: Extent) -> anyhow::Result<()> {
        if extent.is_empty() {
            return Ok(());
        }

        // The swapchain is rebuilt by the next prep_next_frame
        self.app.on_resize(&mut self.ctx, extent)?;

        info!("Resized to {}", extent);
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    fn cleanup(&mut self) {
        if self.ctx.frame_count > 0 {
            let avg_fps = self.fps_sum / self.ctx.frame_count as f64;
            info!("FPS Statistics:");
            info!("  Min: {:.1}", self.min_fps);
            info!("  Max: {:.1}", self.max_fps);
            info!("  Avg: {:.1}", avg_fps);
            info!("  Total frames: {}", self.ctx.frame_count);
        }

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.renderer.wait_idle() {
            error!("Failed to wait idle: {e}");
        }

        self.app.cleanup(&mut self.ctx);

        info!("Cleanup complete");
    }
}
