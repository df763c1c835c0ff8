//! Application context.

use std::sync::Arc;
use std::time::Instant;

use framewise_core::Extent;
use framewise_render::Renderer;
use winit::window::Window;

/// State shared with every [`FramewiseApp`](crate::FramewiseApp) callback.
pub struct AppContext {
    /// Renderer owning the swapchain and all GPU resources.
    ///
    /// Declared before the window so the surface is destroyed first.
    pub renderer: Renderer,
    /// The window handle.
    pub window: Arc<Window>,
    /// Frames presented so far.
    pub frame_count: u64,
    pub(crate) last_frame_time: Instant,
}

impl AppContext {
    pub(crate) fn new(renderer: Renderer, window: Arc<Window>) -> Self {
        Self {
            renderer,
            window,
            frame_count: 0,
            last_frame_time: Instant::now(),
        }
    }

    /// Current drawable size of the window; empty while minimised.
    pub fn extent(&self) -> Extent {
        let size = self.window.inner_size();
        Extent::new(size.width, size.height)
    }
}
