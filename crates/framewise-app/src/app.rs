//! `FramewiseApp` trait definition.

use std::sync::Arc;

use framewise_core::Extent;
use framewise_render::{PipelineDescription, RenderObject};
use winit::event::{DeviceEvent, DeviceId, WindowEvent};

use crate::context::AppContext;
use crate::frame::FrameContext;

/// Trait for Framewise applications.
///
/// The framework creates the window, GPU context and renderer, brackets
/// every frame with `prep_next_frame`/`swap`, and records whatever
/// [`FramewiseApp::objects`] returns.
pub trait FramewiseApp: Sized {
    /// Pipelines compiled at startup.
    ///
    /// Called once before [`FramewiseApp::init`]. Default: none.
    fn pipelines() -> Vec<PipelineDescription> {
        Vec::new()
    }

    /// Initialize the application.
    ///
    /// No frame is prepared yet; create resources and objects here and
    /// upload textures from the first [`FramewiseApp::update`].
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state for the prepared frame.
    ///
    /// Resource writes and texture uploads belong here; they are drawn by
    /// this same frame.
    fn update(&mut self, ctx: &mut AppContext, frame: &FrameContext) -> anyhow::Result<()>;

    /// Objects to draw this frame, in order.
    fn objects(&self) -> &[Arc<RenderObject>];

    /// Handle a window resize. The swapchain follows automatically.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, extent: Extent) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle a window event. Return `true` to stop further processing.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Handle a raw device event.
    #[allow(unused_variables)]
    fn on_device_event(&mut self, device_id: DeviceId, event: &DeviceEvent) {}

    /// Release resources before shutdown. The GPU is idle.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
