//! Application framework for the Framewise engine.
//!
//! This crate handles the boilerplate around the renderer:
//! - Window creation and management
//! - GPU context and renderer initialization
//! - The per-frame prep, update, record and swap sequence
//! - Event loop handling
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use framewise_app::{run_app, AppConfig, AppContext, FrameContext, FramewiseApp};
//! use framewise_render::RenderObject;
//!
//! struct MyApp {
//!     objects: Vec<Arc<RenderObject>>,
//! }
//!
//! impl FramewiseApp for MyApp {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp { objects: Vec::new() })
//!     }
//!
//!     fn update(&mut self, _ctx: &mut AppContext, _frame: &FrameContext) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//!
//!     fn objects(&self) -> &[Arc<RenderObject>] {
//!         &self.objects
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::new("My App"))
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;

pub use app::FramewiseApp;
pub use context::AppContext;
pub use frame::FrameContext;
pub use runner::{run_app, AppConfig};

pub use framewise_gpu::{GpuContext, GpuContextBuilder};
pub use framewise_render::{Renderer, RendererConfig};
pub use winit::event::{DeviceEvent, DeviceId, WindowEvent};
