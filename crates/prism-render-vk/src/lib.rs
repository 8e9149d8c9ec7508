// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Vulkan frame lifecycle: swapchain and per-slot synchronization, command
//! pools, staging uploads, swapchain-bound resources and the per-frame
//! update/render/present sequence.
//!
//! The `testing` feature exposes a host-only recording device for tests.

mod ash_device;
pub mod bootstrap;
pub mod buffer;
pub mod cache;
pub mod camera;
pub mod command;
pub mod device;
pub mod engine;
mod error;
pub mod frame;
pub mod mesh;
pub mod render_target;
mod renderer;
pub mod scene;
pub mod staging;
pub mod swapchain;
pub mod system;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod uniforms;

pub use ash_device::AshDevice;
pub use buffer::Buffer;
pub use cache::{ResourceId, SwapchainBoundCache};
pub use camera::Camera;
pub use command::{CommandPool, Scope};
pub use device::Device;
pub use engine::{Engine, EngineSettings, TickOutcome};
pub use error::{GpuError, GpuResult};
pub use frame::{FrameOrchestrator, FrameStatus};
pub use mesh::{Mesh, Vertex};
pub use render_target::{RenderTarget, RenderTargetFlags};
pub use renderer::VkRenderer;
pub use scene::Scene;
pub use staging::StagingBuffer;
pub use swapchain::{AcquiredFrame, Swapchain, SwapchainSettings, FRAMES_IN_FLIGHT};
pub use system::{ClearSystem, DrawSystem, FrameInfo, PresentSystem, RenderContext, UpdateContext};
pub use uniforms::{CommonUniformSystem, CommonUniforms};

pub use ash::vk;
