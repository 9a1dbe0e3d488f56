//! Vulkan execution core built on [`ash`].
//!
//! Owns device, queue and command buffer lifecycles, fences and semaphores,
//! swapchain acquisition and presentation, render pass and pipeline
//! construction, and the frames-in-flight submission protocol.
//!
//! # Object hierarchy
//!
//! ```text
//! Instance
//! ├── Surface<T>
//! │   └── Swapchain<T> (SwapchainImages + ImageViews)
//! └── Device
//!     ├── Queue (graphics / compute / transfer roles)
//!     ├── CommandPool → CommandBuffer
//!     ├── Fence / Semaphore → FramesInFlight
//!     ├── RenderPass → Framebuffer
//!     ├── DescriptorSetLayout → DescriptorPool → DescriptorSet
//!     ├── PipelineLayout, ShaderModule → EntryPoint → Pipeline
//!     ├── PipelineCache
//!     ├── HostVisibleBuffer / DeviceLocalBuffer
//!     └── DeviceLocalImage / ImageView / Sampler / Texture
//! ```
//!
//! Each wrapper holds its parent via `Arc` so parents cannot be destroyed
//! while children are alive. Every device-level call goes through the
//! [`dispatch::DeviceDispatch`] table held by the [`device::Device`].
//!
//! # Naming conventions
//!
//! | prefix  | meaning                                   |
//! |---------|-------------------------------------------|
//! | `raw_*` | accepts or returns a raw `ash::vk` handle |
//! | `ash_*` | returns the `ash` wrapper object          |

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod dispatch;
pub mod frame;
pub mod image;
pub mod instance;
pub mod pipeline;
pub mod pipeline_cache;
pub mod queue;
pub mod render_pass;
pub mod sampler;
pub mod shader;
pub mod status;
pub mod surface;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
mod testing;

pub use ash;
pub use raw_window_handle::HandleError as RwhHandleError;
