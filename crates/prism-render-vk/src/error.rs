// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;

use crate::cache::ResourceId;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("{op} failed: {result}")]
    Vk {
        op: &'static str,
        result: vk::Result,
    },
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("allocation is not host mapped")]
    NotMapped,
    #[error("surface format {format:?}/{color_space:?} is not supported on this device")]
    UnsupportedSurfaceFormat {
        format: vk::Format,
        color_space: vk::ColorSpaceKHR,
    },
    #[error("present mode {0:?} is not supported on this device")]
    UnsupportedPresentMode(vk::PresentModeKHR),
    #[error("swapchain is out of date")]
    OutOfDate,
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("render target has no {0} attachment")]
    MissingAttachment(&'static str),
    #[error("no depth/stencil attachment format is supported on this device")]
    NoDepthFormat,
    #[error("cache slot {slot} of {id:?} holds a resource of another type")]
    CacheTypeMismatch { id: ResourceId, slot: usize },
    #[error("cache slot {slot} of {id:?} was reserved but never filled")]
    CacheSlotVacant { id: ResourceId, slot: usize },
    #[error("{what} count {count} does not fit a 32-bit index")]
    TooManyElements { what: &'static str, count: usize },
    #[error("scope index {index} out of range (issued {issued})")]
    ScopeIndexOutOfRange { index: usize, issued: usize },
}

impl GpuError {
    /// Maps a raw Vulkan result, keeping the conditions the frame loop reacts to distinct.
    pub fn vk(op: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => GpuError::OutOfDate,
            vk::Result::TIMEOUT | vk::Result::NOT_READY => GpuError::Timeout(op),
            result => GpuError::Vk { op, result },
        }
    }

    pub fn is_out_of_date(&self) -> bool {
        matches!(self, GpuError::OutOfDate)
    }
}

pub type GpuResult<T> = Result<T, GpuError>;

pub(crate) trait VkResultExt<T> {
    fn op(self, op: &'static str) -> GpuResult<T>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn op(self, op: &'static str) -> GpuResult<T> {
        self.map_err(|result| GpuError::vk(op, result))
    }
}
