// SPDX-License-Identifier: CEPL-1.0
pub use winit;

use prism_core::WindowCfg;
use winit::dpi::{LogicalSize, PhysicalSize};
use winit::window::{Window, WindowAttributes};

/// Attributes for the main window, from the `[window]` config section.
pub fn window_attributes(cfg: &WindowCfg) -> WindowAttributes {
    Window::default_attributes()
        .with_title(cfg.title.clone())
        .with_inner_size(LogicalSize::new(cfg.width.max(1), cfg.height.max(1)))
}

/// Framebuffer size in pixels as `(width, height)`.
pub fn framebuffer_size(window: &Window) -> (u32, u32) {
    let PhysicalSize { width, height } = window.inner_size();
    (width, height)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_take_title_and_size() {
        let cfg = WindowCfg {
            title: "viewer".into(),
            width: 640,
            height: 0,
        };
        let attrs = window_attributes(&cfg);
        assert_eq!(attrs.title, "viewer");
        assert_eq!(
            attrs.inner_size,
            Some(LogicalSize::new(640u32, 1u32).into())
        );
    }
}
