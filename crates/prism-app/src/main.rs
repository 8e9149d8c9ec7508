// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::Result;
use clap::Parser;
use prism_core::{init_tracing, EngineConfig, FrameClock, PresentModeCfg};
use prism_platform::{framebuffer_size, window_attributes};
use prism_render::{RenderSize, Renderer};
use prism_render_vk::VkRenderer;
use std::path::PathBuf;
use tracing::{error, info, warn};

use prism_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    raw_window_handle::{HasDisplayHandle, HasWindowHandle},
    window::{Window, WindowId},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine config file
    #[arg(long, default_value = prism_core::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Initial window width, overrides the config
    #[arg(long)]
    width: Option<u32>,
    /// Initial window height, overrides the config
    #[arg(long)]
    height: Option<u32>,
}

struct App {
    cfg: EngineConfig,
    window: Option<Window>,
    renderer: Option<VkRenderer>,
    render_size: RenderSize,
    clock: FrameClock,
    exiting: bool,
    paused: bool,
    occluded: bool,
}

impl App {
    fn new(cfg: EngineConfig) -> Self {
        App {
            cfg,
            window: None,
            renderer: None,
            render_size: RenderSize::new(1, 1),
            clock: FrameClock::new(),
            exiting: false,
            paused: false,
            occluded: false,
        }
    }

    fn init_renderer(&self, window: &Window) -> Result<VkRenderer> {
        let wh = window.window_handle()?;
        let dh = window.display_handle()?;
        let mut renderer = VkRenderer::new(&wh, &dh, self.render_size, &self.cfg.render)?;
        renderer.set_clear_color(self.cfg.render.clear_color);
        Ok(renderer)
    }

    fn update_paused(&mut self) {
        let now_paused = self.occluded || self.render_size.is_zero_area();
        if now_paused != self.paused {
            self.paused = now_paused;
            info!("paused={}", self.paused);
            self.clock.reset_count();
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            let window = match event_loop.create_window(window_attributes(&self.cfg.window)) {
                Ok(w) => w,
                Err(e) => {
                    error!("create_window failed: {e}");
                    event_loop.exit();
                    return;
                }
            };

            let (width, height) = framebuffer_size(&window);
            self.render_size = RenderSize::new(width.max(1), height.max(1));

            match self.init_renderer(&window) {
                Ok(r) => {
                    info!("backend = vk");
                    self.renderer = Some(r);
                }
                // keep the window up without rendering
                Err(e) => error!("vk init failed: {e:#}; rendering disabled"),
            }
            self.window = Some(window);
            self.clock = FrameClock::new();
        }

        event_loop.set_control_flow(match self.cfg.render.present_mode {
            PresentModeCfg::Fifo => ControlFlow::Wait,
            PresentModeCfg::Mailbox | PresentModeCfg::Immediate => ControlFlow::Poll,
        });
        self.update_paused();
        if !self.paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.exiting = true;
                self.renderer = None;
                self.window = None;
                event_loop.exit();
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = RenderSize::new(new_size.width, new_size.height);
                info!(
                    "Resized → {}x{}",
                    self.render_size.width, self.render_size.height
                );
                self.update_paused();
                if let Some(r) = &mut self.renderer {
                    r.resize(self.render_size);
                }
                if !self.paused {
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }

            WindowEvent::Occluded(occluded) => {
                self.occluded = occluded;
                self.update_paused();
            }

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }
                let dt = self.clock.tick();
                if let Some(r) = &mut self.renderer {
                    match r.render(dt) {
                        Ok(()) => {
                            self.clock.frame_presented();
                        }
                        Err(e) => {
                            error!("render error: {e:#}; rendering disabled");
                            self.renderer = None;
                        }
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        if self.paused || self.renderer.is_none() {
            event_loop.set_control_flow(ControlFlow::Wait);
            return;
        }
        // presentation paces the loop; ask for the next frame right away
        if let Some(w) = &self.window {
            w.request_redraw();
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut cfg = EngineConfig::load_or_default(&args.config);
    if let Some(w) = args.width {
        cfg.window.width = w;
    }
    if let Some(h) = args.height {
        cfg.window.height = h;
    }
    if cfg.window.width == 0 || cfg.window.height == 0 {
        warn!("zero-sized window requested; using 1 pixel minimum");
    }

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg);
    event_loop.run_app(&mut app)?;
    Ok(())
}
