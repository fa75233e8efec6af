mod commands;
mod config;
mod device;
mod frame;
mod passes;
mod program;
mod renderer;
mod resources;
mod swapchain;
mod texture;
mod tracker;
mod window;

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{Error, Result};
use winit::event::{Event, WindowEvent};
use winit::event_loop::EventLoop;
use winit::window::{Window, WindowBuilder};

use crate::config::{DesiredProperties, WINDOW_TITLE};
use crate::device::Gpu;
use crate::frame::{FrameOrchestrator, FrameOutcome};
use crate::renderer::Renderer;
use crate::window::WindowInput;

/// Field order is drop order: everything created from the device goes before
/// `gpu`.
struct App {
    orchestrator: FrameOrchestrator,
    input: WindowInput,
    renderer: Renderer,
    gpu: Gpu,
}

impl App {
    unsafe fn create(window: &Window) -> Result<Self> {
        let desired = DesiredProperties::initial();

        let gpu = Gpu::create(window)?;
        let renderer = Renderer::create(&gpu, desired)?;
        let orchestrator = FrameOrchestrator::new(renderer.resolution(), desired.vsync);
        let input = WindowInput::new(window.inner_size());

        let resolution = orchestrator.resolution();
        log::info!("Rendering at {}x{}", resolution.x, resolution.y);

        Ok(Self {
            orchestrator,
            input,
            renderer,
            gpu,
        })
    }

    fn render(&mut self) -> Result<FrameOutcome> {
        self.orchestrator.tick(&mut self.renderer, &self.input)
    }
}

impl Drop for App {
    fn drop(&mut self) {
        if let Err(e) = self.gpu.wait_idle() {
            log::error!("Failed to wait for the device before teardown: {e:#}");
        }
    }
}

/// Turns the error that stopped the event loop, if any, into the process result.
fn exit_status(fatal: Option<Error>) -> Result<()> {
    match fatal {
        Some(error) => Err(error.context("Rendering stopped on a fatal error")),
        None => Ok(()),
    }
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let desired = DesiredProperties::initial();

    let event_loop = EventLoop::new()?;
    let window = WindowBuilder::new()
        .with_title(WINDOW_TITLE)
        .with_inner_size(winit::dpi::PhysicalSize::new(
            desired.resolution.x,
            desired.resolution.y,
        ))
        .with_resizable(false)
        .build(&event_loop)?;

    let mut app = Some(unsafe { App::create(&window)? });
    let fatal = Rc::new(RefCell::new(None));
    let loop_fatal = Rc::clone(&fatal);

    event_loop.run(move |event, target| {
        let Some(running) = app.as_mut() else {
            return;
        };

        match event {
            Event::WindowEvent {
                event: WindowEvent::CloseRequested,
                ..
            } => {
                app = None;
                target.exit();
            }
            Event::WindowEvent {
                event: WindowEvent::Resized(size),
                ..
            } => running.input.resized(size),
            Event::WindowEvent {
                event: WindowEvent::CursorMoved { position, .. },
                ..
            } => running.input.cursor_moved(position),
            Event::WindowEvent {
                event: WindowEvent::RedrawRequested,
                ..
            } => {
                if let Err(e) = running.render() {
                    log::error!(
                        "Fatal error while {:?}: {e:#}",
                        running.orchestrator.state()
                    );
                    // Dropping the app waits for the device before teardown.
                    app = None;
                    *loop_fatal.borrow_mut() = Some(e);
                    target.exit();
                }
            }
            Event::AboutToWait => {
                window.request_redraw();
            }
            _ => {}
        }
    })?;

    let fatal = fatal.borrow_mut().take();
    exit_status(fatal)
}
