use std::time::Instant;

use glam::{UVec2, Vec2};
use winit::dpi::{PhysicalPosition, PhysicalSize};

use crate::frame::WindowState;

/// Window state the frame loop reads, kept current from winit events.
pub struct WindowInput {
    extent: UVec2,
    cursor: Vec2,
    start: Instant,
}

impl WindowInput {
    pub fn new(size: PhysicalSize<u32>) -> Self {
        Self {
            extent: UVec2::new(size.width, size.height),
            cursor: Vec2::ZERO,
            start: Instant::now(),
        }
    }

    pub fn resized(&mut self, size: PhysicalSize<u32>) {
        self.extent = UVec2::new(size.width, size.height);
    }

    pub fn cursor_moved(&mut self, position: PhysicalPosition<f64>) {
        self.cursor = Vec2::new(position.x as f32, position.y as f32);
    }
}

impl WindowState for WindowInput {
    fn extent(&self) -> UVec2 {
        self.extent
    }

    fn cursor_position(&self) -> Vec2 {
        self.cursor
    }

    fn elapsed_seconds(&self) -> f32 {
        self.start.elapsed().as_secs_f32()
    }
}
