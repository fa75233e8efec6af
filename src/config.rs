use glam::UVec2;
use vulkanalia::vk;

pub const VALIDATION_ENABLED: bool = cfg!(debug_assertions);
pub const VALIDATION_LAYER: vk::ExtensionName =
    vk::ExtensionName::from_bytes(b"VK_LAYER_KHRONOS_validation");

pub const DEVICE_EXTENSIONS: &[vk::ExtensionName] = &[vk::KHR_SWAPCHAIN_EXTENSION.name];

// Replace with an index if the preferred GPU is detected incorrectly
pub const PHYSICAL_DEVICE_INDEX_OVERRIDE: Option<usize> = None;

pub const FRAMES_IN_FLIGHT: usize = 1;

pub const APPLICATION_NAME: &[u8] = b"LocalShadertoy\0";
pub const WINDOW_TITLE: &str = "Local Shadertoy";

// Initial swapchain request
pub const INITIAL_WIDTH: u32 = 1280;
pub const INITIAL_HEIGHT: u32 = 720;
pub const USE_VSYNC: bool = true;

pub const RENDER_TARGET_FORMAT: vk::Format = vk::Format::B8G8R8A8_SRGB;
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

pub const SHADERS_ROOT: &str = env!("SHADERS_ROOT");
pub const TEXTURES_ROOT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/resources/textures/");

pub const CHECKER_TEXTURE: &str = "shadertoy_checker.png";
pub const SKYBOX_FACE_COUNT: usize = 6;

pub fn skybox_face(index: usize) -> String {
    format!("shadertoy_skybox{index}.png")
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DesiredProperties {
    pub resolution: UVec2,
    pub vsync: bool,
}

impl DesiredProperties {
    pub fn initial() -> Self {
        Self {
            resolution: UVec2::new(INITIAL_WIDTH, INITIAL_HEIGHT),
            vsync: USE_VSYNC,
        }
    }
}

pub fn extent(resolution: UVec2) -> vk::Extent2D {
    vk::Extent2D {
        width: resolution.x,
        height: resolution.y,
    }
}
