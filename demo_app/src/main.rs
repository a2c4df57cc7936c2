//! Otter demo: a cube casting a ray-traced shadow onto a ground plane
//!
//! Reads `demo.toml` from the working directory when present. The camera
//! orbits the scene; the geometry itself is static so the acceleration
//! structure is built once.

use otter_render::config::ConfigError;
use otter_render::foundation::logging;
use otter_render::prelude::*;
use otter_render::render::vulkan::window::WindowError;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

const CONFIG_PATH: &str = "demo.toml";
const ORBIT_RADIUS: f32 = 6.0;
const ORBIT_HEIGHT: f32 = 2.5;
const ORBIT_SPEED: f32 = 0.3;

#[derive(Error, Debug)]
enum DemoError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Window error: {0}")]
    Window(#[from] WindowError),

    #[error("Renderer error: {0}")]
    Render(#[from] VulkanError),
}

fn orbit_camera(seconds: f32) -> Transform {
    let angle = seconds * ORBIT_SPEED;
    Transform::from_position(Vec3::new(
        angle.sin() * ORBIT_RADIUS,
        ORBIT_HEIGHT,
        angle.cos() * ORBIT_RADIUS,
    ))
    .with_rotation(Vec3::new(-0.35, angle, 0.0))
}

fn run() -> Result<(), DemoError> {
    let config = RendererConfig::load_or_default(CONFIG_PATH)?;
    logging::init_with_config(&config.log);
    config.validate()?;

    let mut window = Window::new(&config.window_title, config.window_width, config.window_height)?;
    let mut renderer = RenderInstance::new(&config, &mut window)?;

    let cube = renderer.upload_mesh(&Mesh::cube(1.0))?;
    let ground = renderer.upload_mesh(&Mesh::plane(20.0))?;
    let cube_material = Arc::new(Material::new().with_color(0.9, 0.3, 0.2, 1.0).with_roughness(0.4));
    let ground_material = Arc::new(Material::new().with_color(0.7, 0.7, 0.7, 1.0).with_roughness(0.9));
    let cube_transform = Transform::from_position(Vec3::new(0.0, 0.5, 0.0)).to_matrix();
    let ground_transform = Transform::identity().to_matrix();

    let start = Instant::now();
    let mut frames = 0u64;
    while window.should_continue() {
        if window.take_resized() {
            renderer.handle_resize(&window);
        }

        renderer.set_camera(orbit_camera(start.elapsed().as_secs_f32()));
        renderer.queue_mesh_draw(&cube, Arc::clone(&cube_material), cube_transform)?;
        renderer.queue_mesh_draw(&ground, Arc::clone(&ground_material), ground_transform)?;
        if renderer.draw()? {
            frames += 1;
        }
    }

    let elapsed = start.elapsed().as_secs_f32();
    log::info!(
        "Presented {} frames in {:.1}s ({:.1} fps)",
        frames,
        elapsed,
        frames as f32 / elapsed.max(f32::EPSILON)
    );

    // Meshes must be released while the device is still alive
    renderer.context().wait_idle()?;
    drop((cube, ground));
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        log::error!("{}", e);
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
