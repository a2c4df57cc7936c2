//! End-to-end rendering on a real device
//!
//! Needs a ray tracing capable GPU, a display and compiled shaders in
//! `shaders/` (or `OTTER_SHADER_DIR`). Run with `cargo test -- --ignored`.

use otter_render::prelude::*;
use std::sync::Arc;

fn test_config() -> RendererConfig {
    let shader_directory = std::env::var("OTTER_SHADER_DIR").unwrap_or_else(|_| "shaders".to_string());
    RendererConfig::new("otter_render gpu test")
        .with_shader_directory(shader_directory)
        .with_window("otter_render gpu test", 640, 360)
        .with_frames_in_flight(2)
        .with_worker_threads(4)
}

#[test]
#[ignore = "requires a ray tracing GPU, a display and compiled shaders"]
fn renders_static_scene_with_shadows() {
    let config = test_config();
    let mut window = Window::new(&config.window_title, config.window_width, config.window_height).unwrap();
    let mut renderer = RenderInstance::new(&config, &mut window).unwrap();
    assert!(renderer.frames_in_flight() >= 1);
    assert!(renderer.frames_in_flight() <= 2);

    let cube = renderer.upload_mesh(&Mesh::cube(1.0)).unwrap();
    let ground = renderer.upload_mesh(&Mesh::plane(20.0)).unwrap();
    let red = Arc::new(Material::new().with_color(0.8, 0.1, 0.1, 1.0));
    let grey = Arc::new(Material::new().with_roughness(0.9));

    renderer.set_camera(Transform::from_position(Vec3::new(0.0, 2.0, 6.0)));
    assert!(!renderer.acceleration_structure_built());

    let mut presented = 0;
    for frame in 0..4 {
        let start = renderer.current_frame();
        renderer
            .queue_mesh_draw(&cube, Arc::clone(&red), Transform::from_position(Vec3::new(0.0, 0.5, 0.0)).to_matrix())
            .unwrap();
        renderer
            .queue_mesh_draw(&ground, Arc::clone(&grey), Transform::identity().to_matrix())
            .unwrap();
        if renderer.draw().unwrap() {
            presented += 1;
            assert_eq!(renderer.current_frame(), (start + 1) % renderer.frames_in_flight());
            assert!(renderer.acceleration_structure_built(), "frame {frame} drew without a scene");
        }
    }
    assert!(presented > 0);

    renderer.invalidate_acceleration_structure().unwrap();
    assert!(!renderer.acceleration_structure_built());

    // Meshes go before the device that owns their memory
    renderer.context().wait_idle().unwrap();
    drop((cube, ground));
    drop(renderer);
}
