// build.rs
// Optional SPIR-V compilation for the renderer's shaders
//
// The renderer loads `<name>.<stage>.spv` binaries at runtime. When GLSL
// sources are available, set OTTER_SHADER_SOURCE to their directory and the
// binaries are written next to them (or to OTTER_SHADER_OUTPUT).

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

const STAGES: [&str; 5] = ["vert", "frag", "rgen", "rmiss", "rchit"];

fn is_stale(source: &Path, output: &Path) -> bool {
    let modified = |path: &Path| std::fs::metadata(path).and_then(|meta| meta.modified()).ok();
    match (modified(source), modified(output)) {
        (Some(src), Some(dst)) => src > dst,
        _ => true,
    }
}

fn compile_shaders(source_dir: &Path, output_dir: &Path, glslc: &Path) -> usize {
    let entries = match std::fs::read_dir(source_dir) {
        Ok(entries) => entries,
        Err(e) => {
            println!("cargo:warning=Cannot read shader sources at {}: {}", source_dir.display(), e);
            return 0;
        }
    };

    let mut compiled = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_stage = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| STAGES.contains(&ext));
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !is_stage {
            continue;
        }

        let output = output_dir.join(format!("{file_name}.spv"));
        if !is_stale(&path, &output) {
            continue;
        }

        // Ray tracing stages need a Vulkan 1.2 target
        let status = Command::new(glslc)
            .arg("--target-env=vulkan1.2")
            .arg("-I")
            .arg(source_dir)
            .arg(&path)
            .arg("-o")
            .arg(&output)
            .status();

        match status {
            Ok(s) if s.success() => compiled += 1,
            Ok(s) => panic!("glslc failed for {} with exit code {:?}", path.display(), s.code()),
            Err(e) => panic!("Failed to run glslc at {}: {}", glslc.display(), e),
        }
    }
    compiled
}

fn glslc_path() -> PathBuf {
    match env::var("VULKAN_SDK") {
        Ok(sdk) if cfg!(target_os = "windows") => PathBuf::from(sdk).join("Bin").join("glslc.exe"),
        Ok(sdk) => PathBuf::from(sdk).join("bin").join("glslc"),
        Err(_) => PathBuf::from("glslc"),
    }
}

fn main() {
    println!("cargo:rerun-if-env-changed=OTTER_SHADER_SOURCE");
    println!("cargo:rerun-if-env-changed=OTTER_SHADER_OUTPUT");
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");

    let Ok(source) = env::var("OTTER_SHADER_SOURCE") else {
        return;
    };
    let source_dir = PathBuf::from(source);
    println!("cargo:rerun-if-changed={}", source_dir.display());

    let output_dir = env::var("OTTER_SHADER_OUTPUT").map_or_else(|_| source_dir.clone(), PathBuf::from);
    if let Err(e) = std::fs::create_dir_all(&output_dir) {
        println!("cargo:warning=Cannot create {}: {}", output_dir.display(), e);
        return;
    }

    let compiled = compile_shaders(&source_dir, &output_dir, &glslc_path());
    if compiled > 0 {
        println!("cargo:warning=Compiled {compiled} shader(s) into {}", output_dir.display());
    }
}
