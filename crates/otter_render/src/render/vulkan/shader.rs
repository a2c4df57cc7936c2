//! SPIR-V shader loading
//!
//! Shaders are compiled ahead of time to `<name>.<stage>.spv` files in the
//! configured shader directory. A missing or malformed binary is a hard
//! initialization failure.

use ash::{vk, Device};
use std::ffi::CStr;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::render::vulkan::{VulkanError, VulkanResult};

/// Every binary the renderer loads at startup
pub const REQUIRED_SHADERS: [&str; 7] = [
    "gbuffer.vert.spv",
    "gbuffer.frag.spv",
    "pbr.vert.spv",
    "pbr.frag.spv",
    "rt.rgen.spv",
    "rt.rmiss.spv",
    "rt.rchit.spv",
];

/// Shader entry point name
pub const ENTRY_POINT: &CStr = c"main";

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Shader loading errors
#[derive(Error, Debug)]
pub enum ShaderError {
    /// The file could not be read
    #[error("Failed to read shader {}: {source}", path.display())]
    Io {
        /// Path that was read
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// The file is not a SPIR-V module
    #[error("Malformed SPIR-V in {} ({len} bytes)", path.display())]
    Malformed {
        /// Path that was read
        path: PathBuf,
        /// File length in bytes
        len: usize,
    },
}

/// Decode SPIR-V words, checking length and magic number
pub fn parse_spirv(path: &Path, bytes: &[u8]) -> Result<Vec<u32>, ShaderError> {
    let malformed = || ShaderError::Malformed {
        path: path.to_path_buf(),
        len: bytes.len(),
    };

    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(malformed());
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    if words[0] != SPIRV_MAGIC {
        return Err(malformed());
    }
    Ok(words)
}

/// Shader module wrapper with RAII cleanup
pub struct ShaderModule {
    device: Device,
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Create shader module from SPIR-V words
    pub fn from_words(device: Device, words: &[u32]) -> VulkanResult<Self> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(words);

        let module = unsafe { device.create_shader_module(&create_info, None).map_err(VulkanError::Api)? };

        Ok(Self { device, module })
    }

    /// Load shader from a SPIR-V file
    pub fn from_file(device: Device, path: impl AsRef<Path>) -> VulkanResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| {
            log::error!("Failed to read shader {}: {}", path.display(), source);
            ShaderError::Io {
                path: path.to_path_buf(),
                source,
            }
        })?;

        let words = parse_spirv(path, &bytes).map_err(|e| {
            log::error!("{}", e);
            e
        })?;
        log::debug!("Loaded shader {} ({} bytes)", path.display(), bytes.len());
        Self::from_words(device, &words)
    }

    /// Get shader module handle
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Create shader stage create info with the `main` entry point
    pub fn stage_info(&self, stage: vk::ShaderStageFlags) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(stage)
            .module(self.module)
            .name(ENTRY_POINT)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_parse_valid_header() {
        let bytes = module_bytes(&[SPIRV_MAGIC, 0x0001_0500, 0, 1, 0]);
        let words = parse_spirv(Path::new("pbr.frag.spv"), &bytes).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn test_length_must_be_word_aligned() {
        let mut bytes = module_bytes(&[SPIRV_MAGIC, 0]);
        bytes.push(0);
        let err = parse_spirv(Path::new("gbuffer.vert.spv"), &bytes).unwrap_err();
        assert!(matches!(err, ShaderError::Malformed { len: 9, .. }));
        assert!(parse_spirv(Path::new("empty.spv"), &[]).is_err());
    }

    #[test]
    fn test_magic_number_is_checked() {
        let bytes = module_bytes(&[0xDEAD_BEEF, 0]);
        assert!(matches!(
            parse_spirv(Path::new("rt.rgen.spv"), &bytes),
            Err(ShaderError::Malformed { .. })
        ));
    }

    #[test]
    fn test_required_shaders_cover_every_stage() {
        for suffix in ["vert", "frag", "rgen", "rmiss", "rchit"] {
            assert!(REQUIRED_SHADERS.iter().any(|name| name.ends_with(&format!(".{suffix}.spv"))));
        }
    }
}
