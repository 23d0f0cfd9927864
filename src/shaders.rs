//! Ray tracing shader modules
//!
//! The GLSL sources live in `shaders/`. With the `shader-compiler` feature
//! they are compiled at runtime with shaderc; otherwise precompiled SPIR-V
//! is loaded from a directory:
//!
//! ```text
//! glslc --target-env=vulkan1.2 shaders/raygen.rgen -o raygen.rgen.spv
//! glslc --target-env=vulkan1.2 shaders/miss.rmiss -o miss.rmiss.spv
//! glslc --target-env=vulkan1.2 shaders/closesthit.rchit -o closesthit.rchit.spv
//! ```

use std::path::Path;

use crate::backend::{BackendError, ShaderStage};
use crate::error::RendererResult;
use crate::{BackendType, RendererConfig};

/// First word of every SPIR-V module
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

pub const RAYGEN_SOURCE: &str = include_str!("../shaders/raygen.rgen");
pub const MISS_SOURCE: &str = include_str!("../shaders/miss.rmiss");
pub const CLOSEST_HIT_SOURCE: &str = include_str!("../shaders/closesthit.rchit");

/// File names of the precompiled modules
const SPIRV_FILES: [(ShaderStage, &str); 3] = [
    (ShaderStage::RayGeneration, "raygen.rgen.spv"),
    (ShaderStage::Miss, "miss.rmiss.spv"),
    (ShaderStage::ClosestHit, "closesthit.rchit.spv"),
];

/// SPIR-V for the three stages of the pipeline
#[derive(Debug, Clone)]
pub struct ShaderLibrary {
    pub ray_generation: Vec<u32>,
    pub miss: Vec<u32>,
    pub closest_hit: Vec<u32>,
}

impl ShaderLibrary {
    pub fn from_modules(ray_generation: Vec<u32>, miss: Vec<u32>, closest_hit: Vec<u32>) -> RendererResult<Self> {
        for (words, stage) in [
            (&ray_generation, ShaderStage::RayGeneration),
            (&miss, ShaderStage::Miss),
            (&closest_hit, ShaderStage::ClosestHit),
        ] {
            if words.first() != Some(&SPIRV_MAGIC) {
                return Err(BackendError::ShaderCompileFailed(format!(
                    "{:?} module is not SPIR-V",
                    stage
                ))
                .into());
            }
        }
        Ok(Self {
            ray_generation,
            miss,
            closest_hit,
        })
    }

    /// Load `raygen.rgen.spv`, `miss.rmiss.spv` and `closesthit.rchit.spv` from `dir`
    pub fn from_spirv_dir(dir: &Path) -> RendererResult<Self> {
        let mut modules = Vec::with_capacity(SPIRV_FILES.len());
        for (stage, file) in SPIRV_FILES {
            let path = dir.join(file);
            let bytes = std::fs::read(&path).map_err(|e| {
                BackendError::ShaderCompileFailed(format!("{}: {}", path.display(), e))
            })?;
            log::debug!("Loaded {:?} shader from {}", stage, path.display());
            modules.push(spirv_words(&bytes, file)?);
        }
        let closest_hit = modules.pop().unwrap_or_default();
        let miss = modules.pop().unwrap_or_default();
        let ray_generation = modules.pop().unwrap_or_default();
        Self::from_modules(ray_generation, miss, closest_hit)
    }

    /// Compile the bundled GLSL sources
    #[cfg(feature = "shader-compiler")]
    pub fn compile_glsl() -> RendererResult<Self> {
        let compiler = shaderc::Compiler::new()
            .ok_or_else(|| BackendError::ShaderCompileFailed("shaderc compiler unavailable".to_string()))?;
        let mut options = shaderc::CompileOptions::new()
            .ok_or_else(|| BackendError::ShaderCompileFailed("shaderc options unavailable".to_string()))?;
        options.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_2 as u32);
        options.set_optimization_level(shaderc::OptimizationLevel::Performance);

        let compile = |source: &str, kind: shaderc::ShaderKind, name: &str| -> RendererResult<Vec<u32>> {
            let artifact = compiler
                .compile_into_spirv(source, kind, name, "main", Some(&options))
                .map_err(|e| BackendError::ShaderCompileFailed(format!("{}: {}", name, e)))?;
            if artifact.get_num_warnings() > 0 {
                log::warn!("{}: {}", name, artifact.get_warning_messages());
            }
            Ok(artifact.as_binary().to_vec())
        };

        Self::from_modules(
            compile(RAYGEN_SOURCE, shaderc::ShaderKind::RayGeneration, "raygen.rgen")?,
            compile(MISS_SOURCE, shaderc::ShaderKind::Miss, "miss.rmiss")?,
            compile(CLOSEST_HIT_SOURCE, shaderc::ShaderKind::ClosestHit, "closesthit.rchit")?,
        )
    }

    /// Header-only modules. The dummy backend never executes shaders, so
    /// these are enough to build a pipeline on it.
    pub fn placeholder() -> Self {
        Self {
            ray_generation: vec![SPIRV_MAGIC],
            miss: vec![SPIRV_MAGIC],
            closest_hit: vec![SPIRV_MAGIC],
        }
    }

    /// Use the configured SPIR-V directory, or compile the sources when
    /// no directory is set and the compiler is built in.
    pub fn load(config: &RendererConfig) -> RendererResult<Self> {
        if let Some(dir) = &config.shader_dir {
            return Self::from_spirv_dir(dir);
        }
        if config.backend == BackendType::Dummy {
            return Ok(Self::placeholder());
        }
        #[cfg(feature = "shader-compiler")]
        {
            Self::compile_glsl()
        }
        #[cfg(not(feature = "shader-compiler"))]
        {
            Err(BackendError::ShaderCompileFailed(
                "no shader directory configured and the shader-compiler feature is disabled".to_string(),
            )
            .into())
        }
    }
}

/// Reinterpret a little-endian SPIR-V file as words
fn spirv_words(bytes: &[u8], name: &str) -> RendererResult<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(BackendError::ShaderCompileFailed(format!(
            "{}: size {} is not a multiple of 4",
            name,
            bytes.len()
        ))
        .into());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spirv_words() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        assert_eq!(spirv_words(&bytes, "test").unwrap(), vec![SPIRV_MAGIC, 1]);
        assert!(spirv_words(&bytes[..5], "test").is_err());
    }

    #[test]
    fn test_non_spirv_rejected() {
        let result = ShaderLibrary::from_modules(vec![SPIRV_MAGIC], vec![0xdead_beef], vec![SPIRV_MAGIC]);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_dir_reports_path() {
        let error = ShaderLibrary::from_spirv_dir(Path::new("/nonexistent/shaders")).unwrap_err();
        assert!(error.to_string().contains("raygen.rgen.spv"));
    }

    #[test]
    fn test_sources_bundled() {
        assert!(RAYGEN_SOURCE.contains("traceRayEXT"));
        assert!(CLOSEST_HIT_SOURCE.contains("shadingMode"));
        assert!(MISS_SOURCE.contains("rayPayloadInEXT"));
    }
}
