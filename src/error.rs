//! Renderer error types

use thiserror::Error;

use crate::backend::BackendError;

/// Errors surfaced by renderer operations
#[derive(Error, Debug)]
pub enum RendererError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("Invalid scene: {0}")]
    InvalidScene(String),
    #[error("Acceleration structure build failed: {0}")]
    AsBuildFailed(String),
    #[error("Shader binding table error: {0}")]
    ShaderBindingTable(String),
    #[error("Frame state error: {0}")]
    FrameState(String),
    #[error("Failed to capture frame: {0}")]
    Capture(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RendererResult<T> = Result<T, RendererError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_is_transparent() {
        let error: RendererError = BackendError::ShaderCompileFailed("raygen.rgen".into()).into();
        assert_eq!(error.to_string(), "Failed to compile shader: raygen.rgen");
    }

    #[test]
    fn test_error_display() {
        let error = RendererError::InvalidScene("mesh 0 has no triangles".into());
        assert_eq!(error.to_string(), "Invalid scene: mesh 0 has no triangles");
    }
}
