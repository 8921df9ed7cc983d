use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// Curvature statistics were requested for a layer kind K-FAC does not model.
    #[error("unsupported layer: {0}")]
    UnsupportedLayer(String),

    /// A factor inversion was due before both covariance factors were observed.
    ///
    /// Usually means the host never ran the sampled backward pass on a `t_cov` step.
    #[error("layer {layer} has no {factor} statistics yet")]
    MissingStatistics { layer: usize, factor: &'static str },

    /// The curvature estimate cannot be used (non-positive traces, singular damped
    /// factors, non-positive trust-region sum). Fatal for the current step.
    #[error("degenerate curvature: {0}")]
    DegenerateCurvature(String),
}

pub type Result<T> = std::result::Result<T, Error>;
