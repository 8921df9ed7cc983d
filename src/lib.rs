//! A small K-FAC (Kronecker-factored approximate curvature) optimizer.
//!
//! `rust-kfac` is a from-scratch implementation of K-FAC for small feed-forward and
//! convolutional networks. For every fully-connected and 2D convolution layer the
//! Fisher information block is approximated as `G ⊗ A`, where `A` is the second moment
//! of the layer's (bias-augmented) inputs and `G` the second moment of the gradients
//! w.r.t. its outputs. Natural gradients are computed from periodic
//! eigendecompositions (or damped inverses) of those two small factors, rescaled by a
//! KL-clip trust region and applied with momentum SGD.
//!
//! # Design goals
//!
//! - Explicit state: all per-layer optimizer state lives in one record per tracked
//!   layer ([`LayerState`]), owned by the optimizer.
//! - Explicit hooks: instead of an autograd engine, the network calls
//!   [`CurvatureHooks`] during its forward and backward passes.
//! - Clear contracts: shapes are validated at the API boundary and reported as
//!   [`Error`] values.
//!
//! # Panics vs `Result`
//!
//! - Numerical failures (non-positive factor traces, a non-positive trust-region sum,
//!   singular damped factors) are [`Error::DegenerateCurvature`] and abort the step.
//! - A factor inversion before both statistics were seen is
//!   [`Error::MissingStatistics`]: the host skipped the sampled backward pass.
//! - Configuration problems are reported at construction ([`Kfac::new`]).
//! - Low-level helpers like [`Dataset::sample`] panic on out-of-range indices, like
//!   slice indexing.
//!
//! # Data layout and shapes
//!
//! - Scalars are `f32`; factors and decompositions are `nalgebra::DMatrix<f32>`.
//! - Linear inputs are `(batch, in_dim)`, conv inputs NCHW `(batch, c, h, w)`.
//! - Linear weights are row-major `(out_dim, in_dim)`, conv weights
//!   `(out_c, in_c, kh, kw)`.
//!
//! # MSRV
//!
//! This crate's minimum supported Rust version (MSRV) is specified in `Cargo.toml`.

//! # Quick start
//!
//! ```rust
//! use rand::SeedableRng;
//! use rand::rngs::StdRng;
//! use rust_kfac::{Activation, Dataset, Kfac, KfacConfig, SequentialBuilder, train_step};
//!
//! # fn main() -> rust_kfac::Result<()> {
//! let xs = vec![
//!     vec![-1.0, -1.0],
//!     vec![-0.8, -1.2],
//!     vec![1.0, 1.0],
//!     vec![1.2, 0.9],
//! ];
//! let train = Dataset::from_rows(&xs, &[0, 0, 1, 1])?;
//!
//! let mut model = SequentialBuilder::new(2)?
//!     .linear(8, true)?
//!     .activation(Activation::Tanh)?
//!     .linear(2, true)?
//!     .build_with_seed(0)?;
//! let mut kfac = Kfac::new(&model, KfacConfig {
//!     lr: 0.05,
//!     t_cov: 1,
//!     t_inv: 5,
//!     ..KfacConfig::default()
//! })?;
//!
//! let mut rng = StdRng::seed_from_u64(0);
//! let (x, y) = train.full_batch()?;
//! for _ in 0..10 {
//!     let step = train_step(&mut model, &mut kfac, &x, &y, &mut rng)?;
//!     assert!(step.loss.is_finite());
//! }
//! assert_eq!(kfac.steps(), 10);
//! # Ok(())
//! # }
//! ```

//! # Driving the passes yourself
//!
//! [`train_step`] is a reference for the host protocol. A custom loop looks like:
//!
//! ```rust
//! use rust_kfac::loss::softmax_cross_entropy;
//! use rust_kfac::{Kfac, KfacConfig, Network, SequentialBuilder, Tensor};
//!
//! # fn main() -> rust_kfac::Result<()> {
//! let mut model = SequentialBuilder::new(3)?.linear(2, true)?.build_with_seed(0)?;
//! let mut kfac = Kfac::new(&model, KfacConfig::default())?;
//! let x = Tensor::from_vec(&[2, 3], vec![0.1, -0.2, 0.3, 0.5, 0.0, -0.1])?;
//! let labels = [0, 1];
//!
//! model.zero_grad();
//! let logits = model.forward_with(&x, &mut kfac)?;
//! let (_loss, d_logits) = softmax_cross_entropy(&logits, &labels)?;
//! if kfac.is_stats_step() {
//!     // Normally labels sampled from the model; the true labels stand in here.
//!     model.backward_with(&d_logits, &mut kfac, true)?;
//!     model.zero_grad();
//! }
//! model.backward_with(&d_logits, &mut kfac, false)?;
//! let report = kfac.step(&mut model)?;
//! assert!(report.inverted);
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod builder;
pub mod config;
pub mod conv;
pub mod covariance;
pub mod data;
pub mod error;
pub mod inverse;
pub mod kfac;
pub mod layer;
pub mod loss;
pub(crate) mod matmul;
pub mod model;
pub mod natural;
pub mod registry;
pub mod stats;
pub mod tensor;
pub mod train;
pub mod trust_region;

pub use activation::{Activation, ActivationLayer};
pub use builder::SequentialBuilder;
pub use config::{KfacConfig, Solver};
pub use conv::{Conv2d, Conv2dGeometry, extract_patches};
pub use data::Dataset;
pub use error::{Error, Result};
pub use inverse::{Decomposition, EigenFactor};
pub use kfac::{Kfac, StepReport};
pub use layer::{Flatten, Init, LayerKind, Linear, Module, Parameter};
pub use model::{Network, Sequential};
pub use natural::NaturalGradient;
pub use registry::{CurvatureHooks, LayerId, LayerRegistry, LayerState, RegisteredLayer};
pub use tensor::Tensor;
pub use train::{FitConfig, FitReport, TrainStep, fit, train_step};
