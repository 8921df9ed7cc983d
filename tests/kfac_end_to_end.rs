use approx::assert_abs_diff_eq;
use rand::SeedableRng;
use rand::rngs::StdRng;

use rust_kfac::{
    Activation, Error, Kfac, KfacConfig, LayerKind, Module, Network, Parameter, Result,
    Sequential, SequentialBuilder, Solver, Tensor, train_step,
};

fn image_batch(batch: usize) -> (Tensor, Vec<usize>) {
    let data = (0..batch * 2 * 5 * 5)
        .map(|i| ((i * 7 % 11) as f32 - 5.0) / 5.0)
        .collect();
    let x = Tensor::from_vec(&[batch, 2, 5, 5], data).unwrap();
    let labels = (0..batch).map(|i| i % 3).collect();
    (x, labels)
}

fn conv_net(seed: u64) -> Sequential {
    SequentialBuilder::new_image(2, 5, 5)
        .unwrap()
        .conv2d(3, (3, 3), (1, 1), (0, 0), true)
        .unwrap()
        .activation(Activation::ReLU)
        .unwrap()
        .flatten()
        .linear(3, true)
        .unwrap()
        .build_with_seed(seed)
        .unwrap()
}

fn params(net: &Sequential) -> Vec<f32> {
    net.modules()
        .iter()
        .flat_map(|m| {
            let w = m.weight().map(Parameter::value).unwrap_or(&[]);
            let b = m.bias().map(Parameter::value).unwrap_or(&[]);
            w.iter().chain(b).copied().collect::<Vec<_>>()
        })
        .collect()
}

#[test]
fn two_stats_windows_populate_state_and_move_parameters() {
    let mut model = conv_net(0);
    let t_cov = 2;
    let cfg = KfacConfig {
        lr: 0.01,
        t_cov,
        t_inv: 2,
        ..KfacConfig::default()
    };
    let mut kfac = Kfac::new(&model, cfg).unwrap();
    assert_eq!(kfac.registry().len(), 2);

    let mut rng = StdRng::seed_from_u64(5);
    let (x, y) = image_batch(4);
    let before = params(&model);

    for _ in 0..2 * t_cov {
        let step = train_step(&mut model, &mut kfac, &x, &y, &mut rng).unwrap();
        assert!(step.report.nu > 0.0 && step.report.nu <= 1.0);
    }

    assert_eq!(kfac.steps(), 2 * t_cov);
    for layer in kfac.registry().iter() {
        let state = layer.state();
        let a = state.a_factor().unwrap();
        let g = state.g_factor().unwrap();
        assert_abs_diff_eq!(a.clone(), a.transpose(), epsilon = 1e-5);
        assert_abs_diff_eq!(g.clone(), g.transpose(), epsilon = 1e-5);
        assert!(state.decomposition().is_some());
        assert!(state.weight_momentum().is_some());
        assert!(state.bias_momentum().is_some());
    }

    let conv = kfac.registry().get(0).unwrap();
    assert!(matches!(conv.kind(), LayerKind::Conv2d(_)));
    // in_c * kh * kw + bias
    assert_eq!(conv.state().a_factor().unwrap().shape(), (2 * 9 + 1, 2 * 9 + 1));
    assert_eq!(conv.state().g_factor().unwrap().shape(), (3, 3));

    let after = params(&model);
    assert_ne!(before, after);
}

#[test]
fn both_solvers_train_the_same_network() {
    for solver in [Solver::Eigen, Solver::DampedInverse] {
        let mut model = conv_net(1);
        let cfg = KfacConfig {
            lr: 0.01,
            damping: 0.01,
            t_cov: 1,
            t_inv: 1,
            solver,
            ..KfacConfig::default()
        };
        let mut kfac = Kfac::new(&model, cfg).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let (x, y) = image_batch(6);
        for _ in 0..3 {
            let step = train_step(&mut model, &mut kfac, &x, &y, &mut rng).unwrap();
            assert!(step.loss.is_finite(), "{solver:?}");
            assert!(step.report.inverted);
            assert_eq!(
                kfac.layer_state(0).unwrap().decomposition().unwrap().solver(),
                solver
            );
        }
    }
}

/// A per-feature scale: it has a weight, but K-FAC does not model it.
#[derive(Debug)]
struct Scale {
    weight: Parameter,
    input: Option<Tensor>,
}

impl Module for Scale {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let dim = self.weight.len();
        let mut out = input.clone();
        for row in out.data_mut().chunks_exact_mut(dim) {
            for (v, &w) in row.iter_mut().zip(self.weight.value()) {
                *v *= w;
            }
        }
        self.input = Some(input.clone());
        Ok(out)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Result<Tensor> {
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| Error::InvalidData("backward before forward".to_owned()))?;
        let dim = self.weight.len();
        let mut d_input = grad_output.clone();
        let (value, grad) = self.weight.value_and_grad_mut();
        for ((d_row, g_row), x_row) in d_input
            .data_mut()
            .chunks_exact_mut(dim)
            .zip(grad_output.data().chunks_exact(dim))
            .zip(input.data().chunks_exact(dim))
        {
            for i in 0..dim {
                grad[i] += g_row[i] * x_row[i];
                d_row[i] = g_row[i] * value[i];
            }
        }
        Ok(d_input)
    }

    fn weight(&self) -> Option<&Parameter> {
        Some(&self.weight)
    }

    fn weight_mut(&mut self) -> Option<&mut Parameter> {
        Some(&mut self.weight)
    }
}

#[test]
fn unsupported_modules_are_left_to_the_host() {
    let mut model = SequentialBuilder::new(3)
        .unwrap()
        .linear(3, true)
        .unwrap()
        .build_with_seed(0)
        .unwrap();
    model.push(Scale {
        weight: Parameter::new(vec![1.0, 2.0, 3.0]),
        input: None,
    });

    let mut kfac = Kfac::new(&model, KfacConfig::default()).unwrap();
    assert_eq!(kfac.registry().len(), 1);
    assert_eq!(kfac.registry().lookup(1), None);

    let x = Tensor::from_vec(&[2, 3], vec![0.5, -0.5, 1.0, 0.2, 0.3, -0.1]).unwrap();
    let mut rng = StdRng::seed_from_u64(0);
    train_step(&mut model, &mut kfac, &x, &[0, 2], &mut rng).unwrap();

    let scale = model.modules()[1].weight().unwrap();
    assert_eq!(scale.value(), &[1.0, 2.0, 3.0]);
    // The raw gradient is still there for a first-order optimizer to use.
    assert!(scale.grad().iter().any(|&g| g != 0.0));
}

#[test]
fn zero_learning_rate_is_a_degenerate_step() {
    let mut model = conv_net(3);
    let mut kfac = Kfac::new(&model, KfacConfig {
        t_cov: 1,
        t_inv: 1,
        ..KfacConfig::default()
    })
    .unwrap();
    kfac.set_lr(0.0).unwrap();

    // lr = 0 makes vg_sum zero, which the trust region rejects.
    let (x, y) = image_batch(2);
    let mut rng = StdRng::seed_from_u64(0);
    let err = train_step(&mut model, &mut kfac, &x, &y, &mut rng).unwrap_err();
    assert!(matches!(err, Error::DegenerateCurvature(_)));
    assert_eq!(kfac.steps(), 0);
}

#[cfg(feature = "serde")]
#[test]
fn config_loads_from_json() {
    let json = r#"{
        "lr": 0.01,
        "momentum": 0.9,
        "damping": 0.001,
        "kl_clip": 0.001,
        "weight_decay": 0.0,
        "t_cov": 5,
        "t_inv": 50,
        "batch_averaged": true,
        "solver": "damped_inverse"
    }"#;
    let cfg = KfacConfig::from_json_str(json).unwrap();
    assert_eq!(cfg.solver, Solver::DampedInverse);
    assert_eq!(cfg.t_inv, 50);

    let bad = json.replace("\"t_cov\": 5", "\"t_cov\": 0");
    assert!(KfacConfig::from_json_str(&bad).is_err());
}
