use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rust_kfac::{Activation, Dataset, FitConfig, Kfac, KfacConfig, SequentialBuilder, Solver, fit};

fn main() -> rust_kfac::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    // Tiny synthetic 3-class dataset in 2D.
    // Each class is a Gaussian-ish blob around a different center.
    let mut rng = StdRng::seed_from_u64(0);

    let centers = [[-1.0_f32, -1.0], [1.0, -1.0], [0.0, 1.0]];
    let n_per_class = 128;
    let mut xs = Vec::with_capacity(3 * n_per_class);
    let mut ys = Vec::with_capacity(3 * n_per_class);

    for (class, center) in centers.iter().enumerate() {
        for _ in 0..n_per_class {
            let x0 = center[0] + rng.gen_range(-0.3..0.3);
            let x1 = center[1] + rng.gen_range(-0.3..0.3);
            xs.push(vec![x0, x1]);
            ys.push(class);
        }
    }

    let train = Dataset::from_rows(&xs, &ys)?;

    let builder = SequentialBuilder::new(2)?
        .linear(16, true)?
        .activation(Activation::ReLU)?
        .linear(3, true)?;

    for solver in [Solver::Eigen, Solver::DampedInverse] {
        let mut model = builder.clone().build_with_seed(0)?;
        let mut kfac = Kfac::new(&model, KfacConfig {
            lr: 0.05,
            damping: 0.01,
            kl_clip: 0.01,
            t_cov: 5,
            t_inv: 20,
            solver,
            ..KfacConfig::default()
        })?;

        let report = fit(&mut model, &mut kfac, &train, FitConfig {
            epochs: 20,
            batch_size: 32,
            seed: 0,
        })?;
        println!(
            "{solver:?}: first_loss={} final_loss={:?} steps={}",
            report.epoch_losses[0],
            report.final_loss(),
            report.steps
        );
    }

    Ok(())
}
