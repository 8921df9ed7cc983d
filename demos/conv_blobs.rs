use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rust_kfac::{Activation, Dataset, FitConfig, Kfac, KfacConfig, SequentialBuilder, fit};

const SIDE: usize = 6;

/// A `SIDE x SIDE` single-channel image with one bright horizontal (class 0) or
/// vertical (class 1) bar plus uniform noise.
fn bar_image<R: Rng>(class: usize, rng: &mut R) -> Vec<f32> {
    let line = rng.gen_range(0..SIDE);
    let mut img = vec![0.0_f32; SIDE * SIDE];
    for y in 0..SIDE {
        for x in 0..SIDE {
            let on = if class == 0 { y == line } else { x == line };
            let base = if on { 1.0 } else { 0.0 };
            img[y * SIDE + x] = base + rng.gen_range(-0.2..0.2);
        }
    }
    img
}

fn main() -> rust_kfac::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let mut rng = StdRng::seed_from_u64(0);
    let n = 256;
    let mut inputs = Vec::with_capacity(n * SIDE * SIDE);
    let mut labels = Vec::with_capacity(n);
    for i in 0..n {
        let class = i % 2;
        inputs.extend(bar_image(class, &mut rng));
        labels.push(class);
    }
    let train = Dataset::from_flat(inputs, &[1, SIDE, SIDE], labels)?;

    let mut model = SequentialBuilder::new_image(1, SIDE, SIDE)?
        .conv2d(4, (3, 3), (1, 1), (1, 1), true)?
        .activation(Activation::ReLU)?
        .flatten()
        .linear(2, true)?
        .build_with_seed(1)?;

    let mut kfac = Kfac::new(&model, KfacConfig {
        lr: 0.02,
        damping: 0.03,
        kl_clip: 0.01,
        t_cov: 2,
        t_inv: 10,
        weight_decay: 1e-4,
        ..KfacConfig::default()
    })?;
    println!("tracking {} layers", kfac.registry().len());

    let report = fit(&mut model, &mut kfac, &train, FitConfig {
        epochs: 10,
        batch_size: 32,
        seed: 3,
    })?;
    println!(
        "first_loss={} final_loss={:?} steps={}",
        report.epoch_losses[0],
        report.final_loss(),
        report.steps
    );
    Ok(())
}
