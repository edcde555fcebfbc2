use sgpu_kde::prelude::*;

fn main() -> Result<()> {
    let x: Vec<f32> = (0..2000)
        .map(|i| {
            let t = (i as f32 * 0.618_034).fract() - 0.5;
            if i % 3 == 0 { 4.0 + 2.0 * t } else { -1.0 + t }
        })
        .collect();

    let estimator = Estimator::new(KdeConfig::default())?;
    println!("backend: {:?}", estimator.backend());

    let y = estimator.estimate(x.len(), 0.25, &x)?;
    let (peak, density) = x
        .iter()
        .zip(&y)
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(&xi, &yi)| (xi, yi))
        .unwrap_or_default();
    println!("highest density {:.4} at x = {:.3}", density, peak);

    let grid: Vec<f32> = (0..=16).map(|i| -3.0 + i as f32 * 0.5).collect();
    for (g, d) in grid.iter().zip(estimator.estimate_at(&x, &grid, 0.25)?) {
        println!("{:>6.2} {}", g, "#".repeat((d * 100.0) as usize));
    }
    Ok(())
}
