//! Output statistics helpers used when checking kernel results

/// Summary statistics over a float slice
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Stats {
    pub max: f32,
    pub min: f32,
    pub mean: f32,
    /// Population standard deviation
    pub std: f32,
}

pub fn mean_std(data: &[f32]) -> Stats {
    if data.is_empty() {
        return Stats::default();
    }
    let mut max = f32::NEG_INFINITY;
    let mut min = f32::INFINITY;
    let mut sum = 0.0f64;
    for &v in data {
        max = max.max(v);
        min = min.min(v);
        sum += v as f64;
    }
    let mean = sum / data.len() as f64;
    let var = data
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / data.len() as f64;
    Stats {
        max,
        min,
        mean: mean as f32,
        std: var.sqrt() as f32,
    }
}

/// The `k` largest values with their indices, largest first.
/// Ties keep the lower index first.
pub fn top_k(data: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut indexed: Vec<(usize, f32)> = data.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    indexed.truncate(k);
    indexed
}

/// Largest absolute difference between two slices
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}
