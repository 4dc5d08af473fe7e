/// Fewer aligned points than this and two series count as uncorrelated.
pub const MIN_CORRELATION_POINTS: usize = 5;

/// Pearson correlation of the overlapping tails of `a` and `b`.
///
/// Series are aligned on their most recent values. Short or flat series
/// return 0.0 so they never count against a trade.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < MIN_CORRELATION_POINTS {
        return 0.0;
    }
    let xs = &a[a.len() - n..];
    let ys = &b[b.len() - n..];

    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
        return 0.0;
    }
    let r = cov / (var_x.sqrt() * var_y.sqrt());
    if r.is_finite() {
        r.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}
