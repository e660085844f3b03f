use crate::error::{EvalError, EvalResult};

pub const EARTH_MEAN_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometers between two points given in degrees.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1 = lat1.to_radians();
    let lon1 = lon1.to_radians();
    let lat2 = lat2.to_radians();
    let lon2 = lon2.to_radians();

    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    // rounding can push `a` just past 1 for near-antipodal points
    let a = ((dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2))
        .clamp(0.0, 1.0);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_MEAN_RADIUS_KM * c
}

/// Weighted centroid of `(latitude, longitude)` points on the unit sphere.
///
/// Points are averaged as 3D unit vectors and projected back, so the result
/// stays meaningful across the antimeridian. When every weight is zero each
/// point gets weight 1.
pub fn weighted_centroid(points: &[(f64, f64)], weights: &[f64]) -> EvalResult<(f64, f64)> {
    if points.len() != weights.len() {
        return Err(EvalError::invalid_input(format!(
            "number of points ({}) and weights ({}) must be equal",
            points.len(),
            weights.len()
        )));
    }
    if points.is_empty() {
        return Err(EvalError::invalid_input(
            "centroid requires at least one point",
        ));
    }

    let uniform;
    let weights = if weights.iter().sum::<f64>() == 0.0 {
        uniform = vec![1.0; points.len()];
        uniform.as_slice()
    } else {
        weights
    };
    let total_weight: f64 = weights.iter().sum();

    let (mut x, mut y, mut z) = (0.0_f64, 0.0_f64, 0.0_f64);
    for (&(latitude, longitude), &weight) in points.iter().zip(weights) {
        let latitude = latitude.to_radians();
        let longitude = longitude.to_radians();
        x += weight * latitude.cos() * longitude.cos();
        y += weight * latitude.cos() * longitude.sin();
        z += weight * latitude.sin();
    }

    x /= total_weight;
    y /= total_weight;
    z /= total_weight;

    let longitude = y.atan2(x);
    let hypotenuse = (x * x + y * y).sqrt();
    let latitude = z.atan2(hypotenuse);

    Ok((latitude.to_degrees(), longitude.to_degrees()))
}
