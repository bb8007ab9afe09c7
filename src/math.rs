use ndarray::Array1;

/// Largest magnitude of the internal coordinate of a bounded variable. Values of the logistic
/// beyond this are indistinguishable from the interval ends in `f64`.
const LOGIT_LIMIT: f64 = 36.0;

/// Numerically stable logistic function, mapping ℝ → (0, 1).
///
/// For negative `z` the naive `1 / (1 + exp(-z))` overflows in the exponential, so the
/// algebraically equivalent `exp(z) / (1 + exp(z))` is used there.
pub fn logistic(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Box constraint on a single regression variable.
///
/// The minimiser works on an unconstrained internal coordinate. An interval constraint
/// $[l, u]$ is realised through the logistic reparameterisation
///
/// $$
///     x = l + (u - l) \frac{1}{1 + e^{-z}}
/// $$
///
/// so every point the minimiser visits satisfies the bounds. Unbounded variables use the
/// identity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Bounds {
    Unbounded,
    Interval { lower: f64, upper: f64 },
}

impl Bounds {
    /// A symmetric band of `relative` times `|centre|` around `centre`, or no bounds at all when
    /// `relative` is `None` or the band would be empty.
    pub fn band(centre: f64, relative: Option<f64>) -> Self {
        match relative {
            Some(relative) => {
                let half_width = centre.abs() * relative;
                if half_width.is_finite() && half_width > 0.0 {
                    Self::Interval {
                        lower: centre - half_width,
                        upper: centre + half_width,
                    }
                } else {
                    Self::Unbounded
                }
            }
            None => Self::Unbounded,
        }
    }

    pub fn contains(&self, x: f64) -> bool {
        match *self {
            Self::Unbounded => x.is_finite(),
            Self::Interval { lower, upper } => (lower..=upper).contains(&x),
        }
    }

    /// The nearest point of the box to `x`
    pub fn clamp(&self, x: f64) -> f64 {
        match *self {
            Self::Unbounded => x,
            Self::Interval { lower, upper } => x.clamp(lower, upper),
        }
    }

    /// Map an external value into the minimiser's coordinate. Values outside the interval are
    /// clamped to its ends.
    pub fn to_internal(&self, x: f64) -> f64 {
        match *self {
            Self::Unbounded => x,
            Self::Interval { lower, upper } => {
                let p = (x - lower) / (upper - lower);
                if p <= 0.0 {
                    -LOGIT_LIMIT
                } else if p >= 1.0 {
                    LOGIT_LIMIT
                } else {
                    (p / (1.0 - p)).ln().clamp(-LOGIT_LIMIT, LOGIT_LIMIT)
                }
            }
        }
    }

    /// Map a minimiser coordinate back to the external value
    pub fn to_external(&self, z: f64) -> f64 {
        match *self {
            Self::Unbounded => z,
            Self::Interval { lower, upper } => (upper - lower).mul_add(logistic(z), lower),
        }
    }
}

/// Pooled root mean square error in percent, $100 \sqrt{\overline{e^2}}$, of a set of squared
/// errors. `NaN` for an empty set.
pub fn pooled_rmse(squared_errors: Vec<f64>) -> f64 {
    Array1::from(squared_errors)
        .mean()
        .map_or(f64::NAN, |mean| 100.0 * mean.sqrt())
}

#[cfg(test)]
mod tests {
    use ndarray_rand::rand::{Rng, SeedableRng};
    use rand_isaac::Isaac64Rng;

    use super::{logistic, pooled_rmse, Bounds};

    #[test]
    fn logistic_is_stable_in_both_tails() {
        approx::assert_relative_eq!(logistic(0.0), 0.5);
        approx::assert_relative_eq!(logistic(800.0), 1.0);
        approx::assert_relative_eq!(logistic(-800.0), 0.0);
        approx::assert_relative_eq!(logistic(2.0) + logistic(-2.0), 1.0, max_relative = 1e-15);
    }

    #[test]
    fn bands_are_symmetric_about_their_centre() {
        assert_eq!(
            Bounds::band(200.0, Some(0.05)),
            Bounds::Interval {
                lower: 190.0,
                upper: 210.0
            }
        );
        assert_eq!(Bounds::band(200.0, None), Bounds::Unbounded);
        assert_eq!(Bounds::band(0.0, Some(0.05)), Bounds::Unbounded);
    }

    #[test]
    fn interval_transform_round_trips_inside_the_box() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let bounds = Bounds::band(150.0, Some(0.02));

        for _ in 0..100 {
            let x = rng.gen_range(147.1..152.9);
            let z = bounds.to_internal(x);
            approx::assert_relative_eq!(bounds.to_external(z), x, max_relative = 1e-10);
        }
    }

    #[test]
    fn any_internal_coordinate_maps_into_the_box() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let bounds = Bounds::band(150.0, Some(0.02));

        for _ in 0..100 {
            let z = rng.gen_range(-1e3..1e3);
            assert!(bounds.contains(bounds.to_external(z)));
        }
    }

    #[test]
    fn the_centre_of_a_band_is_the_origin_of_its_coordinate() {
        let bounds = Bounds::band(150.0, Some(0.02));
        approx::assert_relative_eq!(bounds.to_internal(150.0), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn clamping_pulls_outside_values_onto_the_box() {
        let bounds = Bounds::band(100.0, Some(0.05));
        approx::assert_relative_eq!(bounds.clamp(120.0), 105.0);
        approx::assert_relative_eq!(bounds.clamp(90.0), 95.0);
        approx::assert_relative_eq!(bounds.clamp(101.0), 101.0);
        approx::assert_relative_eq!(Bounds::Unbounded.clamp(-3.0), -3.0);
        assert!(!bounds.contains(120.0));
        assert!(bounds.contains(bounds.clamp(120.0)));
    }

    #[test]
    fn pooled_rmse_is_a_percentage() {
        approx::assert_relative_eq!(pooled_rmse(vec![0.01, 0.01]), 10.0);
        assert!(pooled_rmse(vec![]).is_nan());
    }
}
