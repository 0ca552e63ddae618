//! Empirical latency distributions.
//!
//! A [Cdf] is a cumulative distribution over latency values (in milliseconds),
//! sampled by inverse transform: draw a uniform fraction, then interpolate
//! between the surrounding entries. Network points-of-presence and edges each
//! carry one to model intra-PoP and inter-PoP delay.

use crate::Error;
use rand::Rng;
use rand_distr::Distribution;

/// Cumulative distribution over latency values in milliseconds.
///
/// Entries are `(value_ms, cumulative_fraction)` pairs with strictly
/// increasing fractions, the last of which must be `1.0`.
#[derive(Clone, Debug, PartialEq)]
pub struct Cdf {
    entries: Vec<(f64, f64)>,
}

impl Cdf {
    /// Create a distribution from explicit `(value_ms, cumulative_fraction)` entries.
    pub fn new(mut entries: Vec<(f64, f64)>) -> Result<Self, Error> {
        if entries.is_empty() {
            return Err(Error::InvalidCdf("no entries"));
        }
        entries.sort_by(|a, b| a.1.total_cmp(&b.1));
        let mut last_fraction = 0.0;
        for (value, fraction) in &entries {
            if !value.is_finite() || *value < 0.0 {
                return Err(Error::InvalidCdf("negative or non-finite value"));
            }
            if !fraction.is_finite() || *fraction <= last_fraction || *fraction > 1.0 {
                return Err(Error::InvalidCdf("fractions must strictly increase to 1.0"));
            }
            last_fraction = *fraction;
        }
        if last_fraction != 1.0 {
            return Err(Error::InvalidCdf("final fraction must be 1.0"));
        }
        Ok(Self { entries })
    }

    /// A degenerate distribution that always samples `value_ms`.
    pub fn constant(value_ms: f64) -> Self {
        Self {
            entries: vec![(value_ms, 1.0)],
        }
    }

    /// Build an empirical distribution by drawing `samples` values from `dist`.
    ///
    /// Negative draws are clamped to zero, so this can be used directly with
    /// e.g. [rand_distr::Normal] latency models.
    pub fn from_distribution<D, R>(rng: &mut R, dist: D, samples: usize) -> Result<Self, Error>
    where
        D: Distribution<f64>,
        R: Rng,
    {
        if samples == 0 {
            return Err(Error::InvalidCdf("no samples"));
        }
        let mut values: Vec<f64> = dist
            .sample_iter(rng)
            .take(samples)
            .map(|v| if v.is_finite() { v.max(0.0) } else { 0.0 })
            .collect();
        values.sort_by(f64::total_cmp);
        let entries = values
            .iter()
            .enumerate()
            .map(|(i, &v)| (v, (i + 1) as f64 / samples as f64))
            .collect();
        Ok(Self { entries })
    }

    /// Sample a latency (milliseconds) by inverse transform with linear
    /// interpolation between surrounding entries.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        let draw: f64 = rng.gen();
        let mut previous = (self.entries[0].0, 0.0);
        for &(value, fraction) in &self.entries {
            if draw <= fraction {
                let span = fraction - previous.1;
                if span <= 0.0 {
                    return value;
                }
                let weight = (draw - previous.1) / span;
                return previous.0 + weight * (value - previous.0);
            }
            previous = (value, fraction);
        }
        // draw == 1.0 boundary
        self.entries[self.entries.len() - 1].0
    }

    /// The smallest value in the distribution.
    pub fn minimum(&self) -> f64 {
        self.entries
            .iter()
            .map(|(v, _)| *v)
            .fold(f64::INFINITY, f64::min)
    }

    /// The largest value in the distribution.
    pub fn maximum(&self) -> f64 {
        self.entries
            .iter()
            .map(|(v, _)| *v)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Probability-weighted mean of the distribution.
    ///
    /// Used as the deterministic edge weight for shortest-path computation.
    pub fn mean(&self) -> f64 {
        let mut previous = 0.0;
        let mut mean = 0.0;
        for &(value, fraction) in &self.entries {
            mean += value * (fraction - previous);
            previous = fraction;
        }
        mean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use rand_distr::Normal;

    #[test]
    fn constant_always_samples_value() {
        let cdf = Cdf::constant(5.0);
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        for _ in 0..100 {
            assert_eq!(cdf.sample(&mut rng), 5.0);
        }
        assert_eq!(cdf.minimum(), 5.0);
        assert_eq!(cdf.maximum(), 5.0);
        assert_eq!(cdf.mean(), 5.0);
    }

    #[test]
    fn samples_stay_within_bounds() {
        let cdf = Cdf::new(vec![(10.0, 0.25), (20.0, 0.5), (40.0, 1.0)]).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        for _ in 0..1_000 {
            let v = cdf.sample(&mut rng);
            assert!((10.0..=40.0).contains(&v), "sample out of range: {v}");
        }
    }

    #[test]
    fn mean_weights_by_probability_mass() {
        let cdf = Cdf::new(vec![(10.0, 0.5), (30.0, 1.0)]).unwrap();
        assert_eq!(cdf.mean(), 20.0);
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(Cdf::new(vec![]).is_err());
        assert!(Cdf::new(vec![(5.0, 0.5)]).is_err());
        assert!(Cdf::new(vec![(-1.0, 1.0)]).is_err());
        assert!(Cdf::new(vec![(5.0, 0.5), (6.0, 0.5), (7.0, 1.0)]).is_err());
    }

    #[test]
    fn empirical_from_normal_clamps_negatives() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let dist = Normal::new(1.0, 10.0).unwrap();
        let cdf = Cdf::from_distribution(&mut rng, dist, 500).unwrap();
        assert!(cdf.minimum() >= 0.0);
        assert!(cdf.maximum() >= cdf.minimum());
    }
}
