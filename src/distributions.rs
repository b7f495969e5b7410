/*!
Target and proposal distributions for the bundled Metropolis-Hastings chain.

Both traits are generic over the floating-point precision through
[`num_traits::Float`].

# Examples

```rust
use coupled_mcmc::distributions::{GaussianMixture, IsotropicGaussian, Proposal, Target};

// Two well separated modes: hard for a single chain, easy with tempering.
let target = GaussianMixture::new(vec![-4.0, 4.0], 0.5, 1);
let lp_mode = target.unnorm_log_prob(&[4.0]);
let lp_valley = target.unnorm_log_prob(&[0.0]);
assert!(lp_mode > lp_valley);

let mut proposal = IsotropicGaussian::new(1.0).set_seed(42);
let candidate = proposal.sample(&[0.0, 0.0]);
assert_eq!(candidate.len(), 2);
```
*/

use num_traits::Float;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

/// A trait for generating proposals in Metropolis–Hastings.
pub trait Proposal<T: Float>: Send {
    /// Samples a new point from q(x' | x).
    fn sample(&mut self, current: &[T]) -> Vec<T>;

    /// Evaluates log q(x' | x).
    fn log_prob(&self, from: &[T], to: &[T]) -> T;

    /// Returns a new instance of this proposal distribution seeded with `seed`.
    fn set_seed(self, seed: u64) -> Self;
}

/// A continuous target distribution known up to a normalizing constant.
pub trait Target<T: Float>: Send {
    /// Returns the log of the unnormalized density for state `theta`.
    fn unnorm_log_prob(&self, theta: &[T]) -> T;
}

/**
An isotropic Gaussian random-walk proposal.

Adds independent Gaussian noise with standard deviation `std` to each
coordinate of the current state.
*/
#[derive(Debug, Clone)]
pub struct IsotropicGaussian<T: Float> {
    pub std: T,
    rng: SmallRng,
}

impl<T: Float> IsotropicGaussian<T> {
    /// Creates a new isotropic Gaussian proposal with the specified standard deviation.
    pub fn new(std: T) -> Self {
        Self {
            std,
            rng: SmallRng::from_entropy(),
        }
    }
}

impl<T> Proposal<T> for IsotropicGaussian<T>
where
    T: Float + Send,
    rand_distr::StandardNormal: Distribution<T>,
{
    fn sample(&mut self, current: &[T]) -> Vec<T> {
        match Normal::new(T::zero(), self.std) {
            Ok(normal) => normal
                .sample_iter(&mut self.rng)
                .zip(current)
                .map(|(eps, &x)| x + eps)
                .collect(),
            // A degenerate width proposes the current point.
            Err(_) => current.to_vec(),
        }
    }

    fn log_prob(&self, from: &[T], to: &[T]) -> T {
        let two = T::one() + T::one();
        let var = self.std * self.std;
        let d = T::from(from.len()).unwrap_or_else(T::zero);
        let pi = T::from(std::f64::consts::PI).unwrap_or_else(T::zero);
        let exponent = from
            .iter()
            .zip(to)
            .fold(T::zero(), |acc, (&f, &t)| acc - (t - f) * (t - f) / (two * var));
        exponent - d / two * (two * pi * var).ln()
    }

    fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }
}

/**
An equally weighted mixture of isotropic Gaussians whose centres lie on the
diagonal: component `k` has every coordinate equal to `centers[k]`.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianMixture<T: Float> {
    pub centers: Vec<T>,
    pub std: T,
    pub dim: usize,
}

impl<T: Float> GaussianMixture<T> {
    pub fn new(centers: Vec<T>, std: T, dim: usize) -> Self {
        Self { centers, std, dim }
    }

    /// Index of the component whose centre is closest to `theta`.
    pub fn nearest_component(&self, theta: &[T]) -> usize {
        let mut best = 0;
        let mut best_dist = T::infinity();
        for (k, &c) in self.centers.iter().enumerate() {
            let dist = theta
                .iter()
                .fold(T::zero(), |acc, &x| acc + (x - c) * (x - c));
            if dist < best_dist {
                best = k;
                best_dist = dist;
            }
        }
        best
    }
}

impl<T: Float + Send> Target<T> for GaussianMixture<T> {
    fn unnorm_log_prob(&self, theta: &[T]) -> T {
        let two = T::one() + T::one();
        let var = self.std * self.std;
        let terms: Vec<T> = self
            .centers
            .iter()
            .map(|&c| {
                -theta
                    .iter()
                    .fold(T::zero(), |acc, &x| acc + (x - c) * (x - c))
                    / (two * var)
            })
            .collect();
        // log-sum-exp over components
        let max = terms
            .iter()
            .copied()
            .fold(T::neg_infinity(), |a, b| a.max(b));
        if max == T::neg_infinity() {
            return max;
        }
        max + terms
            .iter()
            .fold(T::zero(), |acc, &t| acc + (t - max).exp())
            .ln()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    #[test]
    fn proposal_log_prob_is_normal_density() {
        let proposal = IsotropicGaussian::new(2.0);
        let lp = proposal.log_prob(&[0.0], &[1.0]);
        let expected = -(1.0 / 8.0) - 0.5 * (2.0 * PI * 4.0).ln();
        assert_abs_diff_eq!(lp, expected, epsilon = 1e-12);
    }

    #[test]
    fn proposal_is_symmetric() {
        let proposal = IsotropicGaussian::new(0.7);
        let a = [0.3, -1.2];
        let b = [1.1, 0.4];
        assert_abs_diff_eq!(
            proposal.log_prob(&a, &b),
            proposal.log_prob(&b, &a),
            epsilon = 1e-12
        );
    }

    #[test]
    fn seeded_proposals_repeat() {
        let mut p1 = IsotropicGaussian::new(1.0).set_seed(9);
        let mut p2 = IsotropicGaussian::new(1.0).set_seed(9);
        assert_eq!(p1.sample(&[0.0, 1.0]), p2.sample(&[0.0, 1.0]));
    }

    #[test]
    fn single_component_mixture_is_gaussian_kernel() {
        let target = GaussianMixture::new(vec![1.0], 1.0, 2);
        assert_abs_diff_eq!(target.unnorm_log_prob(&[2.0, 1.0]), -0.5, epsilon = 1e-12);
    }

    #[test]
    fn mixture_is_symmetric_between_modes() {
        let target = GaussianMixture::new(vec![-3.0, 3.0], 0.5, 1);
        assert_abs_diff_eq!(
            target.unnorm_log_prob(&[-2.5]),
            target.unnorm_log_prob(&[2.5]),
            epsilon = 1e-12
        );
        assert_eq!(target.nearest_component(&[-2.0]), 0);
        assert_eq!(target.nearest_component(&[2.0]), 1);
    }
}
