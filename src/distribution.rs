use std::f64::consts::PI;

use rand::Rng;
use rand_distr::Distribution as _;
use statrs::function::gamma::{digamma, ln_gamma};

use crate::transform::Transform;

/// The generative rule of a stochastic node.
///
/// All parameters are scalar and are read, in order, from the node's inputs.
/// Values outside the support have a log density of `-inf`, and invalid
/// parameters produce `NaN` draws. Neither case is reported as an error,
/// samplers are expected to reject such proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    /// Parameters: `mu`, `sigma`.
    Normal,
    /// Parameters: `sigma`.
    HalfNormal,
    /// Parameters: `shape`, `rate`.
    Gamma,
    /// Parameters: `alpha`, `beta`.
    Beta,
}

impl Distribution {
    pub fn name(&self) -> &'static str {
        match self {
            Distribution::Normal => "Normal",
            Distribution::HalfNormal => "HalfNormal",
            Distribution::Gamma => "Gamma",
            Distribution::Beta => "Beta",
        }
    }

    /// Number of parameter inputs.
    pub fn arity(&self) -> usize {
        match self {
            Distribution::HalfNormal => 1,
            Distribution::Normal | Distribution::Gamma | Distribution::Beta => 2,
        }
    }

    /// The transform a new sample node gets unless it is customized.
    pub fn default_transform(&self) -> Transform {
        match self {
            Distribution::Normal => Transform::Identity,
            Distribution::HalfNormal | Distribution::Gamma => Transform::Log,
            Distribution::Beta => Transform::Logit,
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, params: &[f64], rng: &mut R) -> f64 {
        match self {
            Distribution::Normal => rand_distr::Normal::new(params[0], params[1])
                .map(|dist| dist.sample(rng))
                .unwrap_or(f64::NAN),
            Distribution::HalfNormal => rand_distr::Normal::new(0., params[0])
                .map(|dist| dist.sample(rng).abs())
                .unwrap_or(f64::NAN),
            Distribution::Gamma => rand_distr::Gamma::new(params[0], params[1].recip())
                .map(|dist| dist.sample(rng))
                .unwrap_or(f64::NAN),
            Distribution::Beta => rand_distr::Beta::new(params[0], params[1])
                .map(|dist| dist.sample(rng))
                .unwrap_or(f64::NAN),
        }
    }

    pub fn log_prob(&self, x: f64, params: &[f64]) -> f64 {
        match self {
            Distribution::Normal => {
                let (mu, sigma) = (params[0], params[1]);
                let z = (x - mu) / sigma;
                -0.5 * (2. * PI).ln() - sigma.ln() - 0.5 * z * z
            }
            Distribution::HalfNormal => {
                if x < 0. {
                    return f64::NEG_INFINITY;
                }
                let sigma = params[0];
                let z = x / sigma;
                0.5 * (2. / PI).ln() - sigma.ln() - 0.5 * z * z
            }
            Distribution::Gamma => {
                if x <= 0. {
                    return f64::NEG_INFINITY;
                }
                let (shape, rate) = (params[0], params[1]);
                shape * rate.ln() - ln_gamma(shape) + (shape - 1.) * x.ln() - rate * x
            }
            Distribution::Beta => {
                if (x <= 0.) | (x >= 1.) {
                    return f64::NEG_INFINITY;
                }
                let (a, b) = (params[0], params[1]);
                (a - 1.) * x.ln() + (b - 1.) * (-x).ln_1p() - ln_gamma(a) - ln_gamma(b)
                    + ln_gamma(a + b)
            }
        }
    }

    /// Returns `dlogp/dx` and adds `dlogp/dparam` into `dparams`.
    pub fn grad(&self, x: f64, params: &[f64], dparams: &mut [f64]) -> f64 {
        match self {
            Distribution::Normal => {
                let (mu, sigma) = (params[0], params[1]);
                let diff = x - mu;
                let var = sigma * sigma;
                dparams[0] += diff / var;
                dparams[1] += -sigma.recip() + diff * diff / (var * sigma);
                -diff / var
            }
            Distribution::HalfNormal => {
                let sigma = params[0];
                let var = sigma * sigma;
                dparams[0] += -sigma.recip() + x * x / (var * sigma);
                -x / var
            }
            Distribution::Gamma => {
                let (shape, rate) = (params[0], params[1]);
                dparams[0] += rate.ln() - digamma(shape) + x.ln();
                dparams[1] += shape / rate - x;
                (shape - 1.) / x - rate
            }
            Distribution::Beta => {
                let (a, b) = (params[0], params[1]);
                let psi_ab = digamma(a + b);
                dparams[0] += x.ln() - digamma(a) + psi_ab;
                dparams[1] += (-x).ln_1p() - digamma(b) + psi_ab;
                (a - 1.) / x - (b - 1.) / (1. - x)
            }
        }
    }
}
