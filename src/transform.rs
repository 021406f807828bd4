use crate::value::NodeValue;

/// Bijection between the natural domain of a stochastic node and the real line.
///
/// Samplers only ever see the unconstrained side. Every operation works
/// elementwise, so matrix-valued nodes use the same transform for each entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transform {
    #[default]
    Identity,
    /// For values on `(0, inf)`: `u = ln(x)`.
    Log,
    /// For values on `(0, 1)`: `u = ln(x / (1 - x))`.
    Logit,
}

#[inline]
fn sigmoid(u: f64) -> f64 {
    if u >= 0. {
        1. / (1. + (-u).exp())
    } else {
        let e = u.exp();
        e / (1. + e)
    }
}

impl Transform {
    pub fn is_identity(&self) -> bool {
        matches!(self, Transform::Identity)
    }

    pub fn to_unconstrained(&self, constrained: &NodeValue) -> NodeValue {
        match self {
            Transform::Identity => constrained.clone(),
            Transform::Log => constrained.map(f64::ln),
            Transform::Logit => constrained.map(|x| (x / (1. - x)).ln()),
        }
    }

    pub fn to_constrained(&self, unconstrained: &NodeValue) -> NodeValue {
        match self {
            Transform::Identity => unconstrained.clone(),
            Transform::Log => unconstrained.map(f64::exp),
            Transform::Logit => unconstrained.map(sigmoid),
        }
    }

    /// `log |dx/du|` summed over all elements, given the constrained value.
    pub fn log_abs_det_jacobian(&self, constrained: &NodeValue, unconstrained: &NodeValue) -> f64 {
        match self {
            Transform::Identity => 0.,
            Transform::Log => unconstrained.sum(),
            Transform::Logit => constrained.fold(0f64, |acc, x| acc + x.ln() + (-x).ln_1p()),
        }
    }

    /// Chain rule from `dlogp/dx` to `d(logp + log|J|)/du`.
    pub fn unconstrained_grad(&self, constrained: &NodeValue, grad: &NodeValue) -> NodeValue {
        match self {
            Transform::Identity => grad.clone(),
            Transform::Log => constrained.zip_map(grad, |x, g| g * x + 1.),
            Transform::Logit => constrained.zip_map(grad, |x, g| g * x * (1. - x) + 1. - 2. * x),
        }
    }
}
