//! GLMM response families.
//!
//! A read-only registry maps each [`Family`] tag to its capabilities
//! (name, default and allowed links, whether it uses the dispersion
//! sub-model or the Tweedie power). The log-densities are generic over
//! [`Real`] and take the linear predictors directly, so the joint
//! objective can be differentiated through them.
//!
//! Dispersion is always `phi = exp(eta_disp)`:
//! gaussian variance, Gamma `1 / shape`, nbinom2 size, nbinom1 variance
//! inflation, beta/betabinomial precision, Tweedie dispersion.

use rand::Rng;
use rand_distr::{Beta, Binomial, Distribution, Gamma, Normal, Poisson};
use serde::{Deserialize, Serialize};

use super::link::Link;
use crate::util::ad::Real;
use crate::util::math::{
    ln_choose, ln_factorial, ln_gamma, log1mexp, log_logistic, log_sum_exp, logistic, softplus,
    HALF_LN_2PI,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    Gaussian,
    Poisson,
    Binomial,
    Gamma,
    NBinom2,
    NBinom1,
    TruncatedPoisson,
    TruncatedNBinom2,
    TruncatedNBinom1,
    Beta,
    BetaBinomial,
    Tweedie,
}

/// Response support required by a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Support {
    Real,
    Count,
    PositiveCount,
    Proportion,
    Positive,
    UnitOpen,
    NonNegative,
}

/// Capability record of one family.
#[derive(Debug)]
pub struct FamilyInfo {
    pub family: Family,
    pub name: &'static str,
    pub default_link: Link,
    pub links: &'static [Link],
    pub has_dispersion: bool,
    pub has_power: bool,
    pub support: Support,
    /// Zero-truncated count family.
    pub truncated: bool,
    /// Binomial-type: the prior weight is the number of trials.
    pub weights_are_trials: bool,
}

const COUNT_LINKS: &[Link] = &[Link::Log, Link::Identity, Link::Sqrt];
const UNIT_LINKS: &[Link] = &[Link::Logit, Link::Probit, Link::Cloglog];

static REGISTRY: [FamilyInfo; 12] = [
    FamilyInfo {
        family: Family::Gaussian,
        name: "gaussian",
        default_link: Link::Identity,
        links: &[Link::Identity, Link::Log, Link::Inverse],
        has_dispersion: true,
        has_power: false,
        support: Support::Real,
        truncated: false,
        weights_are_trials: false,
    },
    FamilyInfo {
        family: Family::Poisson,
        name: "poisson",
        default_link: Link::Log,
        links: COUNT_LINKS,
        has_dispersion: false,
        has_power: false,
        support: Support::Count,
        truncated: false,
        weights_are_trials: false,
    },
    FamilyInfo {
        family: Family::Binomial,
        name: "binomial",
        default_link: Link::Logit,
        links: UNIT_LINKS,
        has_dispersion: false,
        has_power: false,
        support: Support::Proportion,
        truncated: false,
        weights_are_trials: true,
    },
    FamilyInfo {
        family: Family::Gamma,
        name: "Gamma",
        default_link: Link::Inverse,
        links: &[Link::Inverse, Link::Log, Link::Identity],
        has_dispersion: true,
        has_power: false,
        support: Support::Positive,
        truncated: false,
        weights_are_trials: false,
    },
    FamilyInfo {
        family: Family::NBinom2,
        name: "nbinom2",
        default_link: Link::Log,
        links: COUNT_LINKS,
        has_dispersion: true,
        has_power: false,
        support: Support::Count,
        truncated: false,
        weights_are_trials: false,
    },
    FamilyInfo {
        family: Family::NBinom1,
        name: "nbinom1",
        default_link: Link::Log,
        links: COUNT_LINKS,
        has_dispersion: true,
        has_power: false,
        support: Support::Count,
        truncated: false,
        weights_are_trials: false,
    },
    FamilyInfo {
        family: Family::TruncatedPoisson,
        name: "truncated_poisson",
        default_link: Link::Log,
        links: &[Link::Log],
        has_dispersion: false,
        has_power: false,
        support: Support::PositiveCount,
        truncated: true,
        weights_are_trials: false,
    },
    FamilyInfo {
        family: Family::TruncatedNBinom2,
        name: "truncated_nbinom2",
        default_link: Link::Log,
        links: &[Link::Log],
        has_dispersion: true,
        has_power: false,
        support: Support::PositiveCount,
        truncated: true,
        weights_are_trials: false,
    },
    FamilyInfo {
        family: Family::TruncatedNBinom1,
        name: "truncated_nbinom1",
        default_link: Link::Log,
        links: &[Link::Log],
        has_dispersion: true,
        has_power: false,
        support: Support::PositiveCount,
        truncated: true,
        weights_are_trials: false,
    },
    FamilyInfo {
        family: Family::Beta,
        name: "beta_family",
        default_link: Link::Logit,
        links: UNIT_LINKS,
        has_dispersion: true,
        has_power: false,
        support: Support::UnitOpen,
        truncated: false,
        weights_are_trials: false,
    },
    FamilyInfo {
        family: Family::BetaBinomial,
        name: "betabinomial",
        default_link: Link::Logit,
        links: UNIT_LINKS,
        has_dispersion: true,
        has_power: false,
        support: Support::Proportion,
        truncated: false,
        weights_are_trials: true,
    },
    FamilyInfo {
        family: Family::Tweedie,
        name: "tweedie",
        default_link: Link::Log,
        links: &[Link::Log],
        has_dispersion: true,
        has_power: true,
        support: Support::NonNegative,
        truncated: false,
        weights_are_trials: false,
    },
];

/// Terms of the Tweedie series further than this below the largest one
/// are dropped (exp(-40) relative contribution).
const TWEEDIE_SERIES_DROP: f64 = 40.0;
const TWEEDIE_SERIES_MAX_TERMS: usize = 5000;

impl Family {
    pub fn registry() -> &'static [FamilyInfo] {
        &REGISTRY
    }

    /// Registry entries are stored in declaration order.
    pub fn info(self) -> &'static FamilyInfo {
        &REGISTRY[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Look up a family by name (case-insensitive; `nbinom` and
    /// `negative_binomial` mean nbinom2, `beta` means beta_family).
    pub fn parse(name: &str) -> Option<Family> {
        let lower = name.trim().to_ascii_lowercase();
        let canonical = match lower.as_str() {
            "nbinom" | "negative_binomial" => "nbinom2",
            "beta" => "beta_family",
            "truncated_nbinom" => "truncated_nbinom2",
            other => other,
        };
        REGISTRY
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(canonical))
            .map(|f| f.family)
    }

    pub fn default_link(self) -> Link {
        self.info().default_link
    }

    pub fn allows_link(self, link: Link) -> bool {
        self.info().links.contains(&link)
    }

    pub fn has_dispersion(self) -> bool {
        self.info().has_dispersion
    }

    pub fn has_power(self) -> bool {
        self.info().has_power
    }

    pub fn is_truncated(self) -> bool {
        self.info().truncated
    }

    pub fn weights_are_trials(self) -> bool {
        self.info().weights_are_trials
    }

    /// Continuous families put no mass at zero; with a zero-inflation
    /// model they become hurdle models.
    pub fn is_continuous(self) -> bool {
        matches!(self, Family::Gaussian | Family::Gamma | Family::Beta)
    }

    /// Whether a zero-inflation model may be attached.
    pub fn allows_zero_inflation(self) -> bool {
        self != Family::Gaussian
    }

    /// Check one response value (and its weight) against the support.
    /// `zero_inflated` admits zeros for hurdle-type families.
    pub fn check_response(self, y: f64, w: f64, zero_inflated: bool) -> Result<(), String> {
        if !y.is_finite() {
            return Err(format!("non-finite response {}", y));
        }
        if !(w.is_finite() && w > 0.0) {
            return Err(format!("weight {} must be positive", w));
        }
        let is_int = |v: f64| (v - v.round()).abs() < 1e-8;
        let ok = match self.info().support {
            Support::Real => true,
            Support::Count => y >= 0.0 && is_int(y),
            Support::PositiveCount => is_int(y) && (y >= 1.0 || (zero_inflated && y == 0.0)),
            Support::Proportion => (0.0..=1.0).contains(&y) && is_int(y * w),
            Support::Positive => y > 0.0 || (zero_inflated && y == 0.0),
            Support::UnitOpen => (y > 0.0 && y < 1.0) || (zero_inflated && y == 0.0),
            Support::NonNegative => y >= 0.0,
        };
        if ok {
            Ok(())
        } else {
            Err(format!(
                "response {} is outside the support of family {}",
                y,
                self.name()
            ))
        }
    }

    /// Log-density of the untruncated distribution at `y`.
    ///
    /// `w` is the number of trials for binomial-type families and is
    /// ignored otherwise. `log_phi` is the dispersion predictor, `psi` the
    /// Tweedie power parameter.
    pub fn log_density<T: Real>(self, link: Link, y: f64, w: f64, eta: T, log_phi: T, psi: T) -> T {
        match self {
            Family::Gaussian => {
                let r = T::cst(y) - link.inverse(eta);
                -T::cst(0.5) * r * r / log_phi.exp() - T::cst(0.5) * log_phi - T::cst(HALF_LN_2PI)
            }
            Family::Poisson | Family::TruncatedPoisson => {
                let lmu = link.log_inverse(eta);
                let mu = lmu.exp();
                T::cst(y) * lmu - mu - T::cst(ln_factorial(y))
            }
            Family::Binomial => {
                let s = y * w;
                let mut ll = T::cst(ln_choose(w, s));
                if s > 0.0 {
                    ll += T::cst(s) * link.log_inverse(eta);
                }
                if w - s > 0.0 {
                    ll += T::cst(w - s) * link.log1m_inverse(eta);
                }
                ll
            }
            Family::Gamma => {
                // shape a = 1/phi, scale = mu * phi
                let shape = (-log_phi).exp();
                let log_scale = link.log_inverse(eta) + log_phi;
                -ln_gamma(shape) - shape * log_scale + (shape - T::one()) * T::cst(y.ln())
                    - T::cst(y) / log_scale.exp()
            }
            Family::NBinom2 | Family::TruncatedNBinom2 => {
                let lmu = link.log_inverse(eta);
                let k = log_phi.exp();
                ln_gamma(T::cst(y) + k) - ln_gamma(k) - T::cst(ln_factorial(y))
                    - k * softplus(lmu - log_phi)
                    - T::cst(y) * softplus(log_phi - lmu)
            }
            Family::NBinom1 | Family::TruncatedNBinom1 => {
                let lmu = link.log_inverse(eta);
                let k = (lmu - log_phi).exp();
                let sp = softplus(log_phi);
                ln_gamma(T::cst(y) + k) - ln_gamma(k) - T::cst(ln_factorial(y)) - k * sp
                    + T::cst(y) * (log_phi - sp)
            }
            Family::Beta => {
                let phi = log_phi.exp();
                let a = link.inverse(eta) * phi;
                let b = link.log1m_inverse(eta).exp() * phi;
                ln_gamma(phi) - ln_gamma(a) - ln_gamma(b)
                    + (a - T::one()) * T::cst(y.ln())
                    + (b - T::one()) * T::cst((-y).ln_1p())
            }
            Family::BetaBinomial => {
                let phi = log_phi.exp();
                let a = link.inverse(eta) * phi;
                let b = link.log1m_inverse(eta).exp() * phi;
                let s = y * w;
                T::cst(ln_choose(w, s)) + ln_beta(T::cst(s) + a, T::cst(w - s) + b) - ln_beta(a, b)
            }
            Family::Tweedie => tweedie_log_density(link, y, eta, log_phi, psi),
        }
    }

    /// log P(Y = 0) of the untruncated distribution, for discrete
    /// families and Tweedie. Continuous families return -inf.
    pub fn log_prob_zero<T: Real>(self, link: Link, w: f64, eta: T, log_phi: T, psi: T) -> T {
        match self {
            Family::Poisson | Family::TruncatedPoisson => -link.inverse(eta),
            Family::Binomial => T::cst(w) * link.log1m_inverse(eta),
            Family::NBinom2 | Family::TruncatedNBinom2 => {
                -log_phi.exp() * softplus(link.log_inverse(eta) - log_phi)
            }
            Family::NBinom1 | Family::TruncatedNBinom1 => {
                -(link.log_inverse(eta) - log_phi).exp() * softplus(log_phi)
            }
            Family::BetaBinomial | Family::Tweedie => {
                self.log_density(link, 0.0, w, eta, log_phi, psi)
            }
            Family::Gaussian | Family::Gamma | Family::Beta => T::cst(f64::NEG_INFINITY),
        }
    }

    /// Log-likelihood contribution of one observation.
    ///
    /// `eta` holds the linear predictors `[cond, zi, disp, psi]`; the zi
    /// entry is only read when `zero_inflated` is set. Prior weights scale
    /// the contribution except for binomial-type families, where they are
    /// the number of trials.
    pub fn obs_log_lik<T: Real>(self, link: Link, zero_inflated: bool, y: f64, w: f64, eta: &[T; 4]) -> T {
        let [eta_c, eta_zi, log_phi, psi] = *eta;
        let trials = if self.weights_are_trials() { w } else { 1.0 };
        let truncated_ll = || {
            let ll = self.log_density(link, y, trials, eta_c, log_phi, psi);
            if self.is_truncated() {
                ll - log1mexp(self.log_prob_zero(link, trials, eta_c, log_phi, psi))
            } else {
                ll
            }
        };
        let ll = if !zero_inflated {
            truncated_ll()
        } else {
            let log_pz = log_logistic(eta_zi);
            let log_1m_pz = log_logistic(-eta_zi);
            let hurdle = self.is_truncated() || self.is_continuous();
            if y == 0.0 && hurdle {
                log_pz
            } else if y == 0.0 {
                log_sum_exp(
                    log_pz,
                    log_1m_pz + self.log_prob_zero(link, trials, eta_c, log_phi, psi),
                )
            } else {
                log_1m_pz + truncated_ll()
            }
        };
        if self.weights_are_trials() {
            ll
        } else {
            T::cst(w) * ll
        }
    }

    /// Tweedie power `p = 1 + logistic(psi)` in (1, 2).
    pub fn tweedie_power<T: Real>(psi: T) -> T {
        T::one() + logistic(psi)
    }

    /// Mean and variance of the untruncated distribution on the response
    /// scale (proportions for binomial-type families).
    pub fn base_moments(self, mu: f64, phi: f64, power: f64, w: f64) -> (f64, f64) {
        let var = match self {
            Family::Gaussian => phi,
            Family::Poisson | Family::TruncatedPoisson => mu,
            Family::Binomial => mu * (1.0 - mu) / w,
            Family::Gamma => phi * mu * mu,
            Family::NBinom2 | Family::TruncatedNBinom2 => mu + mu * mu / phi,
            Family::NBinom1 | Family::TruncatedNBinom1 => mu * (1.0 + phi),
            Family::Beta => mu * (1.0 - mu) / (1.0 + phi),
            Family::BetaBinomial => mu * (1.0 - mu) * (1.0 + (w - 1.0) / (phi + 1.0)) / w,
            Family::Tweedie => phi * mu.powf(power),
        };
        (mu, var)
    }

    /// Mean and variance of the response given the conditional mean `mu`
    /// and the zero-inflation probability `pz`. Truncated families use the
    /// moments of the positive part; with zero inflation the result is the
    /// two-component mixture (hurdle or zero-inflated alike).
    pub fn moments(self, mu: f64, phi: f64, power: f64, w: f64, pz: f64, zero_inflated: bool) -> (f64, f64) {
        let (mut m, mut v) = self.base_moments(mu, phi, power, w);
        if self.is_truncated() {
            let p0 = self.log_prob_zero(Link::Log, w, mu.ln(), phi.ln(), 0.0_f64).exp();
            let keep = (1.0 - p0).max(f64::MIN_POSITIVE);
            let second = (v + m * m) / keep;
            m /= keep;
            v = second - m * m;
        }
        if !zero_inflated {
            return (m, v);
        }
        let keep = 1.0 - pz;
        let mean = keep * m;
        (mean, keep * (v + m * m) - mean * mean)
    }

    /// Draw one response given the conditional mean and dispersion, from
    /// the untruncated distribution unless the family is truncated.
    pub fn sample<R: Rng + ?Sized>(self, rng: &mut R, mu: f64, phi: f64, power: f64, w: f64) -> f64 {
        match self {
            Family::Gaussian => match Normal::new(mu, phi.sqrt()) {
                Ok(d) => d.sample(rng),
                Err(_) => f64::NAN,
            },
            Family::Poisson => sample_poisson(rng, mu),
            Family::Binomial => {
                let n = w.round().max(1.0) as u64;
                match Binomial::new(n, mu.clamp(0.0, 1.0)) {
                    Ok(d) => d.sample(rng) as f64 / n as f64,
                    Err(_) => f64::NAN,
                }
            }
            Family::Gamma => {
                let shape = 1.0 / phi;
                match Gamma::new(shape, mu * phi) {
                    Ok(d) => d.sample(rng),
                    Err(_) => f64::NAN,
                }
            }
            Family::NBinom2 => sample_gamma_poisson(rng, mu, phi),
            Family::NBinom1 => sample_gamma_poisson(rng, mu, mu / phi),
            Family::TruncatedPoisson => sample_positive(rng, |r| sample_poisson(r, mu)),
            Family::TruncatedNBinom2 => sample_positive(rng, |r| sample_gamma_poisson(r, mu, phi)),
            Family::TruncatedNBinom1 => {
                sample_positive(rng, |r| sample_gamma_poisson(r, mu, mu / phi))
            }
            Family::Beta => match Beta::new(mu * phi, (1.0 - mu) * phi) {
                Ok(d) => d.sample(rng),
                Err(_) => f64::NAN,
            },
            Family::BetaBinomial => {
                let p = match Beta::new(mu * phi, (1.0 - mu) * phi) {
                    Ok(d) => d.sample(rng),
                    Err(_) => return f64::NAN,
                };
                let n = w.round().max(1.0) as u64;
                match Binomial::new(n, p.clamp(0.0, 1.0)) {
                    Ok(d) => d.sample(rng) as f64 / n as f64,
                    Err(_) => f64::NAN,
                }
            }
            Family::Tweedie => sample_tweedie(rng, mu, phi, power),
        }
    }
}

fn ln_beta<T: Real>(a: T, b: T) -> T {
    ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b)
}

/// Compound Poisson-Gamma density: N ~ Poisson(lambda) jumps of
/// Gamma(alpha, tau), with lambda = mu^(2-p) / (phi (2-p)),
/// alpha = (2-p)/(p-1), tau = phi (p-1) mu^(p-1).
fn tweedie_log_density<T: Real>(link: Link, y: f64, eta: T, log_phi: T, psi: T) -> T {
    let p = Family::tweedie_power(psi);
    let two_m_p = T::one() - logistic(psi);
    let p_m1 = logistic(psi);
    let lmu = link.log_inverse(eta);
    let log_lambda = two_m_p * lmu - log_phi - two_m_p.ln();
    let lambda = log_lambda.exp();
    if y == 0.0 {
        return -lambda;
    }
    let alpha = two_m_p / p_m1;
    let log_tau = log_phi + p_m1.ln() + (p - T::one()) * lmu;
    let ly = y.ln();

    let term = |j: usize| -> T {
        let jf = T::cst(j as f64);
        jf * log_lambda - T::cst(ln_factorial(j as f64)) + jf * alpha * T::cst(ly)
            - ln_gamma(jf * alpha)
            - jf * alpha * log_tau
    };

    // Locate the significant range of the series on the real parts.
    let mut best = f64::NEG_INFINITY;
    let mut last = 1;
    for j in 1..=TWEEDIE_SERIES_MAX_TERMS {
        let t = term(j).re();
        if t > best {
            best = t;
        }
        last = j;
        if t < best - TWEEDIE_SERIES_DROP && t.is_finite() {
            break;
        }
    }
    let terms: Vec<T> = (1..=last)
        .map(&term)
        .filter(|t| t.re() >= best - TWEEDIE_SERIES_DROP)
        .collect();
    let shift = T::cst(best);
    let mut sum = T::zero();
    for t in &terms {
        sum += (*t - shift).exp();
    }
    -lambda - T::cst(y) / log_tau.exp() - T::cst(ly) + shift + sum.ln()
}

fn sample_poisson<R: Rng + ?Sized>(rng: &mut R, mu: f64) -> f64 {
    if mu <= 0.0 {
        return 0.0;
    }
    match Poisson::new(mu) {
        Ok(d) => d.sample(rng),
        Err(_) => f64::NAN,
    }
}

/// Negative binomial as a Gamma mixture of Poissons with the given size.
fn sample_gamma_poisson<R: Rng + ?Sized>(rng: &mut R, mu: f64, size: f64) -> f64 {
    match Gamma::new(size, mu / size) {
        Ok(d) => {
            let lambda = d.sample(rng);
            sample_poisson(rng, lambda)
        }
        Err(_) => f64::NAN,
    }
}

/// Rejection sampling from the zero-truncated distribution. Falls back to
/// 1 when the untruncated mass at zero is so large that no positive draw
/// turns up.
fn sample_positive<R: Rng + ?Sized, F: FnMut(&mut R) -> f64>(rng: &mut R, mut draw: F) -> f64 {
    for _ in 0..1000 {
        let y = draw(rng);
        if y > 0.0 {
            return y;
        }
    }
    1.0
}

fn sample_tweedie<R: Rng + ?Sized>(rng: &mut R, mu: f64, phi: f64, power: f64) -> f64 {
    let lambda = mu.powf(2.0 - power) / (phi * (2.0 - power));
    let alpha = (2.0 - power) / (power - 1.0);
    let tau = phi * (power - 1.0) * mu.powf(power - 1.0);
    let n = sample_poisson(rng, lambda);
    if n <= 0.0 {
        return 0.0;
    }
    match Gamma::new(n * alpha, tau) {
        Ok(d) => d.sample(rng),
        Err(_) => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn eta4(c: f64, zi: f64, d: f64, s: f64) -> [f64; 4] {
        [c, zi, d, s]
    }

    #[test]
    fn test_registry_lookup() {
        for (i, info) in Family::registry().iter().enumerate() {
            assert_eq!(info.family as usize, i);
            assert_eq!(info.family.info().name, info.name);
            assert_eq!(Family::parse(info.name), Some(info.family));
            assert!(info.links.contains(&info.default_link));
        }
        assert_eq!(Family::parse("nbinom"), Some(Family::NBinom2));
        assert_eq!(Family::parse("unknown"), None);
    }

    #[test]
    fn test_poisson_density() {
        let mu: f64 = 2.5;
        let ll = Family::Poisson.log_density(Link::Log, 3.0, 1.0, mu.ln(), 0.0, 0.0);
        let expected = 3.0 * mu.ln() - mu - 6.0_f64.ln();
        assert!((ll - expected).abs() < 1e-12);
    }

    #[test]
    fn test_densities_sum_to_one() {
        let cases = [
            (Family::Poisson, 1.2_f64.ln(), 0.0),
            (Family::NBinom2, 3.0_f64.ln(), 0.7),
            (Family::NBinom1, 3.0_f64.ln(), -0.3),
            (Family::TruncatedPoisson, 0.8_f64.ln(), 0.0),
            (Family::TruncatedNBinom2, 2.0_f64.ln(), 0.2),
        ];
        for (fam, eta, lphi) in cases {
            let first = if fam.is_truncated() { 1 } else { 0 };
            let total: f64 = (first..400)
                .map(|y| fam.obs_log_lik(Link::Log, false, y as f64, 1.0, &eta4(eta, 0.0, lphi, 0.0)))
                .map(f64::exp)
                .sum();
            assert!((total - 1.0).abs() < 1e-8, "{}: {}", fam.name(), total);
        }
    }

    #[test]
    fn test_binomial_uses_trials() {
        let p: f64 = 0.3;
        let eta = (p / (1.0 - p)).ln();
        let ll = Family::Binomial.obs_log_lik(Link::Logit, false, 0.4, 5.0, &eta4(eta, 0.0, 0.0, 0.0));
        let expected = ln_choose(5.0, 2.0) + 2.0 * p.ln() + 3.0 * (1.0 - p).ln();
        assert!((ll - expected).abs() < 1e-10);
    }

    #[test]
    fn test_zero_inflation_at_zero_probability_is_base() {
        for y in [0.0, 1.0, 4.0] {
            let e = eta4(0.9, -800.0, 0.0, 0.0);
            let zi = Family::Poisson.obs_log_lik(Link::Log, true, y, 1.0, &e);
            let base = Family::Poisson.obs_log_lik(Link::Log, false, y, 1.0, &e);
            assert!((zi - base).abs() < 1e-12, "y={}: {} vs {}", y, zi, base);
        }
    }

    #[test]
    fn test_hurdle_zero_is_zero_probability() {
        let e = eta4(0.5, 0.4, 0.0, 0.0);
        let ll = Family::TruncatedPoisson.obs_log_lik(Link::Log, true, 0.0, 1.0, &e);
        assert!((ll - log_logistic(0.4)).abs() < 1e-12);
    }

    #[test]
    fn test_gamma_density_matches_statrs() {
        use statrs::distribution::{Continuous, Gamma as SGamma};
        let (mu, phi, y): (f64, f64, f64) = (2.0, 0.5, 1.3);
        let ll = Family::Gamma.log_density(Link::Log, y, 1.0, mu.ln(), phi.ln(), 0.0);
        let reference = SGamma::new(1.0 / phi, 1.0 / (mu * phi)).unwrap().ln_pdf(y);
        assert!((ll - reference).abs() < 1e-9);
    }

    #[test]
    fn test_tweedie_integrates_to_one() {
        let (mu, phi, psi): (f64, f64, f64) = (1.5, 0.8, 0.0);
        let eta = mu.ln();
        let p0 = Family::Tweedie.log_density(Link::Log, 0.0, 1.0, eta, phi.ln(), psi).exp();
        let h = 0.002;
        let mut mass = 0.0;
        let mut y = h / 2.0;
        while y < 40.0 {
            mass += Family::Tweedie.log_density(Link::Log, y, 1.0, eta, phi.ln(), psi).exp() * h;
            y += h;
        }
        assert!((p0 + mass - 1.0).abs() < 2e-3, "{}", p0 + mass);
    }

    #[test]
    fn test_truncated_moments() {
        let mu: f64 = 0.7;
        let (m, _) = Family::TruncatedPoisson.moments(mu, 1.0, 0.0, 1.0, 0.0, false);
        assert!((m - mu / (1.0 - (-mu).exp())).abs() < 1e-12);
    }

    #[test]
    fn test_support_checks() {
        assert!(Family::TruncatedPoisson.check_response(0.0, 1.0, false).is_err());
        assert!(Family::TruncatedPoisson.check_response(0.0, 1.0, true).is_ok());
        assert!(Family::Poisson.check_response(1.5, 1.0, false).is_err());
        assert!(Family::Binomial.check_response(0.5, 4.0, false).is_ok());
        assert!(Family::Binomial.check_response(0.3, 4.0, false).is_err());
        assert!(Family::Beta.check_response(1.0, 1.0, false).is_err());
    }

    #[test]
    fn test_sampling_means() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(7);
        let n = 20000;
        let draws: Vec<f64> = (0..n)
            .map(|_| Family::NBinom2.sample(&mut rng, 3.0, 2.0, 0.0, 1.0))
            .collect();
        let mean = draws.iter().sum::<f64>() / n as f64;
        assert!((mean - 3.0).abs() < 0.1, "{}", mean);
        assert!((0..200).all(|_| Family::TruncatedPoisson.sample(&mut rng, 0.3, 1.0, 0.0, 1.0) >= 1.0));
    }
}
