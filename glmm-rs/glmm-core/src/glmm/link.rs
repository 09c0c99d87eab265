//! Link functions for GLMMs.
//!
//! Maps between the linear predictor (eta) and the mean (mu). Every map
//! is generic over [`Real`] so it can sit inside the differentiated
//! objective. Besides mu itself each link supplies `log mu` and
//! `log(1 - mu)` in a form that stays finite where the naive composition
//! would underflow.
//!
//! Overflow guard: for log-type inverse links the exponent is capped
//! softly. Above `LOG_LINK_CAP` the log mean continues as
//! `cap + ln(1 + (eta - cap))`, which is continuous with slope 1 at the
//! cap and never overflows.

use serde::{Deserialize, Serialize};

use crate::util::ad::{self, Real, ScalarFn};
use crate::util::math::{log1mexp, log_logistic, log_normal_cdf, logistic, normal_cdf};

/// Linear predictor value above which the log link grows logarithmically.
pub const LOG_LINK_CAP: f64 = 250.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Link {
    Identity,
    Log,
    Logit,
    Probit,
    Cloglog,
    Inverse,
    Sqrt,
}

/// Guarded exponent: `eta` below the cap, logarithmic growth above it.
pub fn capped_exponent<T: Real>(eta: T) -> T {
    if eta.re() > LOG_LINK_CAP {
        T::cst(LOG_LINK_CAP) + (eta - T::cst(LOG_LINK_CAP)).ln_1p()
    } else {
        eta
    }
}

impl Link {
    pub const ALL: [Link; 7] = [
        Link::Identity,
        Link::Log,
        Link::Logit,
        Link::Probit,
        Link::Cloglog,
        Link::Inverse,
        Link::Sqrt,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Link::Identity => "identity",
            Link::Log => "log",
            Link::Logit => "logit",
            Link::Probit => "probit",
            Link::Cloglog => "cloglog",
            Link::Inverse => "inverse",
            Link::Sqrt => "sqrt",
        }
    }

    pub fn parse(name: &str) -> Option<Link> {
        let lower = name.trim().to_ascii_lowercase();
        Link::ALL.iter().copied().find(|l| l.name() == lower)
    }

    /// Inverse link: mu = g^{-1}(eta).
    pub fn inverse<T: Real>(self, eta: T) -> T {
        match self {
            Link::Identity => eta,
            Link::Log => capped_exponent(eta).exp(),
            Link::Logit => logistic(eta),
            Link::Probit => normal_cdf(eta),
            Link::Cloglog => -(-capped_exponent(eta).exp()).exp_m1(),
            Link::Inverse => eta.recip(),
            Link::Sqrt => eta * eta,
        }
    }

    /// log(mu), evaluated without forming mu where that would underflow.
    pub fn log_inverse<T: Real>(self, eta: T) -> T {
        match self {
            Link::Identity => eta.ln(),
            Link::Log => capped_exponent(eta),
            Link::Logit => log_logistic(eta),
            Link::Probit => log_normal_cdf(eta),
            Link::Cloglog => log1mexp(-capped_exponent(eta).exp()),
            Link::Inverse => -eta.ln(),
            Link::Sqrt => T::cst(2.0) * eta.abs().ln(),
        }
    }

    /// log(1 - mu) for links onto the unit interval.
    pub fn log1m_inverse<T: Real>(self, eta: T) -> T {
        match self {
            Link::Logit => log_logistic(-eta),
            Link::Probit => log_normal_cdf(-eta),
            Link::Cloglog => -capped_exponent(eta).exp(),
            _ => (-self.inverse(eta)).ln_1p(),
        }
    }

    /// Link function: eta = g(mu).
    pub fn link(self, mu: f64) -> f64 {
        match self {
            Link::Identity => mu,
            Link::Log => mu.ln(),
            Link::Logit => (mu / (1.0 - mu)).ln(),
            Link::Probit => crate::util::math::normal_quantile(mu),
            Link::Cloglog => (-(-mu).ln_1p()).ln(),
            Link::Inverse => mu.recip(),
            Link::Sqrt => mu.sqrt(),
        }
    }

    /// d(mu)/d(eta), by forward differentiation of the inverse link.
    pub fn mu_eta(self, eta: f64) -> f64 {
        let (_, g) = ad::gradient(&InverseLink(self), &[eta]);
        g[0]
    }

    /// Whether the link maps onto (0, 1).
    pub fn is_unit_interval(self) -> bool {
        matches!(self, Link::Logit | Link::Probit | Link::Cloglog)
    }
}

struct InverseLink(Link);

impl ScalarFn for InverseLink {
    fn eval<T: Real>(&self, x: &[T]) -> T {
        self.0.inverse(x[0])
    }
}
