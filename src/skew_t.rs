use statrs::distribution::{ContinuousCDF, Normal, StudentsT};
use statrs::function::gamma::ln_gamma;

use crate::error::ContextError;

const LN_PI: f64 = 1.144_729_885_849_400_2;
const LN_2: f64 = std::f64::consts::LN_2;

/// Degrees of freedom beyond which the t kernel is evaluated through its
/// Gaussian limit (tail-reduction references use df around 1e8-1e13, far
/// outside the stable range of the incomplete-beta CDF).
pub const LARGE_DEGREE_OF_FREEDOM: f64 = 1e6;

/// Azzalini skew-t distribution with four parameters.
///
/// Density: `2/scale * t(z; df) * T(shape * z * sqrt((df+1)/(df+z^2)); df+1)`
/// where `z = (x - location)/scale`, `t` is the Student-t density and `T` the
/// Student-t CDF. Constructed once per vector and reused for every grid
/// evaluation; carries no mutable state.
#[derive(Debug, Clone)]
pub struct SkewT {
    pub location: f64,
    pub scale: f64,
    pub degree_of_freedom: f64,
    pub shape: f64,
    tail: TailCdf,
}

#[derive(Debug, Clone)]
enum TailCdf {
    StudentsT(StudentsT),
    Gaussian(Normal),
}

impl SkewT {
    pub fn new(
        location: f64,
        scale: f64,
        degree_of_freedom: f64,
        shape: f64,
    ) -> Result<Self, ContextError> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(ContextError::NumericDomain(format!(
                "scale must be finite and > 0, got {}",
                scale
            )));
        }
        if !degree_of_freedom.is_finite() || degree_of_freedom <= 0.0 {
            return Err(ContextError::NumericDomain(format!(
                "degree of freedom must be finite and > 0, got {}",
                degree_of_freedom
            )));
        }
        if !location.is_finite() || !shape.is_finite() {
            return Err(ContextError::NumericDomain(format!(
                "location and shape must be finite, got {} and {}",
                location, shape
            )));
        }

        let tail_degree_of_freedom = degree_of_freedom + 1.0;
        let tail = if tail_degree_of_freedom > LARGE_DEGREE_OF_FREEDOM {
            TailCdf::Gaussian(Normal::new(0.0, 1.0).map_err(|e| {
                ContextError::NumericDomain(format!("standard normal: {}", e))
            })?)
        } else {
            TailCdf::StudentsT(StudentsT::new(0.0, 1.0, tail_degree_of_freedom).map_err(
                |e| ContextError::NumericDomain(format!("student-t CDF: {}", e)),
            )?)
        };

        Ok(Self {
            location,
            scale,
            degree_of_freedom,
            shape,
            tail,
        })
    }

    /// Log density of the symmetric t kernel at standardized `z`.
    fn t_log_pdf(&self, z: f64) -> f64 {
        let df = self.degree_of_freedom;
        if df > LARGE_DEGREE_OF_FREEDOM {
            // Gaussian limit
            -0.5 * z * z - 0.5 * (LN_2 + LN_PI)
        } else {
            ln_gamma(0.5 * (df + 1.0)) - ln_gamma(0.5 * df)
                - 0.5 * (df.ln() + LN_PI)
                - 0.5 * (df + 1.0) * (z * z / df).ln_1p()
        }
    }

    fn tail_cdf(&self, w: f64) -> f64 {
        match &self.tail {
            TailCdf::StudentsT(t) => t.cdf(w),
            TailCdf::Gaussian(n) => n.cdf(w),
        }
    }

    pub fn pdf(&self, x: f64) -> f64 {
        let z = (x - self.location) / self.scale;
        let df = self.degree_of_freedom;
        let w = if df > LARGE_DEGREE_OF_FREEDOM {
            self.shape * z
        } else {
            self.shape * z * ((df + 1.0) / (df + z * z)).sqrt()
        };
        2.0 / self.scale * self.t_log_pdf(z).exp() * self.tail_cdf(w)
    }

    pub fn log_pdf(&self, x: f64) -> f64 {
        let z = (x - self.location) / self.scale;
        let df = self.degree_of_freedom;
        let w = if df > LARGE_DEGREE_OF_FREEDOM {
            self.shape * z
        } else {
            self.shape * z * ((df + 1.0) / (df + z * z)).sqrt()
        };
        LN_2 - self.scale.ln() + self.t_log_pdf(z) + self.tail_cdf(w).ln()
    }

    pub fn pdf_over(&self, grid: &[f64]) -> Vec<f64> {
        grid.iter().map(|&x| self.pdf(x)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn zero_shape_is_symmetric() {
        let st = SkewT::new(0.0, 1.0, 5.0, 0.0).unwrap();
        assert_relative_eq!(st.pdf(1.3), st.pdf(-1.3), epsilon = 1e-12);
    }

    #[test]
    fn integrates_to_one() {
        let st = SkewT::new(1.0, 2.0, 8.0, 3.0).unwrap();
        let n = 40_000;
        let (lo, hi) = (-60.0, 60.0);
        let dx = (hi - lo) / n as f64;
        let total: f64 = (0..=n).map(|i| st.pdf(lo + i as f64 * dx) * dx).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn large_df_matches_gaussian_limit() {
        // shape 0, huge df: density should match the normal density
        let st = SkewT::new(0.0, 1.0, 1e10, 0.0).unwrap();
        let normal_pdf_at_0 = 1.0 / (2.0 * std::f64::consts::PI).sqrt();
        assert_relative_eq!(st.pdf(0.0), normal_pdf_at_0, epsilon = 1e-6);
    }

    #[test]
    fn positive_shape_skews_right() {
        let st = SkewT::new(0.0, 1.0, 10.0, 4.0).unwrap();
        assert!(st.pdf(1.0) > st.pdf(-1.0));
    }

    #[test]
    fn rejects_degenerate_parameters() {
        assert!(SkewT::new(0.0, 0.0, 5.0, 0.0).is_err());
        assert!(SkewT::new(0.0, -1.0, 5.0, 0.0).is_err());
        assert!(SkewT::new(0.0, 1.0, 0.0, 0.0).is_err());
        assert!(SkewT::new(0.0, 1.0, f64::NAN, 0.0).is_err());
    }
}
