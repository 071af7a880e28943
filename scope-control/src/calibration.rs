//! Calibration curves mapping logical optical values to raw servo positions.
//!
//! A curve is an ordered list of measured anchors, for example the raw zoom
//! servo position at which the eyepiece reads 8 mm and 24 mm. Lookups
//! interpolate linearly between the bracketing anchors. Values past either end
//! are clamped to the end anchor and reported as a [`Boundary`], never
//! extrapolated past verified travel.
//!
//! Curves are immutable once built; recalibration replaces the whole curve.
//!
//! # Example
//!
//! ```
//! use scope_control::calibration::{Anchor, CalibrationCurve};
//!
//! let curve = CalibrationCurve::new(vec![Anchor::new(8.0, 100), Anchor::new(24.0, 900)]).unwrap();
//! assert_eq!(curve.lookup(16.0).unwrap().raw, 500);
//! assert!(curve.lookup(30.0).unwrap().boundary.is_some());
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One measured calibration point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    /// Logical value (focal length in mm, or focus offset).
    pub logical: f64,
    /// Raw servo position at that value.
    pub raw: i32,
}

impl Anchor {
    pub fn new(logical: f64, raw: i32) -> Self {
        Self { logical, raw }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("calibration needs at least 2 anchors, got {0}")]
    TooFewAnchors(usize),

    #[error("anchor {index} has a non-finite logical value")]
    NonFiniteAnchor { index: usize },

    #[error("anchor {index} repeats logical value {logical}")]
    DuplicateLogical { index: usize, logical: f64 },

    /// Raw positions must rise (or fall) strictly along the curve.
    #[error("raw positions are not strictly monotonic at anchor {index}")]
    NotMonotonic { index: usize },

    #[error("target {0} is not a finite number")]
    NonFiniteTarget(f64),
}

/// A lookup that ran off one end of the curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Boundary {
    pub requested: f64,
    /// Logical value of the end anchor actually used.
    pub used: f64,
}

/// Result of a calibration lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lookup {
    pub raw: i32,
    pub boundary: Option<Boundary>,
}

/// Piecewise-linear map from logical value to raw position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Anchor>", into = "Vec<Anchor>")]
pub struct CalibrationCurve {
    anchors: Vec<Anchor>,
}

impl CalibrationCurve {
    /// Build a curve, ordering anchors by logical value.
    pub fn new(mut anchors: Vec<Anchor>) -> Result<Self, CalibrationError> {
        if anchors.len() < 2 {
            return Err(CalibrationError::TooFewAnchors(anchors.len()));
        }
        if let Some(index) = anchors.iter().position(|a| !a.logical.is_finite()) {
            return Err(CalibrationError::NonFiniteAnchor { index });
        }
        anchors.sort_by(|a, b| a.logical.total_cmp(&b.logical));

        let rising = anchors[1].raw > anchors[0].raw;
        for (index, pair) in anchors.windows(2).enumerate() {
            if pair[0].logical == pair[1].logical {
                return Err(CalibrationError::DuplicateLogical {
                    index,
                    logical: pair[0].logical,
                });
            }
            let ordered = if rising {
                pair[1].raw > pair[0].raw
            } else {
                pair[1].raw < pair[0].raw
            };
            if !ordered {
                return Err(CalibrationError::NotMonotonic { index: index + 1 });
            }
        }
        Ok(Self { anchors })
    }

    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    fn first(&self) -> Anchor {
        self.anchors[0]
    }

    fn last(&self) -> Anchor {
        self.anchors[self.anchors.len() - 1]
    }

    /// Logical span covered by the anchors.
    pub fn logical_range(&self) -> (f64, f64) {
        (self.first().logical, self.last().logical)
    }

    /// Smallest and largest raw position on the curve.
    pub fn raw_range(&self) -> (i32, i32) {
        let (a, b) = (self.first().raw, self.last().raw);
        (a.min(b), a.max(b))
    }

    /// Raw position for a logical value.
    pub fn lookup(&self, logical: f64) -> Result<Lookup, CalibrationError> {
        if !logical.is_finite() {
            return Err(CalibrationError::NonFiniteTarget(logical));
        }

        let (first, last) = (self.first(), self.last());
        let end = if logical < first.logical {
            Some(first)
        } else if logical > last.logical {
            Some(last)
        } else {
            None
        };
        if let Some(anchor) = end {
            return Ok(Lookup {
                raw: anchor.raw,
                boundary: Some(Boundary {
                    requested: logical,
                    used: anchor.logical,
                }),
            });
        }

        let pair = self
            .anchors
            .windows(2)
            .find(|pair| logical <= pair[1].logical)
            .unwrap_or(&self.anchors[self.anchors.len() - 2..]);
        let (a, b) = (pair[0], pair[1]);
        let fraction = (logical - a.logical) / (b.logical - a.logical);
        let raw = a.raw as f64 + fraction * (b.raw - a.raw) as f64;

        Ok(Lookup {
            raw: raw.round() as i32,
            boundary: None,
        })
    }

    /// Logical value for a raw position, clamped to the curve's span.
    pub fn inverse(&self, raw: i32) -> f64 {
        let (lo, hi) = self.raw_range();
        if raw <= lo || raw >= hi {
            let at_low_end = (raw <= lo) == (self.first().raw == lo);
            return if at_low_end {
                self.first().logical
            } else {
                self.last().logical
            };
        }

        for pair in self.anchors.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let (pmin, pmax) = (a.raw.min(b.raw), a.raw.max(b.raw));
            if (pmin..=pmax).contains(&raw) {
                let fraction = (raw - a.raw) as f64 / (b.raw - a.raw) as f64;
                return a.logical + fraction * (b.logical - a.logical);
            }
        }
        self.last().logical
    }
}

impl TryFrom<Vec<Anchor>> for CalibrationCurve {
    type Error = CalibrationError;

    fn try_from(anchors: Vec<Anchor>) -> Result<Self, Self::Error> {
        Self::new(anchors)
    }
}

impl From<CalibrationCurve> for Vec<Anchor> {
    fn from(curve: CalibrationCurve) -> Self {
        curve.anchors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn zoom_curve() -> CalibrationCurve {
        CalibrationCurve::new(vec![Anchor::new(8.0, 100), Anchor::new(24.0, 900)]).unwrap()
    }

    #[test]
    fn test_lookup_interpolates_midpoint() {
        let lookup = zoom_curve().lookup(16.0).unwrap();
        assert_eq!(lookup.raw, 500);
        assert_eq!(lookup.boundary, None);
    }

    #[test]
    fn test_lookup_hits_anchors_exactly() {
        let curve = zoom_curve();
        assert_eq!(curve.lookup(8.0).unwrap().raw, 100);
        assert_eq!(curve.lookup(24.0).unwrap().raw, 900);
    }

    #[test]
    fn test_lookup_clamps_beyond_ends() {
        let curve = zoom_curve();

        let low = curve.lookup(4.0).unwrap();
        assert_eq!(low.raw, 100);
        assert_eq!(
            low.boundary,
            Some(Boundary {
                requested: 4.0,
                used: 8.0
            })
        );

        let high = curve.lookup(40.0).unwrap();
        assert_eq!(high.raw, 900);
        assert_relative_eq!(high.boundary.unwrap().used, 24.0);
    }

    #[test]
    fn test_lookup_rejects_non_finite() {
        assert!(matches!(
            zoom_curve().lookup(f64::NAN),
            Err(CalibrationError::NonFiniteTarget(_))
        ));
    }

    #[test]
    fn test_lookup_is_monotonic_and_bracketed() {
        let curve = CalibrationCurve::new(vec![
            Anchor::new(8.0, 100),
            Anchor::new(12.0, 250),
            Anchor::new(18.0, 610),
            Anchor::new(24.0, 900),
        ])
        .unwrap();

        let mut previous = curve.lookup(8.0).unwrap().raw;
        let mut x = 8.0;
        while x < 24.0 {
            x += 0.25;
            let raw = curve.lookup(x).unwrap().raw;
            assert!(raw >= previous, "lookup({x}) went backwards");
            assert_eq!(raw, curve.lookup(x).unwrap().raw);
            previous = raw;
        }

        for pair in curve.anchors().windows(2) {
            let mid = (pair[0].logical + pair[1].logical) / 2.0;
            let raw = curve.lookup(mid).unwrap().raw;
            assert!(raw > pair[0].raw && raw < pair[1].raw);
        }
    }

    #[test]
    fn test_descending_curve() {
        let curve =
            CalibrationCurve::new(vec![Anchor::new(-1.0, 800), Anchor::new(1.0, 400)]).unwrap();
        assert_eq!(curve.lookup(0.0).unwrap().raw, 600);
        assert_eq!(curve.raw_range(), (400, 800));
        assert_relative_eq!(curve.inverse(700), -0.5);
        assert_relative_eq!(curve.inverse(900), -1.0);
        assert_relative_eq!(curve.inverse(100), 1.0);
    }

    #[test]
    fn test_inverse_round_trips_through_lookup() {
        let curve = zoom_curve();
        assert_relative_eq!(curve.inverse(500), 16.0);
        assert_relative_eq!(curve.inverse(498), 15.96, epsilon = 1e-9);
        assert_relative_eq!(curve.inverse(50), 8.0);
        assert_relative_eq!(curve.inverse(1000), 24.0);
    }

    #[test]
    fn test_new_sorts_anchors() {
        let curve =
            CalibrationCurve::new(vec![Anchor::new(24.0, 900), Anchor::new(8.0, 100)]).unwrap();
        assert_eq!(curve.logical_range(), (8.0, 24.0));
    }

    #[test]
    fn test_new_rejects_bad_curves() {
        assert_eq!(
            CalibrationCurve::new(vec![Anchor::new(8.0, 100)]),
            Err(CalibrationError::TooFewAnchors(1))
        );
        assert!(matches!(
            CalibrationCurve::new(vec![
                Anchor::new(8.0, 100),
                Anchor::new(12.0, 400),
                Anchor::new(24.0, 300),
            ]),
            Err(CalibrationError::NotMonotonic { index: 2 })
        ));
        assert!(matches!(
            CalibrationCurve::new(vec![Anchor::new(8.0, 100), Anchor::new(8.0, 300)]),
            Err(CalibrationError::DuplicateLogical { .. })
        ));
        assert!(matches!(
            CalibrationCurve::new(vec![Anchor::new(f64::INFINITY, 100), Anchor::new(8.0, 300)]),
            Err(CalibrationError::NonFiniteAnchor { index: 0 })
        ));
    }

    #[test]
    fn test_serde_validates_on_load() {
        let curve: CalibrationCurve =
            serde_json::from_str(r#"[{"logical":8.0,"raw":100},{"logical":24.0,"raw":900}]"#)
                .unwrap();
        assert_eq!(curve, zoom_curve());

        let bad = serde_json::from_str::<CalibrationCurve>(r#"[{"logical":8.0,"raw":100}]"#);
        assert!(bad.is_err());
    }
}
