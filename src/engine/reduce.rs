//! Accumulators for [`SolidChain::reduce`](crate::engine::chain::SolidChain::reduce).
//!
//! A reduction folds every visited row into a per-range accumulator on the
//! worker that owns the range, then merges the partial accumulators in range
//! order. The types here are plain data: `init` builds an empty one, `fold`
//! feeds a row into it, and `merge` combines two partials.
//!
//! ```ignore
//! let wealth = chain.reduce(
//!     Welford::default,
//!     |mut acc, row| {
//!         acc.push(row.get::<Wealth>().map_or(0.0, |w| w.0));
//!         acc
//!     },
//!     Welford::merge,
//! )?;
//! ```

/// Number of rows folded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Count(pub u64);

impl Count {
    /// Counts one more row.
    #[inline]
    pub fn bump(mut self) -> Self {
        self.0 += 1;
        self
    }

    /// Sum of two partial counts.
    #[inline]
    pub fn merge(self, other: Count) -> Count {
        Count(self.0 + other.0)
    }
}

/// Floating-point total.
///
/// Plain addition; for large populations of very different magnitudes
/// [`Welford`] keeps more precision in the mean.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Sum(pub f64);

impl Sum {
    /// Adds a value.
    #[inline]
    pub fn add(mut self, value: f64) -> Self {
        self.0 += value;
        self
    }

    /// Sum of two partial totals.
    #[inline]
    pub fn merge(self, other: Sum) -> Sum {
        Sum(self.0 + other.0)
    }
}

/// Smallest and largest value seen.
///
/// Starts at `(+inf, -inf)`, so the first value sets both bounds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MinMax {
    /// Smallest value seen.
    pub min: f64,

    /// Largest value seen.
    pub max: f64,
}

impl Default for MinMax {
    fn default() -> Self {
        Self { min: f64::INFINITY, max: f64::NEG_INFINITY }
    }
}

impl MinMax {
    /// Widens the bounds to include `value`.
    #[inline]
    pub fn push(mut self, value: f64) -> Self {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self
    }

    /// `true` until a value was pushed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    /// Union of two partial bounds.
    #[inline]
    pub fn merge(self, other: MinMax) -> MinMax {
        MinMax { min: self.min.min(other.min), max: self.max.max(other.max) }
    }
}

/// Running mean and variance (Welford's online algorithm).
///
/// Partials merge with the parallel update of Chan et al., so the result does
/// not depend on how rows were split between workers beyond floating-point
/// rounding.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Welford {
    /// Samples seen.
    pub n: u64,

    /// Running mean.
    pub mean: f64,

    /// Sum of squared deviations from the mean.
    pub m2: f64,
}

impl Welford {
    /// Adds a sample.
    pub fn push(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (x - self.mean);
    }

    /// Combines two partials.
    pub fn merge(self, other: Welford) -> Welford {
        if self.n == 0 {
            return other;
        }
        if other.n == 0 {
            return self;
        }
        let n = self.n + other.n;
        let delta = other.mean - self.mean;
        let weight = other.n as f64 / n as f64;
        Welford {
            n,
            mean: self.mean + delta * weight,
            m2: self.m2 + other.m2 + delta * delta * self.n as f64 * weight,
        }
    }

    /// Unbiased sample variance; `0` below two samples.
    pub fn variance(&self) -> f64 {
        if self.n > 1 {
            self.m2 / (self.n - 1) as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welford_merge_matches_single_pass() {
        let samples = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let mut whole = Welford::default();
        samples.iter().for_each(|&x| whole.push(x));

        let (left, right) = samples.split_at(3);
        let mut a = Welford::default();
        left.iter().for_each(|&x| a.push(x));
        let mut b = Welford::default();
        right.iter().for_each(|&x| b.push(x));
        let merged = a.merge(b);

        assert_eq!(merged.n, whole.n);
        assert!((merged.mean - 5.0).abs() < 1e-12);
        assert!((merged.variance() - whole.variance()).abs() < 1e-12);
        assert_eq!(Welford::default().merge(whole), whole);
    }

    #[test]
    fn min_max_starts_empty() {
        let bounds = MinMax::default();
        assert!(bounds.is_empty());
        let bounds = bounds.push(3.0).merge(MinMax::default().push(-1.0));
        assert_eq!((bounds.min, bounds.max), (-1.0, 3.0));
        assert_eq!(Count::default().bump().merge(Count(2)), Count(3));
        assert_eq!(Sum(1.5).add(2.0), Sum(3.5));
    }
}
