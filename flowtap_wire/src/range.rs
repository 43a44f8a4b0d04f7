//! Range expressions for generator configuration.

use std::{cmp, fmt};

use rand::distr::uniform::SampleUniform;
use serde::{Deserialize, Serialize};

/// A constant value or an inclusive range to sample from.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
pub enum ValueRange<T>
where
    T: PartialOrd + Copy,
{
    /// Always `T`
    Constant(T),
    /// Chosen uniformly between `min` and `max`, inclusive of both.
    Inclusive {
        /// Lower bound
        min: T,
        /// Upper bound
        max: T,
    },
}

impl<T> ValueRange<T>
where
    T: PartialOrd + Copy + fmt::Display,
{
    /// Check that `min <= max`.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem when the range is empty.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Constant(_) => Ok(()),
            Self::Inclusive { min, max } => match min.partial_cmp(max) {
                Some(cmp::Ordering::Less | cmp::Ordering::Equal) => Ok(()),
                _ => Err(format!("min {min} must be less than or equal to max {max}")),
            },
        }
    }

    /// Largest value the range can produce.
    #[must_use]
    pub fn end(&self) -> T {
        match self {
            Self::Constant(c) => *c,
            Self::Inclusive { max, .. } => *max,
        }
    }
}

impl<T> ValueRange<T>
where
    T: PartialOrd + Copy + SampleUniform,
{
    /// Draw a value from the range.
    pub fn sample<R>(&self, rng: &mut R) -> T
    where
        R: rand::Rng + ?Sized,
    {
        match self {
            Self::Constant(c) => *c,
            Self::Inclusive { min, max } => rng.random_range(*min..=*max),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::SmallRng};

    use super::*;

    #[test]
    fn inverted_range_is_invalid() {
        let range = ValueRange::Inclusive { min: 10u16, max: 1 };
        assert!(range.validate().is_err());
        assert!(ValueRange::Constant(3u16).validate().is_ok());
    }

    #[test]
    fn samples_stay_in_bounds() {
        let mut rng = SmallRng::seed_from_u64(7);
        let range = ValueRange::Inclusive { min: 5u32, max: 9 };
        for _ in 0..256 {
            let v = range.sample(&mut rng);
            assert!((5..=9).contains(&v));
        }
        assert_eq!(range.end(), 9);
    }
}
