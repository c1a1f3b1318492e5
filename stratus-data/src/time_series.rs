//! Ordered per-epoch sequences.

use crate::ConfigurationError;
use serde::{Deserialize, Serialize};

/// Values indexed by strictly increasing acquisition timestamps (seconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "RawTimeSeries<T>",
    bound(deserialize = "T: Deserialize<'de>")
)]
pub struct TimeSeries<T> {
    times: Vec<f64>,
    values: Vec<T>,
}

#[derive(Deserialize)]
struct RawTimeSeries<T> {
    times: Vec<f64>,
    values: Vec<T>,
}

impl<T> TryFrom<RawTimeSeries<T>> for TimeSeries<T> {
    type Error = ConfigurationError;

    fn try_from(raw: RawTimeSeries<T>) -> Result<Self, Self::Error> {
        TimeSeries::new(raw.times, raw.values)
    }
}

impl<T> TimeSeries<T> {
    pub fn new(times: Vec<f64>, values: Vec<T>) -> Result<Self, ConfigurationError> {
        if times.len() != values.len() {
            return Err(ConfigurationError::LengthMismatch {
                expected: times.len(),
                actual: values.len(),
            });
        }
        if let Some(index) = times.iter().position(|t| !t.is_finite()) {
            return Err(ConfigurationError::NonIncreasingTimestamps { index });
        }
        if let Some(index) = times.windows(2).position(|w| w[1] <= w[0]) {
            return Err(ConfigurationError::NonIncreasingTimestamps { index: index + 1 });
        }
        Ok(Self { times, values })
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (f64, T)>) -> Result<Self, ConfigurationError> {
        let (times, values) = pairs.into_iter().unzip();
        Self::new(times, values)
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [T] {
        &mut self.values
    }

    pub fn get(&self, index: usize) -> Option<(f64, &T)> {
        Some((*self.times.get(index)?, self.values.get(index)?))
    }

    pub fn first_time(&self) -> Option<f64> {
        self.times.first().copied()
    }

    /// Elapsed time of step `index` relative to the first step.
    pub fn elapsed(&self, index: usize) -> f64 {
        self.times[index] - self.times[0]
    }

    /// Position of an exact timestamp, if present.
    pub fn index_of(&self, time: f64) -> Option<usize> {
        self.times.binary_search_by(|t| t.total_cmp(&time)).ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, &T)> {
        self.times.iter().copied().zip(self.values.iter())
    }

    /// Same timestamps with transformed values.
    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> TimeSeries<U> {
        TimeSeries {
            times: self.times.clone(),
            values: self.values.iter().map(f).collect(),
        }
    }

    pub fn try_map<U, E>(&self, f: impl FnMut(&T) -> Result<U, E>) -> Result<TimeSeries<U>, E> {
        Ok(TimeSeries {
            times: self.times.clone(),
            values: self.values.iter().map(f).collect::<Result<_, _>>()?,
        })
    }

    /// Whether both series were acquired at exactly the same epochs.
    pub fn same_times<U>(&self, other: &TimeSeries<U>) -> bool {
        self.times == other.times
    }

    pub fn into_parts(self) -> (Vec<f64>, Vec<T>) {
        (self.times, self.values)
    }
}
