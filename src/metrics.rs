use serde::{Serialize, Serializer, ser::SerializeMap};

use crate::error::{BackendError, Result};

/// A single metric, either a number, a series of numbers or a group of named metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Vector(Vec<f64>),
    Nested(MetricsMapping),
}

impl MetricValue {
    /// Adds `other` into `self`: scalars add, vectors add element-wise and nested mappings
    /// merge recursively.
    ///
    /// # Args
    /// * `name` - The metric's name, used for error reporting.
    /// * `other` - The value to add.
    ///
    /// # Errors
    /// `MetricShapeMismatch` if the kinds or the vector lengths differ.
    fn accumulate(&mut self, name: &str, other: &MetricValue) -> Result<()> {
        match (self, other) {
            (MetricValue::Scalar(a), MetricValue::Scalar(b)) => *a += b,
            (MetricValue::Vector(a), MetricValue::Vector(b)) if a.len() == b.len() => {
                a.iter_mut().zip(b).for_each(|(a, b)| *a += b);
            }
            (MetricValue::Nested(a), MetricValue::Nested(b)) => a.merge(b)?,
            _ => {
                return Err(BackendError::MetricShapeMismatch {
                    metric: name.to_string(),
                });
            }
        }

        Ok(())
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Scalar(value)
    }
}

impl From<Vec<f64>> for MetricValue {
    fn from(values: Vec<f64>) -> Self {
        MetricValue::Vector(values)
    }
}

impl From<MetricsMapping> for MetricValue {
    fn from(mapping: MetricsMapping) -> Self {
        MetricValue::Nested(mapping)
    }
}

/// Metric name to value, keeping the order in which names were first inserted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsMapping {
    entries: Vec<(String, MetricValue)>,
}

impl MetricsMapping {
    /// Creates an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sums every mapping key by key, in the given order.
    ///
    /// # Args
    /// * `mappings` - The mappings to sum.
    ///
    /// # Returns
    /// A mapping holding every name seen, or `MetricShapeMismatch`.
    pub fn sum<'a, I>(mappings: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a MetricsMapping>,
    {
        let mut total = Self::new();
        for mapping in mappings {
            total.merge(mapping)?;
        }
        Ok(total)
    }

    /// Inserts a metric, replacing the value in place if the name already exists.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<MetricValue>) {
        let name = name.into();
        let value = value.into();

        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Adds every metric of `other` into `self`, new names are appended.
    pub fn merge(&mut self, other: &MetricsMapping) -> Result<()> {
        for (name, value) in &other.entries {
            match self.entries.iter_mut().find(|(n, _)| n == name) {
                Some((_, slot)) => slot.accumulate(name, value)?,
                None => self.entries.push((name.clone(), value.clone())),
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.entries
            .iter()
            .find_map(|(n, value)| (n == name).then_some(value))
    }

    /// Shortcut for a scalar metric's value.
    pub fn scalar(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            MetricValue::Scalar(value) => Some(*value),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricValue)> {
        self.entries.iter().map(|(n, value)| (n.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for MetricsMapping
where
    K: Into<String>,
    V: Into<MetricValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut mapping = Self::new();
        for (name, value) in iter {
            mapping.insert(name, value);
        }
        mapping
    }
}

impl Serialize for MetricsMapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
