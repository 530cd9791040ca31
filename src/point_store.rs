use crate::error::{Error, Result};
use crate::normalization::Normalization;
use crate::point_buffer::{PointVector, DIMS};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// A city as delivered by the ingestion side.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Point {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub population: f64,
}

impl Point {
    pub fn new(id: impl Into<String>, latitude: f64, longitude: f64, population: f64) -> Self {
        Point {
            id: id.into(),
            name: None,
            latitude,
            longitude,
            population,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Raw `(lat, lon, population)` vector, before normalization.
    pub fn vector(&self) -> PointVector {
        [self.latitude, self.longitude, self.population]
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let checks = [
            (self.latitude, "latitude is not finite"),
            (self.longitude, "longitude is not finite"),
            (self.population, "population is not finite"),
        ];
        for (value, reason) in checks {
            if !value.is_finite() {
                return Err(Error::InvalidPoint {
                    id: self.id.clone(),
                    reason,
                });
            }
        }
        Ok(())
    }
}

/// Normalized, read-only copy of a frozen buffer. Row `i` is slot `i`.
///
/// Map tasks share one instance behind an `Arc` and only ever read the rows
/// of the range they were handed.
#[derive(Debug, Clone)]
pub struct PointMatrix {
    data: Array2<f64>,
}

impl PointMatrix {
    /// Normalizes raw vectors once, up front. Row `i` is `raw[i]`.
    pub fn normalized(raw: &[PointVector], normalization: &Normalization) -> Self {
        let mut data = Array2::<f64>::zeros((raw.len(), DIMS));
        for (i, vector) in raw.iter().enumerate() {
            let normalized = normalization.apply(vector);
            for d in 0..DIMS {
                data[(i, d)] = normalized[d];
            }
        }
        PointMatrix { data }
    }

    /// Wraps vectors that are already in the space distances are computed in.
    pub fn from_vectors(vectors: &[PointVector]) -> Self {
        let mut data = Array2::<f64>::zeros((vectors.len(), DIMS));
        for (i, vector) in vectors.iter().enumerate() {
            for d in 0..DIMS {
                data[(i, d)] = vector[d];
            }
        }
        PointMatrix { data }
    }

    #[inline]
    pub fn row(&self, i: usize) -> PointVector {
        [self.data[(i, 0)], self.data[(i, 1)], self.data[(i, 2)]]
    }

    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    pub fn rows(&self) -> Vec<PointVector> {
        (0..self.len()).map(|i| self.row(i)).collect()
    }
}
