use std::fmt;

use crate::DType;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IOName(pub String);

impl IOName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IOName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IOName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: IOName,
    pub dtype: DType,
    pub rank: usize,
    pub dims: Vec<Option<usize>>, // None = dynamic
}

impl TensorSpec {
    /// Builds a spec from signed dims where any negative value is dynamic.
    pub fn from_signed_dims(name: impl Into<String>, dtype: DType, dims: &[i64]) -> Self {
        let dims: Vec<Option<usize>> = dims
            .iter()
            .map(|d| if *d < 0 { None } else { Some(*d as usize) })
            .collect();
        Self {
            name: IOName(name.into()),
            dtype,
            rank: dims.len(),
            dims,
        }
    }

    /// True when every fixed dim in `self` agrees with the same position in
    /// `other`; dynamic dims on either side match anything.
    pub fn dims_compatible(&self, other: &[Option<usize>]) -> bool {
        self.dims.len() == other.len()
            && self
                .dims
                .iter()
                .zip(other)
                .all(|(a, b)| match (a, b) {
                    (Some(a), Some(b)) => a == b,
                    _ => true,
                })
    }
}

/// Inputs and outputs a network declares.
#[derive(Clone, Debug, Default)]
pub struct ModelSpec {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

impl ModelSpec {
    pub fn input(&self, name: &str) -> Option<&TensorSpec> {
        self.inputs.iter().find(|s| s.name.0 == name)
    }
    pub fn output(&self, name: &str) -> Option<&TensorSpec> {
        self.outputs.iter().find(|s| s.name.0 == name)
    }
}
