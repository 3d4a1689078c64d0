//! Typed array values and named observation/action channels.
//!
//! Environments and agents exchange [`Channels`]: ordered maps from a channel
//! name (`"image"`, `"reward"`, `"is_last"`, ...) to a [`Tensor`]. Environments
//! produce and consume unbatched channels; agents see a leading batch axis.
//! [`Channels::batched`] and [`Channels::unbatched`] convert between the two
//! generically over whatever keys a task happens to use.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{bail, Context, Result};
use ndarray::{ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};

/// Reserved channel names.
pub const IMAGE: &str = "image";
pub const REWARD: &str = "reward";
pub const IS_FIRST: &str = "is_first";
pub const IS_LAST: &str = "is_last";
/// Prefix of diagnostic channels that are not policy inputs.
pub const LOG_PREFIX: &str = "log/";

// ---------------------------------------------------------------------------
// Element types
// ---------------------------------------------------------------------------

/// Element type of a [`Tensor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[serde(rename = "uint8")]
    U8,
    #[serde(rename = "int32")]
    I32,
    #[serde(rename = "int64")]
    I64,
    #[serde(rename = "float32")]
    F32,
    Bool,
}

impl DType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::U8 => "uint8",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::F32 => "float32",
            Self::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tensor
// ---------------------------------------------------------------------------

/// A dynamically shaped array with one of the supported element types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireTensor", try_from = "WireTensor")]
pub enum Tensor {
    U8(ArrayD<u8>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    F32(ArrayD<f32>),
    Bool(ArrayD<bool>),
}

/// Apply the same expression to whichever array a [`Tensor`] holds and wrap the
/// result back into the same variant.
macro_rules! map_array {
    ($tensor:expr, $arr:ident => $body:expr) => {
        match $tensor {
            Tensor::U8($arr) => Tensor::U8($body),
            Tensor::I32($arr) => Tensor::I32($body),
            Tensor::I64($arr) => Tensor::I64($body),
            Tensor::F32($arr) => Tensor::F32($body),
            Tensor::Bool($arr) => Tensor::Bool($body),
        }
    };
}

impl Tensor {
    /// A rank-0 `f32` value.
    pub fn scalar_f32(value: f32) -> Self {
        Self::F32(ArrayD::from_elem(IxDyn(&[]), value))
    }

    /// A rank-0 `bool` value.
    pub fn scalar_bool(value: bool) -> Self {
        Self::Bool(ArrayD::from_elem(IxDyn(&[]), value))
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::U8(_) => DType::U8,
            Self::I32(_) => DType::I32,
            Self::I64(_) => DType::I64,
            Self::F32(_) => DType::F32,
            Self::Bool(_) => DType::Bool,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Self::U8(a) => a.shape(),
            Self::I32(a) => a.shape(),
            Self::I64(a) => a.shape(),
            Self::F32(a) => a.shape(),
            Self::Bool(a) => a.shape(),
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Prepend a batch axis of size 1.
    pub fn batched(&self) -> Self {
        map_array!(self, a => a.clone().insert_axis(Axis(0)))
    }

    /// Take row 0 of the leading axis.
    pub fn unbatched(&self) -> Result<Self> {
        let shape = self.shape();
        if shape.is_empty() {
            bail!("cannot unbatch a rank-0 tensor");
        }
        if shape[0] == 0 {
            bail!("cannot unbatch a tensor with an empty leading axis");
        }
        Ok(map_array!(self, a => a.index_axis(Axis(0), 0).to_owned()))
    }

    /// Row `index` of the leading axis.
    pub fn row(&self, index: usize) -> Result<Self> {
        let shape = self.shape();
        if shape.is_empty() || index >= shape[0] {
            bail!("row {index} out of range for tensor of shape {shape:?}");
        }
        Ok(map_array!(self, a => a.index_axis(Axis(0), index).to_owned()))
    }

    /// The first element as `f64` (`0.0` for an empty tensor).
    ///
    /// Rewards arrive as rank-0 arrays from most environments, but some wrap
    /// them in a length-1 vector; both read the same.
    pub fn as_f64_scalar(&self) -> f64 {
        match self {
            Self::U8(a) => a.iter().next().map_or(0.0, |v| *v as f64),
            Self::I32(a) => a.iter().next().map_or(0.0, |v| *v as f64),
            Self::I64(a) => a.iter().next().map_or(0.0, |v| *v as f64),
            Self::F32(a) => a.iter().next().map_or(0.0, |v| *v as f64),
            Self::Bool(a) => a.iter().next().map_or(0.0, |v| if *v { 1.0 } else { 0.0 }),
        }
    }

    /// Whether the first element is non-zero / true.
    pub fn truthy(&self) -> bool {
        self.as_f64_scalar() != 0.0
    }

    /// All elements converted to `f32`, in logical (row-major) order.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            Self::U8(a) => a.iter().map(|v| *v as f32).collect(),
            Self::I32(a) => a.iter().map(|v| *v as f32).collect(),
            Self::I64(a) => a.iter().map(|v| *v as f32).collect(),
            Self::F32(a) => a.iter().copied().collect(),
            Self::Bool(a) => a.iter().map(|v| if *v { 1.0 } else { 0.0 }).collect(),
        }
    }

    /// Borrow the `u8` array, if that is what this tensor holds.
    pub fn as_u8(&self) -> Option<&ArrayD<u8>> {
        match self {
            Self::U8(a) => Some(a),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// JSON shape of a tensor: `{"dtype": "uint8", "shape": [2, 2], "data": [..]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireTensor {
    dtype: DType,
    shape: Vec<usize>,
    data: serde_json::Value,
}

impl From<Tensor> for WireTensor {
    fn from(tensor: Tensor) -> Self {
        let dtype = tensor.dtype();
        let shape = tensor.shape().to_vec();
        let data = match &tensor {
            Tensor::U8(a) => serde_json::json!(a.iter().collect::<Vec<_>>()),
            Tensor::I32(a) => serde_json::json!(a.iter().collect::<Vec<_>>()),
            Tensor::I64(a) => serde_json::json!(a.iter().collect::<Vec<_>>()),
            Tensor::F32(a) => serde_json::json!(a.iter().collect::<Vec<_>>()),
            Tensor::Bool(a) => serde_json::json!(a.iter().collect::<Vec<_>>()),
        };
        Self { dtype, shape, data }
    }
}

fn decode_array<T: serde::de::DeserializeOwned>(
    shape: &[usize],
    data: serde_json::Value,
) -> Result<ArrayD<T>> {
    // A bare scalar is accepted for rank-0 tensors.
    let values: Vec<T> = match data {
        serde_json::Value::Array(_) => serde_json::from_value(data)?,
        other => vec![serde_json::from_value(other)?],
    };
    ArrayD::from_shape_vec(IxDyn(shape), values)
        .with_context(|| format!("tensor data does not match shape {shape:?}"))
}

impl TryFrom<WireTensor> for Tensor {
    type Error = anyhow::Error;

    fn try_from(wire: WireTensor) -> Result<Self> {
        let WireTensor { dtype, shape, data } = wire;
        Ok(match dtype {
            DType::U8 => Self::U8(decode_array(&shape, data)?),
            DType::I32 => Self::I32(decode_array(&shape, data)?),
            DType::I64 => Self::I64(decode_array(&shape, data)?),
            DType::F32 => Self::F32(decode_array(&shape, data)?),
            DType::Bool => Self::Bool(decode_array(&shape, data)?),
        })
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// A named set of tensors: one observation or one action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channels(BTreeMap<String, Tensor>);

/// What an environment emits after `reset` or `step`.
pub type Observation = Channels;
/// What an agent emits and an environment consumes.
pub type Action = Channels;

impl Channels {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: Tensor) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Tensor) -> Option<Tensor> {
        self.0.insert(name.into(), value)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The `image` channel, if present.
    pub fn image(&self) -> Option<&Tensor> {
        self.get(IMAGE)
    }

    /// The `reward` channel as a float, `0.0` when absent.
    pub fn reward(&self) -> f64 {
        self.get(REWARD).map_or(0.0, Tensor::as_f64_scalar)
    }

    /// The `is_last` flag, `false` when absent.
    pub fn is_last(&self) -> bool {
        self.get(IS_LAST).is_some_and(Tensor::truthy)
    }

    /// The `is_first` flag, `false` when absent.
    pub fn is_first(&self) -> bool {
        self.get(IS_FIRST).is_some_and(Tensor::truthy)
    }

    /// Every channel with a leading batch axis of size 1.
    pub fn batched(&self) -> Self {
        Self(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.batched()))
                .collect(),
        )
    }

    /// Every channel with its leading batch axis stripped (row 0 kept).
    pub fn unbatched(&self) -> Result<Self> {
        self.row(0)
    }

    /// Row `index` of every channel.
    pub fn row(&self, index: usize) -> Result<Self> {
        let mut out = BTreeMap::new();
        for (k, v) in &self.0 {
            let row = v
                .row(index)
                .with_context(|| format!("channel '{k}' has no batch row {index}"))?;
            out.insert(k.clone(), row);
        }
        Ok(Self(out))
    }

    /// A copy without channels whose name starts with `prefix`.
    pub fn without_prefix(&self, prefix: &str) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(k, _)| !k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl FromIterator<(String, Tensor)> for Channels {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Channels {
    type Item = (String, Tensor);
    type IntoIter = std::collections::btree_map::IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
