//! The proxy tensor.

use std::fmt;

use candle_core::{DType, Device, Layout, Result, Shape, Tensor};

use super::dispatch::dispatch;
use super::location::Location;
use super::ops::Op;
use super::tree::{ArgTree, Kwargs, LOCATION_KWARG};
use super::virtual_tensor::{BinaryOp, ReduceOp, UnaryOp, VirtualTensor};

/// Anything a [`MetaTensor`] can be built from.
#[derive(Debug, Clone)]
pub enum TensorLike {
    Proxy(MetaTensor),
    Virtual(VirtualTensor),
    Real(Tensor),
}

impl From<MetaTensor> for TensorLike {
    fn from(t: MetaTensor) -> Self {
        TensorLike::Proxy(t)
    }
}

impl From<&MetaTensor> for TensorLike {
    fn from(t: &MetaTensor) -> Self {
        TensorLike::Proxy(t.clone())
    }
}

impl From<VirtualTensor> for TensorLike {
    fn from(t: VirtualTensor) -> Self {
        TensorLike::Virtual(t)
    }
}

impl From<Tensor> for TensorLike {
    fn from(t: Tensor) -> Self {
        TensorLike::Real(t)
    }
}

impl From<&Tensor> for TensorLike {
    fn from(t: &Tensor) -> Self {
        TensorLike::Real(t.clone())
    }
}

/// Target of [`MetaTensor::convert_to`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConvertTarget {
    /// Dtype-only conversion; the reported location is kept.
    DType(DType),
    /// Move to a new reported location, converting the dtype first if asked.
    Location {
        location: Location,
        dtype: Option<DType>,
    },
}

impl ConvertTarget {
    pub fn with_dtype(self, dtype: DType) -> Self {
        match self {
            ConvertTarget::DType(_) => ConvertTarget::DType(dtype),
            ConvertTarget::Location { location, .. } => ConvertTarget::Location {
                location,
                dtype: Some(dtype),
            },
        }
    }
}

impl From<DType> for ConvertTarget {
    fn from(dtype: DType) -> Self {
        ConvertTarget::DType(dtype)
    }
}

impl From<Location> for ConvertTarget {
    fn from(location: Location) -> Self {
        ConvertTarget::Location {
            location,
            dtype: None,
        }
    }
}

impl From<&Device> for ConvertTarget {
    fn from(device: &Device) -> Self {
        Location::from(device).into()
    }
}

impl TryFrom<&str> for ConvertTarget {
    type Error = super::location::LocationParseError;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        Ok(s.parse::<Location>()?.into())
    }
}

/// A tensor that only simulates shape, stride, dtype and gradient flag.
///
/// The wrapped value always sits on virtual storage while the proxy advertises
/// a separate reported location. Every operation goes through [`dispatch`], so
/// results stay wrapped and keep reporting the location of their inputs.
#[derive(Debug, Clone)]
pub struct MetaTensor {
    value: VirtualTensor,
    reported: Location,
}

impl MetaTensor {
    /// Wrap `value`, reporting `location` or the value's own location.
    ///
    /// Wrapping a proxy unwraps it first; its reported location is the
    /// default when `location` is `None`. Real tensors report their device
    /// and are migrated to virtual storage.
    pub fn new(value: impl Into<TensorLike>, location: Option<Location>) -> Self {
        let (value, default_location) = match value.into() {
            TensorLike::Proxy(proxy) => (proxy.value, proxy.reported),
            TensorLike::Virtual(value) => {
                let location = value.location();
                (value, location)
            }
            TensorLike::Real(tensor) => (
                VirtualTensor::from_tensor(&tensor),
                Location::from(tensor.device()),
            ),
        };
        Self {
            value,
            reported: location.unwrap_or(default_location),
        }
    }

    pub fn wrap(value: impl Into<TensorLike>) -> Self {
        Self::new(value, None)
    }

    pub fn zeros<S: Into<Shape>>(shape: S, dtype: DType, location: Location) -> Result<Self> {
        let dims = shape.into().dims().to_vec();
        Self::factory(Op::Zeros { dims, dtype }, location)
    }

    pub fn ones<S: Into<Shape>>(shape: S, dtype: DType, location: Location) -> Result<Self> {
        let dims = shape.into().dims().to_vec();
        Self::factory(Op::Ones { dims, dtype }, location)
    }

    fn factory(op: Op, location: Location) -> Result<Self> {
        let mut kwargs = Kwargs::new();
        kwargs.insert(LOCATION_KWARG.to_string(), location.into());
        dispatch(&op, vec![], kwargs)?.into_proxy()
    }

    pub(crate) fn into_parts(self) -> (VirtualTensor, Location) {
        (self.value, self.reported)
    }

    /// The wrapped value on virtual storage.
    pub fn real_value(&self) -> &VirtualTensor {
        &self.value
    }

    pub fn reported_location(&self) -> &Location {
        &self.reported
    }

    pub fn layout(&self) -> &Layout {
        self.value.layout()
    }

    pub fn shape(&self) -> &Shape {
        self.value.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.value.dims()
    }

    pub fn rank(&self) -> usize {
        self.value.rank()
    }

    pub fn stride(&self) -> &[usize] {
        self.value.stride()
    }

    pub fn elem_count(&self) -> usize {
        self.value.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.value.dtype()
    }

    pub fn requires_grad(&self) -> bool {
        self.value.requires_grad()
    }

    pub fn requires_grad_(mut self, requires_grad: bool) -> Self {
        self.value = self.value.with_requires_grad(requires_grad);
        self
    }

    /// Device/dtype conversion.
    ///
    /// A dtype target dispatches `to_dtype` and keeps the reported location.
    /// A location target converts the dtype first (if requested), then
    /// re-wraps a copy of the value reporting the new location.
    pub fn convert_to(&self, target: impl Into<ConvertTarget>) -> Result<Self> {
        match target.into() {
            ConvertTarget::DType(dtype) => self.to_dtype(dtype),
            ConvertTarget::Location { location, dtype } => {
                let converted = match dtype {
                    Some(dtype) => self.to_dtype(dtype)?,
                    None => self.clone(),
                };
                Ok(Self::new(converted.value, Some(location)))
            }
        }
    }

    fn apply(&self, op: Op) -> Result<Self> {
        dispatch(&op, vec![self.into()], Kwargs::new())?.into_proxy()
    }

    fn apply2(&self, rhs: &Self, op: Op) -> Result<Self> {
        dispatch(&op, vec![self.into(), rhs.into()], Kwargs::new())?.into_proxy()
    }

    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.apply2(rhs, Op::Binary(BinaryOp::Add))
    }

    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.apply2(rhs, Op::Binary(BinaryOp::Sub))
    }

    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.apply2(rhs, Op::Binary(BinaryOp::Mul))
    }

    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.apply2(rhs, Op::Binary(BinaryOp::Div))
    }

    pub fn maximum(&self, rhs: &Self) -> Result<Self> {
        self.apply2(rhs, Op::Binary(BinaryOp::Maximum))
    }

    pub fn minimum(&self, rhs: &Self) -> Result<Self> {
        self.apply2(rhs, Op::Binary(BinaryOp::Minimum))
    }

    pub fn broadcast_add(&self, rhs: &Self) -> Result<Self> {
        self.apply2(rhs, Op::BroadcastBinary(BinaryOp::Add))
    }

    pub fn broadcast_sub(&self, rhs: &Self) -> Result<Self> {
        self.apply2(rhs, Op::BroadcastBinary(BinaryOp::Sub))
    }

    pub fn broadcast_mul(&self, rhs: &Self) -> Result<Self> {
        self.apply2(rhs, Op::BroadcastBinary(BinaryOp::Mul))
    }

    pub fn broadcast_div(&self, rhs: &Self) -> Result<Self> {
        self.apply2(rhs, Op::BroadcastBinary(BinaryOp::Div))
    }

    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        self.apply2(rhs, Op::Matmul)
    }

    pub fn broadcast_matmul(&self, rhs: &Self) -> Result<Self> {
        self.apply2(rhs, Op::BroadcastMatmul)
    }

    pub fn unary(&self, op: UnaryOp) -> Result<Self> {
        self.apply(Op::Unary(op))
    }

    pub fn exp(&self) -> Result<Self> {
        self.unary(UnaryOp::Exp)
    }

    pub fn sqr(&self) -> Result<Self> {
        self.unary(UnaryOp::Sqr)
    }

    pub fn sqrt(&self) -> Result<Self> {
        self.unary(UnaryOp::Sqrt)
    }

    pub fn relu(&self) -> Result<Self> {
        self.unary(UnaryOp::Relu)
    }

    pub fn gelu(&self) -> Result<Self> {
        self.unary(UnaryOp::Gelu)
    }

    pub fn silu(&self) -> Result<Self> {
        self.unary(UnaryOp::Silu)
    }

    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        self.apply(Op::Affine { mul, add })
    }

    pub fn reshape<S: Into<Shape>>(&self, shape: S) -> Result<Self> {
        self.apply(Op::Reshape(shape.into().dims().to_vec()))
    }

    pub fn transpose(&self, dim1: usize, dim2: usize) -> Result<Self> {
        self.apply(Op::Transpose(dim1, dim2))
    }

    pub fn t(&self) -> Result<Self> {
        let rank = self.rank();
        if rank < 2 {
            return Err(candle_core::Error::UnexpectedNumberOfDims {
                expected: 2,
                got: rank,
                shape: self.shape().clone(),
            }
            .bt());
        }
        self.transpose(rank - 2, rank - 1)
    }

    pub fn permute(&self, dims: &[usize]) -> Result<Self> {
        self.apply(Op::Permute(dims.to_vec()))
    }

    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        self.apply(Op::Narrow { dim, start, len })
    }

    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        self.apply(Op::Unsqueeze(dim))
    }

    pub fn squeeze(&self, dim: usize) -> Result<Self> {
        self.apply(Op::Squeeze(dim))
    }

    pub fn contiguous(&self) -> Result<Self> {
        self.apply(Op::Contiguous)
    }

    pub fn broadcast_as<S: Into<Shape>>(&self, shape: S) -> Result<Self> {
        self.apply(Op::BroadcastAs(shape.into().dims().to_vec()))
    }

    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        self.apply(Op::ToDType(dtype))
    }

    pub fn sum_keepdim(&self, dim: usize) -> Result<Self> {
        self.apply(Op::Reduce {
            op: ReduceOp::Sum,
            dim,
            keepdim: true,
        })
    }

    pub fn sum(&self, dim: usize) -> Result<Self> {
        self.apply(Op::Reduce {
            op: ReduceOp::Sum,
            dim,
            keepdim: false,
        })
    }

    pub fn mean_keepdim(&self, dim: usize) -> Result<Self> {
        self.apply(Op::Reduce {
            op: ReduceOp::Mean,
            dim,
            keepdim: true,
        })
    }

    pub fn max_keepdim(&self, dim: usize) -> Result<Self> {
        self.apply(Op::Reduce {
            op: ReduceOp::Max,
            dim,
            keepdim: true,
        })
    }

    pub fn softmax_last_dim(&self) -> Result<Self> {
        self.apply(Op::SoftmaxLastDim)
    }

    pub fn chunk(&self, chunks: usize, dim: usize) -> Result<Vec<Self>> {
        dispatch(&Op::Chunk { chunks, dim }, vec![self.into()], Kwargs::new())?.into_proxies()
    }

    pub fn cat(tensors: &[&Self], dim: usize) -> Result<Self> {
        let seq = ArgTree::Seq(tensors.iter().map(|t| ArgTree::from(*t)).collect());
        dispatch(&Op::Cat(dim), vec![seq], Kwargs::new())?.into_proxy()
    }

    /// Look up `ids` in a `[vocab, hidden]` table.
    pub fn embedding(ids: &Self, table: &Self) -> Result<Self> {
        ids.apply2(table, Op::Embedding)
    }
}

impl fmt::Display for MetaTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MetaTensor({}, fake_device='{}'", self.value, self.reported)?;
        if let Some(grad_fn) = self.value.grad_fn() {
            write!(f, ", grad_fn=<{grad_fn}>")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for ConvertTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvertTarget::DType(dtype) => write!(f, "{}", dtype.as_str()),
            ConvertTarget::Location {
                location,
                dtype: Some(dtype),
            } => write!(f, "{location} ({})", dtype.as_str()),
            ConvertTarget::Location { location, .. } => write!(f, "{location}"),
        }
    }
}

// ─── Operator overloads ───────────────────────────────────────────────────

macro_rules! bin_trait {
    ($trait:ident, $fn1:ident, $mul:expr, $add:expr) => {
        impl std::ops::$trait<&MetaTensor> for &MetaTensor {
            type Output = Result<MetaTensor>;

            fn $fn1(self, rhs: &MetaTensor) -> Self::Output {
                MetaTensor::$fn1(self, rhs)
            }
        }

        impl std::ops::$trait<MetaTensor> for &MetaTensor {
            type Output = Result<MetaTensor>;

            fn $fn1(self, rhs: MetaTensor) -> Self::Output {
                MetaTensor::$fn1(self, &rhs)
            }
        }

        impl std::ops::$trait<&MetaTensor> for MetaTensor {
            type Output = Result<MetaTensor>;

            fn $fn1(self, rhs: &MetaTensor) -> Self::Output {
                MetaTensor::$fn1(&self, rhs)
            }
        }

        impl std::ops::$trait<MetaTensor> for MetaTensor {
            type Output = Result<MetaTensor>;

            fn $fn1(self, rhs: MetaTensor) -> Self::Output {
                MetaTensor::$fn1(&self, &rhs)
            }
        }

        impl std::ops::$trait<f64> for &MetaTensor {
            type Output = Result<MetaTensor>;

            fn $fn1(self, rhs: f64) -> Self::Output {
                self.affine($mul(rhs), $add(rhs))
            }
        }

        impl std::ops::$trait<f64> for MetaTensor {
            type Output = Result<MetaTensor>;

            fn $fn1(self, rhs: f64) -> Self::Output {
                self.affine($mul(rhs), $add(rhs))
            }
        }
    };
}

bin_trait!(Add, add, |_| 1., |v| v);
bin_trait!(Sub, sub, |_| 1., |v: f64| -v);
bin_trait!(Mul, mul, |v| v, |_| 0.);
bin_trait!(Div, div, |v| 1. / v, |_| 0.);
