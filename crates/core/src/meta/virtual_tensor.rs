//! Metadata-only tensors and their shape kernels.
//!
//! A [`VirtualTensor`] carries everything a candle tensor knows about itself
//! except the element buffer: layout (shape, stride, storage offset), dtype and
//! the gradient flag. The kernels below replay candle's shape/stride semantics
//! so that a chain of operations produces the same metadata it would on real
//! data, and fails with the same class of `candle_core::Error` where real data
//! would fail.

use std::fmt;

use candle_core::{DType, Error, Layout, Result, Shape, Tensor};

use super::location::Location;

/// Binary elementwise operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

impl BinaryOp {
    pub fn name(&self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Maximum => "maximum",
            BinaryOp::Minimum => "minimum",
        }
    }

    pub fn broadcast_name(&self) -> &'static str {
        match self {
            BinaryOp::Add => "broadcast_add",
            BinaryOp::Sub => "broadcast_sub",
            BinaryOp::Mul => "broadcast_mul",
            BinaryOp::Div => "broadcast_div",
            BinaryOp::Maximum => "broadcast_maximum",
            BinaryOp::Minimum => "broadcast_minimum",
        }
    }
}

/// Unary elementwise operations. All of them preserve the shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Exp,
    Log,
    Neg,
    Sqr,
    Sqrt,
    Relu,
    Gelu,
    Silu,
    Tanh,
    Recip,
    Abs,
}

impl UnaryOp {
    pub fn name(&self) -> &'static str {
        match self {
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Neg => "neg",
            UnaryOp::Sqr => "sqr",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Relu => "relu",
            UnaryOp::Gelu => "gelu",
            UnaryOp::Silu => "silu",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Recip => "recip",
            UnaryOp::Abs => "abs",
        }
    }
}

/// Reductions over a single dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
}

impl ReduceOp {
    pub fn name(&self, keepdim: bool) -> &'static str {
        match (self, keepdim) {
            (ReduceOp::Sum, true) => "sum_keepdim",
            (ReduceOp::Sum, false) => "sum",
            (ReduceOp::Mean, true) => "mean_keepdim",
            (ReduceOp::Mean, false) => "mean",
            (ReduceOp::Max, true) => "max_keepdim",
            (ReduceOp::Max, false) => "max",
            (ReduceOp::Min, true) => "min_keepdim",
            (ReduceOp::Min, false) => "min",
        }
    }
}

/// A tensor on virtual storage: real metadata, no elements.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualTensor {
    layout: Layout,
    dtype: DType,
    requires_grad: bool,
    grad_fn: Option<String>,
}

impl VirtualTensor {
    /// Fresh contiguous tensor with no gradient history.
    pub fn new<S: Into<Shape>>(shape: S, dtype: DType) -> Self {
        Self {
            layout: Layout::contiguous(shape),
            dtype,
            requires_grad: false,
            grad_fn: None,
        }
    }

    /// Build from an explicit layout, e.g. one captured from a strided view.
    pub fn from_layout(layout: Layout, dtype: DType) -> Self {
        Self {
            layout,
            dtype,
            requires_grad: false,
            grad_fn: None,
        }
    }

    /// Migrate a real tensor to virtual storage. Only metadata is read.
    pub fn from_tensor(tensor: &Tensor) -> Self {
        Self {
            layout: tensor.layout().clone(),
            dtype: tensor.dtype(),
            requires_grad: tensor.is_variable(),
            grad_fn: None,
        }
    }

    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    pub(crate) fn set_grad_fn(&mut self, name: &str) {
        if self.requires_grad {
            self.grad_fn = Some(name.to_string());
        }
    }

    /// Virtual tensors never leave virtual storage.
    pub fn location(&self) -> Location {
        Location::Meta
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.layout.dims().len()
    }

    pub fn stride(&self) -> &[usize] {
        self.layout.stride()
    }

    pub fn storage_offset(&self) -> usize {
        self.layout.start_offset()
    }

    pub fn elem_count(&self) -> usize {
        self.layout.shape().elem_count()
    }

    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn grad_fn(&self) -> Option<&str> {
        self.grad_fn.as_deref()
    }

    /// Same gradient flag, new layout and dtype.
    fn derive(&self, layout: Layout, dtype: DType) -> Self {
        Self {
            layout,
            dtype,
            requires_grad: self.requires_grad,
            grad_fn: None,
        }
    }

    fn dim_check(&self, dim: usize, op: &'static str) -> Result<()> {
        if dim >= self.rank() {
            return Err(Error::DimOutOfRange {
                shape: self.shape().clone(),
                dim: dim as i32,
                op,
            }
            .bt());
        }
        Ok(())
    }

    // ─── Elementwise ────────────────────────────────────────────────────

    pub fn binary(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        if self.shape() != rhs.shape() {
            return Err(Error::ShapeMismatchBinaryOp {
                lhs: self.shape().clone(),
                rhs: rhs.shape().clone(),
                op: op.name(),
            }
            .bt());
        }
        self.binary_out(rhs, self.shape().clone(), op.name())
    }

    pub fn broadcast_binary(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        let shape = self
            .shape()
            .broadcast_shape_binary_op(rhs.shape(), op.broadcast_name())?;
        self.binary_out(rhs, shape, op.broadcast_name())
    }

    fn binary_out(&self, rhs: &Self, shape: Shape, op: &'static str) -> Result<Self> {
        if self.dtype != rhs.dtype {
            return Err(Error::DTypeMismatchBinaryOp {
                lhs: self.dtype,
                rhs: rhs.dtype,
                op,
            }
            .bt());
        }
        let mut out = Self::new(shape, self.dtype);
        out.requires_grad = self.requires_grad || rhs.requires_grad;
        Ok(out)
    }

    pub fn unary(&self, _op: UnaryOp) -> Self {
        self.derive(Layout::contiguous(self.shape().clone()), self.dtype)
    }

    pub fn affine(&self, _mul: f64, _add: f64) -> Self {
        self.derive(Layout::contiguous(self.shape().clone()), self.dtype)
    }

    // ─── Matrix products ────────────────────────────────────────────────

    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        let a_dims = self.dims();
        let b_dims = rhs.dims();
        let dim = a_dims.len();
        if dim < 2 || b_dims.len() != dim {
            return Err(Error::ShapeMismatchBinaryOp {
                lhs: self.shape().clone(),
                rhs: rhs.shape().clone(),
                op: "matmul",
            }
            .bt());
        }
        let (m, k) = (a_dims[dim - 2], a_dims[dim - 1]);
        let (k2, n) = (b_dims[dim - 2], b_dims[dim - 1]);
        if k != k2 || a_dims[..dim - 2] != b_dims[..dim - 2] {
            return Err(Error::ShapeMismatchBinaryOp {
                lhs: self.shape().clone(),
                rhs: rhs.shape().clone(),
                op: "matmul",
            }
            .bt());
        }
        let mut out_dims = a_dims[..dim - 2].to_vec();
        out_dims.extend([m, n]);
        self.binary_out(rhs, Shape::from(out_dims), "matmul")
    }

    /// Matmul with the batch dimensions of both sides broadcast together.
    pub fn broadcast_matmul(&self, rhs: &Self) -> Result<Self> {
        let (l_dims, r_dims) = (self.dims(), rhs.dims());
        let (l_rank, r_rank) = (l_dims.len(), r_dims.len());
        if l_rank < 2 || r_rank < 2 {
            return Err(Error::Msg(format!(
                "only 2d matrixes are supported {:?} {:?}",
                self.shape(),
                rhs.shape()
            ))
            .bt());
        }
        let (m, k) = (l_dims[l_rank - 2], l_dims[l_rank - 1]);
        let (k2, n) = (r_dims[r_rank - 2], r_dims[r_rank - 1]);
        if k != k2 {
            return Err(Error::Msg(format!(
                "different inner dimensions in broadcast matmul {:?} {:?}",
                self.shape(),
                rhs.shape()
            ))
            .bt());
        }
        let l_batch = Shape::from(&l_dims[..l_rank - 2]);
        let r_batch = Shape::from(&r_dims[..r_rank - 2]);
        let batch = l_batch.broadcast_shape_binary_op(&r_batch, "broadcast_matmul")?;
        let lhs = self.broadcast_as([batch.dims(), &[m, k]].concat())?;
        let rhs = rhs.broadcast_as([batch.dims(), &[k2, n]].concat())?;
        lhs.matmul(&rhs)
    }

    // ─── Views ──────────────────────────────────────────────────────────

    pub fn reshape<S: Into<Shape>>(&self, shape: S) -> Result<Self> {
        let shape = shape.into();
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ShapeMismatch {
                buffer_size: self.elem_count(),
                shape,
            }
            .bt());
        }
        let layout = if self.is_contiguous() {
            Layout::contiguous_with_offset(shape, self.storage_offset())
        } else {
            Layout::contiguous(shape)
        };
        Ok(self.derive(layout, self.dtype))
    }

    pub fn transpose(&self, dim1: usize, dim2: usize) -> Result<Self> {
        if dim1 == dim2 {
            return Ok(self.derive(self.layout.clone(), self.dtype));
        }
        Ok(self.derive(self.layout.transpose(dim1, dim2)?, self.dtype))
    }

    /// Transpose of the two innermost dimensions.
    pub fn t(&self) -> Result<Self> {
        let rank = self.rank();
        if rank < 2 {
            return Err(Error::UnexpectedNumberOfDims {
                expected: 2,
                got: rank,
                shape: self.shape().clone(),
            }
            .bt());
        }
        self.transpose(rank - 2, rank - 1)
    }

    pub fn permute(&self, dims: &[usize]) -> Result<Self> {
        if dims.len() != self.rank() {
            return Err(Error::Msg(format!(
                "permute: {} dims given for a rank {} tensor",
                dims.len(),
                self.rank()
            ))
            .bt());
        }
        Ok(self.derive(self.layout.permute(dims)?, self.dtype))
    }

    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        self.dim_check(dim, "narrow")?;
        if start.checked_add(len).map_or(true, |end| end > self.dims()[dim]) {
            return Err(Error::NarrowInvalidArgs {
                shape: self.shape().clone(),
                dim,
                start,
                len,
                msg: "start + len > dim_len",
            }
            .bt());
        }
        Ok(self.derive(self.layout.narrow(dim, start, len)?, self.dtype))
    }

    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        if dim > self.rank() {
            return Err(Error::DimOutOfRange {
                shape: self.shape().clone(),
                dim: dim as i32,
                op: "unsqueeze",
            }
            .bt());
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.stride().to_vec();
        dims.insert(dim, 1);
        let stride = if dim < strides.len() {
            strides[dim] * dims[dim]
        } else {
            1
        };
        strides.insert(dim, stride);
        let layout = Layout::new(Shape::from(dims), strides, self.storage_offset());
        Ok(self.derive(layout, self.dtype))
    }

    pub fn squeeze(&self, dim: usize) -> Result<Self> {
        self.dim_check(dim, "squeeze")?;
        if self.dims()[dim] != 1 {
            return Ok(self.derive(self.layout.clone(), self.dtype));
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.stride().to_vec();
        dims.remove(dim);
        strides.remove(dim);
        let layout = Layout::new(Shape::from(dims), strides, self.storage_offset());
        Ok(self.derive(layout, self.dtype))
    }

    pub fn contiguous(&self) -> Self {
        if self.is_contiguous() {
            self.derive(self.layout.clone(), self.dtype)
        } else {
            self.derive(Layout::contiguous(self.shape().clone()), self.dtype)
        }
    }

    pub fn broadcast_as<S: Into<Shape>>(&self, shape: S) -> Result<Self> {
        Ok(self.derive(self.layout.broadcast_as(shape)?, self.dtype))
    }

    pub fn to_dtype(&self, dtype: DType) -> Self {
        if dtype == self.dtype {
            return self.derive(self.layout.clone(), dtype);
        }
        self.derive(Layout::contiguous(self.shape().clone()), dtype)
    }

    // ─── Reductions ─────────────────────────────────────────────────────

    pub fn reduce(&self, op: ReduceOp, dim: usize, keepdim: bool) -> Result<Self> {
        self.dim_check(dim, op.name(keepdim))?;
        let mut dims = self.dims().to_vec();
        if keepdim {
            dims[dim] = 1;
        } else {
            dims.remove(dim);
        }
        Ok(self.derive(Layout::contiguous(dims), self.dtype))
    }

    pub fn softmax_last_dim(&self) -> Result<Self> {
        if self.rank() == 0 {
            return Err(Error::UnexpectedNumberOfDims {
                expected: 1,
                got: 0,
                shape: self.shape().clone(),
            }
            .bt());
        }
        if !self.is_contiguous() {
            return Err(Error::Msg("input has to be contiguous".to_string()).bt());
        }
        Ok(self.derive(Layout::contiguous(self.shape().clone()), self.dtype))
    }

    // ─── Multi-tensor ───────────────────────────────────────────────────

    pub fn cat(tensors: &[&Self], dim: usize) -> Result<Self> {
        let Some(first) = tensors.first() else {
            return Err(Error::OpRequiresAtLeastOneTensor { op: "cat" }.bt());
        };
        first.dim_check(dim, "cat")?;
        let mut out_dims = first.dims().to_vec();
        let mut requires_grad = first.requires_grad;
        for (n, t) in tensors.iter().enumerate().skip(1) {
            if t.dtype != first.dtype {
                return Err(Error::DTypeMismatchBinaryOp {
                    lhs: first.dtype,
                    rhs: t.dtype,
                    op: "cat",
                }
                .bt());
            }
            let mismatch = t.rank() != first.rank()
                || t
                    .dims()
                    .iter()
                    .zip(first.dims())
                    .enumerate()
                    .any(|(d, (a, b))| d != dim && a != b);
            if mismatch {
                return Err(Error::ShapeMismatchCat {
                    dim,
                    first_shape: first.shape().clone(),
                    n: n + 1,
                    nth_shape: t.shape().clone(),
                }
                .bt());
            }
            out_dims[dim] += t.dims()[dim];
            requires_grad |= t.requires_grad;
        }
        Ok(Self::new(out_dims, first.dtype).with_requires_grad(requires_grad))
    }

    /// Split into `chunks` views along `dim`; earlier chunks absorb the remainder.
    pub fn chunk(&self, chunks: usize, dim: usize) -> Result<Vec<Self>> {
        self.dim_check(dim, "chunk")?;
        let size = self.dims()[dim];
        if size < chunks {
            return (0..size).map(|i| self.narrow(dim, i, 1)).collect();
        }
        let chunk_size = size / chunks;
        let extra = size % chunks;
        let mut offset = 0;
        let mut out = Vec::with_capacity(chunks);
        for i in 0..chunks {
            let len = chunk_size + usize::from(i < extra);
            out.push(self.narrow(dim, offset, len)?);
            offset += len;
        }
        Ok(out)
    }

    /// Embedding lookup: `ids` of any integer shape into a `[vocab, hidden]` table.
    pub fn embedding(ids: &Self, table: &Self) -> Result<Self> {
        if !ids.dtype.is_int() {
            return Err(Error::UnsupportedDTypeForOp(ids.dtype, "embedding").bt());
        }
        let (_, hidden) = table.shape().dims2()?;
        let mut dims = ids.dims().to_vec();
        dims.push(hidden);
        Ok(Self::new(dims, table.dtype).with_requires_grad(table.requires_grad))
    }
}

/// `(2, 3)`, `(10,)` and `()` like a python tuple.
pub(crate) fn format_size(dims: &[usize]) -> String {
    match dims {
        [] => "()".to_string(),
        [d] => format!("({d},)"),
        _ => {
            let inner: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
            format!("({})", inner.join(", "))
        }
    }
}

impl fmt::Display for VirtualTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tensor(..., device='{}', size={}, dtype={})",
            self.location(),
            format_size(self.dims()),
            self.dtype.as_str()
        )
    }
}
