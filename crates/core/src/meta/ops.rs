//! Primitive operations that can be dispatched against proxies.
//!
//! [`Operation::call`] only ever sees virtual tensors: dispatch unwraps every
//! proxy and migrates every real tensor before the call, so the kernels in
//! [`VirtualTensor`] can run on uniform virtual storage.

use candle_core::{DType, Error, Result};

use super::location::Location;
use super::tree::{Arg, ArgTree, Kwargs, LOCATION_KWARG};
use super::virtual_tensor::{BinaryOp, ReduceOp, UnaryOp, VirtualTensor};

/// A primitive numeric operation.
pub trait Operation {
    fn name(&self) -> &str;

    /// Run on unwrapped arguments. Tensor leaves are always [`Arg::Virtual`].
    fn call(&self, args: &[ArgTree], kwargs: &Kwargs) -> Result<ArgTree>;
}

/// Built-in operations, mirroring the candle tensor API.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Binary(BinaryOp),
    BroadcastBinary(BinaryOp),
    Unary(UnaryOp),
    Affine { mul: f64, add: f64 },
    Matmul,
    BroadcastMatmul,
    Reshape(Vec<usize>),
    Transpose(usize, usize),
    Permute(Vec<usize>),
    Narrow { dim: usize, start: usize, len: usize },
    Unsqueeze(usize),
    Squeeze(usize),
    Contiguous,
    BroadcastAs(Vec<usize>),
    ToDType(DType),
    Reduce { op: ReduceOp, dim: usize, keepdim: bool },
    SoftmaxLastDim,
    /// Takes one sequence argument of tensors.
    Cat(usize),
    Chunk { chunks: usize, dim: usize },
    /// `(ids, table)`.
    Embedding,
    /// Factories honour the `device` keyword.
    Zeros { dims: Vec<usize>, dtype: DType },
    Ones { dims: Vec<usize>, dtype: DType },
}

fn tensor_arg<'a>(args: &'a [ArgTree], idx: usize, op: &str) -> Result<&'a VirtualTensor> {
    args.get(idx)
        .and_then(ArgTree::as_leaf)
        .and_then(Arg::as_virtual)
        .ok_or_else(|| Error::Msg(format!("{op}: argument {idx} is not a tensor")).bt())
}

fn tensor_seq_arg<'a>(args: &'a [ArgTree], idx: usize, op: &str) -> Result<Vec<&'a VirtualTensor>> {
    match args.get(idx) {
        Some(ArgTree::Seq(items)) => items
            .iter()
            .map(|t| {
                t.as_leaf()
                    .and_then(Arg::as_virtual)
                    .ok_or_else(|| Error::Msg(format!("{op}: non-tensor in sequence")).bt())
            })
            .collect(),
        _ => Err(Error::Msg(format!("{op}: argument {idx} is not a tensor sequence")).bt()),
    }
}

fn factory(kwargs: &Kwargs, dims: &[usize], dtype: DType, op: &str) -> Result<ArgTree> {
    match kwargs.get(LOCATION_KWARG).and_then(ArgTree::as_leaf) {
        None | Some(Arg::Location(Location::Meta)) | Some(Arg::None) => {}
        Some(other) => {
            return Err(Error::Msg(format!(
                "{op}: factories only materialize on virtual storage, got {other:?}"
            ))
            .bt())
        }
    }
    Ok(VirtualTensor::new(dims.to_vec(), dtype).into())
}

impl Operation for Op {
    fn name(&self) -> &str {
        match self {
            Op::Binary(op) => op.name(),
            Op::BroadcastBinary(op) => op.broadcast_name(),
            Op::Unary(op) => op.name(),
            Op::Affine { .. } => "affine",
            Op::Matmul => "matmul",
            Op::BroadcastMatmul => "broadcast_matmul",
            Op::Reshape(_) => "reshape",
            Op::Transpose(..) => "transpose",
            Op::Permute(_) => "permute",
            Op::Narrow { .. } => "narrow",
            Op::Unsqueeze(_) => "unsqueeze",
            Op::Squeeze(_) => "squeeze",
            Op::Contiguous => "contiguous",
            Op::BroadcastAs(_) => "broadcast_as",
            Op::ToDType(_) => "to_dtype",
            Op::Reduce { op, keepdim, .. } => op.name(*keepdim),
            Op::SoftmaxLastDim => "softmax_last_dim",
            Op::Cat(_) => "cat",
            Op::Chunk { .. } => "chunk",
            Op::Embedding => "embedding",
            Op::Zeros { .. } => "zeros",
            Op::Ones { .. } => "ones",
        }
    }

    fn call(&self, args: &[ArgTree], kwargs: &Kwargs) -> Result<ArgTree> {
        let name = self.name();
        let out = match self {
            Op::Binary(op) => tensor_arg(args, 0, name)?.binary(tensor_arg(args, 1, name)?, *op)?,
            Op::BroadcastBinary(op) => {
                tensor_arg(args, 0, name)?.broadcast_binary(tensor_arg(args, 1, name)?, *op)?
            }
            Op::Unary(op) => tensor_arg(args, 0, name)?.unary(*op),
            Op::Affine { mul, add } => tensor_arg(args, 0, name)?.affine(*mul, *add),
            Op::Matmul => tensor_arg(args, 0, name)?.matmul(tensor_arg(args, 1, name)?)?,
            Op::BroadcastMatmul => {
                tensor_arg(args, 0, name)?.broadcast_matmul(tensor_arg(args, 1, name)?)?
            }
            Op::Reshape(dims) => tensor_arg(args, 0, name)?.reshape(dims.clone())?,
            Op::Transpose(d1, d2) => tensor_arg(args, 0, name)?.transpose(*d1, *d2)?,
            Op::Permute(dims) => tensor_arg(args, 0, name)?.permute(dims)?,
            Op::Narrow { dim, start, len } => {
                tensor_arg(args, 0, name)?.narrow(*dim, *start, *len)?
            }
            Op::Unsqueeze(dim) => tensor_arg(args, 0, name)?.unsqueeze(*dim)?,
            Op::Squeeze(dim) => tensor_arg(args, 0, name)?.squeeze(*dim)?,
            Op::Contiguous => tensor_arg(args, 0, name)?.contiguous(),
            Op::BroadcastAs(dims) => tensor_arg(args, 0, name)?.broadcast_as(dims.clone())?,
            Op::ToDType(dtype) => tensor_arg(args, 0, name)?.to_dtype(*dtype),
            Op::Reduce { op, dim, keepdim } => {
                tensor_arg(args, 0, name)?.reduce(*op, *dim, *keepdim)?
            }
            Op::SoftmaxLastDim => tensor_arg(args, 0, name)?.softmax_last_dim()?,
            Op::Cat(dim) => VirtualTensor::cat(&tensor_seq_arg(args, 0, name)?, *dim)?,
            Op::Chunk { chunks, dim } => {
                let parts = tensor_arg(args, 0, name)?.chunk(*chunks, *dim)?;
                return Ok(ArgTree::from(parts));
            }
            Op::Embedding => {
                VirtualTensor::embedding(tensor_arg(args, 0, name)?, tensor_arg(args, 1, name)?)?
            }
            Op::Zeros { dims, dtype } | Op::Ones { dims, dtype } => {
                return factory(kwargs, dims, *dtype, name);
            }
        };
        Ok(out.into())
    }
}
