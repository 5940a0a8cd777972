//! Shape-only tensor simulation.
//!
//! [`MetaTensor`] lets tensor-consuming code run without allocating element
//! storage. Each proxy wraps a [`VirtualTensor`] (layout, dtype and gradient
//! flag, no data) and advertises a [`Location`] that is independent of where
//! the value actually lives, which is always virtual storage.
//!
//! ```ignore
//! use candle_core::DType;
//! use stagesim_core::meta::{Location, MetaTensor};
//!
//! let x = MetaTensor::zeros((8, 512), DType::F16, Location::Cuda(3))?;
//! let w = MetaTensor::zeros((512, 1024), DType::F16, Location::Cuda(3))?;
//! let y = x.matmul(&w)?;
//! assert_eq!(y.dims(), &[8, 1024]);
//! assert_eq!(y.reported_location(), &Location::Cuda(3));
//! ```

mod dispatch;
mod location;
mod ops;
mod tensor;
mod tree;
mod virtual_tensor;

pub use dispatch::dispatch;
pub use location::{Location, LocationParseError};
pub use ops::{Op, Operation};
pub use tensor::{ConvertTarget, MetaTensor, TensorLike};
pub use tree::{Arg, ArgTree, Kwargs, LOCATION_KWARG};
pub use virtual_tensor::{BinaryOp, ReduceOp, UnaryOp, VirtualTensor};
