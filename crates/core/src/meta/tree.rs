//! Argument trees for dispatched operations.
//!
//! Operations receive their positional arguments as a list of [`ArgTree`]s and
//! their keyword arguments as a [`Kwargs`] map. Leaves are either tensors (a
//! proxy, a virtual tensor or a real candle tensor) or plain scalars that pass
//! through dispatch untouched.

use std::collections::BTreeMap;

use candle_core::{DType, Error, Result, Tensor};

use super::location::Location;
use super::tensor::MetaTensor;
use super::virtual_tensor::VirtualTensor;

/// Keyword arguments, visited in key order.
pub type Kwargs = BTreeMap<String, ArgTree>;

/// Keyword carrying a requested placement. Dispatch captures it as the
/// reported location and substitutes virtual storage before the call.
pub const LOCATION_KWARG: &str = "device";

#[derive(Debug, Clone)]
pub enum Arg {
    Proxy(MetaTensor),
    Virtual(VirtualTensor),
    Real(Tensor),
    Int(i64),
    Float(f64),
    Bool(bool),
    DType(DType),
    Dims(Vec<usize>),
    Location(Location),
    None,
}

impl Arg {
    pub fn is_tensor(&self) -> bool {
        matches!(self, Arg::Proxy(_) | Arg::Virtual(_) | Arg::Real(_))
    }

    pub fn as_virtual(&self) -> Option<&VirtualTensor> {
        match self {
            Arg::Virtual(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&MetaTensor> {
        match self {
            Arg::Proxy(p) => Some(p),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ArgTree {
    Leaf(Arg),
    Seq(Vec<ArgTree>),
    Map(BTreeMap<String, ArgTree>),
}

impl ArgTree {
    /// Rebuild the tree, visiting leaves depth-first, left to right.
    pub fn map_leaves<F>(self, f: &mut F) -> ArgTree
    where
        F: FnMut(Arg) -> Arg,
    {
        match self {
            ArgTree::Leaf(arg) => ArgTree::Leaf(f(arg)),
            ArgTree::Seq(items) => {
                ArgTree::Seq(items.into_iter().map(|t| t.map_leaves(f)).collect())
            }
            ArgTree::Map(items) => ArgTree::Map(
                items
                    .into_iter()
                    .map(|(k, t)| (k, t.map_leaves(f)))
                    .collect(),
            ),
        }
    }

    /// Leaves in visiting order.
    pub fn leaves(&self) -> Vec<&Arg> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Arg>) {
        match self {
            ArgTree::Leaf(arg) => out.push(arg),
            ArgTree::Seq(items) => items.iter().for_each(|t| t.collect_leaves(out)),
            ArgTree::Map(items) => items.values().for_each(|t| t.collect_leaves(out)),
        }
    }

    pub fn as_leaf(&self) -> Option<&Arg> {
        match self {
            ArgTree::Leaf(arg) => Some(arg),
            _ => None,
        }
    }

    /// The single proxy at the root of a result tree.
    pub fn into_proxy(self) -> Result<MetaTensor> {
        match self {
            ArgTree::Leaf(Arg::Proxy(p)) => Ok(p),
            other => Err(Error::Msg(format!("expected a single tensor result, got {other:?}")).bt()),
        }
    }

    /// Every proxy of a flat sequence result, in order.
    pub fn into_proxies(self) -> Result<Vec<MetaTensor>> {
        match self {
            ArgTree::Seq(items) => items.into_iter().map(ArgTree::into_proxy).collect(),
            other => Ok(vec![other.into_proxy()?]),
        }
    }
}

impl From<Arg> for ArgTree {
    fn from(arg: Arg) -> Self {
        ArgTree::Leaf(arg)
    }
}

impl From<MetaTensor> for ArgTree {
    fn from(t: MetaTensor) -> Self {
        ArgTree::Leaf(Arg::Proxy(t))
    }
}

impl From<&MetaTensor> for ArgTree {
    fn from(t: &MetaTensor) -> Self {
        ArgTree::Leaf(Arg::Proxy(t.clone()))
    }
}

impl From<VirtualTensor> for ArgTree {
    fn from(t: VirtualTensor) -> Self {
        ArgTree::Leaf(Arg::Virtual(t))
    }
}

impl From<Tensor> for ArgTree {
    fn from(t: Tensor) -> Self {
        ArgTree::Leaf(Arg::Real(t))
    }
}

impl From<&Tensor> for ArgTree {
    fn from(t: &Tensor) -> Self {
        ArgTree::Leaf(Arg::Real(t.clone()))
    }
}

impl From<Location> for ArgTree {
    fn from(l: Location) -> Self {
        ArgTree::Leaf(Arg::Location(l))
    }
}

impl From<i64> for ArgTree {
    fn from(v: i64) -> Self {
        ArgTree::Leaf(Arg::Int(v))
    }
}

impl From<f64> for ArgTree {
    fn from(v: f64) -> Self {
        ArgTree::Leaf(Arg::Float(v))
    }
}

impl From<bool> for ArgTree {
    fn from(v: bool) -> Self {
        ArgTree::Leaf(Arg::Bool(v))
    }
}

impl From<DType> for ArgTree {
    fn from(v: DType) -> Self {
        ArgTree::Leaf(Arg::DType(v))
    }
}

impl<T: Into<ArgTree>> From<Vec<T>> for ArgTree {
    fn from(items: Vec<T>) -> Self {
        ArgTree::Seq(items.into_iter().map(Into::into).collect())
    }
}
