//! Interception boundary between proxies and virtual kernels.

use candle_core::Result;

use super::location::Location;
use super::ops::Operation;
use super::tensor::MetaTensor;
use super::tree::{Arg, ArgTree, Kwargs, LOCATION_KWARG};
use super::virtual_tensor::VirtualTensor;

/// Run `op` on a mix of proxies, real tensors and scalars.
///
/// 1. Every proxy is unwrapped to its virtual value and every real tensor is
///    migrated to virtual storage. The reported location of the result is the
///    one of the *last* tensor visited; plain tensors contribute their own
///    device.
/// 2. A `device` keyword overrides that location and is replaced by
///    [`Location::Meta`] before the call.
/// 3. `op` runs on virtual arguments only.
/// 4. Every tensor in the result is wrapped as a proxy reporting the captured
///    location; other leaves pass through.
///
/// When tensor arguments disagree on their reported location the result is
/// last-wins, i.e. it depends on argument order.
///
/// Errors raised by `op` are returned unchanged.
pub fn dispatch(op: &dyn Operation, args: Vec<ArgTree>, kwargs: Kwargs) -> Result<ArgTree> {
    let mut reported: Option<Location> = None;
    let mut unwrap = |arg: Arg| unwrap_leaf(arg, &mut reported);

    let args: Vec<ArgTree> = args.into_iter().map(|t| t.map_leaves(&mut unwrap)).collect();
    let mut kwargs: Kwargs = kwargs
        .into_iter()
        .map(|(k, t)| (k, t.map_leaves(&mut unwrap)))
        .collect();

    if let Some(ArgTree::Leaf(Arg::Location(location))) = kwargs.get_mut(LOCATION_KWARG) {
        reported = Some(std::mem::replace(location, Location::Meta));
    }

    let out = op.call(&args, &kwargs)?;

    let location = reported.unwrap_or_default();
    let name = op.name();
    tracing::trace!(op = name, location = %location, "meta dispatch");
    Ok(out.map_leaves(&mut |arg| wrap_leaf(arg, &location, name)))
}

fn unwrap_leaf(arg: Arg, reported: &mut Option<Location>) -> Arg {
    match arg {
        Arg::Proxy(proxy) => {
            let (value, location) = proxy.into_parts();
            *reported = Some(location);
            Arg::Virtual(value)
        }
        Arg::Real(tensor) => {
            *reported = Some(Location::from(tensor.device()));
            Arg::Virtual(VirtualTensor::from_tensor(&tensor))
        }
        Arg::Virtual(value) => {
            *reported = Some(value.location());
            Arg::Virtual(value)
        }
        other => other,
    }
}

fn wrap_leaf(arg: Arg, location: &Location, op_name: &str) -> Arg {
    let mut value = match arg {
        Arg::Virtual(value) => value,
        Arg::Real(tensor) => VirtualTensor::from_tensor(&tensor),
        Arg::Proxy(proxy) => proxy.into_parts().0,
        other => return other,
    };
    value.set_grad_fn(op_name);
    Arg::Proxy(MetaTensor::new(value, Some(location.clone())))
}
