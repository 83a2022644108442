#![forbid(unsafe_code)]

//! Host kernels for the operators behind the dispatch core.
//!
//! Every kernel addresses its operands through a rank-5 [`TensorView5`]: the
//! flat index of the iteration space is decomposed once into a coordinate and
//! each operand maps that coordinate through its own strides. Work is spread
//! over rayon's pool; results are gathered and scattered on the calling
//! thread so that no two workers ever write the same buffer.

mod bce_logits_loss;
pub mod names;
mod prng;
mod rrelu;
mod smooth_l1_loss;
mod triplet_margin_loss;

use std::fmt;

use ft_view::TensorView5;
use rayon::prelude::*;

pub use bce_logits_loss::{
    LossWeights, bce_logits_loss_reduced_backward, bce_logits_loss_reduced_forward,
};
pub use prng::XorwowState;
pub use rrelu::{rrelu_backward, rrelu_forward};
pub use smooth_l1_loss::{
    smooth_l1_loss_backward_contiguous, smooth_l1_loss_forward_contiguous,
    smooth_l1_loss_reduced_backward, smooth_l1_loss_reduced_forward,
    smooth_l1_loss_unreduced_backward, smooth_l1_loss_unreduced_forward,
};
pub use triplet_margin_loss::{
    TripletMarginParams, triplet_margin_loss_backward, triplet_margin_loss_reduced_forward,
    triplet_margin_loss_unreduced_forward,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    ShapeMismatch {
        lhs: &'static str,
        lhs_shape: [usize; 5],
        rhs: &'static str,
        rhs_shape: [usize; 5],
    },
    StorageSpanOverflow {
        side: &'static str,
    },
    InsufficientStorage {
        side: &'static str,
        needed: usize,
        available: usize,
    },
    EmptyGeneratorPool,
    InvalidLaunch {
        kernel: &'static str,
        detail: String,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch {
                lhs,
                lhs_shape,
                rhs,
                rhs_shape,
            } => write!(
                f,
                "shape mismatch: {lhs}={lhs_shape:?}, {rhs}={rhs_shape:?}"
            ),
            Self::StorageSpanOverflow { side } => {
                write!(f, "storage span overflow on {side}")
            }
            Self::InsufficientStorage {
                side,
                needed,
                available,
            } => write!(
                f,
                "insufficient storage on {side}: needed={needed}, available={available}"
            ),
            Self::EmptyGeneratorPool => f.write_str("generator state pool is empty"),
            Self::InvalidLaunch { kernel, detail } => {
                write!(f, "invalid launch of {kernel}: {detail}")
            }
        }
    }
}

impl std::error::Error for KernelError {}

/// Elements `0..=max_offset` a view may touch, or 0 for an empty view.
fn required_len(view: &TensorView5, side: &'static str) -> Result<usize, KernelError> {
    if view.numel() == 0 {
        return Ok(0);
    }
    view.sizes()
        .iter()
        .zip(view.strides().iter())
        .try_fold(view.base(), |offset, (&size, &stride)| {
            (size - 1)
                .checked_mul(stride)
                .and_then(|extent| offset.checked_add(extent))
        })
        .and_then(|max_offset| max_offset.checked_add(1))
        .ok_or(KernelError::StorageSpanOverflow { side })
}

fn ensure_fits(len: usize, view: &TensorView5, side: &'static str) -> Result<(), KernelError> {
    let needed = required_len(view, side)?;
    if len < needed {
        return Err(KernelError::InsufficientStorage {
            side,
            needed,
            available: len,
        });
    }
    Ok(())
}

fn ensure_len(len: usize, needed: usize, side: &'static str) -> Result<(), KernelError> {
    if len < needed {
        return Err(KernelError::InsufficientStorage {
            side,
            needed,
            available: len,
        });
    }
    Ok(())
}

fn ensure_same_shape(
    lhs: &'static str,
    lhs_view: &TensorView5,
    rhs: &'static str,
    rhs_view: &TensorView5,
) -> Result<(), KernelError> {
    if lhs_view.sizes() != rhs_view.sizes() {
        return Err(KernelError::ShapeMismatch {
            lhs,
            lhs_shape: *lhs_view.sizes(),
            rhs,
            rhs_shape: *rhs_view.sizes(),
        });
    }
    Ok(())
}

/// Read-only operand: a storage slice seen through a strided view.
#[derive(Debug, Clone, Copy)]
pub struct StridedSlice<'a> {
    side: &'static str,
    data: &'a [f64],
    view: TensorView5,
}

impl<'a> StridedSlice<'a> {
    /// Fails unless every offset the view can produce lies inside `data`.
    pub fn new(side: &'static str, data: &'a [f64], view: TensorView5) -> Result<Self, KernelError> {
        ensure_fits(data.len(), &view, side)?;
        Ok(Self { side, data, view })
    }

    #[must_use]
    pub fn side(&self) -> &'static str {
        self.side
    }

    #[must_use]
    pub fn view(&self) -> &TensorView5 {
        &self.view
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.view.numel()
    }

    fn at(&self, coordinate: &[usize; 5]) -> f64 {
        self.data[self.view.coordinate_to_offset(coordinate)]
    }

    fn at_flat(&self, flat_index: usize) -> f64 {
        self.data[self.view.flat_to_offset(flat_index)]
    }
}

/// Writable operand: a storage slice seen through a strided view.
#[derive(Debug)]
pub struct StridedSliceMut<'a> {
    side: &'static str,
    data: &'a mut [f64],
    view: TensorView5,
}

impl<'a> StridedSliceMut<'a> {
    pub fn new(
        side: &'static str,
        data: &'a mut [f64],
        view: TensorView5,
    ) -> Result<Self, KernelError> {
        ensure_fits(data.len(), &view, side)?;
        Ok(Self { side, data, view })
    }

    #[must_use]
    pub fn side(&self) -> &'static str {
        self.side
    }

    #[must_use]
    pub fn view(&self) -> &TensorView5 {
        &self.view
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.view.numel()
    }

    fn store(&mut self, coordinate: &[usize; 5], value: f64) {
        let offset = self.view.coordinate_to_offset(coordinate);
        self.data[offset] = value;
    }

    fn store_flat(&mut self, flat_index: usize, value: f64) {
        let offset = self.view.flat_to_offset(flat_index);
        self.data[offset] = value;
    }
}

/// Sums the first `len` entries of `partials` into the first element of
/// `output`.
pub fn reduce_sum(
    partials: &[f64],
    len: usize,
    output: &mut StridedSliceMut<'_>,
) -> Result<(), KernelError> {
    ensure_len(partials.len(), len, "workspace")?;
    if output.numel() == 0 {
        return Err(KernelError::InvalidLaunch {
            kernel: names::REDUCE_SUM,
            detail: format!("{} has no element to receive the sum", output.side()),
        });
    }
    let sum: f64 = partials[..len].par_iter().sum();
    output.store_flat(0, sum);
    Ok(())
}

/// Evaluates `op` at every coordinate of `iteration` in parallel.
fn map_coordinates<F>(iteration: &TensorView5, op: F) -> Vec<([usize; 5], f64)>
where
    F: Fn(&[usize; 5]) -> f64 + Sync,
{
    (0..iteration.numel())
        .into_par_iter()
        .map(|flat| {
            let coordinate = iteration.flat_to_coordinate(flat);
            let value = op(&coordinate);
            (coordinate, value)
        })
        .collect()
}
