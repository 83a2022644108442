use rayon::prelude::*;

use crate::{
    KernelError, StridedSlice, StridedSliceMut, ensure_len, ensure_same_shape, map_coordinates,
    names,
};

fn loss(diff: f64, beta: f64) -> f64 {
    let magnitude = diff.abs();
    if magnitude < beta {
        0.5 * diff * diff / beta
    } else {
        magnitude - 0.5 * beta
    }
}

/// Derivative of [`loss`] with respect to `input - target`.
fn slope(diff: f64, beta: f64) -> f64 {
    if diff.abs() < beta {
        diff / beta
    } else if diff > 0.0 {
        1.0
    } else if diff < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Fast path for operands that share one dense layout.
pub fn smooth_l1_loss_forward_contiguous(
    input: &[f64],
    target: &[f64],
    output: &mut [f64],
    numel: usize,
    beta: f64,
) -> Result<(), KernelError> {
    ensure_len(input.len(), numel, "input")?;
    ensure_len(target.len(), numel, "target")?;
    ensure_len(output.len(), numel, "output")?;
    output[..numel]
        .par_iter_mut()
        .zip(input[..numel].par_iter().zip(target[..numel].par_iter()))
        .for_each(|(out, (&x, &t))| *out = loss(x - t, beta));
    Ok(())
}

pub fn smooth_l1_loss_unreduced_forward(
    input: StridedSlice<'_>,
    target: StridedSlice<'_>,
    output: &mut StridedSliceMut<'_>,
    beta: f64,
) -> Result<(), KernelError> {
    ensure_same_shape(input.side(), input.view(), target.side(), target.view())?;
    ensure_same_shape(input.side(), input.view(), output.side(), output.view())?;
    let values = map_coordinates(input.view(), |coordinate| {
        loss(input.at(coordinate) - target.at(coordinate), beta)
    });
    for (coordinate, value) in values {
        output.store(&coordinate, value);
    }
    Ok(())
}

/// First pass of the reduced forward: `workspace[i]` receives the loss of
/// flat element `i` scaled by `1 / divisor`. A `ReduceSum` pass folds it.
pub fn smooth_l1_loss_reduced_forward(
    input: StridedSlice<'_>,
    target: StridedSlice<'_>,
    workspace: &mut [f64],
    beta: f64,
    divisor: f64,
) -> Result<(), KernelError> {
    ensure_same_shape(input.side(), input.view(), target.side(), target.view())?;
    let numel = input.numel();
    ensure_len(workspace.len(), numel, "workspace")?;
    workspace[..numel]
        .par_iter_mut()
        .enumerate()
        .for_each(|(flat, slot)| {
            let coordinate = input.view().flat_to_coordinate(flat);
            *slot = loss(input.at(&coordinate) - target.at(&coordinate), beta) / divisor;
        });
    Ok(())
}

/// Fast path backward. Either gradient may be skipped.
pub fn smooth_l1_loss_backward_contiguous(
    input: &[f64],
    target: &[f64],
    output_grad: &[f64],
    input_grad: Option<&mut [f64]>,
    target_grad: Option<&mut [f64]>,
    numel: usize,
    beta: f64,
) -> Result<(), KernelError> {
    ensure_len(input.len(), numel, "input")?;
    ensure_len(target.len(), numel, "target")?;
    ensure_len(output_grad.len(), numel, "output_grad")?;
    let grads: Vec<f64> = (0..numel)
        .into_par_iter()
        .map(|i| slope(input[i] - target[i], beta) * output_grad[i])
        .collect();
    if let Some(input_grad) = input_grad {
        ensure_len(input_grad.len(), numel, "input_grad")?;
        input_grad[..numel].copy_from_slice(&grads);
    }
    if let Some(target_grad) = target_grad {
        ensure_len(target_grad.len(), numel, "target_grad")?;
        for (slot, grad) in target_grad[..numel].iter_mut().zip(&grads) {
            *slot = -grad;
        }
    }
    Ok(())
}

pub fn smooth_l1_loss_unreduced_backward(
    input: StridedSlice<'_>,
    target: StridedSlice<'_>,
    output_grad: StridedSlice<'_>,
    input_grad: Option<&mut StridedSliceMut<'_>>,
    target_grad: Option<&mut StridedSliceMut<'_>>,
    beta: f64,
) -> Result<(), KernelError> {
    ensure_same_shape(
        input.side(),
        input.view(),
        output_grad.side(),
        output_grad.view(),
    )?;
    backward(
        input,
        target,
        input_grad,
        target_grad,
        |coordinate| output_grad.at(coordinate),
        beta,
    )
}

/// Backward of the reduced loss: every element sees the single incoming
/// gradient scaled by `1 / divisor`.
pub fn smooth_l1_loss_reduced_backward(
    input: StridedSlice<'_>,
    target: StridedSlice<'_>,
    output_grad: StridedSlice<'_>,
    input_grad: Option<&mut StridedSliceMut<'_>>,
    target_grad: Option<&mut StridedSliceMut<'_>>,
    beta: f64,
    divisor: f64,
) -> Result<(), KernelError> {
    if output_grad.numel() == 0 {
        return Err(KernelError::InvalidLaunch {
            kernel: names::SMOOTH_L1_LOSS_REDUCED_BACKWARD_5D,
            detail: format!("{} is empty", output_grad.side()),
        });
    }
    let scale = output_grad.at_flat(0) / divisor;
    backward(input, target, input_grad, target_grad, |_| scale, beta)
}

fn backward<G>(
    input: StridedSlice<'_>,
    target: StridedSlice<'_>,
    input_grad: Option<&mut StridedSliceMut<'_>>,
    target_grad: Option<&mut StridedSliceMut<'_>>,
    incoming: G,
    beta: f64,
) -> Result<(), KernelError>
where
    G: Fn(&[usize; 5]) -> f64 + Sync,
{
    ensure_same_shape(input.side(), input.view(), target.side(), target.view())?;
    if let Some(grad) = input_grad.as_deref() {
        ensure_same_shape(input.side(), input.view(), grad.side(), grad.view())?;
    }
    if let Some(grad) = target_grad.as_deref() {
        ensure_same_shape(target.side(), target.view(), grad.side(), grad.view())?;
    }

    let grads = map_coordinates(input.view(), |coordinate| {
        slope(input.at(coordinate) - target.at(coordinate), beta) * incoming(coordinate)
    });
    if let Some(input_grad) = input_grad {
        for (coordinate, grad) in &grads {
            input_grad.store(coordinate, *grad);
        }
    }
    if let Some(target_grad) = target_grad {
        for (coordinate, grad) in &grads {
            target_grad.store(coordinate, -grad);
        }
    }
    Ok(())
}
