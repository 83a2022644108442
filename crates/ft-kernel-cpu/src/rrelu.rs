use rayon::prelude::*;

use crate::{
    KernelError, StridedSlice, StridedSliceMut, XorwowState, ensure_len, ensure_same_shape, names,
};

/// Randomized leaky ReLU over `workers` independent streams.
///
/// Worker `w` starts from a private copy of `states[w % states.len()]` and
/// visits flat indices `w, w + workers, ...`, drawing once per element. The
/// slope of element `i` is stored in `noise[i]`: a uniform draw in
/// `[lower, upper)` for negative inputs, `1` otherwise. The caller's pool is
/// never advanced.
#[allow(clippy::too_many_arguments)]
pub fn rrelu_forward(
    input: StridedSlice<'_>,
    output: &mut StridedSliceMut<'_>,
    noise: &mut [f64],
    states: &[XorwowState],
    workers: usize,
    lower: f64,
    upper: f64,
) -> Result<(), KernelError> {
    ensure_same_shape(input.side(), input.view(), output.side(), output.view())?;
    let numel = input.numel();
    ensure_len(noise.len(), numel, "noise")?;
    if numel == 0 {
        return Ok(());
    }
    if states.is_empty() {
        return Err(KernelError::EmptyGeneratorPool);
    }
    if workers == 0 {
        return Err(KernelError::InvalidLaunch {
            kernel: names::RRELU_FORWARD_5D,
            detail: "worker count is zero".to_string(),
        });
    }

    let draws: Vec<(usize, f64, f64)> = (0..workers)
        .into_par_iter()
        .flat_map_iter(|worker| {
            let mut state = states[worker % states.len()];
            (worker..numel).step_by(workers).map(move |flat| {
                let u = state.next_uniform();
                let x = input.at_flat(flat);
                let alpha = if x < 0.0 {
                    u * (upper - lower) + lower
                } else {
                    1.0
                };
                (flat, x * alpha, alpha)
            })
        })
        .collect();

    for (flat, value, alpha) in draws {
        output.store_flat(flat, value);
        noise[flat] = alpha;
    }
    Ok(())
}

/// `input_grad[i] = output_grad[i] / noise[i]` with the noise recorded by
/// [`rrelu_forward`].
pub fn rrelu_backward(
    output_grad: StridedSlice<'_>,
    noise: &[f64],
    input_grad: &mut StridedSliceMut<'_>,
) -> Result<(), KernelError> {
    ensure_same_shape(
        output_grad.side(),
        output_grad.view(),
        input_grad.side(),
        input_grad.view(),
    )?;
    let numel = output_grad.numel();
    ensure_len(noise.len(), numel, "noise")?;
    let grads: Vec<f64> = (0..numel)
        .into_par_iter()
        .map(|flat| output_grad.at_flat(flat) / noise[flat])
        .collect();
    for (flat, grad) in grads.into_iter().enumerate() {
        input_grad.store_flat(flat, grad);
    }
    Ok(())
}
