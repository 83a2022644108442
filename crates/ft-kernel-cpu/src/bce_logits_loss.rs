use rayon::prelude::*;

use crate::{KernelError, StridedSlice, StridedSliceMut, ensure_len, ensure_same_shape, names};

/// `ln(1 + e^x)` without overflow for large `|x|`.
fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn loss(x: f64, t: f64, weight: f64, pos_weight: f64) -> f64 {
    weight * (pos_weight * t * softplus(-x) + (1.0 - t) * softplus(x))
}

/// Partial derivatives of [`loss`] with respect to the logit and the target.
fn partials(x: f64, t: f64, weight: f64, pos_weight: f64) -> (f64, f64) {
    let scaled = pos_weight * t;
    let dx = weight * ((scaled + 1.0 - t) * sigmoid(x) - scaled);
    let dt = weight * (pos_weight * softplus(-x) - softplus(x));
    (dx, dt)
}

/// Optional per-element weights; an absent one reads as `1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LossWeights<'a> {
    pub weight: Option<StridedSlice<'a>>,
    pub pos_weight: Option<StridedSlice<'a>>,
}

impl LossWeights<'_> {
    fn ensure_shape(&self, input: &StridedSlice<'_>) -> Result<(), KernelError> {
        for slice in self.weight.iter().chain(self.pos_weight.iter()) {
            ensure_same_shape(input.side(), input.view(), slice.side(), slice.view())?;
        }
        Ok(())
    }

    fn at(&self, coordinate: &[usize; 5]) -> (f64, f64) {
        (
            self.weight.map_or(1.0, |w| w.at(coordinate)),
            self.pos_weight.map_or(1.0, |pw| pw.at(coordinate)),
        )
    }
}

/// First pass of the reduced forward: `workspace[i]` receives the weighted
/// loss of flat element `i` scaled by `1 / divisor`.
pub fn bce_logits_loss_reduced_forward(
    input: StridedSlice<'_>,
    target: StridedSlice<'_>,
    weights: LossWeights<'_>,
    workspace: &mut [f64],
    divisor: f64,
) -> Result<(), KernelError> {
    ensure_same_shape(input.side(), input.view(), target.side(), target.view())?;
    weights.ensure_shape(&input)?;
    let numel = input.numel();
    ensure_len(workspace.len(), numel, "workspace")?;
    workspace[..numel]
        .par_iter_mut()
        .enumerate()
        .for_each(|(flat, slot)| {
            let coordinate = input.view().flat_to_coordinate(flat);
            let (weight, pos_weight) = weights.at(&coordinate);
            *slot = loss(
                input.at(&coordinate),
                target.at(&coordinate),
                weight,
                pos_weight,
            ) / divisor;
        });
    Ok(())
}

pub fn bce_logits_loss_reduced_backward(
    input: StridedSlice<'_>,
    target: StridedSlice<'_>,
    weights: LossWeights<'_>,
    output_grad: StridedSlice<'_>,
    input_grad: Option<&mut StridedSliceMut<'_>>,
    target_grad: Option<&mut StridedSliceMut<'_>>,
    divisor: f64,
) -> Result<(), KernelError> {
    if output_grad.numel() == 0 {
        return Err(KernelError::InvalidLaunch {
            kernel: names::BCE_LOGITS_LOSS_REDUCED_BACKWARD_5D,
            detail: format!("{} is empty", output_grad.side()),
        });
    }
    ensure_same_shape(input.side(), input.view(), target.side(), target.view())?;
    weights.ensure_shape(&input)?;
    if let Some(grad) = input_grad.as_deref() {
        ensure_same_shape(input.side(), input.view(), grad.side(), grad.view())?;
    }
    if let Some(grad) = target_grad.as_deref() {
        ensure_same_shape(target.side(), target.view(), grad.side(), grad.view())?;
    }

    let scale = output_grad.at_flat(0) / divisor;
    let grads: Vec<([usize; 5], (f64, f64))> = (0..input.numel())
        .into_par_iter()
        .map(|flat| {
            let coordinate = input.view().flat_to_coordinate(flat);
            let (weight, pos_weight) = weights.at(&coordinate);
            let (dx, dt) = partials(
                input.at(&coordinate),
                target.at(&coordinate),
                weight,
                pos_weight,
            );
            (coordinate, (dx * scale, dt * scale))
        })
        .collect();
    if let Some(input_grad) = input_grad {
        for (coordinate, (dx, _)) in &grads {
            input_grad.store(coordinate, *dx);
        }
    }
    if let Some(target_grad) = target_grad {
        for (coordinate, (_, dt)) in &grads {
            target_grad.store(coordinate, *dt);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ft_core::{DType, TensorDescriptor};
    use ft_view::TensorView5;
    use proptest::prelude::*;

    use super::{
        LossWeights, bce_logits_loss_reduced_backward, bce_logits_loss_reduced_forward, loss,
        partials, softplus,
    };
    use crate::{KernelError, StridedSlice, StridedSliceMut, reduce_sum};

    fn view_of(desc: &TensorDescriptor) -> TensorView5 {
        TensorView5::from_descriptor(desc).expect("test view should canonicalize")
    }

    #[test]
    fn softplus_is_stable_at_extremes() {
        assert_eq!(softplus(1000.0), 1000.0);
        assert_eq!(softplus(-1000.0), 0.0);
        assert!((softplus(0.0) - std::f64::consts::LN_2).abs() < 1e-15);
    }

    #[test]
    fn unweighted_forward_then_reduce_gives_mean() {
        let desc = TensorDescriptor::from_shape(vec![2], DType::F64);
        let scalar = TensorDescriptor::from_shape(vec![1], DType::F64);
        let input_data = vec![0.0, 0.0];
        let target_data = vec![1.0, 0.0];
        let mut workspace = vec![0.0; 2];
        let mut out = vec![0.0];

        let input = StridedSlice::new("input", &input_data, view_of(&desc)).expect("fits");
        let target = StridedSlice::new("target", &target_data, view_of(&desc)).expect("fits");
        bce_logits_loss_reduced_forward(input, target, LossWeights::default(), &mut workspace, 2.0)
            .expect("first pass should succeed");
        let mut output = StridedSliceMut::new("output", &mut out, view_of(&scalar)).expect("fits");
        reduce_sum(&workspace, 2, &mut output).expect("reduction should succeed");

        assert!((out[0] - std::f64::consts::LN_2).abs() < 1e-12);
    }

    #[test]
    fn broadcast_pos_weight_scales_positive_terms_per_column() {
        let desc = TensorDescriptor::from_shape(vec![2, 2], DType::F64);
        let column = TensorDescriptor::from_shape(vec![2], DType::F64)
            .broadcast_to(&[2, 2])
            .expect("broadcast");
        let input_data = vec![0.0; 4];
        let target_data = vec![1.0; 4];
        let pos_weight_data = vec![1.0, 3.0];
        let mut workspace = vec![0.0; 4];

        let input = StridedSlice::new("input", &input_data, view_of(&desc)).expect("fits");
        let target = StridedSlice::new("target", &target_data, view_of(&desc)).expect("fits");
        let pos_weight =
            StridedSlice::new("pos_weight", &pos_weight_data, view_of(&column)).expect("fits");
        let weights = LossWeights {
            weight: None,
            pos_weight: Some(pos_weight),
        };
        bce_logits_loss_reduced_forward(input, target, weights, &mut workspace, 1.0)
            .expect("first pass should succeed");

        let ln2 = std::f64::consts::LN_2;
        let expected = [ln2, 3.0 * ln2, ln2, 3.0 * ln2];
        for (got, want) in workspace.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn backward_writes_requested_gradients_only() {
        let desc = TensorDescriptor::from_shape(vec![2], DType::F64);
        let scalar = TensorDescriptor::from_shape(vec![1], DType::F64);
        let input_data = vec![0.0, 2.0];
        let target_data = vec![1.0, 0.0];
        let weight_data = vec![2.0, 0.5];
        let grad_data = vec![4.0];
        let mut dinput = vec![0.0; 2];

        let input = StridedSlice::new("input", &input_data, view_of(&desc)).expect("fits");
        let target = StridedSlice::new("target", &target_data, view_of(&desc)).expect("fits");
        let weight = StridedSlice::new("weight", &weight_data, view_of(&desc)).expect("fits");
        let output_grad =
            StridedSlice::new("output_grad", &grad_data, view_of(&scalar)).expect("fits");
        let mut input_grad =
            StridedSliceMut::new("input_grad", &mut dinput, view_of(&desc)).expect("fits");
        bce_logits_loss_reduced_backward(
            input,
            target,
            LossWeights {
                weight: Some(weight),
                pos_weight: None,
            },
            output_grad,
            Some(&mut input_grad),
            None,
            2.0,
        )
        .expect("backward should succeed");

        // sigmoid(0) - 1 = -0.5 under weight 2; sigmoid(2) under weight 0.5
        let sigmoid_two = 1.0 / (1.0 + (-2.0f64).exp());
        assert!((dinput[0] - (2.0 * -0.5 * 2.0)).abs() < 1e-12);
        assert!((dinput[1] - (0.5 * sigmoid_two * 2.0)).abs() < 1e-12);
    }

    #[test]
    fn weight_shape_must_match_input() {
        let desc = TensorDescriptor::from_shape(vec![4], DType::F64);
        let short = TensorDescriptor::from_shape(vec![2], DType::F64);
        let data = vec![0.0; 4];
        let mut workspace = vec![0.0; 4];
        let input = StridedSlice::new("input", &data, view_of(&desc)).expect("fits");
        let weight = StridedSlice::new("weight", &data, view_of(&short)).expect("fits");
        let err = bce_logits_loss_reduced_forward(
            input,
            input,
            LossWeights {
                weight: Some(weight),
                pos_weight: None,
            },
            &mut workspace,
            1.0,
        )
        .expect_err("weight is too short");
        assert!(matches!(
            err,
            KernelError::ShapeMismatch { rhs: "weight", .. }
        ));
    }

    proptest! {
        #[test]
        fn prop_partials_match_finite_differences(
            x in -6.0f64..6.0,
            t in 0.0f64..1.0,
            weight in 0.1f64..3.0,
            pos_weight in 0.1f64..3.0,
        ) {
            let h = 1e-6;
            let (dx, dt) = partials(x, t, weight, pos_weight);
            let numeric_dx =
                (loss(x + h, t, weight, pos_weight) - loss(x - h, t, weight, pos_weight)) / (2.0 * h);
            let numeric_dt =
                (loss(x, t + h, weight, pos_weight) - loss(x, t - h, weight, pos_weight)) / (2.0 * h);
            prop_assert!((dx - numeric_dx).abs() < 1e-5);
            prop_assert!((dt - numeric_dt).abs() < 1e-5);
        }
    }
}
