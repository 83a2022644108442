use rayon::prelude::*;

use crate::{KernelError, StridedSlice, StridedSliceMut, ensure_len, ensure_same_shape, names};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripletMarginParams {
    pub margin: f64,
    /// Norm degree of the pairwise distance.
    pub p: f64,
    /// Added to every difference before the norm is taken.
    pub eps: f64,
    /// Use `min(d(a, n), d(p, n))` as the negative distance.
    pub swap: bool,
}

impl Default for TripletMarginParams {
    fn default() -> Self {
        Self {
            margin: 1.0,
            p: 2.0,
            eps: 1e-6,
            swap: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegativePair {
    Anchor,
    Positive,
}

#[derive(Debug, Clone, Copy)]
struct Triplet<'a> {
    anchor: StridedSlice<'a>,
    positive: StridedSlice<'a>,
    negative: StridedSlice<'a>,
    rows: usize,
    dims: usize,
}

impl<'a> Triplet<'a> {
    fn new(
        anchor: StridedSlice<'a>,
        positive: StridedSlice<'a>,
        negative: StridedSlice<'a>,
        params: &TripletMarginParams,
        kernel: &'static str,
    ) -> Result<Self, KernelError> {
        ensure_same_shape(anchor.side(), anchor.view(), positive.side(), positive.view())?;
        ensure_same_shape(anchor.side(), anchor.view(), negative.side(), negative.view())?;
        if !(params.p > 0.0) {
            return Err(KernelError::InvalidLaunch {
                kernel,
                detail: format!("norm degree must be positive, got {}", params.p),
            });
        }
        let sizes = anchor.view().sizes();
        Ok(Self {
            anchor,
            positive,
            negative,
            rows: sizes[3],
            dims: sizes[4],
        })
    }

    fn difference(
        &self,
        lhs: &StridedSlice<'_>,
        rhs: &StridedSlice<'_>,
        row: usize,
        eps: f64,
    ) -> Vec<f64> {
        (0..self.dims)
            .map(|col| {
                let flat = row * self.dims + col;
                lhs.at_flat(flat) - rhs.at_flat(flat) + eps
            })
            .collect()
    }

    /// Distances `d(a, p)` and the selected negative distance for one row,
    /// together with the differences they were taken over.
    fn row_terms(&self, row: usize, params: &TripletMarginParams) -> RowTerms {
        let ap = self.difference(&self.anchor, &self.positive, row, params.eps);
        let an = self.difference(&self.anchor, &self.negative, row, params.eps);
        let d_ap = norm(&ap, params.p);
        let d_an = norm(&an, params.p);
        let (negative_pair, neg, d_neg) = if params.swap {
            let pn = self.difference(&self.positive, &self.negative, row, params.eps);
            let d_pn = norm(&pn, params.p);
            if d_pn < d_an {
                (NegativePair::Positive, pn, d_pn)
            } else {
                (NegativePair::Anchor, an, d_an)
            }
        } else {
            (NegativePair::Anchor, an, d_an)
        };
        RowTerms {
            loss: (params.margin + d_ap - d_neg).max(0.0),
            ap,
            d_ap,
            neg,
            d_neg,
            negative_pair,
        }
    }
}

struct RowTerms {
    loss: f64,
    ap: Vec<f64>,
    d_ap: f64,
    neg: Vec<f64>,
    d_neg: f64,
    negative_pair: NegativePair,
}

fn norm(diff: &[f64], p: f64) -> f64 {
    diff.iter().map(|v| v.abs().powf(p)).sum::<f64>().powf(1.0 / p)
}

/// Gradient of `norm(diff)` with respect to `diff`; zero at the origin.
fn norm_grad(diff: &[f64], distance: f64, p: f64) -> Vec<f64> {
    if distance == 0.0 {
        return vec![0.0; diff.len()];
    }
    let denom = distance.powf(p - 1.0);
    diff.iter()
        .map(|&v| {
            if v == 0.0 {
                0.0
            } else {
                v.signum() * v.abs().powf(p - 1.0) / denom
            }
        })
        .collect()
}

fn row_losses(triplet: &Triplet<'_>, params: &TripletMarginParams) -> Vec<f64> {
    (0..triplet.rows)
        .into_par_iter()
        .map(|row| triplet.row_terms(row, params).loss)
        .collect()
}

/// One loss per row of `[N, D]` embeddings, written to the `[N]` output.
pub fn triplet_margin_loss_unreduced_forward(
    anchor: StridedSlice<'_>,
    positive: StridedSlice<'_>,
    negative: StridedSlice<'_>,
    output: &mut StridedSliceMut<'_>,
    params: &TripletMarginParams,
) -> Result<(), KernelError> {
    let triplet = Triplet::new(
        anchor,
        positive,
        negative,
        params,
        names::TRIPLET_MARGIN_LOSS_UNREDUCED_FORWARD_2D,
    )?;
    ensure_len(output.numel(), triplet.rows, output.side())?;
    for (row, loss) in row_losses(&triplet, params).into_iter().enumerate() {
        output.store_flat(row, loss);
    }
    Ok(())
}

/// First pass of the reduced forward: `workspace[n]` receives row `n`'s loss
/// scaled by `1 / divisor`.
pub fn triplet_margin_loss_reduced_forward(
    anchor: StridedSlice<'_>,
    positive: StridedSlice<'_>,
    negative: StridedSlice<'_>,
    workspace: &mut [f64],
    params: &TripletMarginParams,
    divisor: f64,
) -> Result<(), KernelError> {
    let triplet = Triplet::new(
        anchor,
        positive,
        negative,
        params,
        names::TRIPLET_MARGIN_LOSS_REDUCED_FORWARD_2D,
    )?;
    ensure_len(workspace.len(), triplet.rows, "workspace")?;
    for (slot, loss) in workspace.iter_mut().zip(row_losses(&triplet, params)) {
        *slot = loss / divisor;
    }
    Ok(())
}

/// Gradients of the triplet loss. `output_grad` holds one entry per row, or a
/// single entry when `divisor` is given for the reduced loss.
#[allow(clippy::too_many_arguments)]
pub fn triplet_margin_loss_backward<'a>(
    anchor: StridedSlice<'_>,
    positive: StridedSlice<'_>,
    negative: StridedSlice<'_>,
    output_grad: StridedSlice<'_>,
    anchor_grad: Option<&mut StridedSliceMut<'a>>,
    positive_grad: Option<&mut StridedSliceMut<'a>>,
    negative_grad: Option<&mut StridedSliceMut<'a>>,
    params: &TripletMarginParams,
    divisor: Option<f64>,
) -> Result<(), KernelError> {
    let kernel = if divisor.is_some() {
        names::TRIPLET_MARGIN_LOSS_REDUCED_BACKWARD_2D
    } else {
        names::TRIPLET_MARGIN_LOSS_UNREDUCED_BACKWARD_2D
    };
    let triplet = Triplet::new(anchor, positive, negative, params, kernel)?;
    let needed = if divisor.is_some() { 1 } else { triplet.rows };
    ensure_len(output_grad.numel(), needed, output_grad.side())?;
    for grad in [&anchor_grad, &positive_grad, &negative_grad]
        .into_iter()
        .flatten()
    {
        ensure_same_shape(anchor.side(), anchor.view(), grad.side(), grad.view())?;
    }

    let rows: Vec<[Vec<f64>; 3]> = (0..triplet.rows)
        .into_par_iter()
        .map(|row| {
            let incoming = match divisor {
                Some(divisor) => output_grad.at_flat(0) / divisor,
                None => output_grad.at_flat(row),
            };
            let terms = triplet.row_terms(row, params);
            let zeros = vec![0.0; triplet.dims];
            if terms.loss <= 0.0 || incoming == 0.0 {
                return [zeros.clone(), zeros.clone(), zeros];
            }
            let g_ap = norm_grad(&terms.ap, terms.d_ap, params.p);
            let g_neg = norm_grad(&terms.neg, terms.d_neg, params.p);
            let mut d_anchor = zeros.clone();
            let mut d_positive = zeros.clone();
            let mut d_negative = zeros;
            for col in 0..triplet.dims {
                d_anchor[col] = incoming * g_ap[col];
                d_positive[col] = -incoming * g_ap[col];
                d_negative[col] = incoming * g_neg[col];
                match terms.negative_pair {
                    NegativePair::Anchor => d_anchor[col] -= incoming * g_neg[col],
                    NegativePair::Positive => d_positive[col] -= incoming * g_neg[col],
                }
            }
            [d_anchor, d_positive, d_negative]
        })
        .collect();

    for (slot, target) in [anchor_grad, positive_grad, negative_grad]
        .into_iter()
        .enumerate()
    {
        let Some(target) = target else {
            continue;
        };
        for (row, grads) in rows.iter().enumerate() {
            for (col, value) in grads[slot].iter().enumerate() {
                target.store_flat(row * triplet.dims + col, *value);
            }
        }
    }
    Ok(())
}
