use ft_core::{TensorDescriptor, ValidationMode};

use crate::{
    OperatorKind, Operand, ProblemDescription, Reduction, ShapeConstraint, ValidationError,
    Variant,
};

/// Triplet margin loss over `[N, D]` embeddings.
///
/// The unreduced result is `[N]`; the reduced result holds one element.
#[derive(Debug, Clone, Copy)]
pub struct TripletMarginLossForwardProblem<'a> {
    anchor: &'a TensorDescriptor,
    positive: &'a TensorDescriptor,
    negative: &'a TensorDescriptor,
    output: &'a TensorDescriptor,
    reduction: Reduction,
    mode: ValidationMode,
}

impl<'a> TripletMarginLossForwardProblem<'a> {
    #[must_use]
    pub fn new(
        anchor: &'a TensorDescriptor,
        positive: &'a TensorDescriptor,
        negative: &'a TensorDescriptor,
        output: &'a TensorDescriptor,
        reduction: Reduction,
        mode: ValidationMode,
    ) -> Self {
        Self {
            anchor,
            positive,
            negative,
            output,
            reduction,
            mode,
        }
    }

    pub fn build(
        anchor: &'a TensorDescriptor,
        positive: &'a TensorDescriptor,
        negative: &'a TensorDescriptor,
        output: &'a TensorDescriptor,
        reduction: Reduction,
        mode: ValidationMode,
    ) -> Result<Self, ValidationError> {
        let problem = Self::new(anchor, positive, negative, output, reduction, mode);
        problem.validate()?;
        Ok(problem)
    }

    #[must_use]
    pub fn anchor(&self) -> &'a TensorDescriptor {
        self.anchor
    }

    #[must_use]
    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.anchor.shape().first().copied().unwrap_or(0)
    }
}

impl ProblemDescription for TripletMarginLossForwardProblem<'_> {
    fn operator(&self) -> OperatorKind {
        OperatorKind::TripletMarginLoss
    }

    fn variant(&self) -> Variant {
        Variant::forward(self.reduction)
    }

    fn mode(&self) -> ValidationMode {
        self.mode
    }

    fn operands(&self) -> Vec<Operand<'_>> {
        vec![
            Operand::new("anchor", self.anchor),
            Operand::new("positive", self.positive),
            Operand::new("negative", self.negative),
            Operand::new("output", self.output),
        ]
    }

    fn shape_constraints(&self) -> Vec<ShapeConstraint<'_>> {
        let anchor = Operand::new("anchor", self.anchor);
        let output = Operand::new("output", self.output);
        vec![
            ShapeConstraint::Rank {
                operand: anchor,
                rank: 2,
            },
            ShapeConstraint::SameShape(anchor, Operand::new("positive", self.positive)),
            ShapeConstraint::SameShape(anchor, Operand::new("negative", self.negative)),
            match self.reduction {
                Reduction::Unreduced => ShapeConstraint::LeadingAxis {
                    result: output,
                    source: anchor,
                },
                Reduction::Reduced => ShapeConstraint::SingleElement(output),
            },
        ]
    }

    fn fingerprint_extra(&self) -> String {
        format!("rows{}", self.rows())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TripletMarginLossBackwardProblem<'a> {
    anchor: &'a TensorDescriptor,
    positive: &'a TensorDescriptor,
    negative: &'a TensorDescriptor,
    output_grad: &'a TensorDescriptor,
    anchor_grad: &'a TensorDescriptor,
    positive_grad: &'a TensorDescriptor,
    negative_grad: &'a TensorDescriptor,
    reduction: Reduction,
    mode: ValidationMode,
}

impl<'a> TripletMarginLossBackwardProblem<'a> {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        anchor: &'a TensorDescriptor,
        positive: &'a TensorDescriptor,
        negative: &'a TensorDescriptor,
        output_grad: &'a TensorDescriptor,
        anchor_grad: &'a TensorDescriptor,
        positive_grad: &'a TensorDescriptor,
        negative_grad: &'a TensorDescriptor,
        reduction: Reduction,
        mode: ValidationMode,
    ) -> Self {
        Self {
            anchor,
            positive,
            negative,
            output_grad,
            anchor_grad,
            positive_grad,
            negative_grad,
            reduction,
            mode,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build(
        anchor: &'a TensorDescriptor,
        positive: &'a TensorDescriptor,
        negative: &'a TensorDescriptor,
        output_grad: &'a TensorDescriptor,
        anchor_grad: &'a TensorDescriptor,
        positive_grad: &'a TensorDescriptor,
        negative_grad: &'a TensorDescriptor,
        reduction: Reduction,
        mode: ValidationMode,
    ) -> Result<Self, ValidationError> {
        let problem = Self::new(
            anchor,
            positive,
            negative,
            output_grad,
            anchor_grad,
            positive_grad,
            negative_grad,
            reduction,
            mode,
        );
        problem.validate()?;
        Ok(problem)
    }

    #[must_use]
    pub fn anchor(&self) -> &'a TensorDescriptor {
        self.anchor
    }

    #[must_use]
    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    #[must_use]
    pub fn rows(&self) -> usize {
        self.anchor.shape().first().copied().unwrap_or(0)
    }
}

impl ProblemDescription for TripletMarginLossBackwardProblem<'_> {
    fn operator(&self) -> OperatorKind {
        OperatorKind::TripletMarginLoss
    }

    fn variant(&self) -> Variant {
        Variant::backward(self.reduction)
    }

    fn mode(&self) -> ValidationMode {
        self.mode
    }

    fn operands(&self) -> Vec<Operand<'_>> {
        vec![
            Operand::new("anchor", self.anchor),
            Operand::new("positive", self.positive),
            Operand::new("negative", self.negative),
            Operand::new("output_grad", self.output_grad),
            Operand::new("anchor_grad", self.anchor_grad),
            Operand::new("positive_grad", self.positive_grad),
            Operand::new("negative_grad", self.negative_grad),
        ]
    }

    fn shape_constraints(&self) -> Vec<ShapeConstraint<'_>> {
        let anchor = Operand::new("anchor", self.anchor);
        let output_grad = Operand::new("output_grad", self.output_grad);
        vec![
            ShapeConstraint::Rank {
                operand: anchor,
                rank: 2,
            },
            ShapeConstraint::SameShape(anchor, Operand::new("positive", self.positive)),
            ShapeConstraint::SameShape(anchor, Operand::new("negative", self.negative)),
            ShapeConstraint::SameShape(anchor, Operand::new("anchor_grad", self.anchor_grad)),
            ShapeConstraint::SameShape(anchor, Operand::new("positive_grad", self.positive_grad)),
            ShapeConstraint::SameShape(anchor, Operand::new("negative_grad", self.negative_grad)),
            match self.reduction {
                Reduction::Unreduced => ShapeConstraint::LeadingAxis {
                    result: output_grad,
                    source: anchor,
                },
                Reduction::Reduced => ShapeConstraint::SingleElement(output_grad),
            },
        ]
    }

    fn fingerprint_extra(&self) -> String {
        format!("rows{}", self.rows())
    }
}
