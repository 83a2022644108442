use ft_core::{TensorDescriptor, ValidationMode};

use crate::{
    OperatorKind, Operand, ProblemDescription, Reduction, ShapeConstraint, ValidationError,
    Variant,
};

/// Element weights that scale the loss. Either may be absent; a present one
/// must have the input's shape, possibly as a declared broadcast.
#[derive(Debug, Clone, Copy, Default)]
pub struct BceLogitsWeights<'a> {
    pub weight: Option<&'a TensorDescriptor>,
    pub pos_weight: Option<&'a TensorDescriptor>,
}

impl<'a> BceLogitsWeights<'a> {
    fn operands(&self) -> impl Iterator<Item = Operand<'a>> + use<'a> {
        let weight = self.weight.map(|desc| Operand::new("weight", desc));
        let pos_weight = self.pos_weight.map(|desc| Operand::new("pos_weight", desc));
        weight.into_iter().chain(pos_weight)
    }

    fn fingerprint_flags(&self) -> String {
        format!(
            "weight{};pos_weight{}",
            u8::from(self.weight.is_some()),
            u8::from(self.pos_weight.is_some())
        )
    }
}

/// Forward of the mean or sum binary cross-entropy on logits. Only the
/// reduced variant exists; the result is a single element.
#[derive(Debug, Clone, Copy)]
pub struct BceLogitsLossForwardProblem<'a> {
    input: &'a TensorDescriptor,
    target: &'a TensorDescriptor,
    weights: BceLogitsWeights<'a>,
    output: &'a TensorDescriptor,
    mode: ValidationMode,
}

impl<'a> BceLogitsLossForwardProblem<'a> {
    #[must_use]
    pub fn new(
        input: &'a TensorDescriptor,
        target: &'a TensorDescriptor,
        weights: BceLogitsWeights<'a>,
        output: &'a TensorDescriptor,
        mode: ValidationMode,
    ) -> Self {
        Self {
            input,
            target,
            weights,
            output,
            mode,
        }
    }

    pub fn build(
        input: &'a TensorDescriptor,
        target: &'a TensorDescriptor,
        weights: BceLogitsWeights<'a>,
        output: &'a TensorDescriptor,
        mode: ValidationMode,
    ) -> Result<Self, ValidationError> {
        let problem = Self::new(input, target, weights, output, mode);
        problem.validate()?;
        Ok(problem)
    }

    #[must_use]
    pub fn input(&self) -> &'a TensorDescriptor {
        self.input
    }

    #[must_use]
    pub fn output(&self) -> &'a TensorDescriptor {
        self.output
    }

    #[must_use]
    pub fn weights(&self) -> BceLogitsWeights<'a> {
        self.weights
    }
}

impl ProblemDescription for BceLogitsLossForwardProblem<'_> {
    fn operator(&self) -> OperatorKind {
        OperatorKind::BceLogitsLoss
    }

    fn variant(&self) -> Variant {
        Variant::forward(Reduction::Reduced)
    }

    fn mode(&self) -> ValidationMode {
        self.mode
    }

    fn operands(&self) -> Vec<Operand<'_>> {
        let mut operands = vec![
            Operand::new("input", self.input),
            Operand::new("target", self.target),
        ];
        operands.extend(self.weights.operands());
        operands.push(Operand::new("output", self.output));
        operands
    }

    fn shape_constraints(&self) -> Vec<ShapeConstraint<'_>> {
        let input = Operand::new("input", self.input);
        let mut constraints = vec![ShapeConstraint::SameShape(
            input,
            Operand::new("target", self.target),
        )];
        constraints.extend(
            self.weights
                .operands()
                .map(|weight| ShapeConstraint::SameShape(input, weight)),
        );
        constraints.push(ShapeConstraint::SingleElement(Operand::new(
            "output",
            self.output,
        )));
        constraints
    }

    fn fingerprint_extra(&self) -> String {
        self.weights.fingerprint_flags()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BceLogitsLossBackwardProblem<'a> {
    input: &'a TensorDescriptor,
    target: &'a TensorDescriptor,
    weights: BceLogitsWeights<'a>,
    output_grad: &'a TensorDescriptor,
    input_grad: &'a TensorDescriptor,
    target_grad: &'a TensorDescriptor,
    mode: ValidationMode,
}

impl<'a> BceLogitsLossBackwardProblem<'a> {
    #[must_use]
    pub fn new(
        input: &'a TensorDescriptor,
        target: &'a TensorDescriptor,
        weights: BceLogitsWeights<'a>,
        output_grad: &'a TensorDescriptor,
        input_grad: &'a TensorDescriptor,
        target_grad: &'a TensorDescriptor,
        mode: ValidationMode,
    ) -> Self {
        Self {
            input,
            target,
            weights,
            output_grad,
            input_grad,
            target_grad,
            mode,
        }
    }

    pub fn build(
        input: &'a TensorDescriptor,
        target: &'a TensorDescriptor,
        weights: BceLogitsWeights<'a>,
        output_grad: &'a TensorDescriptor,
        input_grad: &'a TensorDescriptor,
        target_grad: &'a TensorDescriptor,
        mode: ValidationMode,
    ) -> Result<Self, ValidationError> {
        let problem = Self::new(
            input,
            target,
            weights,
            output_grad,
            input_grad,
            target_grad,
            mode,
        );
        problem.validate()?;
        Ok(problem)
    }

    #[must_use]
    pub fn input(&self) -> &'a TensorDescriptor {
        self.input
    }

    #[must_use]
    pub fn input_grad(&self) -> &'a TensorDescriptor {
        self.input_grad
    }

    #[must_use]
    pub fn output_grad(&self) -> &'a TensorDescriptor {
        self.output_grad
    }
}

impl ProblemDescription for BceLogitsLossBackwardProblem<'_> {
    fn operator(&self) -> OperatorKind {
        OperatorKind::BceLogitsLoss
    }

    fn variant(&self) -> Variant {
        Variant::backward(Reduction::Reduced)
    }

    fn mode(&self) -> ValidationMode {
        self.mode
    }

    fn operands(&self) -> Vec<Operand<'_>> {
        let mut operands = vec![
            Operand::new("input", self.input),
            Operand::new("target", self.target),
        ];
        operands.extend(self.weights.operands());
        operands.extend([
            Operand::new("output_grad", self.output_grad),
            Operand::new("input_grad", self.input_grad),
            Operand::new("target_grad", self.target_grad),
        ]);
        operands
    }

    fn shape_constraints(&self) -> Vec<ShapeConstraint<'_>> {
        let input = Operand::new("input", self.input);
        let target = Operand::new("target", self.target);
        let mut constraints = vec![ShapeConstraint::SameShape(input, target)];
        constraints.extend(
            self.weights
                .operands()
                .map(|weight| ShapeConstraint::SameShape(input, weight)),
        );
        constraints.extend([
            ShapeConstraint::SameShape(input, Operand::new("input_grad", self.input_grad)),
            ShapeConstraint::SameShape(target, Operand::new("target_grad", self.target_grad)),
            ShapeConstraint::SingleElement(Operand::new("output_grad", self.output_grad)),
        ]);
        constraints
    }

    fn fingerprint_extra(&self) -> String {
        self.weights.fingerprint_flags()
    }
}

#[cfg(test)]
mod tests {
    use ft_core::{DType, TensorDescriptor, ValidationMode};

    use super::{BceLogitsLossBackwardProblem, BceLogitsLossForwardProblem, BceLogitsWeights};
    use crate::{ProblemDescription, ValidationError, Variant};

    #[test]
    fn forward_requires_a_single_element_result() {
        let input = TensorDescriptor::from_shape(vec![2, 3], DType::F32);
        let output = TensorDescriptor::from_shape(vec![2], DType::F32);
        let err = BceLogitsLossForwardProblem::build(
            &input,
            &input,
            BceLogitsWeights::default(),
            &output,
            ValidationMode::Raise,
        )
        .expect_err("two-element output");
        assert!(matches!(
            err,
            ValidationError::NotSingleElement { role: "output", .. }
        ));
    }

    #[test]
    fn present_weights_join_type_and_shape_checks() {
        let input = TensorDescriptor::from_shape(vec![2, 3], DType::F32);
        let scalar = TensorDescriptor::from_shape(vec![1], DType::F32);
        let half = TensorDescriptor::from_shape(vec![2, 3], DType::F16);
        let column = TensorDescriptor::from_shape(vec![3], DType::F32);

        let err = BceLogitsLossForwardProblem::build(
            &input,
            &input,
            BceLogitsWeights {
                weight: Some(&half),
                pos_weight: None,
            },
            &scalar,
            ValidationMode::Raise,
        )
        .expect_err("weight type differs");
        assert!(matches!(
            err,
            ValidationError::TypeMismatch { rhs: "weight", .. }
        ));

        let err = BceLogitsLossForwardProblem::build(
            &input,
            &input,
            BceLogitsWeights {
                weight: None,
                pos_weight: Some(&column),
            },
            &scalar,
            ValidationMode::Raise,
        )
        .expect_err("pos_weight must be declared against the input shape");
        assert!(matches!(
            err,
            ValidationError::LengthMismatch {
                rhs: "pos_weight",
                ..
            }
        ));

        let broadcast = column.broadcast_to(&[2, 3]).expect("broadcast");
        let ok = BceLogitsLossForwardProblem::build(
            &input,
            &input,
            BceLogitsWeights {
                weight: None,
                pos_weight: Some(&broadcast),
            },
            &scalar,
            ValidationMode::Raise,
        )
        .expect("declared broadcast validates");
        assert_eq!(ok.variant(), Variant::ReducedForward);
    }

    #[test]
    fn weight_presence_changes_the_fingerprint() {
        let input = TensorDescriptor::from_shape(vec![4], DType::F32);
        let scalar = TensorDescriptor::from_shape(vec![1], DType::F32);
        let bare = BceLogitsLossForwardProblem::new(
            &input,
            &input,
            BceLogitsWeights::default(),
            &scalar,
            ValidationMode::Raise,
        );
        let weighted = BceLogitsLossForwardProblem::new(
            &input,
            &input,
            BceLogitsWeights {
                weight: Some(&input),
                pos_weight: None,
            },
            &scalar,
            ValidationMode::Raise,
        );
        assert_ne!(bare.fingerprint(), weighted.fingerprint());
        assert!(bare.fingerprint().as_str().starts_with("bcelogitsloss_reduced_fwd"));
    }

    #[test]
    fn backward_checks_gradients_and_output_grad() {
        let input = TensorDescriptor::from_shape(vec![3, 2], DType::F64);
        let scalar = TensorDescriptor::from_shape(vec![1], DType::F64);
        let wide = TensorDescriptor::from_shape(vec![3, 3], DType::F64);

        let err = BceLogitsLossBackwardProblem::build(
            &input,
            &input,
            BceLogitsWeights::default(),
            &scalar,
            &wide,
            &input,
            ValidationMode::Raise,
        )
        .expect_err("input_grad shape differs");
        assert!(matches!(
            err,
            ValidationError::LengthMismatch {
                rhs: "input_grad",
                ..
            }
        ));

        let advisory = BceLogitsLossBackwardProblem::new(
            &input,
            &input,
            BceLogitsWeights::default(),
            &input,
            &input,
            &input,
            ValidationMode::Advisory,
        );
        assert_eq!(advisory.is_right_length(), Ok(false));
        assert_eq!(advisory.element_count(), 6);
    }
}
