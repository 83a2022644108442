use ft_core::{TensorDescriptor, ValidationMode};

use crate::{
    OperatorKind, Operand, ProblemDescription, Reduction, ShapeConstraint, ValidationError,
    Variant,
};

#[derive(Debug, Clone, Copy)]
pub struct SmoothL1LossForwardProblem<'a> {
    input: &'a TensorDescriptor,
    target: &'a TensorDescriptor,
    output: &'a TensorDescriptor,
    reduction: Reduction,
    mode: ValidationMode,
}

impl<'a> SmoothL1LossForwardProblem<'a> {
    #[must_use]
    pub fn new(
        input: &'a TensorDescriptor,
        target: &'a TensorDescriptor,
        output: &'a TensorDescriptor,
        reduction: Reduction,
        mode: ValidationMode,
    ) -> Self {
        Self {
            input,
            target,
            output,
            reduction,
            mode,
        }
    }

    pub fn build(
        input: &'a TensorDescriptor,
        target: &'a TensorDescriptor,
        output: &'a TensorDescriptor,
        reduction: Reduction,
        mode: ValidationMode,
    ) -> Result<Self, ValidationError> {
        let problem = Self::new(input, target, output, reduction, mode);
        problem.validate()?;
        Ok(problem)
    }

    #[must_use]
    pub fn input(&self) -> &'a TensorDescriptor {
        self.input
    }

    #[must_use]
    pub fn target(&self) -> &'a TensorDescriptor {
        self.target
    }

    #[must_use]
    pub fn output(&self) -> &'a TensorDescriptor {
        self.output
    }

    #[must_use]
    pub fn reduction(&self) -> Reduction {
        self.reduction
    }
}

impl ProblemDescription for SmoothL1LossForwardProblem<'_> {
    fn operator(&self) -> OperatorKind {
        OperatorKind::SmoothL1Loss
    }

    fn variant(&self) -> Variant {
        Variant::forward(self.reduction)
    }

    fn mode(&self) -> ValidationMode {
        self.mode
    }

    fn operands(&self) -> Vec<Operand<'_>> {
        vec![
            Operand::new("input", self.input),
            Operand::new("target", self.target),
            Operand::new("output", self.output),
        ]
    }

    fn shape_constraints(&self) -> Vec<ShapeConstraint<'_>> {
        let input = Operand::new("input", self.input);
        let output = Operand::new("output", self.output);
        let mut constraints = vec![ShapeConstraint::SameShape(
            input,
            Operand::new("target", self.target),
        )];
        constraints.push(match self.reduction {
            Reduction::Unreduced => ShapeConstraint::SameShape(input, output),
            Reduction::Reduced => ShapeConstraint::SingleElement(output),
        });
        constraints
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SmoothL1LossBackwardProblem<'a> {
    input: &'a TensorDescriptor,
    target: &'a TensorDescriptor,
    output_grad: &'a TensorDescriptor,
    input_grad: &'a TensorDescriptor,
    target_grad: &'a TensorDescriptor,
    reduction: Reduction,
    mode: ValidationMode,
}

impl<'a> SmoothL1LossBackwardProblem<'a> {
    #[must_use]
    pub fn new(
        input: &'a TensorDescriptor,
        target: &'a TensorDescriptor,
        output_grad: &'a TensorDescriptor,
        input_grad: &'a TensorDescriptor,
        target_grad: &'a TensorDescriptor,
        reduction: Reduction,
        mode: ValidationMode,
    ) -> Self {
        Self {
            input,
            target,
            output_grad,
            input_grad,
            target_grad,
            reduction,
            mode,
        }
    }

    pub fn build(
        input: &'a TensorDescriptor,
        target: &'a TensorDescriptor,
        output_grad: &'a TensorDescriptor,
        input_grad: &'a TensorDescriptor,
        target_grad: &'a TensorDescriptor,
        reduction: Reduction,
        mode: ValidationMode,
    ) -> Result<Self, ValidationError> {
        let problem = Self::new(
            input,
            target,
            output_grad,
            input_grad,
            target_grad,
            reduction,
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

    #[must_use]
    pub fn reduction(&self) -> Reduction {
        self.reduction
    }
}

impl ProblemDescription for SmoothL1LossBackwardProblem<'_> {
    fn operator(&self) -> OperatorKind {
        OperatorKind::SmoothL1Loss
    }

    fn variant(&self) -> Variant {
        Variant::backward(self.reduction)
    }

    fn mode(&self) -> ValidationMode {
        self.mode
    }

    fn operands(&self) -> Vec<Operand<'_>> {
        vec![
            Operand::new("input", self.input),
            Operand::new("target", self.target),
            Operand::new("output_grad", self.output_grad),
            Operand::new("input_grad", self.input_grad),
            Operand::new("target_grad", self.target_grad),
        ]
    }

    fn shape_constraints(&self) -> Vec<ShapeConstraint<'_>> {
        let input = Operand::new("input", self.input);
        let target = Operand::new("target", self.target);
        let output_grad = Operand::new("output_grad", self.output_grad);
        vec![
            ShapeConstraint::SameShape(input, target),
            ShapeConstraint::SameShape(input, Operand::new("input_grad", self.input_grad)),
            ShapeConstraint::SameShape(target, Operand::new("target_grad", self.target_grad)),
            match self.reduction {
                Reduction::Unreduced => ShapeConstraint::SameShape(input, output_grad),
                Reduction::Reduced => ShapeConstraint::SingleElement(output_grad),
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use ft_core::{DType, TensorDescriptor, ValidationMode};

    use super::SmoothL1LossBackwardProblem;
    use crate::{ProblemDescription, Reduction, ValidationError, Variant};

    #[test]
    fn backward_requires_gradients_to_match_their_sources() {
        let input = TensorDescriptor::from_shape(vec![2, 5], DType::F64);
        let target = TensorDescriptor::from_shape(vec![2, 5], DType::F64);
        let output_grad = TensorDescriptor::from_shape(vec![1], DType::F64);
        let short_grad = TensorDescriptor::from_shape(vec![2, 4], DType::F64);

        let problem = SmoothL1LossBackwardProblem::build(
            &input,
            &target,
            &output_grad,
            &input,
            &short_grad,
            Reduction::Reduced,
            ValidationMode::Raise,
        );
        assert!(matches!(
            problem,
            Err(ValidationError::LengthMismatch {
                lhs: "target",
                rhs: "target_grad",
                ..
            })
        ));

        let ok = SmoothL1LossBackwardProblem::build(
            &input,
            &target,
            &output_grad,
            &input,
            &target,
            Reduction::Reduced,
            ValidationMode::Raise,
        )
        .expect("matching gradients should validate");
        assert_eq!(ok.variant(), Variant::ReducedBackward);
        assert_eq!(ok.element_count(), 10);
    }
}
