use ft_core::{TensorDescriptor, ValidationMode};

use crate::{OperatorKind, Operand, ProblemDescription, ShapeConstraint, ValidationError, Variant};

/// Randomized leaky ReLU, forward direction.
///
/// The per-element slopes are not an operand: they land in a flat noise
/// buffer indexed by the output's flat index, supplied at invocation time.
#[derive(Debug, Clone, Copy)]
pub struct RReluForwardProblem<'a> {
    input: &'a TensorDescriptor,
    output: &'a TensorDescriptor,
    mode: ValidationMode,
}

impl<'a> RReluForwardProblem<'a> {
    #[must_use]
    pub fn new(
        input: &'a TensorDescriptor,
        output: &'a TensorDescriptor,
        mode: ValidationMode,
    ) -> Self {
        Self {
            input,
            output,
            mode,
        }
    }

    pub fn build(
        input: &'a TensorDescriptor,
        output: &'a TensorDescriptor,
        mode: ValidationMode,
    ) -> Result<Self, ValidationError> {
        let problem = Self::new(input, output, mode);
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
}

impl ProblemDescription for RReluForwardProblem<'_> {
    fn operator(&self) -> OperatorKind {
        OperatorKind::RRelu
    }

    fn variant(&self) -> Variant {
        Variant::Forward
    }

    fn mode(&self) -> ValidationMode {
        self.mode
    }

    fn operands(&self) -> Vec<Operand<'_>> {
        vec![
            Operand::new("input", self.input),
            Operand::new("output", self.output),
        ]
    }

    fn shape_constraints(&self) -> Vec<ShapeConstraint<'_>> {
        vec![ShapeConstraint::SameShape(
            Operand::new("input", self.input),
            Operand::new("output", self.output),
        )]
    }
}

/// Randomized leaky ReLU, backward direction: `input_grad = output_grad / noise`
/// with the noise recorded by the forward pass.
#[derive(Debug, Clone, Copy)]
pub struct RReluBackwardProblem<'a> {
    output_grad: &'a TensorDescriptor,
    input_grad: &'a TensorDescriptor,
    mode: ValidationMode,
}

impl<'a> RReluBackwardProblem<'a> {
    #[must_use]
    pub fn new(
        output_grad: &'a TensorDescriptor,
        input_grad: &'a TensorDescriptor,
        mode: ValidationMode,
    ) -> Self {
        Self {
            output_grad,
            input_grad,
            mode,
        }
    }

    pub fn build(
        output_grad: &'a TensorDescriptor,
        input_grad: &'a TensorDescriptor,
        mode: ValidationMode,
    ) -> Result<Self, ValidationError> {
        let problem = Self::new(output_grad, input_grad, mode);
        problem.validate()?;
        Ok(problem)
    }

    #[must_use]
    pub fn output_grad(&self) -> &'a TensorDescriptor {
        self.output_grad
    }

    #[must_use]
    pub fn input_grad(&self) -> &'a TensorDescriptor {
        self.input_grad
    }
}

impl ProblemDescription for RReluBackwardProblem<'_> {
    fn operator(&self) -> OperatorKind {
        OperatorKind::RRelu
    }

    fn variant(&self) -> Variant {
        Variant::Backward
    }

    fn mode(&self) -> ValidationMode {
        self.mode
    }

    fn operands(&self) -> Vec<Operand<'_>> {
        vec![
            Operand::new("output_grad", self.output_grad),
            Operand::new("input_grad", self.input_grad),
        ]
    }

    fn shape_constraints(&self) -> Vec<ShapeConstraint<'_>> {
        vec![ShapeConstraint::SameShape(
            Operand::new("output_grad", self.output_grad),
            Operand::new("input_grad", self.input_grad),
        )]
    }
}

#[cfg(test)]
mod tests {
    use ft_core::{DType, TensorDescriptor, ValidationMode};

    use super::{RReluBackwardProblem, RReluForwardProblem};
    use crate::{ProblemDescription, ValidationError, Variant};

    #[test]
    fn forward_rejects_mismatched_output() {
        let input = TensorDescriptor::from_shape(vec![10], DType::F32);
        let output = TensorDescriptor::from_shape(vec![10], DType::F32);
        let short = TensorDescriptor::from_shape(vec![9], DType::F32);

        let plain = RReluForwardProblem::build(&input, &output, ValidationMode::Raise)
            .expect("matching input and output validate");
        assert_eq!(plain.variant(), Variant::Forward);
        assert!(plain.fingerprint().as_str().starts_with("rrelu_fwd;rank1"));

        let err = RReluForwardProblem::build(&input, &short, ValidationMode::Raise)
            .expect_err("output must match input");
        assert!(matches!(
            err,
            ValidationError::LengthMismatch { rhs: "output", .. }
        ));
    }

    #[test]
    fn backward_counts_elements_of_output_gradient() {
        let grad = TensorDescriptor::from_shape(vec![2, 3, 4], DType::F64);
        let problem = RReluBackwardProblem::build(&grad, &grad, ValidationMode::Raise)
            .expect("identical shapes validate");
        assert_eq!(problem.element_count(), 24);
        assert_eq!(problem.variant(), Variant::Backward);
    }
}
