#![forbid(unsafe_code)]

//! Problem descriptions: the static, device-independent half of a dispatch.
//!
//! A problem borrows the caller's tensor descriptors for one operation
//! variant and answers the questions solvers ask before committing to a plan.
//! Every predicate reports a violation according to the problem's
//! [`ValidationMode`]: as a [`ValidationError`] in `Raise` mode, as `Ok(false)`
//! in `Advisory` mode. Solvers only ever consume the boolean view through
//! [`holds`].

mod bce_logits_loss;
mod rrelu;
mod smooth_l1_loss;
mod triplet_margin_loss;

use std::fmt;

use ft_core::{DType, TensorDescriptor, ValidationMode};

pub use bce_logits_loss::{
    BceLogitsLossBackwardProblem, BceLogitsLossForwardProblem, BceLogitsWeights,
};
pub use rrelu::{RReluBackwardProblem, RReluForwardProblem};
pub use smooth_l1_loss::{SmoothL1LossBackwardProblem, SmoothL1LossForwardProblem};
pub use triplet_margin_loss::{TripletMarginLossBackwardProblem, TripletMarginLossForwardProblem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    SmoothL1Loss,
    TripletMarginLoss,
    BceLogitsLoss,
    RRelu,
}

impl OperatorKind {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::SmoothL1Loss => "smoothl1loss",
            Self::TripletMarginLoss => "tripletmarginloss",
            Self::BceLogitsLoss => "bcelogitsloss",
            Self::RRelu => "rrelu",
        }
    }

    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::SmoothL1Loss => "SmoothL1Loss",
            Self::TripletMarginLoss => "TripletMarginLoss",
            Self::BceLogitsLoss => "BCELogitsLoss",
            Self::RRelu => "RReLU",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reduction {
    Unreduced,
    Reduced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    UnreducedForward,
    ReducedForward,
    UnreducedBackward,
    ReducedBackward,
    Forward,
    Backward,
}

impl Variant {
    #[must_use]
    pub const fn forward(reduction: Reduction) -> Self {
        match reduction {
            Reduction::Unreduced => Self::UnreducedForward,
            Reduction::Reduced => Self::ReducedForward,
        }
    }

    #[must_use]
    pub const fn backward(reduction: Reduction) -> Self {
        match reduction {
            Reduction::Unreduced => Self::UnreducedBackward,
            Reduction::Reduced => Self::ReducedBackward,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::UnreducedForward => "unreduced_fwd",
            Self::ReducedForward => "reduced_fwd",
            Self::UnreducedBackward => "unreduced_bwd",
            Self::ReducedBackward => "reduced_bwd",
            Self::Forward => "fwd",
            Self::Backward => "bwd",
        }
    }

    #[must_use]
    pub const fn is_reduced(self) -> bool {
        matches!(self, Self::ReducedForward | Self::ReducedBackward)
    }
}

/// A borrowed descriptor tagged with the role it plays in the operation.
#[derive(Debug, Clone, Copy)]
pub struct Operand<'a> {
    pub role: &'static str,
    pub desc: &'a TensorDescriptor,
}

impl<'a> Operand<'a> {
    #[must_use]
    pub const fn new(role: &'static str, desc: &'a TensorDescriptor) -> Self {
        Self { role, desc }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ShapeConstraint<'a> {
    /// Identical logical shape; strides may differ.
    SameShape(Operand<'a>, Operand<'a>),
    /// Exactly one element, as required of reduced results.
    SingleElement(Operand<'a>),
    /// Result is `[source.shape[0]]`.
    LeadingAxis {
        result: Operand<'a>,
        source: Operand<'a>,
    },
    Rank {
        operand: Operand<'a>,
        rank: usize,
    },
}

/// Canonical plan-cache key.
///
/// Built from operator, variant, rank, the outcome of every predicate a solver
/// may consult, operand element types and element count. Two problems with
/// equal fingerprints therefore select the same solver and can share a plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Appends an execution-context tag so that plans built under different
    /// contexts never collide.
    #[must_use]
    pub fn scoped(&self, tag: &str) -> Self {
        Self(format!("{};ctx={tag}", self.0))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait ProblemDescription {
    fn operator(&self) -> OperatorKind;

    fn variant(&self) -> Variant;

    fn mode(&self) -> ValidationMode;

    /// All descriptors of the variant; the first one defines the element count.
    fn operands(&self) -> Vec<Operand<'_>>;

    fn shape_constraints(&self) -> Vec<ShapeConstraint<'_>>;

    /// Problem-specific fingerprint fields beyond the shared ones.
    fn fingerprint_extra(&self) -> String {
        String::new()
    }

    /// Operand pairs whose strides must agree for same-stride kernels.
    fn stride_pairs(&self) -> Vec<(Operand<'_>, Operand<'_>)> {
        self.shape_constraints()
            .into_iter()
            .filter_map(|constraint| match constraint {
                ShapeConstraint::SameShape(lhs, rhs) => Some((lhs, rhs)),
                _ => None,
            })
            .collect()
    }

    fn element_count(&self) -> usize {
        self.operands()
            .first()
            .map_or(0, |operand| operand.desc.numel())
    }

    fn max_rank(&self) -> usize {
        self.operands()
            .iter()
            .map(|operand| operand.desc.rank())
            .max()
            .unwrap_or(0)
    }

    fn is_same_type(&self) -> Result<bool, ValidationError> {
        let operands = self.operands();
        let Some((first, rest)) = operands.split_first() else {
            return Ok(true);
        };
        for other in rest {
            if other.desc.dtype() != first.desc.dtype() {
                return report(
                    self.mode(),
                    ValidationError::TypeMismatch {
                        operator: self.operator(),
                        lhs: first.role,
                        lhs_dtype: first.desc.dtype(),
                        rhs: other.role,
                        rhs_dtype: other.desc.dtype(),
                    },
                );
            }
        }
        Ok(true)
    }

    fn is_right_length(&self) -> Result<bool, ValidationError> {
        let operator = self.operator();
        for constraint in self.shape_constraints() {
            let violation = match constraint {
                ShapeConstraint::SameShape(lhs, rhs) => (lhs.desc.shape() != rhs.desc.shape())
                    .then(|| ValidationError::LengthMismatch {
                        operator,
                        lhs: lhs.role,
                        lhs_shape: lhs.desc.shape().to_vec(),
                        rhs: rhs.role,
                        rhs_shape: rhs.desc.shape().to_vec(),
                    }),
                ShapeConstraint::SingleElement(operand) => (operand.desc.numel() != 1).then(|| {
                    ValidationError::NotSingleElement {
                        operator,
                        role: operand.role,
                        shape: operand.desc.shape().to_vec(),
                    }
                }),
                ShapeConstraint::LeadingAxis { result, source } => {
                    let expected = source.desc.shape().first().map(|&rows| vec![rows]);
                    (expected.as_deref() != Some(result.desc.shape())).then(|| {
                        ValidationError::LengthMismatch {
                            operator,
                            lhs: result.role,
                            lhs_shape: result.desc.shape().to_vec(),
                            rhs: source.role,
                            rhs_shape: expected.unwrap_or_default(),
                        }
                    })
                }
                ShapeConstraint::Rank { operand, rank } => {
                    (operand.desc.rank() != rank).then(|| ValidationError::RankMismatch {
                        operator,
                        role: operand.role,
                        expected: rank,
                        actual: operand.desc.rank(),
                    })
                }
            };
            if let Some(error) = violation {
                return report(self.mode(), error);
            }
        }
        Ok(true)
    }

    fn is_same_stride(&self) -> Result<bool, ValidationError> {
        for (lhs, rhs) in self.stride_pairs() {
            if lhs.desc.strides() != rhs.desc.strides() {
                return report(
                    self.mode(),
                    ValidationError::StrideMismatch {
                        operator: self.operator(),
                        lhs: lhs.role,
                        rhs: rhs.role,
                    },
                );
            }
        }
        Ok(true)
    }

    fn is_all_contiguous(&self) -> Result<bool, ValidationError> {
        for operand in self.operands() {
            if !operand.desc.is_contiguous() {
                return report(
                    self.mode(),
                    ValidationError::NonContiguous {
                        operator: self.operator(),
                        role: operand.role,
                    },
                );
            }
        }
        Ok(true)
    }

    fn is_fully_packed(&self) -> Result<bool, ValidationError> {
        for operand in self.operands() {
            if !operand.desc.is_packed() {
                return report(
                    self.mode(),
                    ValidationError::NotPacked {
                        operator: self.operator(),
                        role: operand.role,
                    },
                );
            }
        }
        Ok(true)
    }

    /// Invariants every solver of the operation relies on. In advisory mode
    /// this never fails; an invalid problem then finds no applicable solver.
    fn validate(&self) -> Result<(), ValidationError> {
        self.is_same_type()?;
        self.is_right_length()?;
        Ok(())
    }

    fn fingerprint(&self) -> Fingerprint {
        let mut key = format!(
            "{}_{};rank{}",
            self.operator().label(),
            self.variant().label(),
            self.max_rank()
        );
        for (name, flag) in [
            ("type", holds(self.is_same_type())),
            ("len", holds(self.is_right_length())),
            ("stride", holds(self.is_same_stride())),
            ("contiguous", holds(self.is_all_contiguous())),
            ("packed", holds(self.is_fully_packed())),
        ] {
            key.push_str(&format!(";{name}{}", u8::from(flag)));
        }
        for operand in self.operands() {
            key.push_str(&format!(";{}={}", operand.role, operand.desc.dtype()));
        }
        key.push_str(&format!(";size{}", self.element_count()));
        let extra = self.fingerprint_extra();
        if !extra.is_empty() {
            key.push(';');
            key.push_str(&extra);
        }
        Fingerprint(key)
    }
}

/// Boolean view of a predicate: a raised violation counts as `false`.
#[must_use]
pub fn holds(result: Result<bool, ValidationError>) -> bool {
    matches!(result, Ok(true))
}

fn report(mode: ValidationMode, error: ValidationError) -> Result<bool, ValidationError> {
    match mode {
        ValidationMode::Raise => Err(error),
        ValidationMode::Advisory => Ok(false),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    TypeMismatch {
        operator: OperatorKind,
        lhs: &'static str,
        lhs_dtype: DType,
        rhs: &'static str,
        rhs_dtype: DType,
    },
    LengthMismatch {
        operator: OperatorKind,
        lhs: &'static str,
        lhs_shape: Vec<usize>,
        rhs: &'static str,
        rhs_shape: Vec<usize>,
    },
    NotSingleElement {
        operator: OperatorKind,
        role: &'static str,
        shape: Vec<usize>,
    },
    RankMismatch {
        operator: OperatorKind,
        role: &'static str,
        expected: usize,
        actual: usize,
    },
    StrideMismatch {
        operator: OperatorKind,
        lhs: &'static str,
        rhs: &'static str,
    },
    NonContiguous {
        operator: OperatorKind,
        role: &'static str,
    },
    NotPacked {
        operator: OperatorKind,
        role: &'static str,
    },
}

impl ValidationError {
    #[must_use]
    pub fn operator(&self) -> OperatorKind {
        match self {
            Self::TypeMismatch { operator, .. }
            | Self::LengthMismatch { operator, .. }
            | Self::NotSingleElement { operator, .. }
            | Self::RankMismatch { operator, .. }
            | Self::StrideMismatch { operator, .. }
            | Self::NonContiguous { operator, .. }
            | Self::NotPacked { operator, .. } => *operator,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.operator().display_name();
        match self {
            Self::TypeMismatch {
                lhs,
                lhs_dtype,
                rhs,
                rhs_dtype,
                ..
            } => write!(
                f,
                "{name}: tensor types do not match ({lhs}={lhs_dtype}, {rhs}={rhs_dtype})"
            ),
            Self::LengthMismatch {
                lhs,
                lhs_shape,
                rhs,
                rhs_shape,
                ..
            } => write!(
                f,
                "{name}: tensor sizes do not match ({lhs}={lhs_shape:?}, {rhs}={rhs_shape:?})"
            ),
            Self::NotSingleElement { role, shape, .. } => write!(
                f,
                "{name}: {role} tensor must hold exactly one element, got shape {shape:?}"
            ),
            Self::RankMismatch {
                role,
                expected,
                actual,
                ..
            } => write!(
                f,
                "{name}: {role} tensor must have rank {expected}, got {actual}"
            ),
            Self::StrideMismatch { lhs, rhs, .. } => {
                write!(f, "{name}: tensor strides do not match ({lhs}, {rhs})")
            }
            Self::NonContiguous { role, .. } => {
                write!(f, "{name}: non-contiguous {role} tensor")
            }
            Self::NotPacked { role, .. } => {
                write!(f, "{name}: {role} tensor is not fully packed")
            }
        }
    }
}

impl std::error::Error for ValidationError {}
