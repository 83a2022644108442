#![forbid(unsafe_code)]

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    F64,
    F32,
    F16,
    BF16,
}

impl DType {
    #[must_use]
    pub const fn element_size(self) -> usize {
        match self {
            Self::F64 => 8,
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
        }
    }

    /// Short tag used in configuration fingerprints.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::F64 => "f64",
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
        }
    }

    /// Storage type name handed to kernels; bfloat16 travels as raw `ushort`.
    #[must_use]
    pub const fn kernel_type_name(self) -> &'static str {
        match self {
            Self::F64 => "double",
            Self::F32 => "float",
            Self::F16 => "half",
            Self::BF16 => "ushort",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda,
}

/// How problem predicates report a violated invariant.
///
/// `Raise` turns a violation into a structured error, `Advisory` degrades it
/// to a plain `false` so callers can probe configurations cheaply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationMode {
    Raise,
    Advisory,
}

impl ValidationMode {
    /// Debug builds and the `strict-validation` feature raise; release builds
    /// stay advisory.
    #[must_use]
    pub const fn from_build() -> Self {
        if cfg!(any(debug_assertions, feature = "strict-validation")) {
            Self::Raise
        } else {
            Self::Advisory
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Raise => "raise",
            Self::Advisory => "advisory",
        }
    }
}

impl Default for ValidationMode {
    fn default() -> Self {
        Self::from_build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorDescriptor {
    shape: Vec<usize>,
    strides: Vec<usize>,
    dtype: DType,
}

impl TensorDescriptor {
    #[must_use]
    pub fn scalar(dtype: DType) -> Self {
        Self {
            shape: Vec::new(),
            strides: Vec::new(),
            dtype,
        }
    }

    #[must_use]
    pub fn from_shape(shape: Vec<usize>, dtype: DType) -> Self {
        let strides = contiguous_strides(&shape);
        Self {
            shape,
            strides,
            dtype,
        }
    }

    pub fn from_shape_and_strides(
        shape: Vec<usize>,
        strides: Vec<usize>,
        dtype: DType,
    ) -> Result<Self, DescriptorError> {
        let desc = Self {
            shape,
            strides,
            dtype,
        };
        desc.validate()?;
        Ok(desc)
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.shape.len() != self.strides.len() {
            return Err(DescriptorError::RankStrideMismatch {
                rank: self.shape.len(),
                strides: self.strides.len(),
            });
        }
        self.storage_span().map(|_| ())
    }

    /// Declares a value broadcast: every size-1 axis that must grow to the
    /// target extent gets stride 0. Missing leading axes are added the same way.
    pub fn broadcast_to(&self, target: &[usize]) -> Result<Self, DescriptorError> {
        if target.len() < self.shape.len() {
            return Err(DescriptorError::BroadcastMismatch {
                shape: self.shape.clone(),
                target: target.to_vec(),
            });
        }

        let lead = target.len() - self.shape.len();
        let mut strides = vec![0usize; target.len()];
        for (axis, &extent) in target.iter().enumerate().skip(lead) {
            let size = self.shape[axis - lead];
            let stride = self.strides[axis - lead];
            strides[axis] = if size == extent {
                stride
            } else if size == 1 {
                0
            } else {
                return Err(DescriptorError::BroadcastMismatch {
                    shape: self.shape.clone(),
                    target: target.to_vec(),
                });
            };
        }

        Ok(Self {
            shape: target.to_vec(),
            strides,
            dtype: self.dtype,
        })
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().copied().product()
    }

    /// Number of storage elements the descriptor can touch: the largest
    /// reachable offset plus one, or zero for an empty tensor.
    pub fn storage_span(&self) -> Result<usize, DescriptorError> {
        if self.shape.contains(&0) {
            return Ok(0);
        }

        let mut max_linear_offset = 0usize;
        for (size, stride) in self.shape.iter().copied().zip(self.strides.iter().copied()) {
            let span = stride
                .checked_mul(size - 1)
                .ok_or(DescriptorError::StrideOverflow { size, stride })?;
            max_linear_offset = max_linear_offset
                .checked_add(span)
                .ok_or(DescriptorError::SpanOverflow { max_linear_offset })?;
        }
        max_linear_offset
            .checked_add(1)
            .ok_or(DescriptorError::SpanOverflow { max_linear_offset })
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        if self.shape.len() != self.strides.len() {
            return false;
        }

        let mut expected_stride = 1usize;
        for (size, stride) in self
            .shape
            .iter()
            .copied()
            .zip(self.strides.iter().copied())
            .rev()
        {
            // Singleton dimensions are contiguous regardless of stride.
            if size == 1 {
                continue;
            }
            if stride != expected_stride {
                return false;
            }
            let Some(next_expected) = expected_stride.checked_mul(size) else {
                return false;
            };
            expected_stride = next_expected;
        }
        true
    }

    /// Dense in some axis order: sorted by stride, each stride equals the
    /// previous stride times its extent, starting from 1.
    #[must_use]
    pub fn is_packed(&self) -> bool {
        if self.shape.len() != self.strides.len() {
            return false;
        }

        let mut axes: Vec<(usize, usize)> = self
            .strides
            .iter()
            .copied()
            .zip(self.shape.iter().copied())
            .filter(|&(_, size)| size != 1)
            .collect();
        axes.sort_unstable();

        let mut expected_stride = 1usize;
        for (stride, size) in axes {
            if stride != expected_stride {
                return false;
            }
            let Some(next_expected) = expected_stride.checked_mul(size) else {
                return false;
            };
            expected_stride = next_expected;
        }
        true
    }

    /// Layout class used by fingerprints and kernel build flags.
    #[must_use]
    pub fn layout_class(&self) -> LayoutClass {
        if self.is_contiguous() {
            LayoutClass::Contiguous
        } else if self.is_packed() {
            LayoutClass::Packed
        } else {
            LayoutClass::Strided
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutClass {
    Contiguous,
    Packed,
    Strided,
}

impl LayoutClass {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Contiguous => "contiguous",
            Self::Packed => "packed",
            Self::Strided => "strided",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    RankStrideMismatch {
        rank: usize,
        strides: usize,
    },
    StrideOverflow {
        size: usize,
        stride: usize,
    },
    SpanOverflow {
        max_linear_offset: usize,
    },
    BroadcastMismatch {
        shape: Vec<usize>,
        target: Vec<usize>,
    },
}

impl fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankStrideMismatch { rank, strides } => {
                write!(f, "shape rank {rank} does not match strides rank {strides}")
            }
            Self::StrideOverflow { size, stride } => {
                write!(f, "stride overflow for size={size}, stride={stride}")
            }
            Self::SpanOverflow { max_linear_offset } => {
                write!(
                    f,
                    "storage span overflow past max_linear_offset={max_linear_offset}"
                )
            }
            Self::BroadcastMismatch { shape, target } => {
                write!(f, "cannot broadcast shape {shape:?} to {target:?}")
            }
        }
    }
}

impl std::error::Error for DescriptorError {}

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }

    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for idx in (0..shape.len()).rev() {
        strides[idx] = running;
        running = running.saturating_mul(shape[idx]);
    }
    strides
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        DType, DescriptorError, LayoutClass, TensorDescriptor, ValidationMode, contiguous_strides,
    };

    #[test]
    fn scalar_descriptor_is_valid() {
        let desc = TensorDescriptor::scalar(DType::F32);
        assert!(desc.validate().is_ok());
        assert_eq!(desc.rank(), 0);
        assert_eq!(desc.numel(), 1);
        assert!(desc.is_contiguous());
        assert!(desc.is_packed());
        assert_eq!(desc.storage_span(), Ok(1));
    }

    #[test]
    fn shape_builds_contiguous_strides() {
        let desc = TensorDescriptor::from_shape(vec![2, 3, 4], DType::F64);
        assert_eq!(desc.strides(), &[12, 4, 1]);
        assert_eq!(desc.numel(), 24);
        assert!(desc.is_contiguous());
        assert_eq!(desc.layout_class(), LayoutClass::Contiguous);
    }

    #[test]
    fn rank_stride_mismatch_fails_closed() {
        let err = TensorDescriptor::from_shape_and_strides(vec![2, 3], vec![1], DType::F32)
            .expect_err("rank/stride mismatch must fail");
        assert_eq!(
            err,
            DescriptorError::RankStrideMismatch {
                rank: 2,
                strides: 1
            }
        );
    }

    #[test]
    fn transposed_layout_is_packed_but_not_contiguous() {
        let desc = TensorDescriptor::from_shape_and_strides(vec![4, 3], vec![1, 4], DType::F32)
            .expect("transposed layout should validate");
        assert!(!desc.is_contiguous());
        assert!(desc.is_packed());
        assert_eq!(desc.layout_class(), LayoutClass::Packed);
    }

    #[test]
    fn padded_rows_are_neither_packed_nor_contiguous() {
        let desc = TensorDescriptor::from_shape_and_strides(vec![4, 3], vec![8, 1], DType::F32)
            .expect("padded layout should validate");
        assert!(!desc.is_contiguous());
        assert!(!desc.is_packed());
        assert_eq!(desc.layout_class(), LayoutClass::Strided);
        assert_eq!(desc.storage_span(), Ok(27));
    }

    #[test]
    fn singleton_dim_stride_variation_is_still_contiguous() {
        let desc = TensorDescriptor::from_shape_and_strides(
            vec![2, 1, 4],
            vec![4, 99, 1],
            DType::F64,
        )
        .expect("interior singleton stride should validate");
        assert!(desc.is_contiguous());
    }

    #[test]
    fn broadcast_to_uses_zero_strides() {
        let column = TensorDescriptor::from_shape(vec![4, 1], DType::F32);
        let expanded = column
            .broadcast_to(&[4, 3])
            .expect("size-1 axis should broadcast");
        assert_eq!(expanded.shape(), &[4, 3]);
        assert_eq!(expanded.strides(), &[1, 0]);
        assert!(!expanded.is_packed());

        let lifted = TensorDescriptor::from_shape(vec![3], DType::F32)
            .broadcast_to(&[2, 3])
            .expect("leading axis should be added");
        assert_eq!(lifted.strides(), &[0, 1]);
    }

    #[test]
    fn broadcast_to_rejects_incompatible_extent() {
        let desc = TensorDescriptor::from_shape(vec![4, 2], DType::F32);
        let err = desc
            .broadcast_to(&[4, 3])
            .expect_err("extent 2 cannot grow to 3");
        assert!(matches!(err, DescriptorError::BroadcastMismatch { .. }));
    }

    #[test]
    fn empty_tensor_has_zero_span() {
        let desc = TensorDescriptor::from_shape(vec![0, 3], DType::F32);
        assert_eq!(desc.numel(), 0);
        assert_eq!(desc.storage_span(), Ok(0));
    }

    #[test]
    fn stride_overflow_is_reported() {
        let err = TensorDescriptor::from_shape_and_strides(vec![3], vec![usize::MAX], DType::F32)
            .expect_err("span must overflow");
        assert!(matches!(err, DescriptorError::StrideOverflow { .. }));
    }

    #[test]
    fn validation_mode_follows_build_profile() {
        let expected = if cfg!(any(debug_assertions, feature = "strict-validation")) {
            ValidationMode::Raise
        } else {
            ValidationMode::Advisory
        };
        assert_eq!(ValidationMode::from_build(), expected);
        assert_eq!(ValidationMode::default(), expected);
    }

    #[test]
    fn dtype_sizes_and_kernel_names() {
        assert_eq!(DType::F64.element_size(), 8);
        assert_eq!(DType::BF16.element_size(), 2);
        assert_eq!(DType::BF16.kernel_type_name(), "ushort");
        assert_eq!(DType::F32.to_string(), "f32");
    }

    proptest! {
        #[test]
        fn prop_contiguous_descriptors_are_packed(shape in prop::collection::vec(1usize..=5, 0..=5)) {
            let desc = TensorDescriptor::from_shape(shape.clone(), DType::F32);
            prop_assert!(desc.is_contiguous());
            prop_assert!(desc.is_packed());
            prop_assert_eq!(desc.storage_span(), Ok(desc.numel()));
            prop_assert_eq!(contiguous_strides(&shape), desc.strides().to_vec());
        }

        #[test]
        fn prop_reversed_strides_stay_packed(shape in prop::collection::vec(2usize..=4, 2..=4)) {
            let reversed: Vec<usize> = shape.iter().rev().copied().collect();
            let mut strides = contiguous_strides(&reversed);
            strides.reverse();
            let desc = TensorDescriptor::from_shape_and_strides(shape, strides, DType::F64)
                .expect("reversed layout should validate");
            prop_assert!(desc.is_packed());
            prop_assert!(!desc.is_contiguous());
        }
    }
}
