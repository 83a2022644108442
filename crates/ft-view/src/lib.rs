#![forbid(unsafe_code)]

//! Fixed-rank strided views.
//!
//! Kernels address every operand through a [`StridedView`] of a single,
//! compile-time rank. A descriptor of lower rank is canonicalized once, in
//! [`StridedView::from_descriptor`], by right-aligning its axes into the last
//! slots and padding the leading slots with extent 1. Padded slots never
//! contribute to an offset, so flat-index decomposition is unchanged.

use std::fmt;

use ft_core::TensorDescriptor;

/// Highest rank the kernels are generated for.
pub const MAX_RANK: usize = 5;

pub type TensorView5 = StridedView<MAX_RANK>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StridedView<const N: usize> {
    size: [usize; N],
    stride: [usize; N],
    base: usize,
}

impl<const N: usize> StridedView<N> {
    #[must_use]
    pub const fn from_parts(size: [usize; N], stride: [usize; N]) -> Self {
        Self {
            size,
            stride,
            base: 0,
        }
    }

    /// Canonicalizes a descriptor into rank `N`.
    ///
    /// Real axes occupy slots `N - rank..N`. A padded slot has extent 1 and
    /// borrows the stride of the first real axis (1 for a rank-0 descriptor).
    pub fn from_descriptor(desc: &TensorDescriptor) -> Result<Self, ViewError> {
        let rank = desc.rank();
        if rank > N {
            return Err(ViewError::RankTooLarge { rank, max: N });
        }
        if desc.strides().len() != rank {
            return Err(ViewError::RankStrideMismatch {
                rank,
                strides: desc.strides().len(),
            });
        }

        let pad = N - rank;
        let pad_stride = desc.strides().first().copied().unwrap_or(1);
        let mut size = [1usize; N];
        let mut stride = [pad_stride; N];
        size[pad..].copy_from_slice(desc.shape());
        stride[pad..].copy_from_slice(desc.strides());
        Ok(Self::from_parts(size, stride))
    }

    #[must_use]
    pub fn sizes(&self) -> &[usize; N] {
        &self.size
    }

    #[must_use]
    pub fn strides(&self) -> &[usize; N] {
        &self.stride
    }

    /// Storage offset of the logical origin; non-zero only after slicing
    /// with a positive start.
    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.size.iter().product()
    }

    /// No bounds checking: callers keep `coordinate[axis] < size[axis]`.
    #[must_use]
    pub fn coordinate_to_offset(&self, coordinate: &[usize; N]) -> usize {
        coordinate
            .iter()
            .zip(self.stride.iter())
            .fold(self.base, |offset, (&idx, &stride)| offset + idx * stride)
    }

    /// Row-major decomposition: the last axis varies fastest.
    #[must_use]
    pub fn flat_to_coordinate(&self, flat_index: usize) -> [usize; N] {
        let mut coordinate = [0usize; N];
        let mut rest = flat_index;
        for axis in (0..N).rev() {
            let size = self.size[axis];
            if size == 0 {
                continue;
            }
            coordinate[axis] = rest % size;
            rest /= size;
        }
        coordinate
    }

    #[must_use]
    pub fn flat_to_offset(&self, flat_index: usize) -> usize {
        self.coordinate_to_offset(&self.flat_to_coordinate(flat_index))
    }

    /// Narrows one axis to `start..min(end, size)` taking every `step`-th
    /// element.
    pub fn slice(
        &self,
        axis: usize,
        start: usize,
        end: usize,
        step: usize,
    ) -> Result<Self, ViewError> {
        if axis >= N {
            return Err(ViewError::AxisOutOfRange { axis, rank: N });
        }
        if step == 0 {
            return Err(ViewError::ZeroStep { axis });
        }

        let end = end.min(self.size[axis]);
        let len = end
            .checked_sub(start)
            .ok_or(ViewError::NegativeSliceLength { axis, start, end })?;

        let mut out = *self;
        out.size[axis] = len.div_ceil(step);
        out.stride[axis] = self.stride[axis] * step;
        if out.size[axis] > 0 {
            out.base = self.base + start * self.stride[axis];
        }
        Ok(out)
    }

    /// Axis `i` of the result is axis `ordering[i]` of `self`.
    pub fn permute(&self, ordering: &[usize]) -> Result<Self, ViewError> {
        if ordering.len() != N {
            return Err(ViewError::PermutationLength {
                expected: N,
                actual: ordering.len(),
            });
        }

        let mut seen = [false; N];
        for &axis in ordering {
            if axis >= N {
                return Err(ViewError::AxisOutOfRange { axis, rank: N });
            }
            if seen[axis] {
                return Err(ViewError::DuplicateAxis { axis });
            }
            seen[axis] = true;
        }

        let mut out = *self;
        for (slot, &axis) in ordering.iter().enumerate() {
            out.size[slot] = self.size[axis];
            out.stride[slot] = self.stride[axis];
        }
        Ok(out)
    }
}

#[must_use]
pub fn inverse_permutation(ordering: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0usize; ordering.len()];
    for (slot, &axis) in ordering.iter().enumerate() {
        if let Some(entry) = inverse.get_mut(axis) {
            *entry = slot;
        }
    }
    inverse
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewError {
    RankTooLarge { rank: usize, max: usize },
    RankStrideMismatch { rank: usize, strides: usize },
    AxisOutOfRange { axis: usize, rank: usize },
    ZeroStep { axis: usize },
    NegativeSliceLength { axis: usize, start: usize, end: usize },
    PermutationLength { expected: usize, actual: usize },
    DuplicateAxis { axis: usize },
}

impl fmt::Display for ViewError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankTooLarge { rank, max } => {
                write!(f, "tensor view: rank {rank} exceeds maximum rank {max}")
            }
            Self::RankStrideMismatch { rank, strides } => {
                write!(f, "tensor view: rank {rank} does not match {strides} strides")
            }
            Self::AxisOutOfRange { axis, rank } => {
                write!(f, "tensor view: axis {axis} out of range for rank {rank}")
            }
            Self::ZeroStep { axis } => write!(f, "tensor view: zero slice step on axis {axis}"),
            Self::NegativeSliceLength { axis, start, end } => write!(
                f,
                "tensor view: slice on axis {axis} has negative length (start={start}, end={end})"
            ),
            Self::PermutationLength { expected, actual } => write!(
                f,
                "tensor view permute: permutation size must be {expected}, got {actual}"
            ),
            Self::DuplicateAxis { axis } => {
                write!(f, "tensor view permute: permutation value {axis} duplicate")
            }
        }
    }
}

impl std::error::Error for ViewError {}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use ft_core::{DType, TensorDescriptor, contiguous_strides};
    use proptest::prelude::*;

    use super::{MAX_RANK, StridedView, TensorView5, ViewError, inverse_permutation};

    fn view_of(shape: &[usize], strides: &[usize]) -> TensorView5 {
        let desc =
            TensorDescriptor::from_shape_and_strides(shape.to_vec(), strides.to_vec(), DType::F32)
                .expect("test descriptor should validate");
        TensorView5::from_descriptor(&desc).expect("rank fits")
    }

    #[test]
    fn lower_rank_descriptor_is_right_aligned() {
        let view = view_of(&[4, 3], &[3, 1]);
        assert_eq!(view.sizes(), &[1, 1, 1, 4, 3]);
        assert_eq!(view.strides(), &[3, 3, 3, 3, 1]);
        assert_eq!(view.numel(), 12);
    }

    #[test]
    fn scalar_descriptor_pads_every_slot() {
        let view = TensorView5::from_descriptor(&TensorDescriptor::scalar(DType::F64))
            .expect("scalar fits");
        assert_eq!(view.sizes(), &[1; MAX_RANK]);
        assert_eq!(view.strides(), &[1; MAX_RANK]);
        assert_eq!(view.flat_to_offset(0), 0);
    }

    #[test]
    fn rank_six_is_rejected() {
        let desc = TensorDescriptor::from_shape(vec![1, 2, 1, 2, 1, 2], DType::F32);
        let err = TensorView5::from_descriptor(&desc).expect_err("rank 6 exceeds 5");
        assert_eq!(err, ViewError::RankTooLarge { rank: 6, max: 5 });
    }

    #[test]
    fn flat_index_walks_strided_storage() {
        // Rows padded to 8 elements.
        let view = view_of(&[2, 3], &[8, 1]);
        let offsets: Vec<usize> = (0..6).map(|i| view.flat_to_offset(i)).collect();
        assert_eq!(offsets, vec![0, 1, 2, 8, 9, 10]);
    }

    #[test]
    fn broadcast_axis_aliases_on_purpose() {
        let desc = TensorDescriptor::from_shape(vec![4, 1], DType::F32)
            .broadcast_to(&[4, 3])
            .expect("broadcast should succeed");
        let view = TensorView5::from_descriptor(&desc).expect("rank fits");
        assert_eq!(view.flat_to_offset(0), view.flat_to_offset(2));
        assert_eq!(view.flat_to_offset(3), 1);
    }

    #[test]
    fn full_slice_is_identity() {
        let view = view_of(&[4, 3], &[3, 1]);
        for axis in 0..MAX_RANK {
            let sliced = view
                .slice(axis, 0, view.sizes()[axis], 1)
                .expect("full slice is valid");
            assert_eq!(sliced, view);
        }
    }

    #[test]
    fn stepped_slice_rounds_up_and_scales_stride() {
        let view = view_of(&[10], &[1]);
        let sliced = view.slice(4, 1, 8, 3).expect("slice is valid");
        assert_eq!(sliced.sizes()[4], 3);
        assert_eq!(sliced.strides()[4], 3);
        let offsets: Vec<usize> = (0..3).map(|i| sliced.flat_to_offset(i)).collect();
        assert_eq!(offsets, vec![1, 4, 7]);
    }

    #[test]
    fn slice_clamps_end_to_extent() {
        let view = view_of(&[5], &[1]);
        let sliced = view.slice(4, 2, 100, 1).expect("end is clamped");
        assert_eq!(sliced.sizes()[4], 3);
    }

    #[test]
    fn slice_rejects_negative_length_and_zero_step() {
        let view = view_of(&[5], &[1]);
        assert_eq!(
            view.slice(4, 4, 2, 1),
            Err(ViewError::NegativeSliceLength {
                axis: 4,
                start: 4,
                end: 2
            })
        );
        assert_eq!(view.slice(4, 0, 5, 0), Err(ViewError::ZeroStep { axis: 4 }));
        assert!(matches!(
            view.slice(5, 0, 1, 1),
            Err(ViewError::AxisOutOfRange { axis: 5, .. })
        ));
    }

    #[test]
    fn axis_error_displays_for_rank_zero() {
        let err = ViewError::AxisOutOfRange { axis: 0, rank: 0 };
        assert_eq!(
            err.to_string(),
            "tensor view: axis 0 out of range for rank 0"
        );
    }

    #[test]
    fn permute_rejects_non_bijections() {
        let view = view_of(&[2, 3], &[3, 1]);
        assert_eq!(
            view.permute(&[0, 1, 2, 3]),
            Err(ViewError::PermutationLength {
                expected: 5,
                actual: 4
            })
        );
        assert!(matches!(
            view.permute(&[0, 1, 2, 3, 7]),
            Err(ViewError::AxisOutOfRange { axis: 7, .. })
        ));
        assert_eq!(
            view.permute(&[0, 1, 2, 3, 3]),
            Err(ViewError::DuplicateAxis { axis: 3 })
        );
    }

    #[test]
    fn permute_swaps_last_two_axes() {
        let view = view_of(&[2, 3], &[3, 1]);
        let transposed = view.permute(&[0, 1, 2, 4, 3]).expect("valid permutation");
        assert_eq!(transposed.sizes(), &[1, 1, 1, 3, 2]);
        assert_eq!(transposed.strides(), &[3, 3, 3, 1, 3]);
        assert_eq!(transposed.flat_to_offset(1), 3);
    }

    #[test]
    fn from_parts_view_round_trips_coordinates() {
        let view = StridedView::<3>::from_parts([2, 2, 2], [4, 2, 1]);
        assert_eq!(view.flat_to_coordinate(5), [1, 0, 1]);
        assert_eq!(view.coordinate_to_offset(&[1, 0, 1]), 5);
    }

    fn shape_strategy() -> impl Strategy<Value = Vec<usize>> {
        prop::collection::vec(1usize..=4, 0..=MAX_RANK)
    }

    proptest! {
        #[test]
        fn prop_packed_views_enumerate_distinct_offsets(shape in shape_strategy()) {
            let desc = TensorDescriptor::from_shape(shape.clone(), DType::F32);
            let view = TensorView5::from_descriptor(&desc).expect("rank fits");
            let numel = desc.numel();

            let offsets: BTreeSet<usize> = (0..numel).map(|i| view.flat_to_offset(i)).collect();
            prop_assert_eq!(offsets.len(), numel);
            prop_assert_eq!(offsets.iter().next_back().copied(), numel.checked_sub(1));

            // Contiguous layout maps the flat index onto itself.
            for i in 0..numel {
                prop_assert_eq!(view.flat_to_offset(i), i);
            }
        }

        #[test]
        fn prop_unit_steps_reproduce_declared_strides(shape in prop::collection::vec(2usize..=4, 1..=MAX_RANK)) {
            let strides = contiguous_strides(&shape);
            let view = view_of(&shape, &strides);
            let pad = MAX_RANK - shape.len();
            for (axis, &stride) in strides.iter().enumerate() {
                let mut coordinate = [0usize; MAX_RANK];
                coordinate[pad + axis] = 1;
                prop_assert_eq!(view.coordinate_to_offset(&coordinate), stride);
            }
        }

        #[test]
        fn prop_flat_coordinate_round_trip(shape in shape_strategy(), seed in any::<u64>()) {
            let desc = TensorDescriptor::from_shape(shape, DType::F32);
            let view = TensorView5::from_descriptor(&desc).expect("rank fits");
            let flat = usize::try_from(seed % desc.numel() as u64).expect("fits usize");
            let coordinate = view.flat_to_coordinate(flat);
            for (axis, &idx) in coordinate.iter().enumerate() {
                prop_assert!(idx < view.sizes()[axis]);
            }
            prop_assert_eq!(view.coordinate_to_offset(&coordinate), flat);
        }

        #[test]
        fn prop_permute_then_inverse_is_identity(
            shape in shape_strategy(),
            ordering in Just((0..MAX_RANK).collect::<Vec<_>>()).prop_shuffle(),
        ) {
            let desc = TensorDescriptor::from_shape(shape, DType::F64);
            let view = TensorView5::from_descriptor(&desc).expect("rank fits");
            let permuted = view.permute(&ordering).expect("shuffle is a bijection");
            let restored = permuted
                .permute(&inverse_permutation(&ordering))
                .expect("inverse is a bijection");
            prop_assert_eq!(restored, view);
        }

        #[test]
        fn prop_full_slice_is_identity(shape in shape_strategy(), axis in 0usize..MAX_RANK) {
            let desc = TensorDescriptor::from_shape(shape, DType::F32);
            let view = TensorView5::from_descriptor(&desc).expect("rank fits");
            let sliced = view.slice(axis, 0, view.sizes()[axis], 1).expect("full slice");
            prop_assert_eq!(sliced, view);
        }
    }
}
