use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;

use ft_core::{DType, Device};
use ft_kernel_cpu::{
    KernelError, LossWeights, StridedSlice, StridedSliceMut, TripletMarginParams, XorwowState,
    bce_logits_loss_reduced_backward, bce_logits_loss_reduced_forward, names, reduce_sum,
    rrelu_backward, rrelu_forward, smooth_l1_loss_backward_contiguous,
    smooth_l1_loss_forward_contiguous, smooth_l1_loss_reduced_backward,
    smooth_l1_loss_reduced_forward, smooth_l1_loss_unreduced_backward,
    smooth_l1_loss_unreduced_forward, triplet_margin_loss_backward,
    triplet_margin_loss_reduced_forward, triplet_margin_loss_unreduced_forward,
};
use ft_view::TensorView5;

use crate::{BufferId, DeviceError, DeviceRuntime, KernelArg, KernelInfo};

/// Size of one xorwow state on the device: six 32-bit words.
const STATE_BYTES: usize = 24;

#[derive(Debug)]
enum Storage {
    Values { dtype: DType, data: RefCell<Vec<f64>> },
    States(Vec<XorwowState>),
}

impl Storage {
    fn bytes(&self) -> usize {
        match self {
            Self::Values { dtype, data } => data.borrow().len() * dtype.element_size(),
            Self::States(states) => states.len() * STATE_BYTES,
        }
    }
}

/// Host device: buffers live in process memory and kernels run on the
/// calling thread (fanning out over rayon) before `run` returns.
///
/// Values are held as `f64` whatever the declared element type; the type
/// only sizes the allocation.
#[derive(Debug, Default)]
pub struct CpuDevice {
    buffers: HashMap<BufferId, Storage>,
    next_id: u64,
    used_bytes: usize,
    memory_limit: Option<usize>,
    launches: Vec<String>,
    in_flight: usize,
}

impl CpuDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocations beyond `bytes` in total fail with
    /// [`DeviceError::OutOfMemory`].
    #[must_use]
    pub fn with_memory_limit(bytes: usize) -> Self {
        Self {
            memory_limit: Some(bytes),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    /// Kernel names in launch order.
    #[must_use]
    pub fn launches(&self) -> &[String] {
        &self.launches
    }

    /// Launches not yet synchronized.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    fn reserve(&mut self, bytes: usize) -> Result<(), DeviceError> {
        if let Some(limit) = self.memory_limit {
            let available = limit.saturating_sub(self.used_bytes);
            if bytes > available {
                return Err(DeviceError::OutOfMemory {
                    requested: bytes,
                    available,
                });
            }
        }
        self.used_bytes += bytes;
        Ok(())
    }

    fn insert(&mut self, storage: Storage) -> BufferId {
        let id = BufferId::new(self.next_id);
        self.next_id += 1;
        self.buffers.insert(id, storage);
        id
    }

    fn cell(&self, id: BufferId) -> Result<&RefCell<Vec<f64>>, DeviceError> {
        match self.buffers.get(&id) {
            Some(Storage::Values { data, .. }) => Ok(data),
            Some(Storage::States(_)) | None => Err(DeviceError::UnknownBuffer(id)),
        }
    }

    fn states(&self, id: BufferId) -> Result<&[XorwowState], DeviceError> {
        match self.buffers.get(&id) {
            Some(Storage::States(states)) => Ok(states),
            Some(Storage::Values { .. }) | None => Err(DeviceError::UnknownBuffer(id)),
        }
    }

    fn execute(&self, kernel: &KernelInfo, args: &[KernelArg]) -> Result<(), DeviceError> {
        let args = Args {
            device: self,
            kernel: &kernel.kernel_name,
            args,
        };
        match kernel.kernel_name.as_str() {
            names::SMOOTH_L1_LOSS_UNREDUCED_FORWARD_CONTIGUOUS => {
                let input = args.values(0)?;
                let target = args.values(1)?;
                let mut output = args.values_mut(2)?;
                smooth_l1_loss_forward_contiguous(
                    &input,
                    &target,
                    &mut output,
                    args.count(3)?,
                    args.scalar(4)?,
                )
                .map_err(|source| args.failed(source))
            }
            names::SMOOTH_L1_LOSS_UNREDUCED_FORWARD_5D => {
                let input = args.values(0)?;
                let target = args.values(2)?;
                let mut output = args.values_mut(4)?;
                let mut output = args.strided_mut("output", &mut output, 5)?;
                smooth_l1_loss_unreduced_forward(
                    args.strided("input", &input, 1)?,
                    args.strided("target", &target, 3)?,
                    &mut output,
                    args.scalar(6)?,
                )
                .map_err(|source| args.failed(source))
            }
            names::SMOOTH_L1_LOSS_REDUCED_FORWARD_5D => {
                let input = args.values(0)?;
                let target = args.values(2)?;
                let mut workspace = args.values_mut(4)?;
                smooth_l1_loss_reduced_forward(
                    args.strided("input", &input, 1)?,
                    args.strided("target", &target, 3)?,
                    &mut workspace,
                    args.scalar(5)?,
                    args.scalar(6)?,
                )
                .map_err(|source| args.failed(source))
            }
            names::REDUCE_SUM => {
                let partials = args.values(0)?;
                let mut output = args.values_mut(2)?;
                let mut output = args.strided_mut("output", &mut output, 3)?;
                reduce_sum(&partials, args.count(1)?, &mut output)
                    .map_err(|source| args.failed(source))
            }
            names::SMOOTH_L1_LOSS_UNREDUCED_BACKWARD_CONTIGUOUS => {
                let input = args.values(0)?;
                let target = args.values(1)?;
                let output_grad = args.values(2)?;
                let mut input_grad = args.optional_values_mut(3)?;
                let mut target_grad = args.optional_values_mut(4)?;
                smooth_l1_loss_backward_contiguous(
                    &input,
                    &target,
                    &output_grad,
                    input_grad.as_deref_mut().map(Vec::as_mut_slice),
                    target_grad.as_deref_mut().map(Vec::as_mut_slice),
                    args.count(5)?,
                    args.scalar(6)?,
                )
                .map_err(|source| args.failed(source))
            }
            names::SMOOTH_L1_LOSS_UNREDUCED_BACKWARD_5D
            | names::SMOOTH_L1_LOSS_REDUCED_BACKWARD_5D => {
                let input = args.values(0)?;
                let target = args.values(2)?;
                let output_grad = args.values(4)?;
                let mut input_grad = args.optional_values_mut(6)?;
                let mut target_grad = args.optional_values_mut(8)?;
                let mut input_grad = args.optional_strided_mut("input_grad", &mut input_grad, 7)?;
                let mut target_grad =
                    args.optional_strided_mut("target_grad", &mut target_grad, 9)?;
                let input = args.strided("input", &input, 1)?;
                let target = args.strided("target", &target, 3)?;
                let output_grad = args.strided("output_grad", &output_grad, 5)?;
                let beta = args.scalar(10)?;
                let result = if kernel.kernel_name == names::SMOOTH_L1_LOSS_REDUCED_BACKWARD_5D {
                    smooth_l1_loss_reduced_backward(
                        input,
                        target,
                        output_grad,
                        input_grad.as_mut(),
                        target_grad.as_mut(),
                        beta,
                        args.scalar(11)?,
                    )
                } else {
                    smooth_l1_loss_unreduced_backward(
                        input,
                        target,
                        output_grad,
                        input_grad.as_mut(),
                        target_grad.as_mut(),
                        beta,
                    )
                };
                result.map_err(|source| args.failed(source))
            }
            names::TRIPLET_MARGIN_LOSS_UNREDUCED_FORWARD_2D => {
                let anchor = args.values(0)?;
                let positive = args.values(2)?;
                let negative = args.values(4)?;
                let mut output = args.values_mut(6)?;
                let mut output = args.strided_mut("output", &mut output, 7)?;
                triplet_margin_loss_unreduced_forward(
                    args.strided("anchor", &anchor, 1)?,
                    args.strided("positive", &positive, 3)?,
                    args.strided("negative", &negative, 5)?,
                    &mut output,
                    &args.triplet_params(8)?,
                )
                .map_err(|source| args.failed(source))
            }
            names::TRIPLET_MARGIN_LOSS_REDUCED_FORWARD_2D => {
                let anchor = args.values(0)?;
                let positive = args.values(2)?;
                let negative = args.values(4)?;
                let mut workspace = args.values_mut(6)?;
                triplet_margin_loss_reduced_forward(
                    args.strided("anchor", &anchor, 1)?,
                    args.strided("positive", &positive, 3)?,
                    args.strided("negative", &negative, 5)?,
                    &mut workspace,
                    &args.triplet_params(7)?,
                    args.scalar(11)?,
                )
                .map_err(|source| args.failed(source))
            }
            names::TRIPLET_MARGIN_LOSS_UNREDUCED_BACKWARD_2D
            | names::TRIPLET_MARGIN_LOSS_REDUCED_BACKWARD_2D => {
                let anchor = args.values(0)?;
                let positive = args.values(2)?;
                let negative = args.values(4)?;
                let output_grad = args.values(6)?;
                let mut anchor_grad = args.optional_values_mut(8)?;
                let mut positive_grad = args.optional_values_mut(10)?;
                let mut negative_grad = args.optional_values_mut(12)?;
                let mut anchor_grad =
                    args.optional_strided_mut("anchor_grad", &mut anchor_grad, 9)?;
                let mut positive_grad =
                    args.optional_strided_mut("positive_grad", &mut positive_grad, 11)?;
                let mut negative_grad =
                    args.optional_strided_mut("negative_grad", &mut negative_grad, 13)?;
                let divisor = if kernel.kernel_name == names::TRIPLET_MARGIN_LOSS_REDUCED_BACKWARD_2D
                {
                    Some(args.scalar(18)?)
                } else {
                    None
                };
                triplet_margin_loss_backward(
                    args.strided("anchor", &anchor, 1)?,
                    args.strided("positive", &positive, 3)?,
                    args.strided("negative", &negative, 5)?,
                    args.strided("output_grad", &output_grad, 7)?,
                    anchor_grad.as_mut(),
                    positive_grad.as_mut(),
                    negative_grad.as_mut(),
                    &args.triplet_params(14)?,
                    divisor,
                )
                .map_err(|source| args.failed(source))
            }
            names::BCE_LOGITS_LOSS_REDUCED_FORWARD_5D => {
                let input = args.values(0)?;
                let target = args.values(2)?;
                let weight = args.optional_values(4)?;
                let pos_weight = args.optional_values(6)?;
                let mut workspace = args.values_mut(8)?;
                let weights = args.loss_weights(weight.as_deref(), pos_weight.as_deref(), 5)?;
                bce_logits_loss_reduced_forward(
                    args.strided("input", &input, 1)?,
                    args.strided("target", &target, 3)?,
                    weights,
                    &mut workspace,
                    args.scalar(9)?,
                )
                .map_err(|source| args.failed(source))
            }
            names::BCE_LOGITS_LOSS_REDUCED_BACKWARD_5D => {
                let input = args.values(0)?;
                let target = args.values(2)?;
                let weight = args.optional_values(4)?;
                let pos_weight = args.optional_values(6)?;
                let output_grad = args.values(8)?;
                let mut input_grad = args.optional_values_mut(10)?;
                let mut target_grad = args.optional_values_mut(12)?;
                let mut input_grad =
                    args.optional_strided_mut("input_grad", &mut input_grad, 11)?;
                let mut target_grad =
                    args.optional_strided_mut("target_grad", &mut target_grad, 13)?;
                let weights = args.loss_weights(weight.as_deref(), pos_weight.as_deref(), 5)?;
                bce_logits_loss_reduced_backward(
                    args.strided("input", &input, 1)?,
                    args.strided("target", &target, 3)?,
                    weights,
                    args.strided("output_grad", &output_grad, 9)?,
                    input_grad.as_mut(),
                    target_grad.as_mut(),
                    args.scalar(14)?,
                )
                .map_err(|source| args.failed(source))
            }
            names::RRELU_FORWARD_5D => {
                let states = self.states(args.buffer(0)?)?;
                let input = args.values(1)?;
                let mut output = args.values_mut(3)?;
                let mut noise = args.values_mut(5)?;
                let mut output = args.strided_mut("output", &mut output, 4)?;
                rrelu_forward(
                    args.strided("input", &input, 2)?,
                    &mut output,
                    &mut noise,
                    states,
                    kernel.work_items(),
                    args.scalar(6)?,
                    args.scalar(7)?,
                )
                .map_err(|source| args.failed(source))
            }
            names::RRELU_BACKWARD_5D => {
                let noise = args.values(0)?;
                let output_grad = args.values(1)?;
                let mut input_grad = args.values_mut(3)?;
                let mut input_grad = args.strided_mut("input_grad", &mut input_grad, 4)?;
                rrelu_backward(
                    args.strided("output_grad", &output_grad, 2)?,
                    &noise,
                    &mut input_grad,
                )
                .map_err(|source| args.failed(source))
            }
            other => Err(DeviceError::UnknownKernel {
                name: other.to_string(),
            }),
        }
    }
}

/// Positional view of one launch's arguments.
struct Args<'a> {
    device: &'a CpuDevice,
    kernel: &'a str,
    args: &'a [KernelArg],
}

impl<'a> Args<'a> {
    fn bad(&self, index: usize, expected: &'static str) -> DeviceError {
        DeviceError::BadArgument {
            kernel: self.kernel.to_string(),
            index,
            expected,
        }
    }

    fn failed(&self, source: KernelError) -> DeviceError {
        DeviceError::Kernel {
            kernel: self.kernel.to_string(),
            source,
        }
    }

    fn buffer(&self, index: usize) -> Result<BufferId, DeviceError> {
        match self.args.get(index) {
            Some(KernelArg::Buffer(id)) => Ok(*id),
            _ => Err(self.bad(index, "buffer")),
        }
    }

    fn optional_buffer(&self, index: usize) -> Result<Option<BufferId>, DeviceError> {
        match self.args.get(index) {
            Some(KernelArg::Buffer(id)) => Ok(Some(*id)),
            Some(KernelArg::Null) => Ok(None),
            _ => Err(self.bad(index, "buffer or null")),
        }
    }

    fn view(&self, index: usize) -> Result<TensorView5, DeviceError> {
        match self.args.get(index) {
            Some(KernelArg::View(view)) => Ok(*view),
            _ => Err(self.bad(index, "tensor view")),
        }
    }

    fn scalar(&self, index: usize) -> Result<f64, DeviceError> {
        match self.args.get(index) {
            Some(KernelArg::Scalar(value)) => Ok(*value),
            _ => Err(self.bad(index, "scalar")),
        }
    }

    fn count(&self, index: usize) -> Result<usize, DeviceError> {
        match self.args.get(index) {
            Some(KernelArg::Count(value)) => {
                usize::try_from(*value).map_err(|_| self.bad(index, "count within usize"))
            }
            _ => Err(self.bad(index, "count")),
        }
    }

    fn flag(&self, index: usize) -> Result<bool, DeviceError> {
        match self.args.get(index) {
            Some(KernelArg::Flag(value)) => Ok(*value),
            _ => Err(self.bad(index, "flag")),
        }
    }

    /// `margin, p, eps, swap` starting at `index`.
    fn triplet_params(&self, index: usize) -> Result<TripletMarginParams, DeviceError> {
        Ok(TripletMarginParams {
            margin: self.scalar(index)?,
            p: self.scalar(index + 1)?,
            eps: self.scalar(index + 2)?,
            swap: self.flag(index + 3)?,
        })
    }

    fn values(&self, index: usize) -> Result<Ref<'a, Vec<f64>>, DeviceError> {
        let id = self.buffer(index)?;
        self.device
            .cell(id)?
            .try_borrow()
            .map_err(|_| DeviceError::Aliased { buffer: id })
    }

    fn values_mut(&self, index: usize) -> Result<RefMut<'a, Vec<f64>>, DeviceError> {
        let id = self.buffer(index)?;
        self.device
            .cell(id)?
            .try_borrow_mut()
            .map_err(|_| DeviceError::Aliased { buffer: id })
    }

    fn optional_values(&self, index: usize) -> Result<Option<Ref<'a, Vec<f64>>>, DeviceError> {
        match self.optional_buffer(index)? {
            Some(_) => self.values(index).map(Some),
            None => Ok(None),
        }
    }

    fn optional_values_mut(
        &self,
        index: usize,
    ) -> Result<Option<RefMut<'a, Vec<f64>>>, DeviceError> {
        match self.optional_buffer(index)? {
            Some(_) => self.values_mut(index).map(Some),
            None => Ok(None),
        }
    }

    fn strided<'b>(
        &self,
        side: &'static str,
        data: &'b [f64],
        view_index: usize,
    ) -> Result<StridedSlice<'b>, DeviceError> {
        StridedSlice::new(side, data, self.view(view_index)?).map_err(|source| self.failed(source))
    }

    fn strided_mut<'b>(
        &self,
        side: &'static str,
        data: &'b mut [f64],
        view_index: usize,
    ) -> Result<StridedSliceMut<'b>, DeviceError> {
        StridedSliceMut::new(side, data, self.view(view_index)?)
            .map_err(|source| self.failed(source))
    }

    /// `weight` viewed at `view_index`, `pos_weight` two slots later.
    fn loss_weights<'b>(
        &self,
        weight: Option<&'b Vec<f64>>,
        pos_weight: Option<&'b Vec<f64>>,
        view_index: usize,
    ) -> Result<LossWeights<'b>, DeviceError> {
        Ok(LossWeights {
            weight: weight
                .map(|data| self.strided("weight", data, view_index))
                .transpose()?,
            pos_weight: pos_weight
                .map(|data| self.strided("pos_weight", data, view_index + 2))
                .transpose()?,
        })
    }

    fn optional_strided_mut<'b>(
        &self,
        side: &'static str,
        data: &'b mut Option<RefMut<'a, Vec<f64>>>,
        view_index: usize,
    ) -> Result<Option<StridedSliceMut<'b>>, DeviceError> {
        match data {
            Some(data) => self.strided_mut(side, data, view_index).map(Some),
            None => Ok(None),
        }
    }
}

impl DeviceRuntime for CpuDevice {
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn allocate(&mut self, dtype: DType, len: usize) -> Result<BufferId, DeviceError> {
        let bytes = len.saturating_mul(dtype.element_size());
        self.reserve(bytes)?;
        Ok(self.insert(Storage::Values {
            dtype,
            data: RefCell::new(vec![0.0; len]),
        }))
    }

    fn release(&mut self, id: BufferId) -> Result<(), DeviceError> {
        let storage = self
            .buffers
            .remove(&id)
            .ok_or(DeviceError::UnknownBuffer(id))?;
        self.used_bytes = self.used_bytes.saturating_sub(storage.bytes());
        Ok(())
    }

    fn write(&mut self, id: BufferId, values: &[f64]) -> Result<(), DeviceError> {
        let cell = self.cell(id)?;
        let mut data = cell
            .try_borrow_mut()
            .map_err(|_| DeviceError::Aliased { buffer: id })?;
        if data.len() != values.len() {
            return Err(DeviceError::SizeMismatch {
                buffer: id,
                expected: data.len(),
                actual: values.len(),
            });
        }
        data.copy_from_slice(values);
        Ok(())
    }

    fn read(&self, id: BufferId) -> Result<Vec<f64>, DeviceError> {
        let cell = self.cell(id)?;
        let data = cell
            .try_borrow()
            .map_err(|_| DeviceError::Aliased { buffer: id })?;
        Ok(data.clone())
    }

    fn buffer_len(&self, id: BufferId) -> Result<usize, DeviceError> {
        let cell = self.cell(id)?;
        let data = cell
            .try_borrow()
            .map_err(|_| DeviceError::Aliased { buffer: id })?;
        Ok(data.len())
    }

    fn buffer_bytes(&self, id: BufferId) -> Result<usize, DeviceError> {
        match self.buffers.get(&id) {
            Some(storage @ Storage::Values { .. }) => Ok(storage.bytes()),
            Some(Storage::States(_)) | None => Err(DeviceError::UnknownBuffer(id)),
        }
    }

    fn upload_states(&mut self, states: &[XorwowState]) -> Result<BufferId, DeviceError> {
        self.reserve(states.len().saturating_mul(STATE_BYTES))?;
        Ok(self.insert(Storage::States(states.to_vec())))
    }

    fn state_count(&self, id: BufferId) -> Result<usize, DeviceError> {
        self.states(id).map(<[XorwowState]>::len)
    }

    fn run(&mut self, kernel: &KernelInfo, args: &[KernelArg]) -> Result<(), DeviceError> {
        self.execute(kernel, args)?;
        self.launches.push(kernel.kernel_name.clone());
        self.in_flight += 1;
        Ok(())
    }

    fn synchronize(&mut self) -> Result<(), DeviceError> {
        self.in_flight = 0;
        Ok(())
    }
}
