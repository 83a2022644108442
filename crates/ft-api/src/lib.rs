#![forbid(unsafe_code)]

use std::fmt;

use ft_core::Device;
use ft_device::{BufferId, DeviceRuntime};
use ft_dispatch::{
    BCE_LOGITS_LOSS_BACKWARD, BCE_LOGITS_LOSS_FORWARD, BceLogitsLossBackwardArgs,
    BceLogitsLossForwardArgs, InvokeParams, RRELU_BACKWARD, RRELU_FORWARD, RReluBackwardArgs,
    RReluForwardArgs, SMOOTH_L1_LOSS_BACKWARD, SMOOTH_L1_LOSS_FORWARD, SmoothL1LossBackwardArgs,
    SmoothL1LossForwardArgs, TRIPLET_MARGIN_LOSS_BACKWARD, TRIPLET_MARGIN_LOSS_FORWARD, TensorArg,
    TripletMarginLossBackwardArgs, TripletMarginLossForwardArgs,
};
use ft_problem::{
    BceLogitsLossBackwardProblem, BceLogitsLossForwardProblem, RReluBackwardProblem,
    RReluForwardProblem, SmoothL1LossBackwardProblem, SmoothL1LossForwardProblem,
    TripletMarginLossBackwardProblem, TripletMarginLossForwardProblem,
};
use ft_runtime::RuntimeContext;

pub use ft_core::{DType, TensorDescriptor, ValidationMode};
pub use ft_device::{CpuDevice, DeviceError};
pub use ft_dispatch::{CacheStats, DispatchError, ExecutionReport, WorkspaceSize};
pub use ft_kernel_cpu::TripletMarginParams;
pub use ft_problem::{BceLogitsWeights, Reduction};
pub use ft_runtime::{ConfigError, EvidenceEntry, EvidenceKind, RuntimeConfig};

/// A device buffer together with the descriptor it is addressed through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tensor {
    desc: TensorDescriptor,
    buffer: BufferId,
}

impl Tensor {
    #[must_use]
    pub fn desc(&self) -> &TensorDescriptor {
        &self.desc
    }

    #[must_use]
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    fn arg(&self) -> TensorArg<'_> {
        TensorArg::new(self.buffer, &self.desc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothL1LossOptions {
    pub reduction: Reduction,
    pub beta: f64,
    pub divisor: f64,
}

impl Default for SmoothL1LossOptions {
    fn default() -> Self {
        Self {
            reduction: Reduction::Unreduced,
            beta: 1.0,
            divisor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripletMarginLossOptions {
    pub reduction: Reduction,
    pub params: TripletMarginParams,
    pub divisor: f64,
}

impl Default for TripletMarginLossOptions {
    fn default() -> Self {
        Self {
            reduction: Reduction::Unreduced,
            params: TripletMarginParams::default(),
            divisor: 1.0,
        }
    }
}

/// Optional weights and the reduction divisor of a BCELogitsLoss call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BceLogitsLossOptions<'a> {
    pub weight: Option<&'a Tensor>,
    pub pos_weight: Option<&'a Tensor>,
    pub divisor: f64,
}

impl<'a> BceLogitsLossOptions<'a> {
    fn weights(&self) -> BceLogitsWeights<'a> {
        BceLogitsWeights {
            weight: self.weight.map(Tensor::desc),
            pos_weight: self.pos_weight.map(Tensor::desc),
        }
    }
}

impl Default for BceLogitsLossOptions<'_> {
    fn default() -> Self {
        Self {
            weight: None,
            pos_weight: None,
            divisor: 1.0,
        }
    }
}

/// Slopes recorded by an RReLU forward call, consumed by its backward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RReluNoise {
    buffer: BufferId,
    len: usize,
}

impl RReluNoise {
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Host session: a CPU device, its execution context and the uploaded
/// generator pool.
#[derive(Debug)]
pub struct Session {
    device: CpuDevice,
    runtime: RuntimeContext,
    states: BufferId,
}

impl Session {
    pub fn new(config: RuntimeConfig) -> Result<Self, SessionError> {
        Self::with_device(config, CpuDevice::new())
    }

    /// Session configured from the `FT_*` environment variables.
    pub fn from_env() -> Result<Self, SessionError> {
        Self::new(RuntimeConfig::from_env()?)
    }

    pub fn with_device(config: RuntimeConfig, mut device: CpuDevice) -> Result<Self, SessionError> {
        let states = device.upload_states(&config.generator_pool())?;
        let runtime = RuntimeContext::new(config, Device::Cpu);
        Ok(Self {
            device,
            runtime,
            states,
        })
    }

    #[must_use]
    pub fn validation(&self) -> ValidationMode {
        self.runtime.validation()
    }

    pub fn set_validation(&mut self, mode: ValidationMode) {
        self.runtime.set_validation(mode);
    }

    #[must_use]
    pub fn device(&self) -> &CpuDevice {
        &self.device
    }

    #[must_use]
    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.runtime.plan_cache().stats()
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.runtime.ledger().entries()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.runtime.ledger().len()
    }

    /// Uploads `values` as the storage behind `desc`.
    pub fn tensor(&mut self, desc: TensorDescriptor, values: &[f64]) -> Result<Tensor, SessionError> {
        let buffer = self.device.upload(desc.dtype(), values)?;
        Ok(Tensor { desc, buffer })
    }

    pub fn zeros(&mut self, desc: TensorDescriptor) -> Result<Tensor, SessionError> {
        let buffer = self.device.allocate(desc.dtype(), desc.numel())?;
        Ok(Tensor { desc, buffer })
    }

    pub fn read(&self, tensor: &Tensor) -> Result<Vec<f64>, SessionError> {
        Ok(self.device.read(tensor.buffer)?)
    }

    pub fn read_noise(&self, noise: &RReluNoise) -> Result<Vec<f64>, SessionError> {
        Ok(self.device.read(noise.buffer)?)
    }

    pub fn release(&mut self, tensor: Tensor) -> Result<(), SessionError> {
        Ok(self.device.release(tensor.buffer)?)
    }

    pub fn release_noise(&mut self, noise: RReluNoise) -> Result<(), SessionError> {
        Ok(self.device.release(noise.buffer)?)
    }

    pub fn smooth_l1_loss_forward_workspace_size(
        &mut self,
        input: &TensorDescriptor,
        target: &TensorDescriptor,
        output: &TensorDescriptor,
        reduction: Reduction,
    ) -> WorkspaceSize {
        let problem =
            SmoothL1LossForwardProblem::new(input, target, output, reduction, self.validation());
        self.runtime
            .workspace_size(&SMOOTH_L1_LOSS_FORWARD, &problem)
    }

    pub fn smooth_l1_loss_forward(
        &mut self,
        input: &Tensor,
        target: &Tensor,
        output: &Tensor,
        options: SmoothL1LossOptions,
    ) -> Result<ExecutionReport, SessionError> {
        let problem = SmoothL1LossForwardProblem::new(
            &input.desc,
            &target.desc,
            &output.desc,
            options.reduction,
            self.validation(),
        );
        let size = self.runtime.workspace_size(&SMOOTH_L1_LOSS_FORWARD, &problem);
        let workspace = self.allocate_workspace(size, input.desc.dtype())?;
        let params = InvokeParams::SmoothL1LossForward(SmoothL1LossForwardArgs {
            input: input.arg(),
            target: target.arg(),
            output: output.arg(),
            workspace,
            beta: options.beta,
            divisor: options.divisor,
        });
        let result = self.runtime.dispatch(
            &SMOOTH_L1_LOSS_FORWARD,
            &mut self.device,
            &problem,
            &params,
        );
        self.release_workspace(workspace)?;
        Ok(result?)
    }

    /// Gradients are written only for the operands given a buffer.
    pub fn smooth_l1_loss_backward(
        &mut self,
        input: &Tensor,
        target: &Tensor,
        output_grad: &Tensor,
        input_grad: Option<&Tensor>,
        target_grad: Option<&Tensor>,
        options: SmoothL1LossOptions,
    ) -> Result<ExecutionReport, SessionError> {
        let problem = SmoothL1LossBackwardProblem::new(
            &input.desc,
            &target.desc,
            &output_grad.desc,
            input_grad.map_or(&input.desc, Tensor::desc),
            target_grad.map_or(&target.desc, Tensor::desc),
            options.reduction,
            self.validation(),
        );
        let params = InvokeParams::SmoothL1LossBackward(SmoothL1LossBackwardArgs {
            input: input.arg(),
            target: target.arg(),
            output_grad: output_grad.arg(),
            input_grad: input_grad.map(Tensor::arg),
            target_grad: target_grad.map(Tensor::arg),
            beta: options.beta,
            divisor: options.divisor,
        });
        Ok(self.runtime.dispatch(
            &SMOOTH_L1_LOSS_BACKWARD,
            &mut self.device,
            &problem,
            &params,
        )?)
    }

    pub fn triplet_margin_loss_forward_workspace_size(
        &mut self,
        anchor: &TensorDescriptor,
        positive: &TensorDescriptor,
        negative: &TensorDescriptor,
        output: &TensorDescriptor,
        reduction: Reduction,
    ) -> WorkspaceSize {
        let problem = TripletMarginLossForwardProblem::new(
            anchor,
            positive,
            negative,
            output,
            reduction,
            self.validation(),
        );
        self.runtime
            .workspace_size(&TRIPLET_MARGIN_LOSS_FORWARD, &problem)
    }

    pub fn triplet_margin_loss_forward(
        &mut self,
        anchor: &Tensor,
        positive: &Tensor,
        negative: &Tensor,
        output: &Tensor,
        options: TripletMarginLossOptions,
    ) -> Result<ExecutionReport, SessionError> {
        let problem = TripletMarginLossForwardProblem::new(
            &anchor.desc,
            &positive.desc,
            &negative.desc,
            &output.desc,
            options.reduction,
            self.validation(),
        );
        let size = self
            .runtime
            .workspace_size(&TRIPLET_MARGIN_LOSS_FORWARD, &problem);
        let workspace = self.allocate_workspace(size, anchor.desc.dtype())?;
        let params = InvokeParams::TripletMarginLossForward(TripletMarginLossForwardArgs {
            anchor: anchor.arg(),
            positive: positive.arg(),
            negative: negative.arg(),
            output: output.arg(),
            workspace,
            params: options.params,
            divisor: options.divisor,
        });
        let result = self.runtime.dispatch(
            &TRIPLET_MARGIN_LOSS_FORWARD,
            &mut self.device,
            &problem,
            &params,
        );
        self.release_workspace(workspace)?;
        Ok(result?)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn triplet_margin_loss_backward(
        &mut self,
        anchor: &Tensor,
        positive: &Tensor,
        negative: &Tensor,
        output_grad: &Tensor,
        anchor_grad: Option<&Tensor>,
        positive_grad: Option<&Tensor>,
        negative_grad: Option<&Tensor>,
        options: TripletMarginLossOptions,
    ) -> Result<ExecutionReport, SessionError> {
        let problem = TripletMarginLossBackwardProblem::new(
            &anchor.desc,
            &positive.desc,
            &negative.desc,
            &output_grad.desc,
            anchor_grad.map_or(&anchor.desc, Tensor::desc),
            positive_grad.map_or(&positive.desc, Tensor::desc),
            negative_grad.map_or(&negative.desc, Tensor::desc),
            options.reduction,
            self.validation(),
        );
        let params = InvokeParams::TripletMarginLossBackward(TripletMarginLossBackwardArgs {
            anchor: anchor.arg(),
            positive: positive.arg(),
            negative: negative.arg(),
            output_grad: output_grad.arg(),
            anchor_grad: anchor_grad.map(Tensor::arg),
            positive_grad: positive_grad.map(Tensor::arg),
            negative_grad: negative_grad.map(Tensor::arg),
            params: options.params,
            divisor: options.divisor,
        });
        Ok(self.runtime.dispatch(
            &TRIPLET_MARGIN_LOSS_BACKWARD,
            &mut self.device,
            &problem,
            &params,
        )?)
    }

    pub fn bce_logits_loss_forward_workspace_size(
        &mut self,
        input: &TensorDescriptor,
        target: &TensorDescriptor,
        weights: BceLogitsWeights<'_>,
        output: &TensorDescriptor,
    ) -> WorkspaceSize {
        let problem =
            BceLogitsLossForwardProblem::new(input, target, weights, output, self.validation());
        self.runtime
            .workspace_size(&BCE_LOGITS_LOSS_FORWARD, &problem)
    }

    /// Writes the weighted binary cross-entropy of `input` logits, summed
    /// and divided by `options.divisor`, into the single element of `output`.
    pub fn bce_logits_loss_forward(
        &mut self,
        input: &Tensor,
        target: &Tensor,
        output: &Tensor,
        options: BceLogitsLossOptions<'_>,
    ) -> Result<ExecutionReport, SessionError> {
        let problem = BceLogitsLossForwardProblem::new(
            &input.desc,
            &target.desc,
            options.weights(),
            &output.desc,
            self.validation(),
        );
        let size = self
            .runtime
            .workspace_size(&BCE_LOGITS_LOSS_FORWARD, &problem);
        let workspace = self.allocate_workspace(size, input.desc.dtype())?;
        let params = InvokeParams::BceLogitsLossForward(BceLogitsLossForwardArgs {
            input: input.arg(),
            target: target.arg(),
            weight: options.weight.map(Tensor::arg),
            pos_weight: options.pos_weight.map(Tensor::arg),
            output: output.arg(),
            workspace,
            divisor: options.divisor,
        });
        let result = self.runtime.dispatch(
            &BCE_LOGITS_LOSS_FORWARD,
            &mut self.device,
            &problem,
            &params,
        );
        self.release_workspace(workspace)?;
        Ok(result?)
    }

    pub fn bce_logits_loss_backward(
        &mut self,
        input: &Tensor,
        target: &Tensor,
        output_grad: &Tensor,
        input_grad: Option<&Tensor>,
        target_grad: Option<&Tensor>,
        options: BceLogitsLossOptions<'_>,
    ) -> Result<ExecutionReport, SessionError> {
        let problem = BceLogitsLossBackwardProblem::new(
            &input.desc,
            &target.desc,
            options.weights(),
            &output_grad.desc,
            input_grad.map_or(&input.desc, Tensor::desc),
            target_grad.map_or(&target.desc, Tensor::desc),
            self.validation(),
        );
        let params = InvokeParams::BceLogitsLossBackward(BceLogitsLossBackwardArgs {
            input: input.arg(),
            target: target.arg(),
            weight: options.weight.map(Tensor::arg),
            pos_weight: options.pos_weight.map(Tensor::arg),
            output_grad: output_grad.arg(),
            input_grad: input_grad.map(Tensor::arg),
            target_grad: target_grad.map(Tensor::arg),
            divisor: options.divisor,
        });
        Ok(self.runtime.dispatch(
            &BCE_LOGITS_LOSS_BACKWARD,
            &mut self.device,
            &problem,
            &params,
        )?)
    }

    /// Draws one value per element. Negative inputs take it as a slope in
    /// `[lower, upper)`; non-negative inputs store `1`. The returned noise
    /// feeds the matching backward call and stays allocated until
    /// [`Session::release_noise`].
    pub fn rrelu_forward(
        &mut self,
        input: &Tensor,
        output: &Tensor,
        lower: f64,
        upper: f64,
    ) -> Result<(ExecutionReport, RReluNoise), SessionError> {
        let problem = RReluForwardProblem::new(&input.desc, &output.desc, self.validation());
        let len = output.desc.numel();
        let noise = self.device.allocate(output.desc.dtype(), len)?;
        let params = InvokeParams::RReluForward(RReluForwardArgs {
            input: input.arg(),
            output: output.arg(),
            noise,
            states: self.states,
            lower,
            upper,
        });
        match self
            .runtime
            .dispatch(&RRELU_FORWARD, &mut self.device, &problem, &params)
        {
            Ok(report) => Ok((report, RReluNoise { buffer: noise, len })),
            Err(error) => {
                self.device.release(noise)?;
                Err(error.into())
            }
        }
    }

    pub fn rrelu_backward(
        &mut self,
        output_grad: &Tensor,
        input_grad: &Tensor,
        noise: &RReluNoise,
    ) -> Result<ExecutionReport, SessionError> {
        let problem =
            RReluBackwardProblem::new(&output_grad.desc, &input_grad.desc, self.validation());
        let params = InvokeParams::RReluBackward(RReluBackwardArgs {
            output_grad: output_grad.arg(),
            input_grad: input_grad.arg(),
            noise: noise.buffer,
        });
        Ok(self
            .runtime
            .dispatch(&RRELU_BACKWARD, &mut self.device, &problem, &params)?)
    }

    /// Clears the plan cache; returns how many plans were dropped.
    pub fn teardown(&mut self) -> usize {
        self.runtime.teardown()
    }

    fn allocate_workspace(
        &mut self,
        size: WorkspaceSize,
        dtype: DType,
    ) -> Result<Option<BufferId>, SessionError> {
        let bytes = match size {
            WorkspaceSize::Bytes(0) | WorkspaceSize::Unsupported => return Ok(None),
            WorkspaceSize::Bytes(bytes) => bytes,
        };
        let buffer = self
            .device
            .allocate(dtype, bytes.div_ceil(dtype.element_size()))?;
        self.runtime.ledger_mut().record(
            EvidenceKind::Workspace,
            format!("allocated {bytes} bytes as {buffer:?}"),
        );
        Ok(Some(buffer))
    }

    fn release_workspace(&mut self, workspace: Option<BufferId>) -> Result<(), SessionError> {
        if let Some(buffer) = workspace {
            self.device.release(buffer)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    Config(ConfigError),
    Device(DeviceError),
    Dispatch(DispatchError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(error) => write!(f, "configuration failure: {error}"),
            Self::Device(error) => write!(f, "device failure: {error}"),
            Self::Dispatch(error) => write!(f, "dispatch failure: {error}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(error) => Some(error),
            Self::Device(error) => Some(error),
            Self::Dispatch(error) => Some(error),
        }
    }
}

impl From<ConfigError> for SessionError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<DeviceError> for SessionError {
    fn from(value: DeviceError) -> Self {
        Self::Device(value)
    }
}

impl From<DispatchError> for SessionError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

#[cfg(test)]
mod tests {
    use ft_core::{DType, TensorDescriptor, ValidationMode};
    use ft_device::{CpuDevice, DeviceError};
    use ft_dispatch::{DispatchError, WorkspaceSize};
    use ft_runtime::{EvidenceKind, RuntimeConfig};

    use super::{Reduction, Session, SessionError, SmoothL1LossOptions};

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            validation: ValidationMode::Raise,
            plan_cache_capacity: 8,
            generator_states: 4,
            generator_seed: 1,
        }
    }

    #[test]
    fn reduced_forward_allocates_and_releases_workspace() {
        let mut session = Session::new(config()).expect("session");
        let desc = TensorDescriptor::from_shape(vec![2, 2], DType::F32);
        let scalar = TensorDescriptor::from_shape(vec![1], DType::F32);
        assert_eq!(
            session.smooth_l1_loss_forward_workspace_size(&desc, &desc, &scalar, Reduction::Reduced),
            WorkspaceSize::Bytes(16)
        );

        let input = session.tensor(desc.clone(), &[0.0, 1.0, 2.0, 3.0]).expect("input");
        let target = session.tensor(desc.clone(), &[0.0; 4]).expect("target");
        let output = session.zeros(scalar).expect("output");
        let before = session.device().used_bytes();
        let report = session
            .smooth_l1_loss_forward(
                &input,
                &target,
                &output,
                SmoothL1LossOptions {
                    reduction: Reduction::Reduced,
                    beta: 1.0,
                    divisor: 4.0,
                },
            )
            .expect("reduced forward");

        assert_eq!(report.launches, 2);
        assert_eq!(report.workspace_bytes, 16);
        assert_eq!(session.device().used_bytes(), before);
        // 0 + 0.5 + 1.5 + 2.5 over 4
        assert_eq!(session.read(&output).expect("read"), vec![1.125]);
    }

    #[test]
    fn workspace_allocation_failure_is_a_device_error() {
        // room for the state pool and two 4-element operands, not the workspace
        let device = CpuDevice::with_memory_limit(4 * 24 + 2 * 16 + 4);
        let mut session = Session::with_device(config(), device).expect("session");
        let desc = TensorDescriptor::from_shape(vec![4], DType::F32);
        let scalar = TensorDescriptor::from_shape(vec![1], DType::F32);
        let input = session.tensor(desc.clone(), &[1.0; 4]).expect("input");
        let target = session.tensor(desc, &[0.0; 4]).expect("target");
        let output = session.zeros(scalar).expect("output");

        let err = session
            .smooth_l1_loss_forward(
                &input,
                &target,
                &output,
                SmoothL1LossOptions {
                    reduction: Reduction::Reduced,
                    ..SmoothL1LossOptions::default()
                },
            )
            .expect_err("no room for workspace");
        assert!(matches!(
            err,
            SessionError::Device(DeviceError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn raise_mode_reports_validation_through_session() {
        let mut session = Session::new(config()).expect("session");
        let input = session
            .tensor(TensorDescriptor::from_shape(vec![4], DType::F32), &[0.0; 4])
            .expect("input");
        let target = session
            .tensor(TensorDescriptor::from_shape(vec![4], DType::F16), &[0.0; 4])
            .expect("target");
        let output = session
            .zeros(TensorDescriptor::from_shape(vec![4], DType::F32))
            .expect("output");

        let err = session
            .smooth_l1_loss_forward(&input, &target, &output, SmoothL1LossOptions::default())
            .expect_err("mixed element types");
        assert!(matches!(
            err,
            SessionError::Dispatch(DispatchError::Validation(_))
        ));

        session.set_validation(ValidationMode::Advisory);
        let err = session
            .smooth_l1_loss_forward(&input, &target, &output, SmoothL1LossOptions::default())
            .expect_err("still no solver");
        assert!(matches!(
            err,
            SessionError::Dispatch(DispatchError::NoApplicableSolver { .. })
        ));
    }

    #[test]
    fn released_noise_returns_its_bytes() {
        let mut session = Session::new(config()).expect("session");
        let desc = TensorDescriptor::from_shape(vec![6], DType::F32);
        let input = session
            .tensor(desc.clone(), &[-1.0, 2.0, -3.0, 0.5, -0.25, 4.0])
            .expect("input");
        let output = session.zeros(desc).expect("output");
        let before = session.device().used_bytes();

        let (_, noise) = session
            .rrelu_forward(&input, &output, 0.1, 0.3)
            .expect("forward");
        assert_eq!(session.device().used_bytes(), before + 6 * 4);
        session.release_noise(noise).expect("release noise");
        assert_eq!(session.device().used_bytes(), before);
    }

    #[test]
    fn teardown_empties_the_plan_cache() {
        let mut session = Session::new(config()).expect("session");
        let desc = TensorDescriptor::from_shape(vec![3], DType::F64);
        let input = session.tensor(desc.clone(), &[1.0, -2.0, 3.0]).expect("input");
        let output = session.zeros(desc).expect("output");
        let (_, noise) = session
            .rrelu_forward(&input, &output, 0.1, 0.3)
            .expect("forward");
        session.release_noise(noise).expect("release noise");
        assert_eq!(session.cache_stats().len, 1);

        assert_eq!(session.teardown(), 1);
        assert_eq!(session.cache_stats().len, 0);
        let cache_entries = session
            .runtime()
            .ledger()
            .of_kind(EvidenceKind::Cache)
            .count();
        assert_eq!(cache_entries, 1);
    }
}
