#![forbid(unsafe_code)]

//! Solver selection, plan caching and invocation marshalling.
//!
//! Each operation variant owns a closed [`SolverRegistry`]. Dispatch probes
//! the [`PlanCache`] with the problem's scoped fingerprint, and on a miss scans
//! the registry in registration order: the first applicable solver sizes the
//! workspace and builds an [`ExecutionPlan`]. The plan's invoker turns
//! [`InvokeParams`] into kernel launches on a [`DeviceRuntime`], recomputing
//! every operand view from the descriptors supplied with the call.

mod bce_logits_loss;
mod cache;
mod rrelu;
mod smooth_l1_loss;
mod triplet_margin_loss;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ft_core::{DType, Device, TensorDescriptor};
use ft_device::{BufferId, DeviceError, DeviceGuard, DeviceRuntime, KernelArg, KernelInfo};
use ft_kernel_cpu::TripletMarginParams;
use ft_problem::{Fingerprint, ProblemDescription, ValidationError, holds};
use ft_view::{MAX_RANK, TensorView5, ViewError};

pub use bce_logits_loss::{
    BCE_LOGITS_LOSS_BACKWARD, BCE_LOGITS_LOSS_FORWARD, BceLogitsLossBackwardSolver,
    BceLogitsLossForwardSolver,
};
pub use cache::{CacheStats, PlanCache};
pub use rrelu::{RRELU_BACKWARD, RRELU_FORWARD, RReluBackwardSolver, RReluForwardSolver};
pub use smooth_l1_loss::{
    SMOOTH_L1_LOSS_BACKWARD, SMOOTH_L1_LOSS_FORWARD, SmoothL1LossBackwardSolver,
    SmoothL1LossForwardSolver,
};
pub use triplet_margin_loss::{
    TRIPLET_MARGIN_LOSS_BACKWARD, TRIPLET_MARGIN_LOSS_FORWARD, TripletMarginLossBackwardSolver,
    TripletMarginLossForwardSolver,
};

/// Work-group size of every launch.
pub const LOCAL_SIZE: usize = 256;

/// Execution context a solver is selected and planned under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolverContext {
    device: Device,
    generator_states: usize,
}

impl SolverContext {
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self {
            device,
            generator_states: 0,
        }
    }

    /// Size of the generator-state pool stochastic solvers partition.
    #[must_use]
    pub fn with_generator_states(mut self, count: usize) -> Self {
        self.generator_states = count;
        self
    }

    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    #[must_use]
    pub fn generator_states(&self) -> usize {
        self.generator_states
    }

    /// Everything about the context that can change a plan.
    #[must_use]
    pub fn tag(&self) -> String {
        format!("{:?};states{}", self.device, self.generator_states).to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkspaceSize {
    Bytes(usize),
    /// No solver handles the configuration. Never conflated with zero.
    Unsupported,
}

impl WorkspaceSize {
    #[must_use]
    pub fn bytes(self) -> Option<usize> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            Self::Unsupported => None,
        }
    }

    #[must_use]
    pub fn is_supported(self) -> bool {
        matches!(self, Self::Bytes(_))
    }
}

impl fmt::Display for WorkspaceSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "{bytes} bytes"),
            Self::Unsupported => f.write_str("unsupported"),
        }
    }
}

/// One computation strategy for one operation variant.
///
/// Solvers are stateless values. `workspace_size` and `solution` are only
/// called once `is_applicable` has returned `true` for the same problem.
pub trait Solver: fmt::Debug + Send + Sync + 'static {
    type Problem<'a>: ProblemDescription;

    fn id(&self) -> &'static str;

    fn is_applicable(&self, ctx: &SolverContext, problem: &Self::Problem<'_>) -> bool;

    fn workspace_size(&self, ctx: &SolverContext, problem: &Self::Problem<'_>) -> WorkspaceSize;

    fn solution(
        &self,
        ctx: &SolverContext,
        problem: &Self::Problem<'_>,
    ) -> Result<ExecutionPlan, DispatchError>;
}

/// Ordered solver candidates of one operation variant.
#[derive(Debug)]
pub struct SolverRegistry<S: 'static> {
    name: &'static str,
    solvers: &'static [S],
}

impl<S: 'static> SolverRegistry<S> {
    #[must_use]
    pub const fn new(name: &'static str, solvers: &'static [S]) -> Self {
        Self { name, solvers }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn solvers(&self) -> &'static [S] {
        self.solvers
    }
}

impl<S: Solver> SolverRegistry<S> {
    /// First applicable solver in registration order.
    #[must_use]
    pub fn select(&self, ctx: &SolverContext, problem: &S::Problem<'_>) -> Option<&'static S> {
        self.solvers
            .iter()
            .find(|solver| solver.is_applicable(ctx, problem))
    }

    #[must_use]
    pub fn workspace_size(&self, ctx: &SolverContext, problem: &S::Problem<'_>) -> WorkspaceSize {
        self.select(ctx, problem)
            .map_or(WorkspaceSize::Unsupported, |solver| {
                solver.workspace_size(ctx, problem)
            })
    }
}

type Invoker =
    Arc<dyn Fn(&mut dyn DeviceRuntime, &InvokeParams<'_>) -> Result<(), DispatchError> + Send + Sync>;

/// Launch descriptors plus the invoker that binds call arguments to them.
/// Immutable once built and shared between every problem of one fingerprint.
#[derive(Clone)]
pub struct ExecutionPlan {
    solver_id: &'static str,
    kernels: Vec<KernelInfo>,
    workspace_bytes: usize,
    invoker: Invoker,
}

impl ExecutionPlan {
    pub fn new<F>(
        solver_id: &'static str,
        kernels: Vec<KernelInfo>,
        workspace_bytes: usize,
        invoker: F,
    ) -> Self
    where
        F: Fn(&mut dyn DeviceRuntime, &InvokeParams<'_>) -> Result<(), DispatchError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            solver_id,
            kernels,
            workspace_bytes,
            invoker: Arc::new(invoker),
        }
    }

    #[must_use]
    pub fn solver_id(&self) -> &'static str {
        self.solver_id
    }

    #[must_use]
    pub fn kernels(&self) -> &[KernelInfo] {
        &self.kernels
    }

    #[must_use]
    pub fn workspace_bytes(&self) -> usize {
        self.workspace_bytes
    }

    pub fn invoke(
        &self,
        runtime: &mut dyn DeviceRuntime,
        params: &InvokeParams<'_>,
    ) -> Result<(), DispatchError> {
        (self.invoker)(runtime, params)
    }
}

impl fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("solver_id", &self.solver_id)
            .field("kernels", &self.kernels)
            .field("workspace_bytes", &self.workspace_bytes)
            .finish_non_exhaustive()
    }
}

/// A device buffer bound to the descriptor it is read or written through.
#[derive(Debug, Clone, Copy)]
pub struct TensorArg<'a> {
    pub buffer: BufferId,
    pub desc: &'a TensorDescriptor,
}

impl<'a> TensorArg<'a> {
    #[must_use]
    pub const fn new(buffer: BufferId, desc: &'a TensorDescriptor) -> Self {
        Self { buffer, desc }
    }

    fn buffer_arg(self) -> KernelArg {
        KernelArg::Buffer(self.buffer)
    }

    fn view_arg(self) -> Result<KernelArg, DispatchError> {
        Ok(KernelArg::View(TensorView5::from_descriptor(self.desc)?))
    }
}

/// Buffer and view slots of an operand the caller may omit.
fn optional_args(arg: Option<TensorArg<'_>>) -> Result<[KernelArg; 2], DispatchError> {
    match arg {
        Some(arg) => Ok([arg.buffer_arg(), arg.view_arg()?]),
        None => Ok([KernelArg::Null, KernelArg::Null]),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SmoothL1LossForwardArgs<'a> {
    pub input: TensorArg<'a>,
    pub target: TensorArg<'a>,
    pub output: TensorArg<'a>,
    /// Required by the reduced variant.
    pub workspace: Option<BufferId>,
    pub beta: f64,
    /// Reduced results are divided by this; ignored when unreduced.
    pub divisor: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct SmoothL1LossBackwardArgs<'a> {
    pub input: TensorArg<'a>,
    pub target: TensorArg<'a>,
    pub output_grad: TensorArg<'a>,
    pub input_grad: Option<TensorArg<'a>>,
    pub target_grad: Option<TensorArg<'a>>,
    pub beta: f64,
    pub divisor: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct TripletMarginLossForwardArgs<'a> {
    pub anchor: TensorArg<'a>,
    pub positive: TensorArg<'a>,
    pub negative: TensorArg<'a>,
    pub output: TensorArg<'a>,
    pub workspace: Option<BufferId>,
    pub params: TripletMarginParams,
    pub divisor: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct TripletMarginLossBackwardArgs<'a> {
    pub anchor: TensorArg<'a>,
    pub positive: TensorArg<'a>,
    pub negative: TensorArg<'a>,
    pub output_grad: TensorArg<'a>,
    pub anchor_grad: Option<TensorArg<'a>>,
    pub positive_grad: Option<TensorArg<'a>>,
    pub negative_grad: Option<TensorArg<'a>>,
    pub params: TripletMarginParams,
    pub divisor: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct BceLogitsLossForwardArgs<'a> {
    pub input: TensorArg<'a>,
    pub target: TensorArg<'a>,
    pub weight: Option<TensorArg<'a>>,
    pub pos_weight: Option<TensorArg<'a>>,
    pub output: TensorArg<'a>,
    pub workspace: Option<BufferId>,
    pub divisor: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct BceLogitsLossBackwardArgs<'a> {
    pub input: TensorArg<'a>,
    pub target: TensorArg<'a>,
    pub weight: Option<TensorArg<'a>>,
    pub pos_weight: Option<TensorArg<'a>>,
    pub output_grad: TensorArg<'a>,
    pub input_grad: Option<TensorArg<'a>>,
    pub target_grad: Option<TensorArg<'a>>,
    pub divisor: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct RReluForwardArgs<'a> {
    pub input: TensorArg<'a>,
    pub output: TensorArg<'a>,
    /// Flat buffer of `numel` slopes, indexed like the output.
    pub noise: BufferId,
    /// Generator-state pool; read, never advanced.
    pub states: BufferId,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct RReluBackwardArgs<'a> {
    pub output_grad: TensorArg<'a>,
    pub input_grad: TensorArg<'a>,
    pub noise: BufferId,
}

/// Per-call arguments, one shape per operation.
#[derive(Debug, Clone, Copy)]
pub enum InvokeParams<'a> {
    SmoothL1LossForward(SmoothL1LossForwardArgs<'a>),
    SmoothL1LossBackward(SmoothL1LossBackwardArgs<'a>),
    TripletMarginLossForward(TripletMarginLossForwardArgs<'a>),
    TripletMarginLossBackward(TripletMarginLossBackwardArgs<'a>),
    BceLogitsLossForward(BceLogitsLossForwardArgs<'a>),
    BceLogitsLossBackward(BceLogitsLossBackwardArgs<'a>),
    RReluForward(RReluForwardArgs<'a>),
    RReluBackward(RReluBackwardArgs<'a>),
}

impl InvokeParams<'_> {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::SmoothL1LossForward(_) => "SmoothL1LossForward",
            Self::SmoothL1LossBackward(_) => "SmoothL1LossBackward",
            Self::TripletMarginLossForward(_) => "TripletMarginLossForward",
            Self::TripletMarginLossBackward(_) => "TripletMarginLossBackward",
            Self::BceLogitsLossForward(_) => "BceLogitsLossForward",
            Self::BceLogitsLossBackward(_) => "BceLogitsLossBackward",
            Self::RReluForward(_) => "RReluForward",
            Self::RReluBackward(_) => "RReluBackward",
        }
    }

    #[must_use]
    pub fn workspace(&self) -> Option<BufferId> {
        match self {
            Self::SmoothL1LossForward(args) => args.workspace,
            Self::TripletMarginLossForward(args) => args.workspace,
            Self::BceLogitsLossForward(args) => args.workspace,
            _ => None,
        }
    }

    fn mismatch(&self, expected: &'static str) -> DispatchError {
        DispatchError::ParamsMismatch {
            expected,
            actual: self.label(),
        }
    }
}

/// Number of stochastic workers for `elements` outputs over a pool of
/// `states` generators.
///
/// Up to one worker per element while the pool suffices; beyond that the
/// largest power of two `2^d` with `2^d * d <= elements`. Aligned up to a
/// whole number of work groups.
#[must_use]
pub fn stochastic_worker_count(elements: usize, states: usize) -> usize {
    let workers = if elements <= states {
        elements
    } else {
        let mut exponent = 1u32;
        while exponent < usize::BITS - 1
            && (1usize << exponent)
                .checked_mul(exponent as usize)
                .is_some_and(|cost| cost <= elements)
        {
            exponent += 1;
        }
        1usize << (exponent - 1)
    };
    align_up(workers, LOCAL_SIZE)
}

fn align_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

/// Compile-time definitions for a kernel reading `input` and writing
/// `output` elements.
#[must_use]
pub fn kernel_build_params(input: DType, output: DType) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    for (flag, dtype) in [
        ("USE_FP16", DType::F16),
        ("USE_FP32", DType::F32),
        ("USE_FP64", DType::F64),
        ("USE_BFP16", DType::BF16),
    ] {
        params.insert(flag.to_string(), u8::from(input == dtype).to_string());
    }
    params.insert("INPUT_TYPE".to_string(), input.kernel_type_name().to_string());
    params.insert(
        "OUTPUT_TYPE".to_string(),
        output.kernel_type_name().to_string(),
    );
    params
}

/// One-dimensional launch covering `work_items`, padded to three dimensions.
#[must_use]
pub fn launch(
    kernel_file: &str,
    kernel_name: &str,
    work_items: usize,
    build_params: BTreeMap<String, String>,
) -> KernelInfo {
    KernelInfo {
        kernel_file: kernel_file.to_string(),
        kernel_name: kernel_name.to_string(),
        local: [LOCAL_SIZE, 1, 1],
        global: [align_up(work_items, LOCAL_SIZE), 1, 1],
        build_params,
    }
}

fn count_arg(count: usize) -> KernelArg {
    KernelArg::Count(count as u64)
}

/// Preconditions shared by every solver: addressable rank, one element type
/// and consistent operand lengths.
fn is_well_formed(problem: &impl ProblemDescription) -> bool {
    problem.max_rank() <= MAX_RANK
        && holds(problem.is_same_type())
        && holds(problem.is_right_length())
}

#[derive(Debug, Clone)]
pub struct PreparedPlan {
    pub plan: Arc<ExecutionPlan>,
    pub fingerprint: Fingerprint,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub solver_id: &'static str,
    pub fingerprint: Fingerprint,
    pub cache_hit: bool,
    pub workspace_bytes: usize,
    pub launches: usize,
}

/// Workspace bytes `problem` needs, or `Unsupported` when no solver applies.
#[must_use]
pub fn workspace_size<S: Solver>(
    registry: &SolverRegistry<S>,
    ctx: &SolverContext,
    problem: &S::Problem<'_>,
) -> WorkspaceSize {
    registry.workspace_size(ctx, problem)
}

/// Validates `problem` and returns its plan, building and caching it on a
/// miss.
pub fn prepare<S: Solver>(
    registry: &SolverRegistry<S>,
    cache: &PlanCache,
    ctx: &SolverContext,
    problem: &S::Problem<'_>,
) -> Result<PreparedPlan, DispatchError> {
    problem.validate()?;
    let fingerprint = problem.fingerprint().scoped(&ctx.tag());
    if let Some(plan) = cache.get(&fingerprint) {
        return Ok(PreparedPlan {
            plan,
            fingerprint,
            cache_hit: true,
        });
    }

    let solver = registry
        .select(ctx, problem)
        .ok_or_else(|| DispatchError::NoApplicableSolver {
            registry: registry.name(),
            fingerprint: fingerprint.clone(),
        })?;
    let plan = solver.solution(ctx, problem)?;
    let plan = cache.insert(fingerprint.clone(), plan);
    Ok(PreparedPlan {
        plan,
        fingerprint,
        cache_hit: false,
    })
}

/// Plans `problem` and runs it with `params`, waiting for completion.
pub fn execute<S: Solver>(
    registry: &SolverRegistry<S>,
    cache: &PlanCache,
    ctx: &SolverContext,
    runtime: &mut dyn DeviceRuntime,
    problem: &S::Problem<'_>,
    params: &InvokeParams<'_>,
) -> Result<ExecutionReport, DispatchError> {
    DeviceGuard::new(ctx.device()).ensure_runtime(runtime)?;
    let prepared = prepare(registry, cache, ctx, problem)?;
    let plan = &prepared.plan;

    let required = plan.workspace_bytes();
    if required > 0 {
        let provided = match params.workspace() {
            Some(id) => runtime.buffer_bytes(id)?,
            None => 0,
        };
        if provided < required {
            return Err(DispatchError::WorkspaceTooSmall { required, provided });
        }
    }

    plan.invoke(runtime, params)?;
    runtime.synchronize()?;
    Ok(ExecutionReport {
        solver_id: plan.solver_id(),
        fingerprint: prepared.fingerprint,
        cache_hit: prepared.cache_hit,
        workspace_bytes: required,
        launches: plan.kernels().len(),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    Validation(ValidationError),
    View(ViewError),
    NoApplicableSolver {
        registry: &'static str,
        fingerprint: Fingerprint,
    },
    WorkspaceTooSmall {
        required: usize,
        provided: usize,
    },
    ParamsMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    GeneratorStateMismatch {
        expected: usize,
        actual: usize,
    },
    Device(DeviceError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(error) => write!(f, "validation failure: {error}"),
            Self::View(error) => write!(f, "view failure: {error}"),
            Self::NoApplicableSolver {
                registry,
                fingerprint,
            } => write!(
                f,
                "no applicable solver in {registry} for configuration {fingerprint}"
            ),
            Self::WorkspaceTooSmall { required, provided } => write!(
                f,
                "workspace too small: required {required} bytes, provided {provided}"
            ),
            Self::ParamsMismatch { expected, actual } => write!(
                f,
                "invocation parameters mismatch: plan expects {expected}, got {actual}"
            ),
            Self::GeneratorStateMismatch { expected, actual } => write!(
                f,
                "generator pool mismatch: plan was built for {expected} states, got {actual}"
            ),
            Self::Device(error) => write!(f, "device failure: {error}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Validation(error) => Some(error),
            Self::View(error) => Some(error),
            Self::Device(error) => Some(error),
            _ => None,
        }
    }
}

impl From<ValidationError> for DispatchError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<ViewError> for DispatchError {
    fn from(value: ViewError) -> Self {
        Self::View(value)
    }
}

impl From<DeviceError> for DispatchError {
    fn from(value: DeviceError) -> Self {
        Self::Device(value)
    }
}

#[cfg(test)]
mod tests {
    use ft_core::{DType, Device, TensorDescriptor, ValidationMode};
    use ft_device::{CpuDevice, DeviceError, DeviceRuntime};
    use ft_problem::{Reduction, SmoothL1LossForwardProblem, ValidationError};
    use proptest::prelude::*;

    use super::{
        DispatchError, InvokeParams, LOCAL_SIZE, PlanCache, SMOOTH_L1_LOSS_FORWARD,
        SmoothL1LossForwardArgs, SolverContext, TensorArg, WorkspaceSize, execute,
        kernel_build_params, launch, stochastic_worker_count, workspace_size,
    };

    fn cpu() -> SolverContext {
        SolverContext::new(Device::Cpu)
    }

    #[test]
    fn worker_count_matches_reference_points() {
        assert_eq!(stochastic_worker_count(10, 4), 256);
        assert_eq!(stochastic_worker_count(3, 4), 256);
        assert_eq!(stochastic_worker_count(0, 4), 0);
        assert_eq!(stochastic_worker_count(4096, 4), 256);
        assert_eq!(stochastic_worker_count(100_000, 4), 4096);
        assert_eq!(stochastic_worker_count(600, 1024), 768);
    }

    #[test]
    fn worker_count_stays_finite_at_the_largest_element_count() {
        let workers = stochastic_worker_count(usize::MAX, 4);
        assert!(workers.is_power_of_two());
        assert_eq!(workers % LOCAL_SIZE, 0);
        let doubled = workers * 2;
        assert!(
            doubled
                .checked_mul(doubled.trailing_zeros() as usize)
                .is_none()
        );
    }

    #[test]
    fn build_params_flag_exactly_the_input_type() {
        let params = kernel_build_params(DType::BF16, DType::BF16);
        assert_eq!(params["USE_BFP16"], "1");
        assert_eq!(params["USE_FP16"], "0");
        assert_eq!(params["USE_FP32"], "0");
        assert_eq!(params["USE_FP64"], "0");
        assert_eq!(params["INPUT_TYPE"], "ushort");
        assert_eq!(params["OUTPUT_TYPE"], "ushort");
    }

    #[test]
    fn launch_grid_is_aligned_and_three_dimensional() {
        let kernel = launch("Loss.cpp", "Loss", 300, kernel_build_params(DType::F32, DType::F32));
        assert_eq!(kernel.local, [LOCAL_SIZE, 1, 1]);
        assert_eq!(kernel.global, [512, 1, 1]);
        assert_eq!(kernel.work_items(), 512);
    }

    #[test]
    fn context_tag_separates_pool_sizes() {
        assert_ne!(cpu().tag(), cpu().with_generator_states(4).tag());
        assert_eq!(cpu().with_generator_states(4).tag(), "cpu;states4");
    }

    #[test]
    fn rank_six_is_unsupported_and_has_no_solver() {
        let desc = TensorDescriptor::from_shape(vec![2, 1, 1, 1, 1, 3], DType::F32);
        let problem = SmoothL1LossForwardProblem::new(
            &desc,
            &desc,
            &desc,
            Reduction::Unreduced,
            ValidationMode::Raise,
        );
        assert_eq!(
            workspace_size(&SMOOTH_L1_LOSS_FORWARD, &cpu(), &problem),
            WorkspaceSize::Unsupported
        );

        let mut device = CpuDevice::new();
        let buffer = device.allocate(DType::F32, 6).expect("allocate");
        let arg = TensorArg::new(buffer, &desc);
        let params = InvokeParams::SmoothL1LossForward(SmoothL1LossForwardArgs {
            input: arg,
            target: arg,
            output: arg,
            workspace: None,
            beta: 1.0,
            divisor: 1.0,
        });
        let cache = PlanCache::new(8);
        let err = execute(
            &SMOOTH_L1_LOSS_FORWARD,
            &cache,
            &cpu(),
            &mut device,
            &problem,
            &params,
        )
        .expect_err("rank 6 has no solver");
        assert!(matches!(
            err,
            DispatchError::NoApplicableSolver {
                registry: "SmoothL1LossForward",
                ..
            }
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn raise_mode_surfaces_validation_before_selection() {
        let input = TensorDescriptor::from_shape(vec![4, 3], DType::F32);
        let target = TensorDescriptor::from_shape(vec![4, 1], DType::F32);
        let problem = SmoothL1LossForwardProblem::new(
            &input,
            &target,
            &input,
            Reduction::Unreduced,
            ValidationMode::Raise,
        );
        let mut device = CpuDevice::new();
        let buffer = device.allocate(DType::F32, 12).expect("allocate");
        let params = InvokeParams::SmoothL1LossForward(SmoothL1LossForwardArgs {
            input: TensorArg::new(buffer, &input),
            target: TensorArg::new(buffer, &target),
            output: TensorArg::new(buffer, &input),
            workspace: None,
            beta: 1.0,
            divisor: 1.0,
        });
        let err = execute(
            &SMOOTH_L1_LOSS_FORWARD,
            &PlanCache::new(8),
            &cpu(),
            &mut device,
            &problem,
            &params,
        )
        .expect_err("undeclared broadcast is rejected");
        assert!(matches!(
            err,
            DispatchError::Validation(ValidationError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn runtime_on_another_device_is_rejected() {
        let desc = TensorDescriptor::from_shape(vec![4], DType::F32);
        let problem = SmoothL1LossForwardProblem::new(
            &desc,
            &desc,
            &desc,
            Reduction::Unreduced,
            ValidationMode::Raise,
        );
        let mut device = CpuDevice::new();
        let buffer = device.allocate(DType::F32, 4).expect("allocate");
        let arg = TensorArg::new(buffer, &desc);
        let params = InvokeParams::SmoothL1LossForward(SmoothL1LossForwardArgs {
            input: arg,
            target: arg,
            output: arg,
            workspace: None,
            beta: 1.0,
            divisor: 1.0,
        });
        let err = execute(
            &SMOOTH_L1_LOSS_FORWARD,
            &PlanCache::new(8),
            &SolverContext::new(Device::Cuda),
            &mut device,
            &problem,
            &params,
        )
        .expect_err("cuda context cannot run on the cpu device");
        assert!(matches!(
            err,
            DispatchError::Device(DeviceError::Mismatch { .. })
        ));
    }

    #[test]
    fn workspace_error_display_reports_bytes() {
        let err = DispatchError::WorkspaceTooSmall {
            required: 48,
            provided: 0,
        };
        assert!(err.to_string().contains("required 48 bytes"));
    }

    proptest! {
        #[test]
        fn prop_worker_count_is_aligned_and_bounded(
            elements in 0usize..2_000_000,
            states in 0usize..4096,
        ) {
            let workers = stochastic_worker_count(elements, states);
            prop_assert_eq!(workers % LOCAL_SIZE, 0);
            if elements <= states {
                prop_assert!(workers >= elements);
                prop_assert!(workers < elements + LOCAL_SIZE);
            } else {
                prop_assert!(workers <= elements.max(LOCAL_SIZE));
            }
        }
    }
}
