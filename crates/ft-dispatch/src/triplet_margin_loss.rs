use ft_device::KernelArg;
use ft_kernel_cpu::{TripletMarginParams, names};
use ft_problem::{Reduction, TripletMarginLossBackwardProblem, TripletMarginLossForwardProblem};

use crate::{
    DispatchError, ExecutionPlan, InvokeParams, Solver, SolverContext, SolverRegistry,
    TripletMarginLossBackwardArgs, TripletMarginLossForwardArgs, WorkspaceSize, count_arg,
    is_well_formed, kernel_build_params, launch, optional_args,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripletMarginLossForwardSolver {
    Unreduced2d,
    Reduced2d,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripletMarginLossBackwardSolver {
    Unreduced2d,
    Reduced2d,
}

pub const TRIPLET_MARGIN_LOSS_FORWARD: SolverRegistry<TripletMarginLossForwardSolver> =
    SolverRegistry::new(
        "TripletMarginLossForward",
        &[
            TripletMarginLossForwardSolver::Unreduced2d,
            TripletMarginLossForwardSolver::Reduced2d,
        ],
    );

pub const TRIPLET_MARGIN_LOSS_BACKWARD: SolverRegistry<TripletMarginLossBackwardSolver> =
    SolverRegistry::new(
        "TripletMarginLossBackward",
        &[
            TripletMarginLossBackwardSolver::Unreduced2d,
            TripletMarginLossBackwardSolver::Reduced2d,
        ],
    );

fn params_args(params: &TripletMarginParams) -> [KernelArg; 4] {
    [
        KernelArg::Scalar(params.margin),
        KernelArg::Scalar(params.p),
        KernelArg::Scalar(params.eps),
        KernelArg::Flag(params.swap),
    ]
}

fn forward_args<'a>(
    params: &InvokeParams<'a>,
) -> Result<TripletMarginLossForwardArgs<'a>, DispatchError> {
    match params {
        InvokeParams::TripletMarginLossForward(args) => Ok(*args),
        other => Err(other.mismatch("TripletMarginLossForward")),
    }
}

fn backward_args<'a>(
    params: &InvokeParams<'a>,
) -> Result<TripletMarginLossBackwardArgs<'a>, DispatchError> {
    match params {
        InvokeParams::TripletMarginLossBackward(args) => Ok(*args),
        other => Err(other.mismatch("TripletMarginLossBackward")),
    }
}

impl Solver for TripletMarginLossForwardSolver {
    type Problem<'a> = TripletMarginLossForwardProblem<'a>;

    fn id(&self) -> &'static str {
        match self {
            Self::Unreduced2d => "TripletMarginLossUnreducedForward2d",
            Self::Reduced2d => "TripletMarginLossReducedForward2d",
        }
    }

    fn is_applicable(&self, _ctx: &SolverContext, problem: &Self::Problem<'_>) -> bool {
        is_well_formed(problem)
            && match self {
                Self::Unreduced2d => problem.reduction() == Reduction::Unreduced,
                Self::Reduced2d => problem.reduction() == Reduction::Reduced,
            }
    }

    fn workspace_size(&self, _ctx: &SolverContext, problem: &Self::Problem<'_>) -> WorkspaceSize {
        match self {
            Self::Unreduced2d => WorkspaceSize::Bytes(0),
            Self::Reduced2d => {
                WorkspaceSize::Bytes(problem.rows() * problem.anchor().dtype().element_size())
            }
        }
    }

    fn solution(
        &self,
        _ctx: &SolverContext,
        problem: &Self::Problem<'_>,
    ) -> Result<ExecutionPlan, DispatchError> {
        let rows = problem.rows();
        let dtype = problem.anchor().dtype();
        let build = kernel_build_params(dtype, dtype);
        let plan = match self {
            Self::Unreduced2d => {
                let kernel = launch(
                    names::TRIPLET_MARGIN_LOSS_FILE,
                    names::TRIPLET_MARGIN_LOSS_UNREDUCED_FORWARD_2D,
                    rows,
                    build,
                );
                ExecutionPlan::new(self.id(), vec![kernel.clone()], 0, move |runtime, params| {
                    let args = forward_args(params)?;
                    let mut launch_args = vec![
                        args.anchor.buffer_arg(),
                        args.anchor.view_arg()?,
                        args.positive.buffer_arg(),
                        args.positive.view_arg()?,
                        args.negative.buffer_arg(),
                        args.negative.view_arg()?,
                        args.output.buffer_arg(),
                        args.output.view_arg()?,
                    ];
                    launch_args.extend(params_args(&args.params));
                    runtime.run(&kernel, &launch_args)?;
                    Ok(())
                })
            }
            Self::Reduced2d => {
                let required = rows * dtype.element_size();
                let forward = launch(
                    names::TRIPLET_MARGIN_LOSS_FILE,
                    names::TRIPLET_MARGIN_LOSS_REDUCED_FORWARD_2D,
                    rows,
                    build.clone(),
                );
                let reduce = launch(names::REDUCE_FILE, names::REDUCE_SUM, rows, build);
                let kernels = vec![forward.clone(), reduce.clone()];
                ExecutionPlan::new(self.id(), kernels, required, move |runtime, params| {
                    let args = forward_args(params)?;
                    let workspace = args.workspace.ok_or(DispatchError::WorkspaceTooSmall {
                        required,
                        provided: 0,
                    })?;
                    let mut launch_args = vec![
                        args.anchor.buffer_arg(),
                        args.anchor.view_arg()?,
                        args.positive.buffer_arg(),
                        args.positive.view_arg()?,
                        args.negative.buffer_arg(),
                        args.negative.view_arg()?,
                        KernelArg::Buffer(workspace),
                    ];
                    launch_args.extend(params_args(&args.params));
                    launch_args.push(KernelArg::Scalar(args.divisor));
                    runtime.run(&forward, &launch_args)?;

                    let rows = args.anchor.desc.shape().first().copied().unwrap_or(0);
                    runtime.run(
                        &reduce,
                        &[
                            KernelArg::Buffer(workspace),
                            count_arg(rows),
                            args.output.buffer_arg(),
                            args.output.view_arg()?,
                        ],
                    )?;
                    Ok(())
                })
            }
        };
        Ok(plan)
    }
}

impl Solver for TripletMarginLossBackwardSolver {
    type Problem<'a> = TripletMarginLossBackwardProblem<'a>;

    fn id(&self) -> &'static str {
        match self {
            Self::Unreduced2d => "TripletMarginLossUnreducedBackward2d",
            Self::Reduced2d => "TripletMarginLossReducedBackward2d",
        }
    }

    fn is_applicable(&self, _ctx: &SolverContext, problem: &Self::Problem<'_>) -> bool {
        is_well_formed(problem)
            && match self {
                Self::Unreduced2d => problem.reduction() == Reduction::Unreduced,
                Self::Reduced2d => problem.reduction() == Reduction::Reduced,
            }
    }

    fn workspace_size(&self, _ctx: &SolverContext, _problem: &Self::Problem<'_>) -> WorkspaceSize {
        WorkspaceSize::Bytes(0)
    }

    fn solution(
        &self,
        _ctx: &SolverContext,
        problem: &Self::Problem<'_>,
    ) -> Result<ExecutionPlan, DispatchError> {
        let dtype = problem.anchor().dtype();
        let reduced = *self == Self::Reduced2d;
        let name = if reduced {
            names::TRIPLET_MARGIN_LOSS_REDUCED_BACKWARD_2D
        } else {
            names::TRIPLET_MARGIN_LOSS_UNREDUCED_BACKWARD_2D
        };
        let kernel = launch(
            names::TRIPLET_MARGIN_LOSS_FILE,
            name,
            problem.rows(),
            kernel_build_params(dtype, dtype),
        );
        Ok(ExecutionPlan::new(
            self.id(),
            vec![kernel.clone()],
            0,
            move |runtime, params| {
                let args = backward_args(params)?;
                let mut launch_args = vec![
                    args.anchor.buffer_arg(),
                    args.anchor.view_arg()?,
                    args.positive.buffer_arg(),
                    args.positive.view_arg()?,
                    args.negative.buffer_arg(),
                    args.negative.view_arg()?,
                    args.output_grad.buffer_arg(),
                    args.output_grad.view_arg()?,
                ];
                launch_args.extend(optional_args(args.anchor_grad)?);
                launch_args.extend(optional_args(args.positive_grad)?);
                launch_args.extend(optional_args(args.negative_grad)?);
                launch_args.extend(params_args(&args.params));
                if reduced {
                    launch_args.push(KernelArg::Scalar(args.divisor));
                }
                runtime.run(&kernel, &launch_args)?;
                Ok(())
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use ft_core::{DType, Device, TensorDescriptor, ValidationMode};
    use ft_device::{BufferId, CpuDevice, DeviceRuntime};
    use ft_kernel_cpu::TripletMarginParams;
    use ft_problem::{Reduction, TripletMarginLossBackwardProblem, TripletMarginLossForwardProblem};

    use super::{TRIPLET_MARGIN_LOSS_BACKWARD, TRIPLET_MARGIN_LOSS_FORWARD};
    use crate::{
        InvokeParams, PlanCache, SolverContext, TensorArg, TripletMarginLossBackwardArgs,
        TripletMarginLossForwardArgs, WorkspaceSize, execute, workspace_size,
    };

    // row 0: d(a,p)=5, d(a,n)=1 -> 1 + 5 - 1 = 5
    // row 1: d(a,p)=0, d(a,n)=5 -> max(1 + 0 - 5, 0) = 0
    const ANCHOR: [f64; 4] = [0.0, 0.0, 1.0, 1.0];
    const POSITIVE: [f64; 4] = [3.0, 4.0, 1.0, 1.0];
    const NEGATIVE: [f64; 4] = [0.0, 1.0, 4.0, 5.0];

    fn exact() -> TripletMarginParams {
        TripletMarginParams {
            eps: 0.0,
            ..TripletMarginParams::default()
        }
    }

    fn cpu() -> SolverContext {
        SolverContext::new(Device::Cpu)
    }

    struct Embeddings {
        device: CpuDevice,
        anchor: BufferId,
        positive: BufferId,
        negative: BufferId,
    }

    fn embeddings() -> Embeddings {
        let mut device = CpuDevice::new();
        let anchor = device.upload(DType::F32, &ANCHOR).expect("upload");
        let positive = device.upload(DType::F32, &POSITIVE).expect("upload");
        let negative = device.upload(DType::F32, &NEGATIVE).expect("upload");
        Embeddings {
            device,
            anchor,
            positive,
            negative,
        }
    }

    #[test]
    fn unreduced_forward_writes_one_loss_per_row() {
        let pair = TensorDescriptor::from_shape(vec![2, 2], DType::F32);
        let rows = TensorDescriptor::from_shape(vec![2], DType::F32);
        let problem = TripletMarginLossForwardProblem::build(
            &pair,
            &pair,
            &pair,
            &rows,
            Reduction::Unreduced,
            ValidationMode::Raise,
        )
        .expect("valid problem");

        let mut setup = embeddings();
        let output = setup.device.allocate(DType::F32, 2).expect("allocate");
        let params = InvokeParams::TripletMarginLossForward(TripletMarginLossForwardArgs {
            anchor: TensorArg::new(setup.anchor, &pair),
            positive: TensorArg::new(setup.positive, &pair),
            negative: TensorArg::new(setup.negative, &pair),
            output: TensorArg::new(output, &rows),
            workspace: None,
            params: exact(),
            divisor: 1.0,
        });
        let report = execute(
            &TRIPLET_MARGIN_LOSS_FORWARD,
            &PlanCache::new(4),
            &cpu(),
            &mut setup.device,
            &problem,
            &params,
        )
        .expect("forward execution");
        assert_eq!(report.solver_id, "TripletMarginLossUnreducedForward2d");

        let out = setup.device.read(output).expect("read");
        assert!((out[0] - 5.0).abs() < 1e-12);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn reduced_forward_averages_rows() {
        let pair = TensorDescriptor::from_shape(vec![2, 2], DType::F32);
        let scalar = TensorDescriptor::from_shape(vec![1], DType::F32);
        let problem = TripletMarginLossForwardProblem::build(
            &pair,
            &pair,
            &pair,
            &scalar,
            Reduction::Reduced,
            ValidationMode::Raise,
        )
        .expect("valid problem");
        assert_eq!(
            workspace_size(&TRIPLET_MARGIN_LOSS_FORWARD, &cpu(), &problem),
            WorkspaceSize::Bytes(8)
        );

        let mut setup = embeddings();
        let output = setup.device.allocate(DType::F32, 1).expect("allocate");
        let workspace = setup.device.allocate(DType::F32, 2).expect("allocate");
        let params = InvokeParams::TripletMarginLossForward(TripletMarginLossForwardArgs {
            anchor: TensorArg::new(setup.anchor, &pair),
            positive: TensorArg::new(setup.positive, &pair),
            negative: TensorArg::new(setup.negative, &pair),
            output: TensorArg::new(output, &scalar),
            workspace: Some(workspace),
            params: exact(),
            divisor: 2.0,
        });
        let report = execute(
            &TRIPLET_MARGIN_LOSS_FORWARD,
            &PlanCache::new(4),
            &cpu(),
            &mut setup.device,
            &problem,
            &params,
        )
        .expect("reduced execution");
        assert_eq!(report.launches, 2);
        assert_eq!(setup.device.launches(), ["TripletMarginLossReducedForward2d", "ReduceSum"]);

        let out = setup.device.read(output).expect("read");
        assert!((out[0] - 2.5).abs() < 1e-12);
    }

    #[test]
    fn unreduced_backward_skips_inactive_rows_and_omitted_gradients() {
        let pair = TensorDescriptor::from_shape(vec![2, 2], DType::F32);
        let rows = TensorDescriptor::from_shape(vec![2], DType::F32);
        let problem = TripletMarginLossBackwardProblem::build(
            &pair,
            &pair,
            &pair,
            &rows,
            &pair,
            &pair,
            &pair,
            Reduction::Unreduced,
            ValidationMode::Raise,
        )
        .expect("valid backward problem");

        let mut setup = embeddings();
        let output_grad = setup.device.upload(DType::F32, &[1.0, 1.0]).expect("upload");
        let anchor_grad = setup.device.allocate(DType::F32, 4).expect("allocate");
        let params = InvokeParams::TripletMarginLossBackward(TripletMarginLossBackwardArgs {
            anchor: TensorArg::new(setup.anchor, &pair),
            positive: TensorArg::new(setup.positive, &pair),
            negative: TensorArg::new(setup.negative, &pair),
            output_grad: TensorArg::new(output_grad, &rows),
            anchor_grad: Some(TensorArg::new(anchor_grad, &pair)),
            positive_grad: None,
            negative_grad: None,
            params: exact(),
            divisor: 1.0,
        });
        let report = execute(
            &TRIPLET_MARGIN_LOSS_BACKWARD,
            &PlanCache::new(4),
            &cpu(),
            &mut setup.device,
            &problem,
            &params,
        )
        .expect("backward execution");
        assert_eq!(report.solver_id, "TripletMarginLossUnreducedBackward2d");

        // (a - p) / 5 - (a - n) / 1 on row 0; row 1 is past the margin
        let grad = setup.device.read(anchor_grad).expect("read");
        let expected = [-0.6, 0.2, 0.0, 0.0];
        for (got, want) in grad.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn rank_three_anchor_has_no_solver() {
        let cube = TensorDescriptor::from_shape(vec![2, 2, 2], DType::F32);
        let rows = TensorDescriptor::from_shape(vec![2], DType::F32);
        let problem = TripletMarginLossForwardProblem::new(
            &cube,
            &cube,
            &cube,
            &rows,
            Reduction::Unreduced,
            ValidationMode::Advisory,
        );
        assert_eq!(
            workspace_size(&TRIPLET_MARGIN_LOSS_FORWARD, &cpu(), &problem),
            WorkspaceSize::Unsupported
        );
    }
}
