use ft_core::TensorDescriptor;
use ft_device::KernelArg;
use ft_kernel_cpu::names;
use ft_problem::{
    ProblemDescription, Reduction, SmoothL1LossBackwardProblem, SmoothL1LossForwardProblem, holds,
};

use crate::{
    DispatchError, ExecutionPlan, InvokeParams, SmoothL1LossBackwardArgs, SmoothL1LossForwardArgs,
    Solver, SolverContext, SolverRegistry, TensorArg, WorkspaceSize, count_arg, is_well_formed,
    kernel_build_params, launch, optional_args,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmoothL1LossForwardSolver {
    UnreducedContiguous,
    Unreduced5d,
    Reduced5d,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmoothL1LossBackwardSolver {
    UnreducedContiguous,
    Unreduced5d,
    Reduced5d,
}

pub const SMOOTH_L1_LOSS_FORWARD: SolverRegistry<SmoothL1LossForwardSolver> = SolverRegistry::new(
    "SmoothL1LossForward",
    &[
        SmoothL1LossForwardSolver::UnreducedContiguous,
        SmoothL1LossForwardSolver::Unreduced5d,
        SmoothL1LossForwardSolver::Reduced5d,
    ],
);

pub const SMOOTH_L1_LOSS_BACKWARD: SolverRegistry<SmoothL1LossBackwardSolver> =
    SolverRegistry::new(
        "SmoothL1LossBackward",
        &[
            SmoothL1LossBackwardSolver::UnreducedContiguous,
            SmoothL1LossBackwardSolver::Unreduced5d,
            SmoothL1LossBackwardSolver::Reduced5d,
        ],
    );

/// One partial loss per element ahead of the final sum.
fn partials_bytes(input: &TensorDescriptor) -> usize {
    input.numel() * input.dtype().element_size()
}

fn forward_args<'a>(
    params: &InvokeParams<'a>,
) -> Result<SmoothL1LossForwardArgs<'a>, DispatchError> {
    match params {
        InvokeParams::SmoothL1LossForward(args) => Ok(*args),
        other => Err(other.mismatch("SmoothL1LossForward")),
    }
}

fn backward_args<'a>(
    params: &InvokeParams<'a>,
) -> Result<SmoothL1LossBackwardArgs<'a>, DispatchError> {
    match params {
        InvokeParams::SmoothL1LossBackward(args) => Ok(*args),
        other => Err(other.mismatch("SmoothL1LossBackward")),
    }
}

impl Solver for SmoothL1LossForwardSolver {
    type Problem<'a> = SmoothL1LossForwardProblem<'a>;

    fn id(&self) -> &'static str {
        match self {
            Self::UnreducedContiguous => "SmoothL1LossUnreducedForwardContiguous",
            Self::Unreduced5d => "SmoothL1LossUnreducedForward5d",
            Self::Reduced5d => "SmoothL1LossReducedForward5d",
        }
    }

    fn is_applicable(&self, _ctx: &SolverContext, problem: &Self::Problem<'_>) -> bool {
        if !is_well_formed(problem) {
            return false;
        }
        match self {
            Self::UnreducedContiguous => {
                problem.reduction() == Reduction::Unreduced && holds(problem.is_all_contiguous())
            }
            Self::Unreduced5d => problem.reduction() == Reduction::Unreduced,
            Self::Reduced5d => problem.reduction() == Reduction::Reduced,
        }
    }

    fn workspace_size(&self, _ctx: &SolverContext, problem: &Self::Problem<'_>) -> WorkspaceSize {
        match self {
            Self::Reduced5d => WorkspaceSize::Bytes(partials_bytes(problem.input())),
            Self::UnreducedContiguous | Self::Unreduced5d => WorkspaceSize::Bytes(0),
        }
    }

    fn solution(
        &self,
        _ctx: &SolverContext,
        problem: &Self::Problem<'_>,
    ) -> Result<ExecutionPlan, DispatchError> {
        let numel = problem.input().numel();
        let build = kernel_build_params(problem.input().dtype(), problem.output().dtype());
        let plan = match self {
            Self::UnreducedContiguous => {
                let kernel = launch(
                    names::SMOOTH_L1_LOSS_FILE,
                    names::SMOOTH_L1_LOSS_UNREDUCED_FORWARD_CONTIGUOUS,
                    numel,
                    build,
                );
                ExecutionPlan::new(self.id(), vec![kernel.clone()], 0, move |runtime, params| {
                    let args = forward_args(params)?;
                    runtime.run(
                        &kernel,
                        &[
                            args.input.buffer_arg(),
                            args.target.buffer_arg(),
                            args.output.buffer_arg(),
                            count_arg(args.input.desc.numel()),
                            KernelArg::Scalar(args.beta),
                        ],
                    )?;
                    Ok(())
                })
            }
            Self::Unreduced5d => {
                let kernel = launch(
                    names::SMOOTH_L1_LOSS_FILE,
                    names::SMOOTH_L1_LOSS_UNREDUCED_FORWARD_5D,
                    numel,
                    build,
                );
                ExecutionPlan::new(self.id(), vec![kernel.clone()], 0, move |runtime, params| {
                    let args = forward_args(params)?;
                    runtime.run(
                        &kernel,
                        &[
                            args.input.buffer_arg(),
                            args.input.view_arg()?,
                            args.target.buffer_arg(),
                            args.target.view_arg()?,
                            args.output.buffer_arg(),
                            args.output.view_arg()?,
                            KernelArg::Scalar(args.beta),
                        ],
                    )?;
                    Ok(())
                })
            }
            Self::Reduced5d => {
                let required = partials_bytes(problem.input());
                let forward = launch(
                    names::SMOOTH_L1_LOSS_FILE,
                    names::SMOOTH_L1_LOSS_REDUCED_FORWARD_5D,
                    numel,
                    build.clone(),
                );
                let reduce = launch(names::REDUCE_FILE, names::REDUCE_SUM, numel, build);
                let kernels = vec![forward.clone(), reduce.clone()];
                ExecutionPlan::new(self.id(), kernels, required, move |runtime, params| {
                    let args = forward_args(params)?;
                    let workspace = args.workspace.ok_or(DispatchError::WorkspaceTooSmall {
                        required,
                        provided: 0,
                    })?;
                    runtime.run(
                        &forward,
                        &[
                            args.input.buffer_arg(),
                            args.input.view_arg()?,
                            args.target.buffer_arg(),
                            args.target.view_arg()?,
                            KernelArg::Buffer(workspace),
                            KernelArg::Scalar(args.beta),
                            KernelArg::Scalar(args.divisor),
                        ],
                    )?;
                    runtime.run(
                        &reduce,
                        &[
                            KernelArg::Buffer(workspace),
                            count_arg(args.input.desc.numel()),
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

impl Solver for SmoothL1LossBackwardSolver {
    type Problem<'a> = SmoothL1LossBackwardProblem<'a>;

    fn id(&self) -> &'static str {
        match self {
            Self::UnreducedContiguous => "SmoothL1LossUnreducedBackwardContiguous",
            Self::Unreduced5d => "SmoothL1LossUnreducedBackward5d",
            Self::Reduced5d => "SmoothL1LossReducedBackward5d",
        }
    }

    /// Gradients are scattered one element per offset, so every operand
    /// must be packed.
    fn is_applicable(&self, _ctx: &SolverContext, problem: &Self::Problem<'_>) -> bool {
        if !is_well_formed(problem) || !holds(problem.is_fully_packed()) {
            return false;
        }
        match self {
            Self::UnreducedContiguous => {
                problem.reduction() == Reduction::Unreduced && holds(problem.is_all_contiguous())
            }
            Self::Unreduced5d => problem.reduction() == Reduction::Unreduced,
            Self::Reduced5d => problem.reduction() == Reduction::Reduced,
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
        let numel = problem.input().numel();
        let build = kernel_build_params(problem.input().dtype(), problem.input_grad().dtype());
        let plan = match self {
            Self::UnreducedContiguous => {
                let kernel = launch(
                    names::SMOOTH_L1_LOSS_FILE,
                    names::SMOOTH_L1_LOSS_UNREDUCED_BACKWARD_CONTIGUOUS,
                    numel,
                    build,
                );
                ExecutionPlan::new(self.id(), vec![kernel.clone()], 0, move |runtime, params| {
                    let args = backward_args(params)?;
                    runtime.run(
                        &kernel,
                        &[
                            args.input.buffer_arg(),
                            args.target.buffer_arg(),
                            args.output_grad.buffer_arg(),
                            args.input_grad.map_or(KernelArg::Null, TensorArg::buffer_arg),
                            args.target_grad.map_or(KernelArg::Null, TensorArg::buffer_arg),
                            count_arg(args.input.desc.numel()),
                            KernelArg::Scalar(args.beta),
                        ],
                    )?;
                    Ok(())
                })
            }
            Self::Unreduced5d | Self::Reduced5d => {
                let reduced = *self == Self::Reduced5d;
                let name = if reduced {
                    names::SMOOTH_L1_LOSS_REDUCED_BACKWARD_5D
                } else {
                    names::SMOOTH_L1_LOSS_UNREDUCED_BACKWARD_5D
                };
                let kernel = launch(names::SMOOTH_L1_LOSS_FILE, name, numel, build);
                ExecutionPlan::new(self.id(), vec![kernel.clone()], 0, move |runtime, params| {
                    let args = backward_args(params)?;
                    let [input_grad, input_grad_view] = optional_args(args.input_grad)?;
                    let [target_grad, target_grad_view] = optional_args(args.target_grad)?;
                    let mut launch_args = vec![
                        args.input.buffer_arg(),
                        args.input.view_arg()?,
                        args.target.buffer_arg(),
                        args.target.view_arg()?,
                        args.output_grad.buffer_arg(),
                        args.output_grad.view_arg()?,
                        input_grad,
                        input_grad_view,
                        target_grad,
                        target_grad_view,
                        KernelArg::Scalar(args.beta),
                    ];
                    if reduced {
                        launch_args.push(KernelArg::Scalar(args.divisor));
                    }
                    runtime.run(&kernel, &launch_args)?;
                    Ok(())
                })
            }
        };
        Ok(plan)
    }
}
