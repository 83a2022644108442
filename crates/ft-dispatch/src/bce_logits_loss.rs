use ft_core::TensorDescriptor;
use ft_device::KernelArg;
use ft_kernel_cpu::names;
use ft_problem::{BceLogitsLossBackwardProblem, BceLogitsLossForwardProblem};

use crate::{
    BceLogitsLossBackwardArgs, BceLogitsLossForwardArgs, DispatchError, ExecutionPlan,
    InvokeParams, Solver, SolverContext, SolverRegistry, WorkspaceSize, count_arg, is_well_formed,
    kernel_build_params, launch, optional_args,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BceLogitsLossForwardSolver {
    Reduced5d,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BceLogitsLossBackwardSolver {
    Reduced5d,
}

pub const BCE_LOGITS_LOSS_FORWARD: SolverRegistry<BceLogitsLossForwardSolver> =
    SolverRegistry::new("BceLogitsLossForward", &[BceLogitsLossForwardSolver::Reduced5d]);

pub const BCE_LOGITS_LOSS_BACKWARD: SolverRegistry<BceLogitsLossBackwardSolver> =
    SolverRegistry::new(
        "BceLogitsLossBackward",
        &[BceLogitsLossBackwardSolver::Reduced5d],
    );

fn partials_bytes(input: &TensorDescriptor) -> usize {
    input.numel() * input.dtype().element_size()
}

fn forward_args<'a>(
    params: &InvokeParams<'a>,
) -> Result<BceLogitsLossForwardArgs<'a>, DispatchError> {
    match params {
        InvokeParams::BceLogitsLossForward(args) => Ok(*args),
        other => Err(other.mismatch("BceLogitsLossForward")),
    }
}

fn backward_args<'a>(
    params: &InvokeParams<'a>,
) -> Result<BceLogitsLossBackwardArgs<'a>, DispatchError> {
    match params {
        InvokeParams::BceLogitsLossBackward(args) => Ok(*args),
        other => Err(other.mismatch("BceLogitsLossBackward")),
    }
}

impl Solver for BceLogitsLossForwardSolver {
    type Problem<'a> = BceLogitsLossForwardProblem<'a>;

    fn id(&self) -> &'static str {
        "BCELogitsLossReducedForward5d"
    }

    fn is_applicable(&self, _ctx: &SolverContext, problem: &Self::Problem<'_>) -> bool {
        is_well_formed(problem)
    }

    fn workspace_size(&self, _ctx: &SolverContext, problem: &Self::Problem<'_>) -> WorkspaceSize {
        WorkspaceSize::Bytes(partials_bytes(problem.input()))
    }

    fn solution(
        &self,
        _ctx: &SolverContext,
        problem: &Self::Problem<'_>,
    ) -> Result<ExecutionPlan, DispatchError> {
        let numel = problem.input().numel();
        let required = partials_bytes(problem.input());
        let build = kernel_build_params(problem.input().dtype(), problem.output().dtype());
        let forward = launch(
            names::BCE_LOGITS_LOSS_FILE,
            names::BCE_LOGITS_LOSS_REDUCED_FORWARD_5D,
            numel,
            build.clone(),
        );
        let reduce = launch(names::REDUCE_FILE, names::REDUCE_SUM, numel, build);
        let kernels = vec![forward.clone(), reduce.clone()];
        Ok(ExecutionPlan::new(
            self.id(),
            kernels,
            required,
            move |runtime, params| {
                let args = forward_args(params)?;
                let workspace = args.workspace.ok_or(DispatchError::WorkspaceTooSmall {
                    required,
                    provided: 0,
                })?;
                let [weight, weight_view] = optional_args(args.weight)?;
                let [pos_weight, pos_weight_view] = optional_args(args.pos_weight)?;
                runtime.run(
                    &forward,
                    &[
                        args.input.buffer_arg(),
                        args.input.view_arg()?,
                        args.target.buffer_arg(),
                        args.target.view_arg()?,
                        weight,
                        weight_view,
                        pos_weight,
                        pos_weight_view,
                        KernelArg::Buffer(workspace),
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
            },
        ))
    }
}

impl Solver for BceLogitsLossBackwardSolver {
    type Problem<'a> = BceLogitsLossBackwardProblem<'a>;

    fn id(&self) -> &'static str {
        "BCELogitsLossReducedBackward5d"
    }

    fn is_applicable(&self, _ctx: &SolverContext, problem: &Self::Problem<'_>) -> bool {
        is_well_formed(problem)
    }

    fn workspace_size(&self, _ctx: &SolverContext, _problem: &Self::Problem<'_>) -> WorkspaceSize {
        WorkspaceSize::Bytes(0)
    }

    fn solution(
        &self,
        _ctx: &SolverContext,
        problem: &Self::Problem<'_>,
    ) -> Result<ExecutionPlan, DispatchError> {
        let kernel = launch(
            names::BCE_LOGITS_LOSS_FILE,
            names::BCE_LOGITS_LOSS_REDUCED_BACKWARD_5D,
            problem.input().numel(),
            kernel_build_params(problem.input().dtype(), problem.output_grad().dtype()),
        );
        Ok(ExecutionPlan::new(
            self.id(),
            vec![kernel.clone()],
            0,
            move |runtime, params| {
                let args = backward_args(params)?;
                let [weight, weight_view] = optional_args(args.weight)?;
                let [pos_weight, pos_weight_view] = optional_args(args.pos_weight)?;
                let [input_grad, input_grad_view] = optional_args(args.input_grad)?;
                let [target_grad, target_grad_view] = optional_args(args.target_grad)?;
                runtime.run(
                    &kernel,
                    &[
                        args.input.buffer_arg(),
                        args.input.view_arg()?,
                        args.target.buffer_arg(),
                        args.target.view_arg()?,
                        weight,
                        weight_view,
                        pos_weight,
                        pos_weight_view,
                        args.output_grad.buffer_arg(),
                        args.output_grad.view_arg()?,
                        input_grad,
                        input_grad_view,
                        target_grad,
                        target_grad_view,
                        KernelArg::Scalar(args.divisor),
                    ],
                )?;
                Ok(())
            },
        ))
    }
}
