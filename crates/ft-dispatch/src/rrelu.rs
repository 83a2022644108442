use ft_device::KernelArg;
use ft_kernel_cpu::names;
use ft_problem::{RReluBackwardProblem, RReluForwardProblem};

use crate::{
    DispatchError, ExecutionPlan, InvokeParams, RReluBackwardArgs, RReluForwardArgs, Solver,
    SolverContext, SolverRegistry, WorkspaceSize, is_well_formed, kernel_build_params, launch,
    stochastic_worker_count,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RReluForwardSolver {
    Forward5d,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RReluBackwardSolver {
    Backward5d,
}

pub const RRELU_FORWARD: SolverRegistry<RReluForwardSolver> =
    SolverRegistry::new("RReluForward", &[RReluForwardSolver::Forward5d]);

pub const RRELU_BACKWARD: SolverRegistry<RReluBackwardSolver> =
    SolverRegistry::new("RReluBackward", &[RReluBackwardSolver::Backward5d]);

fn forward_args<'a>(params: &InvokeParams<'a>) -> Result<RReluForwardArgs<'a>, DispatchError> {
    match params {
        InvokeParams::RReluForward(args) => Ok(*args),
        other => Err(other.mismatch("RReluForward")),
    }
}

fn backward_args<'a>(params: &InvokeParams<'a>) -> Result<RReluBackwardArgs<'a>, DispatchError> {
    match params {
        InvokeParams::RReluBackward(args) => Ok(*args),
        other => Err(other.mismatch("RReluBackward")),
    }
}

impl Solver for RReluForwardSolver {
    type Problem<'a> = RReluForwardProblem<'a>;

    fn id(&self) -> &'static str {
        "RReluForward5d"
    }

    /// Needs a non-empty generator pool to draw from.
    fn is_applicable(&self, ctx: &SolverContext, problem: &Self::Problem<'_>) -> bool {
        ctx.generator_states() > 0 && is_well_formed(problem)
    }

    fn workspace_size(&self, _ctx: &SolverContext, _problem: &Self::Problem<'_>) -> WorkspaceSize {
        WorkspaceSize::Bytes(0)
    }

    fn solution(
        &self,
        ctx: &SolverContext,
        problem: &Self::Problem<'_>,
    ) -> Result<ExecutionPlan, DispatchError> {
        let states = ctx.generator_states();
        let workers = stochastic_worker_count(problem.input().numel(), states);
        let kernel = launch(
            names::RRELU_FILE,
            names::RRELU_FORWARD_5D,
            workers,
            kernel_build_params(problem.input().dtype(), problem.output().dtype()),
        );
        Ok(ExecutionPlan::new(
            self.id(),
            vec![kernel.clone()],
            0,
            move |runtime, params| {
                let args = forward_args(params)?;
                // The launch grid was sized for this pool.
                let actual = runtime.state_count(args.states)?;
                if actual != states {
                    return Err(DispatchError::GeneratorStateMismatch {
                        expected: states,
                        actual,
                    });
                }
                runtime.run(
                    &kernel,
                    &[
                        KernelArg::Buffer(args.states),
                        args.input.buffer_arg(),
                        args.input.view_arg()?,
                        args.output.buffer_arg(),
                        args.output.view_arg()?,
                        KernelArg::Buffer(args.noise),
                        KernelArg::Scalar(args.lower),
                        KernelArg::Scalar(args.upper),
                    ],
                )?;
                Ok(())
            },
        ))
    }
}

impl Solver for RReluBackwardSolver {
    type Problem<'a> = RReluBackwardProblem<'a>;

    fn id(&self) -> &'static str {
        "RReluBackward5d"
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
            names::RRELU_FILE,
            names::RRELU_BACKWARD_5D,
            problem.output_grad().numel(),
            kernel_build_params(problem.output_grad().dtype(), problem.input_grad().dtype()),
        );
        Ok(ExecutionPlan::new(
            self.id(),
            vec![kernel.clone()],
            0,
            move |runtime, params| {
                let args = backward_args(params)?;
                runtime.run(
                    &kernel,
                    &[
                        KernelArg::Buffer(args.noise),
                        args.output_grad.buffer_arg(),
                        args.output_grad.view_arg()?,
                        args.input_grad.buffer_arg(),
                        args.input_grad.view_arg()?,
                    ],
                )?;
                Ok(())
            },
        ))
    }
}
