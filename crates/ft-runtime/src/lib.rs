#![forbid(unsafe_code)]

//! Execution context: configuration, plan-cache ownership and the evidence
//! ledger every dispatch decision is recorded in.

use std::fmt;

use ft_core::{Device, ValidationMode};
use ft_device::DeviceRuntime;
use ft_dispatch::{
    DispatchError, ExecutionReport, InvokeParams, PlanCache, Solver, SolverContext,
    SolverRegistry, WorkspaceSize,
};
use ft_kernel_cpu::XorwowState;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Policy,
    Dispatch,
    Cache,
    Workspace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    pub fn of_kind(&self, kind: EvidenceKind) -> impl Iterator<Item = &EvidenceEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One JSON object per line, in recording order.
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        let mut lines = String::new();
        for entry in &self.entries {
            lines.push_str(&serde_json::to_string(entry)?);
            lines.push('\n');
        }
        Ok(lines)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub validation: ValidationMode,
    /// Plans kept before the least recently used one is evicted; 0 disables
    /// caching.
    pub plan_cache_capacity: usize,
    /// Size of the generator-state pool handed to stochastic operators.
    pub generator_states: usize,
    pub generator_seed: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            validation: ValidationMode::from_build(),
            plan_cache_capacity: PlanCache::DEFAULT_CAPACITY,
            generator_states: Self::DEFAULT_GENERATOR_STATES,
            generator_seed: 0,
        }
    }
}

impl RuntimeConfig {
    pub const DEFAULT_GENERATOR_STATES: usize = 1024;

    pub const VALIDATION_VAR: &'static str = "FT_VALIDATION";
    pub const PLAN_CACHE_CAPACITY_VAR: &'static str = "FT_PLAN_CACHE_CAPACITY";
    pub const GENERATOR_STATES_VAR: &'static str = "FT_GENERATOR_STATES";
    pub const GENERATOR_SEED_VAR: &'static str = "FT_GENERATOR_SEED";

    /// Defaults overridden by the `FT_*` environment variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup(Self::VALIDATION_VAR) {
            config.validation = match value.trim().to_ascii_lowercase().as_str() {
                "raise" => ValidationMode::Raise,
                "advisory" => ValidationMode::Advisory,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: Self::VALIDATION_VAR,
                        value,
                        expected: "raise or advisory",
                    });
                }
            };
        }
        if let Some(value) = lookup(Self::PLAN_CACHE_CAPACITY_VAR) {
            config.plan_cache_capacity = parse(Self::PLAN_CACHE_CAPACITY_VAR, value)?;
        }
        if let Some(value) = lookup(Self::GENERATOR_STATES_VAR) {
            config.generator_states = parse(Self::GENERATOR_STATES_VAR, value)?;
        }
        if let Some(value) = lookup(Self::GENERATOR_SEED_VAR) {
            config.generator_seed = parse(Self::GENERATOR_SEED_VAR, value)?;
        }
        Ok(config)
    }

    /// Deterministic pool: state `i` is subsequence `i` of the seed.
    #[must_use]
    pub fn generator_pool(&self) -> Vec<XorwowState> {
        (0..self.generator_states as u64)
            .map(|subsequence| XorwowState::seeded(self.generator_seed, subsequence))
            .collect()
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key,
            value,
            expected: "a non-negative integer",
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue {
                key,
                value,
                expected,
            } => write!(f, "invalid {key}={value:?}: expected {expected}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Owns the plan cache for its lifetime and records every dispatch decision.
#[derive(Debug)]
pub struct RuntimeContext {
    config: RuntimeConfig,
    solver_ctx: SolverContext,
    cache: PlanCache,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(config: RuntimeConfig, device: Device) -> Self {
        let solver_ctx =
            SolverContext::new(device).with_generator_states(config.generator_states);
        let cache = PlanCache::new(config.plan_cache_capacity);
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::Policy,
            format!(
                "context initialized device={device:?} validation={} plan_cache_capacity={} generator_states={} generator_seed={}",
                config.validation.label(),
                config.plan_cache_capacity,
                config.generator_states,
                config.generator_seed
            ),
        );
        Self {
            config,
            solver_ctx,
            cache,
            ledger,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn validation(&self) -> ValidationMode {
        self.config.validation
    }

    pub fn set_validation(&mut self, mode: ValidationMode) {
        self.config.validation = mode;
        self.ledger.record(
            EvidenceKind::Policy,
            format!("validation switched to {}", mode.label()),
        );
    }

    #[must_use]
    pub fn solver_context(&self) -> &SolverContext {
        &self.solver_ctx
    }

    #[must_use]
    pub fn plan_cache(&self) -> &PlanCache {
        &self.cache
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }

    pub fn workspace_size<S: Solver>(
        &mut self,
        registry: &SolverRegistry<S>,
        problem: &S::Problem<'_>,
    ) -> WorkspaceSize {
        let size = ft_dispatch::workspace_size(registry, &self.solver_ctx, problem);
        self.ledger.record(
            EvidenceKind::Workspace,
            format!("registry={} workspace={size}", registry.name()),
        );
        size
    }

    /// Runs `problem` through `registry`, recording the outcome.
    pub fn dispatch<S: Solver>(
        &mut self,
        registry: &SolverRegistry<S>,
        runtime: &mut dyn DeviceRuntime,
        problem: &S::Problem<'_>,
        params: &InvokeParams<'_>,
    ) -> Result<ExecutionReport, DispatchError> {
        let evictions_before = self.cache.stats().evictions;
        let result = ft_dispatch::execute(
            registry,
            &self.cache,
            &self.solver_ctx,
            runtime,
            problem,
            params,
        );
        match &result {
            Ok(report) => self.ledger.record(
                EvidenceKind::Dispatch,
                format!(
                    "registry={} solver={} cache_hit={} workspace_bytes={} launches={} fingerprint={}",
                    registry.name(),
                    report.solver_id,
                    report.cache_hit,
                    report.workspace_bytes,
                    report.launches,
                    report.fingerprint
                ),
            ),
            Err(error) => self.ledger.record(
                EvidenceKind::Dispatch,
                format!("registry={} error={error}", registry.name()),
            ),
        }

        let evicted = self.cache.stats().evictions - evictions_before;
        if evicted > 0 {
            self.ledger.record(
                EvidenceKind::Cache,
                format!(
                    "evicted={evicted} len={} capacity={}",
                    self.cache.len(),
                    self.cache.capacity()
                ),
            );
        }
        result
    }

    /// Drops every cached plan, leaving a final cache record.
    pub fn teardown(&mut self) -> usize {
        let stats = self.cache.stats();
        let cleared = self.cache.clear();
        self.ledger.record(
            EvidenceKind::Cache,
            format!(
                "teardown cleared={cleared} hits={} misses={} inserts={} evictions={}",
                stats.hits, stats.misses, stats.inserts, stats.evictions
            ),
        );
        cleared
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
