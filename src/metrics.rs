//! Orchestrator Metrics
//!
//! Prometheus counters for sagas, steps and compensations. Each instance owns
//! its registry so several orchestrators (and tests) do not collide.

use crate::error::{Error, Result};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

/// Saga and step metrics
#[derive(Clone)]
pub struct OrchestratorMetrics {
    registry: Registry,
    sagas: IntCounterVec,
    steps: IntCounterVec,
    compensations: IntCounterVec,
    saga_duration: Histogram,
}

impl OrchestratorMetrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let sagas = IntCounterVec::new(
            Opts::new("topology_sagas_total", "Finished sagas by outcome"),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let steps = IntCounterVec::new(
            Opts::new("topology_saga_steps_total", "Step state transitions"),
            &["state"],
        )
        .map_err(metrics_error)?;
        let compensations = IntCounterVec::new(
            Opts::new("topology_compensations_total", "Compensations by result"),
            &["result"],
        )
        .map_err(metrics_error)?;
        let saga_duration = Histogram::with_opts(
            HistogramOpts::new("topology_saga_duration_seconds", "Duration of saga executions")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        )
        .map_err(metrics_error)?;

        registry.register(Box::new(sagas.clone())).map_err(metrics_error)?;
        registry.register(Box::new(steps.clone())).map_err(metrics_error)?;
        registry
            .register(Box::new(compensations.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(saga_duration.clone()))
            .map_err(metrics_error)?;

        Ok(Arc::new(Self {
            registry,
            sagas,
            steps,
            compensations,
            saga_duration,
        }))
    }

    #[inline]
    pub fn record_step(&self, state: &str) {
        self.steps.with_label_values(&[state]).inc();
    }

    #[inline]
    pub fn record_compensation(&self, result: &str) {
        self.compensations.with_label_values(&[result]).inc();
    }

    pub fn record_saga(&self, outcome: &str, elapsed: Duration) {
        self.sagas.with_label_values(&[outcome]).inc();
        self.saga_duration.observe(elapsed.as_secs_f64());
    }

    pub fn step_count(&self, state: &str) -> u64 {
        self.steps.with_label_values(&[state]).get()
    }

    pub fn saga_count(&self, outcome: &str) -> u64 {
        self.sagas.with_label_values(&[outcome]).get()
    }

    pub fn compensation_count(&self, result: &str) -> u64 {
        self.compensations.with_label_values(&[result]).get()
    }

    /// Text exposition of every metric in this registry
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

impl std::fmt::Debug for OrchestratorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorMetrics").finish_non_exhaustive()
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
