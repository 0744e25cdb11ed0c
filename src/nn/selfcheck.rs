use super::backend::Activations;
use super::backend::Backend;
use super::backend::Cpu;
use super::error::EvaluatorError;
use super::planes::Plane;
use super::weights::Weights;
use crate::CHECK_ABSOLUTE_FLOOR;
use crate::CHECK_MIN_EXPANSIONS;
use crate::CHECK_RELATIVE_ERROR;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

/// cross-validates an accelerator against the host pipeline on a random
/// sample of calls. transient disagreements spend from a credit balance
/// that every clean call slowly refills; reproducible disagreements and
/// an exhausted balance both stop the engine, because a backend that
/// cannot be trusted must not pick moves.
pub struct SelfCheck<B> {
    inner: B,
    reference: Cpu,
    /// one audit per this many calls, on average
    probability: u32,
    /// credit spent per mismatching output
    unit: i64,
    credit: AtomicI64,
}

impl<B> SelfCheck<B> {
    pub fn new(inner: B, probability: u32) -> Self {
        let probability = probability.max(1);
        let unit = (CHECK_MIN_EXPANSIONS as f64 / probability as f64 / 2.0).ceil() as i64;
        Self {
            inner,
            reference: Cpu,
            probability,
            unit,
            credit: AtomicI64::new(unit),
        }
    }

    fn ceiling(&self) -> i64 {
        3 * self.unit
    }

    fn accrue(&self) {
        let _ = self
            .credit
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some((c + 1).min(self.ceiling()))
            });
    }

    /// false once the balance cannot cover the spend
    fn spend(&self) -> bool {
        self.credit.fetch_sub(self.unit, Ordering::Relaxed) >= self.unit
    }
}

impl<B: Backend> Backend for SelfCheck<B> {
    fn evaluate(&self, weights: &Weights, planes: &[Plane]) -> Result<Activations, EvaluatorError> {
        use rand::Rng;
        let out = self.inner.evaluate(weights, planes)?;
        self.accrue();
        if rand::rng().random_range(0..self.probability) == 0 {
            self.audit(weights, planes, &out)?;
        }
        Ok(out)
    }

    fn describe(&self) -> String {
        format!("{} (self-checked 1/{})", self.inner.describe(), self.probability)
    }
}

impl<B: Backend> SelfCheck<B> {
    fn audit(
        &self,
        weights: &Weights,
        planes: &[Plane],
        observed: &Activations,
    ) -> Result<(), EvaluatorError> {
        let expected = self.reference.evaluate(weights, planes)?;
        let (faults, worst) = mismatches(observed, &expected);
        if faults == 0 {
            return Ok(());
        }
        // a wrong answer the backend stands by on retry is a hard failure
        let retry = self.inner.evaluate(weights, planes)?;
        if mismatches(&retry, &expected).0 > 0 {
            return Err(EvaluatorError::Mismatch(format!(
                "{}: {} outputs off, worst error {:.3}",
                self.inner.describe(),
                faults,
                worst
            )));
        }
        for _ in 0..faults {
            if !self.spend() {
                return Err(EvaluatorError::Unstable(format!(
                    "{}: worst error {:.3}",
                    self.inner.describe(),
                    worst
                )));
            }
        }
        log::warn!(
            "{}: tolerated {} transient mismatches, worst error {:.3}",
            self.inner.describe(),
            faults,
            worst
        );
        Ok(())
    }
}

/// count of outputs beyond tolerance, and the worst error seen. tiny
/// magnitudes are clamped before the division; disagreeing signs on
/// non-zero outputs count as maximally wrong.
fn mismatches(observed: &Activations, expected: &Activations) -> (usize, f32) {
    observed
        .policy
        .iter()
        .chain(observed.value.iter())
        .zip(expected.policy.iter().chain(expected.value.iter()))
        .map(|(&o, &e)| discrepancy(o, e))
        .fold((0, 0.0), |(n, worst), error| {
            if error > CHECK_RELATIVE_ERROR {
                (n + 1, if error > worst { error } else { worst })
            } else {
                (n, worst)
            }
        })
}

fn discrepancy(observed: f32, expected: f32) -> f32 {
    if observed != 0.0 && expected != 0.0 && observed.signum() != expected.signum() {
        return f32::INFINITY;
    }
    (observed - expected).abs() / expected.abs().max(CHECK_ABSOLUTE_FLOOR)
}
