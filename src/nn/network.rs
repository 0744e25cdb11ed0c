use super::backend::Backend;
use super::backend::Cpu;
use super::blas;
use super::error::EvaluatorError;
use super::error::LoadError;
use super::planes::Plane;
use super::weights::Weights;
use crate::Prob;
use crate::Winrate;
use crate::search::driver::Oracle;
use std::path::Path;

/// a finished evaluation: the softmaxed move distribution over the flat
/// encoding and the winrate for the side to move
#[derive(Debug, Clone)]
pub struct NetworkOutput {
    pub policy: Vec<Prob>,
    pub winrate: Winrate,
}

/// the frozen weights plus whichever backend runs them. the network owns
/// the adaptation from raw head activations to a usable evaluation:
/// temperature softmax on the policy logits, final projection and tanh
/// on the value tower.
pub struct Network<B = Cpu> {
    weights: Weights,
    backend: B,
    temperature: f32,
}

impl Network<Cpu> {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        Ok(Self::from(Weights::load(path)?))
    }
}

impl From<Weights> for Network<Cpu> {
    fn from(weights: Weights) -> Self {
        Self::with_backend(weights, Cpu, 1.0)
    }
}

impl<B: Backend> Network<B> {
    pub fn with_backend(weights: Weights, backend: B, temperature: f32) -> Self {
        Self {
            weights,
            backend,
            temperature,
        }
    }

    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    pub fn describe(&self) -> String {
        self.backend.describe()
    }

    pub fn forward(&self, planes: &[Plane]) -> Result<NetworkOutput, EvaluatorError> {
        let raw = self.backend.evaluate(&self.weights, planes)?;
        let mut policy = vec![0.0; raw.policy.len()];
        blas::softmax(&raw.policy, &mut policy, self.temperature);
        let value = &self.weights.value;
        let dot = raw
            .value
            .iter()
            .zip(value.final_weights.iter())
            .map(|(a, w)| a * w)
            .sum::<f32>()
            + value.final_bias;
        Ok(NetworkOutput {
            policy,
            winrate: dot.tanh(),
        })
    }
}

impl<B: Backend> Oracle for Network<B> {
    fn evaluate(&self, planes: &[Plane]) -> Result<NetworkOutput, EvaluatorError> {
        self.forward(planes)
    }
}
