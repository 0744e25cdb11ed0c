use super::blas;
use super::error::EvaluatorError;
use super::planes;
use super::planes::Plane;
use super::weights::Weights;
use super::winograd;
use crate::Logit;
use crate::SQUARES;

/// raw head activations: policy logits over the flat move encoding and
/// the value tower output before its final projection. whoever drives
/// the backend applies softmax and the scalar readout.
#[derive(Debug, Clone, PartialEq)]
pub struct Activations {
    pub policy: Vec<Logit>,
    pub value: Vec<f32>,
}

/// an evaluator capability. the CPU path below is the reference
/// implementation; an accelerator provides the same contract and can be
/// wrapped in a SelfCheck to keep it honest.
pub trait Backend: Send + Sync {
    fn evaluate(&self, weights: &Weights, planes: &[Plane]) -> Result<Activations, EvaluatorError>;
    fn describe(&self) -> String;
}

/// the Winograd pipeline on the host. stateless: weights are borrowed
/// per call and scratch lives on the caller's stack frame, so any number
/// of worker threads can evaluate concurrently.
pub struct Cpu;

impl Backend for Cpu {
    fn evaluate(&self, weights: &Weights, planes: &[Plane]) -> Result<Activations, EvaluatorError> {
        let depth = weights.format().input_channels();
        if planes.len() != depth {
            return Err(EvaluatorError::Backend(format!(
                "expected {} input planes, got {}",
                depth,
                planes.len()
            )));
        }
        let channels = weights.channels();
        let widest = depth.max(channels);

        // every buffer the forward pass touches, sized once up front
        let mut v = vec![0.0; winograd::TILES * widest * winograd::TILES];
        let mut m = vec![0.0; winograd::TILES * widest * winograd::TILES];
        let mut dense = vec![0.0; depth * SQUARES];
        let mut raw = vec![0.0; channels * SQUARES];
        let mut act = vec![0.0; channels * SQUARES];
        let mut res = vec![0.0; channels * SQUARES];

        planes::materialize(planes, &mut dense);
        let first = &weights.input;
        winograd::convolve(depth, channels, &dense, &first.filter, &mut raw, &mut v, &mut m);
        blas::batchnorm(channels, SQUARES, &raw, &first.means, &first.stddevs, &mut act, None);
        for block in weights.tower.chunks_exact(2) {
            res.copy_from_slice(&act);
            winograd::convolve(channels, channels, &act, &block[0].filter, &mut raw, &mut v, &mut m);
            blas::batchnorm(channels, SQUARES, &raw, &block[0].means, &block[0].stddevs, &mut act, None);
            winograd::convolve(channels, channels, &act, &block[1].filter, &mut raw, &mut v, &mut m);
            blas::batchnorm(channels, SQUARES, &raw, &block[1].means, &block[1].stddevs, &mut act, Some(&res));
        }

        let policy = &weights.policy;
        let mut logits = vec![0.0; policy.fc_biases.len()];
        let features = Self::head(&policy.conv, &act, channels);
        blas::gemv(
            logits.len(),
            policy.conv.outputs * SQUARES,
            &policy.fc_weights,
            &features,
            &policy.fc_biases,
            &mut logits,
        );

        let value = &weights.value;
        let mut hidden = vec![0.0; value.hidden_biases.len()];
        let features = Self::head(&value.conv, &act, channels);
        blas::gemv(
            hidden.len(),
            value.conv.outputs * SQUARES,
            &value.hidden_weights,
            &features,
            &value.hidden_biases,
            &mut hidden,
        );
        for h in hidden.iter_mut() {
            *h = h.max(0.0);
        }

        Ok(Activations { policy: logits, value: hidden })
    }

    fn describe(&self) -> String {
        "cpu".to_string()
    }
}

impl Cpu {
    /// a head's 1x1 convolution is a plain GEMM over the 64 squares,
    /// followed by its batch norm
    fn head(conv: &super::weights::HeadConv, act: &[f32], channels: usize) -> Vec<f32> {
        let mut raw = vec![0.0; conv.outputs * SQUARES];
        let mut out = vec![0.0; conv.outputs * SQUARES];
        blas::gemm(
            false,
            false,
            conv.outputs,
            SQUARES,
            channels,
            1.0,
            &conv.filter,
            channels,
            act,
            SQUARES,
            0.0,
            &mut raw,
            SQUARES,
        );
        blas::batchnorm(conv.outputs, SQUARES, &raw, &conv.means, &conv.stddevs, &mut out, None);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::weights::Format;
    use crate::nn::weights::fixtures;

    #[test]
    fn zero_network_yields_flat_activations() {
        let weights = Weights::parse(&fixtures::zeros(Format::V2, 8, 1)).unwrap();
        let planes = vec![Plane::filled(1.0); 112];
        let out = Cpu.evaluate(&weights, &planes).unwrap();
        assert!(out.policy.len() == 1858);
        assert!(out.value.len() == 8);
        assert!(out.policy.iter().all(|&x| x == 0.0));
        assert!(out.value.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn head_biases_pass_through() {
        let weights = Weights::parse(&fixtures::biased(Format::V2, 4, 0, 0.25, 0.5)).unwrap();
        let planes = vec![Plane::empty(); 112];
        let out = Cpu.evaluate(&weights, &planes).unwrap();
        assert!(out.policy.iter().all(|&x| x == 0.25));
        assert!(out.value.iter().all(|&x| x == 0.5));
    }

    #[test]
    fn rejects_wrong_plane_count() {
        let weights = Weights::parse(&fixtures::zeros(Format::V2, 4, 0)).unwrap();
        let planes = vec![Plane::empty(); 3];
        assert!(matches!(
            Cpu.evaluate(&weights, &planes),
            Err(EvaluatorError::Backend(_))
        ));
    }
}
