use super::error::LoadError;
use super::winograd;
use crate::BN_EPSILON;
use crate::SQUARES;
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::Path;

/// weight file format discriminator. the two generations of the network
/// differ in how many feature planes encode a position and how wide the
/// flat move encoding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    V1,
    V2,
}

impl Format {
    /// total input planes fed to the first convolution
    pub fn input_channels(self) -> usize {
        match self {
            Format::V1 => 120,
            Format::V2 => 112,
        }
    }
    /// feature planes per history snapshot (8 snapshots + 8 auxiliary)
    pub fn history_planes(self) -> usize {
        match self {
            Format::V1 => 14,
            Format::V2 => 13,
        }
    }
    /// width of the flat move encoding produced by the policy head
    pub fn policy_outputs(self) -> usize {
        match self {
            Format::V1 => 1924,
            Format::V2 => 1858,
        }
    }
}

impl TryFrom<u32> for Format {
    type Error = LoadError;
    fn try_from(version: u32) -> Result<Self, LoadError> {
        match version {
            1 => Ok(Format::V1),
            2 => Ok(Format::V2),
            v => Err(LoadError::Version(v.to_string())),
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Format::V1 => write!(f, "v1"),
            Format::V2 => write!(f, "v2"),
        }
    }
}

/// one 3x3 convolution fused with its batch norm. the filter is already
/// Winograd-transformed, the convolution bias already folded into the
/// batch norm means, and the variances inverted to reciprocal stddevs.
pub struct ConvBlock {
    pub inputs: usize,
    pub outputs: usize,
    pub filter: Vec<f32>,
    pub means: Vec<f32>,
    pub stddevs: Vec<f32>,
}

/// the 1x1 convolution opening a head, same folding as ConvBlock
pub struct HeadConv {
    pub inputs: usize,
    pub outputs: usize,
    pub filter: Vec<f32>,
    pub means: Vec<f32>,
    pub stddevs: Vec<f32>,
}

pub struct PolicyHead {
    pub conv: HeadConv,
    /// [policy width][filters * 64] row-major
    pub fc_weights: Vec<f32>,
    pub fc_biases: Vec<f32>,
}

pub struct ValueHead {
    pub conv: HeadConv,
    /// [hidden][filters * 64] row-major
    pub hidden_weights: Vec<f32>,
    pub hidden_biases: Vec<f32>,
    /// [hidden] -> scalar readout
    pub final_weights: Vec<f32>,
    pub final_bias: f32,
}

/// the frozen network. loaded once, shared by borrow for the process
/// lifetime, never mutated after this constructor returns.
pub struct Weights {
    format: Format,
    channels: usize,
    blocks: usize,
    pub input: ConvBlock,
    pub tower: Vec<ConvBlock>,
    pub policy: PolicyHead,
    pub value: ValueHead,
}

impl Weights {
    pub fn format(&self) -> Format {
        self.format
    }
    pub fn channels(&self) -> usize {
        self.channels
    }
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// transparently gunzip by magic-byte sniff, then parse
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LoadError> {
        if bytes.starts_with(&[0x1f, 0x8b]) {
            let mut text = String::new();
            GzDecoder::new(bytes).read_to_string(&mut text)?;
            Self::parse(&text)
        } else {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            Self::parse(text)
        }
    }

    /// two passes over the text: the first derives the architecture from
    /// the line count and the width of the input convolution, the second
    /// parses every line into its weight array.
    pub fn parse(text: &str) -> Result<Self, LoadError> {
        let lines = text
            .lines()
            .enumerate()
            .map(|(n, line)| (n + 1, line))
            .filter(|(_, line)| !line.trim().is_empty())
            .collect::<Vec<_>>();

        // pass one: structure
        let (line, version) = lines.first().copied().ok_or(LoadError::Structure { lines: 0 })?;
        let version = version
            .trim()
            .parse::<u32>()
            .map_err(|_| LoadError::Parse { line })?;
        let format = Format::try_from(version)?;
        let count = lines.len();
        // 1 version line, 4 for the input conv, 8 per block, 6 + 8 for the heads
        if count < 19 || (count - 19) % 8 != 0 {
            return Err(LoadError::Structure { lines: count });
        }
        let blocks = (count - 19) / 8;
        let tokens = lines
            .get(1)
            .map(|(_, line)| line.split_whitespace().count())
            .unwrap_or(0);
        let width = format.input_channels() * 9;
        if tokens == 0 || tokens % width != 0 {
            return Err(LoadError::Shape {
                name: "input convolution",
                expected: width,
                found: tokens,
            });
        }
        let channels = tokens / width;

        // pass two: contents
        let ref mut cursor = Cursor { rows: &lines[1..], at: 0 };
        let mut input = cursor.conv("input convolution", format.input_channels(), channels)?;
        let mut tower = (0..2 * blocks)
            .map(|_| cursor.conv("residual convolution", channels, channels))
            .collect::<Result<Vec<_>, _>>()?;
        let policy = cursor.policy(format, channels)?;
        let value = cursor.value(channels)?;

        // offline Winograd pre-transform, one layer per task
        use rayon::prelude::*;
        std::iter::once(&mut input)
            .chain(tower.iter_mut())
            .collect::<Vec<_>>()
            .par_iter_mut()
            .for_each(|conv| {
                conv.filter = winograd::transform_filter(&conv.filter, conv.inputs, conv.outputs)
            });

        Ok(Self {
            format,
            channels,
            blocks,
            input,
            tower,
            policy,
            value,
        })
    }
}

struct Cursor<'a> {
    rows: &'a [(usize, &'a str)],
    at: usize,
}

impl Cursor<'_> {
    fn next(&mut self) -> Result<Vec<f32>, LoadError> {
        let (line, text) = self
            .rows
            .get(self.at)
            .copied()
            .ok_or(LoadError::Structure { lines: self.at })?;
        self.at += 1;
        text.split_whitespace()
            .map(str::parse)
            .collect::<Result<Vec<f32>, _>>()
            .map_err(|_| LoadError::Parse { line })
    }

    fn sized(&mut self, name: &'static str, expected: usize) -> Result<Vec<f32>, LoadError> {
        let floats = self.next()?;
        match floats.len() {
            n if n == expected => Ok(floats),
            found => Err(LoadError::Shape { name, expected, found }),
        }
    }

    fn conv(
        &mut self,
        name: &'static str,
        inputs: usize,
        outputs: usize,
    ) -> Result<ConvBlock, LoadError> {
        let filter = self.sized(name, outputs * inputs * 9)?;
        let biases = self.sized(name, outputs)?;
        let mut means = self.sized(name, outputs)?;
        let variances = self.sized(name, outputs)?;
        fold(&mut means, &biases);
        // the filter is still in [k][c][3][3] order here; `parse` runs the
        // Winograd pre-transform over all layers at once
        Ok(ConvBlock {
            inputs,
            outputs,
            filter,
            means,
            stddevs: recip(variances),
        })
    }

    fn head(
        &mut self,
        head: &'static str,
        name: &'static str,
        inputs: usize,
    ) -> Result<HeadConv, LoadError> {
        let filter = self.next()?;
        let biases = self.next()?;
        let outputs = biases.len();
        if outputs == 0 || filter.len() != outputs * inputs {
            return Err(LoadError::Shape {
                name,
                expected: outputs * inputs,
                found: filter.len(),
            });
        }
        let mut means = self.next()?;
        let variances = self.next()?;
        if means.len() != outputs || variances.len() != outputs {
            return Err(LoadError::Head(head));
        }
        fold(&mut means, &biases);
        Ok(HeadConv {
            inputs,
            outputs,
            filter,
            means,
            stddevs: recip(variances),
        })
    }

    fn policy(&mut self, format: Format, channels: usize) -> Result<PolicyHead, LoadError> {
        let conv = self.head("policy", "policy convolution", channels)?;
        let outputs = format.policy_outputs();
        let fc_weights = self.sized("policy projection", outputs * conv.outputs * SQUARES)?;
        let fc_biases = self.sized("policy projection", outputs)?;
        Ok(PolicyHead {
            conv,
            fc_weights,
            fc_biases,
        })
    }

    fn value(&mut self, channels: usize) -> Result<ValueHead, LoadError> {
        let conv = self.head("value", "value convolution", channels)?;
        let hidden_weights = self.next()?;
        let hidden_biases = self.next()?;
        let hidden = hidden_biases.len();
        if hidden == 0 || hidden_weights.len() != hidden * conv.outputs * SQUARES {
            return Err(LoadError::Shape {
                name: "value projection",
                expected: hidden * conv.outputs * SQUARES,
                found: hidden_weights.len(),
            });
        }
        let final_weights = self.sized("value readout", hidden)?;
        let final_bias = self.sized("value readout", 1)?[0];
        Ok(ValueHead {
            conv,
            hidden_weights,
            hidden_biases,
            final_weights,
            final_bias,
        })
    }
}

/// variance line -> reciprocal standard deviation
fn recip(variances: Vec<f32>) -> Vec<f32> {
    variances
        .into_iter()
        .map(|v| 1.0 / (v + BN_EPSILON).sqrt())
        .collect()
}

/// fold the convolution bias into the batch norm mean; the bias itself
/// is then zero and never stored
fn fold(means: &mut [f32], biases: &[f32]) {
    for (mean, bias) in means.iter_mut().zip(biases) {
        *mean -= bias;
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_zero_network() {
        let text = fixtures::zeros(Format::V2, 8, 1);
        let weights = Weights::parse(&text).unwrap();
        assert!(weights.format() == Format::V2);
        assert!(weights.channels() == 8);
        assert!(weights.blocks() == 1);
        assert!(weights.tower.len() == 2);
        assert!(weights.input.inputs == 112);
        assert!(weights.input.outputs == 8);
        assert!(weights.policy.conv.outputs == 2);
        assert!(weights.policy.fc_biases.len() == 1858);
        assert!(weights.value.hidden_biases.len() == 8);
        // zero variance becomes 1/sqrt(epsilon)
        let stddev = weights.input.stddevs[0];
        assert!((stddev - 1.0 / BN_EPSILON.sqrt()).abs() < 1e-2);
    }

    #[test]
    fn version_one_is_wider() {
        let text = fixtures::zeros(Format::V1, 4, 0);
        let weights = Weights::parse(&text).unwrap();
        assert!(weights.format().input_channels() == 120);
        assert!(weights.format().history_planes() == 14);
        assert!(weights.policy.fc_biases.len() == 1924);
    }

    #[test]
    fn gunzips_transparently() {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;
        let text = fixtures::zeros(Format::V2, 4, 0);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(text.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();
        let weights = Weights::from_bytes(&compressed).unwrap();
        assert!(weights.channels() == 4);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut text = fixtures::zeros(Format::V2, 4, 0);
        text.replace_range(0..1, "3");
        assert!(matches!(
            Weights::parse(&text),
            Err(LoadError::Version(_))
        ));
    }

    #[test]
    fn rejects_garbled_version() {
        assert!(matches!(
            Weights::parse("weights\n0 0 0"),
            Err(LoadError::Parse { line: 1 })
        ));
    }

    #[test]
    fn rejects_broken_tower() {
        let text = fixtures::zeros(Format::V2, 4, 1);
        let truncated = text.lines().take(20).collect::<Vec<_>>().join("\n");
        assert!(matches!(
            Weights::parse(&truncated),
            Err(LoadError::Structure { lines: 20 })
        ));
    }

    #[test]
    fn reports_the_malformed_line() {
        let text = fixtures::zeros(Format::V2, 4, 0);
        let mut lines = text.lines().map(String::from).collect::<Vec<_>>();
        lines[4] = lines[4].replacen('0', "x", 1);
        let text = lines.join("\n");
        assert!(matches!(
            Weights::parse(&text),
            Err(LoadError::Parse { line: 5 })
        ));
    }

    #[test]
    fn rejects_head_mismatch() {
        let text = fixtures::zeros(Format::V2, 4, 0);
        let mut lines = text.lines().map(String::from).collect::<Vec<_>>();
        // policy batch norm means hold one value, conv biases two
        lines[7] = "0".to_string();
        let text = lines.join("\n");
        assert!(matches!(
            Weights::parse(&text),
            Err(LoadError::Head("policy"))
        ));
    }

    #[test]
    fn folds_biases_into_means() {
        let mut lines = Vec::new();
        lines.push("2".to_string());
        lines.push(fixtures::row(112 * 9, 0.0)); // one channel
        lines.push("1.5".to_string()); // conv bias
        lines.push("0.5".to_string()); // bn mean
        lines.push("3.0".to_string()); // bn variance
        // policy head
        lines.push(fixtures::row(2, 0.0));
        lines.push(fixtures::row(2, 0.25));
        lines.push(fixtures::row(2, 1.0));
        lines.push(fixtures::row(2, 0.0));
        lines.push(fixtures::row(1858 * 2 * SQUARES, 0.0));
        lines.push(fixtures::row(1858, 0.0));
        // value head
        lines.push(fixtures::row(1, 0.0));
        lines.push(fixtures::row(1, 0.0));
        lines.push(fixtures::row(1, 0.0));
        lines.push(fixtures::row(1, 0.0));
        lines.push(fixtures::row(8 * SQUARES, 0.0));
        lines.push(fixtures::row(8, 0.0));
        lines.push(fixtures::row(8, 0.0));
        lines.push(fixtures::row(1, 0.0));
        let weights = Weights::parse(&lines.join("\n")).unwrap();
        assert!((weights.input.means[0] - (0.5 - 1.5)).abs() < 1e-6);
        assert!((weights.input.stddevs[0] - 1.0 / (3.0f32 + BN_EPSILON).sqrt()).abs() < 1e-6);
        assert!((weights.policy.conv.means[0] - (1.0 - 0.25)).abs() < 1e-6);
    }
}
