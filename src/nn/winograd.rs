//! Winograd F(2x2, 3x3) convolution over the 8x8 board. each 3x3 kernel is
//! pre-transformed offline into a 4x4 tile; at inference the feature map is
//! cut into 16 overlapping 4x4 tiles, multiplied tile-coordinate by
//! tile-coordinate with one batched GEMM per coordinate, and folded back
//! into 2x2 output patches. 16 multiplies per tile instead of 36.

use super::blas;
use crate::BOARD;
use crate::SQUARES;

/// tiles per feature map: a 4x4 grid of 2x2 output patches
pub const TILES: usize = 16;

/// filter transform, 4x3
const G: [[f32; 3]; 4] = [
    [1.0, 0.0, 0.0],
    [0.5, 0.5, 0.5],
    [0.5, -0.5, 0.5],
    [0.0, 0.0, 1.0],
];

/// input transform, transposed, 4x4
const BT: [[f32; 4]; 4] = [
    [1.0, 0.0, -1.0, 0.0],
    [0.0, 1.0, 1.0, 0.0],
    [0.0, -1.0, 1.0, 0.0],
    [0.0, 1.0, 0.0, -1.0],
];

/// output transform, 4x2
const A: [[f32; 2]; 4] = [
    [1.0, 0.0],
    [1.0, 1.0],
    [1.0, -1.0],
    [0.0, -1.0],
];

/// U = G g Gt for a single 3x3 kernel
fn transform_kernel(g: &[f32]) -> [f32; 16] {
    let mut t = [0.0; 12];
    for i in 0..4 {
        for j in 0..3 {
            t[i * 3 + j] = (0..3).map(|k| G[i][k] * g[k * 3 + j]).sum();
        }
    }
    let mut u = [0.0; 16];
    for i in 0..4 {
        for j in 0..4 {
            u[i * 4 + j] = (0..3).map(|k| t[i * 3 + k] * G[j][k]).sum();
        }
    }
    u
}

/// pre-transform a full [outputs][inputs][3][3] filter bank into the
/// U[xi][nu][c][k] layout consumed by `multiply`. keeping k fastest means
/// the batched GEMM reads U as a C x K operand and transposes it on the
/// fly, leaving the outputs in the rows of M.
pub fn transform_filter(filter: &[f32], inputs: usize, outputs: usize) -> Vec<f32> {
    let mut u = vec![0.0; TILES * inputs * outputs];
    for k in 0..outputs {
        for c in 0..inputs {
            let tile = transform_kernel(&filter[(k * inputs + c) * 9..][..9]);
            for xi in 0..4 {
                for nu in 0..4 {
                    u[((xi * 4 + nu) * inputs + c) * outputs + k] = tile[xi * 4 + nu];
                }
            }
        }
    }
    u
}

/// round a transformed filter up to accelerator tile multiples. the
/// original coefficients keep their (c, k) coordinates; the padding is
/// zero, so the padded GEMM computes the same product with dead rows.
pub fn zeropad_filter(
    u: &[f32],
    inputs: usize,
    outputs: usize,
    inputs_pad: usize,
    outputs_pad: usize,
) -> Vec<f32> {
    assert!(inputs_pad >= inputs);
    assert!(outputs_pad >= outputs);
    let mut padded = vec![0.0; TILES * inputs_pad * outputs_pad];
    for b in 0..TILES {
        for c in 0..inputs {
            for k in 0..outputs {
                padded[(b * inputs_pad + c) * outputs_pad + k] = u[(b * inputs + c) * outputs + k];
            }
        }
    }
    padded
}

/// V = Bt d B per overlapping 4x4 input tile, written V[xi][nu][c][p].
/// tile origins sit at (2 by - 1, 2 bx - 1) so the border tiles read the
/// zero padding outside the board.
pub fn transform_input(input: &[f32], channels: usize, v: &mut [f32]) {
    for c in 0..channels {
        let map = &input[c * SQUARES..][..SQUARES];
        for by in 0..4 {
            for bx in 0..4 {
                let p = by * 4 + bx;
                let mut d = [0.0; 16];
                for y in 0..4 {
                    for x in 0..4 {
                        // coordinates shifted by +1 so the -1 origin stays unsigned
                        let row = 2 * by + y;
                        let col = 2 * bx + x;
                        if (1..=BOARD).contains(&row) && (1..=BOARD).contains(&col) {
                            d[y * 4 + x] = map[(row - 1) * BOARD + (col - 1)];
                        }
                    }
                }
                let mut t = [0.0; 16];
                for i in 0..4 {
                    for j in 0..4 {
                        t[i * 4 + j] = (0..4).map(|k| BT[i][k] * d[k * 4 + j]).sum();
                    }
                }
                for xi in 0..4 {
                    for nu in 0..4 {
                        let tile: f32 = (0..4).map(|k| t[xi * 4 + k] * BT[nu][k]).sum();
                        v[((xi * 4 + nu) * channels + c) * TILES + p] = tile;
                    }
                }
            }
        }
    }
}

/// M[xi][nu] = U[xi][nu]^T V[xi][nu] for each of the 16 tile coordinates;
/// output rows are the K output channels, columns the 16 tiles
pub fn multiply(u: &[f32], v: &[f32], m: &mut [f32], inputs: usize, outputs: usize) {
    for b in 0..TILES {
        blas::gemm(
            true,
            false,
            outputs,
            TILES,
            inputs,
            1.0,
            &u[b * inputs * outputs..][..inputs * outputs],
            outputs,
            &v[b * inputs * TILES..][..inputs * TILES],
            TILES,
            0.0,
            &mut m[b * outputs * TILES..][..outputs * TILES],
            TILES,
        );
    }
}

/// Y = At m A per (channel, tile), writing the 2x2 patch at (2 by, 2 bx).
/// patches never cross the 8x8 boundary on an even board, but border
/// writes stay guarded for the general case.
pub fn transform_output(m: &[f32], outputs: usize, output: &mut [f32]) {
    for k in 0..outputs {
        for by in 0..4 {
            for bx in 0..4 {
                let p = by * 4 + bx;
                let mut tile = [0.0; 16];
                for xi in 0..4 {
                    for nu in 0..4 {
                        tile[xi * 4 + nu] = m[((xi * 4 + nu) * outputs + k) * TILES + p];
                    }
                }
                let mut t = [0.0; 8];
                for i in 0..2 {
                    for j in 0..4 {
                        t[i * 4 + j] = (0..4).map(|k| A[k][i] * tile[k * 4 + j]).sum();
                    }
                }
                for dy in 0..2 {
                    for dx in 0..2 {
                        let row = 2 * by + dy;
                        let col = 2 * bx + dx;
                        if row < BOARD && col < BOARD {
                            let y: f32 = (0..4).map(|k| t[dy * 4 + k] * A[k][dx]).sum();
                            output[k * SQUARES + row * BOARD + col] = y;
                        }
                    }
                }
            }
        }
    }
}

/// full 3x3 convolution of one 8x8 feature stack through a pre-transformed
/// filter. `v` and `m` are caller-owned scratch, each at least
/// 16 * max(inputs, outputs) * 16 floats, so the per-simulation hot path
/// allocates nothing.
pub fn convolve(
    inputs: usize,
    outputs: usize,
    input: &[f32],
    filter: &[f32],
    output: &mut [f32],
    v: &mut [f32],
    m: &mut [f32],
) {
    debug_assert!(input.len() >= inputs * SQUARES);
    debug_assert!(output.len() >= outputs * SQUARES);
    debug_assert!(filter.len() == TILES * inputs * outputs);
    debug_assert!(v.len() >= TILES * inputs * TILES);
    debug_assert!(m.len() >= TILES * outputs * TILES);
    transform_input(input, inputs, v);
    multiply(filter, v, m, inputs, outputs);
    transform_output(m, outputs, output);
}
