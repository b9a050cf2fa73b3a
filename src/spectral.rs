//! Spectral operators over a Fourier-state grid. Purely local multipliers.

use crate::grid::DistGrid;
use crate::Cplx;

/// G[k] ← −G[k]/|k|², with the k=0 mode zeroed.
pub fn inverse_laplacian(g: &mut DistGrid) {
    g.apply_k(|v, k| {
        let k2 = k[0] * k[0] + k[1] * k[1] + k[2] * k[2];
        if k2 == 0.0 {
            Cplx::new(0.0, 0.0)
        } else {
            -v / k2
        }
    });
}

/// G[k] ← |k|²·G[k].
pub fn negative_laplacian(g: &mut DistGrid) {
    g.apply_k(|v, k| v * (k[0] * k[0] + k[1] * k[1] + k[2] * k[2]));
}

/// G[k] ← i·kₐ·G[k].
pub fn gradient_component(g: &mut DistGrid, a: usize) {
    g.apply_k(|v, k| v * Cplx::new(0.0, k[a]));
}

/// G[k] ← −kₐ·k_b·G[k], one entry of the Hessian.
pub fn hessian_component(g: &mut DistGrid, a: usize, b: usize) {
    g.apply_k(|v, k| v * (-k[a] * k[b]));
}
