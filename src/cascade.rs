//! The perturbative cascade: φ(1) through the third-order potentials.
//!
//! All potentials live on the same box and are assembled in Fourier space.
//! The first-order potential comes straight from the white noise and the
//! linear amplitude; everything above it is a fixed pattern of dealiased
//! Hessian products of the lower orders, closed by an inverse Laplacian.

use std::time::Instant;

use tracing::info;

use crate::config::Params;
use crate::convolve::{
    add_to, add_twice_to, assign_to, subtract_from, subtract_twice_from, DealiasedConvolver,
};
use crate::error::IcError;
use crate::fft::FftEngine;
use crate::grid::DistGrid;
use crate::spectral::inverse_laplacian;
use crate::Cplx;

/// Owns the LPT potentials for one species and the scratch machinery that
/// builds them. Grids are allocated once up front; the convolver reuses its
/// padded buffers across every primitive call.
pub struct LptSolver {
    pub phi: DistGrid,
    pub phi2: DistGrid,
    pub phi3a: DistGrid,
    pub phi3b: DistGrid,
    pub a3: [DistGrid; 3],
    conv: DealiasedConvolver,
    engine: FftEngine,
    params: Params,
}

impl LptSolver {
    pub fn new(params: &Params) -> Self {
        let (n, l) = (params.n, params.boxlen);
        Self {
            phi: DistGrid::new(n, l),
            phi2: DistGrid::new(n, l),
            phi3a: DistGrid::new(n, l),
            phi3b: DistGrid::new(n, l),
            a3: [
                DistGrid::new(n, l),
                DistGrid::new(n, l),
                DistGrid::new(n, l),
            ],
            conv: DealiasedConvolver::new(n, l),
            engine: FftEngine::new(n),
            params: params.clone(),
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn engine(&self) -> &FftEngine {
        &self.engine
    }

    /// Run the cascade: noise → φ(1) → φ(2) → φ(3a), φ(3b), A(3), then
    /// scale everything by its growth coefficient. Leaves all potentials in
    /// Fourier state.
    pub fn compute<N, A>(&mut self, noise: N, amplitude: A) -> Result<(), IcError>
    where
        N: FnMut(usize, usize, usize) -> f64,
        A: Fn(f64) -> f64 + Sync,
    {
        self.compute_phi1(noise, amplitude)?;

        // orders that stay unbuilt keep their zero spectra, but emission
        // reads every potential in Fourier state
        self.phi2.mark_fourier();
        self.phi3a.mark_fourier();
        self.phi3b.mark_fourier();
        for a in &mut self.a3 {
            a.mark_fourier();
        }

        if self.params.lpt_order > 1 || self.params.symplectic {
            self.compute_phi2();
        }
        if self.params.lpt_order > 2 && !self.params.symplectic {
            self.compute_phi3a();
            self.compute_phi3b();
            self.compute_a3();
        }
        if self.params.symplectic {
            self.compute_symplectic_a3();
        }

        self.apply_growth();
        Ok(())
    }

    /// φ(1): scale each noise mode by √P(k), solve the Poisson equation.
    fn compute_phi1<N, A>(&mut self, noise: N, amplitude: A) -> Result<(), IcError>
    where
        N: FnMut(usize, usize, usize) -> f64,
        A: Fn(f64) -> f64 + Sync,
    {
        let t0 = Instant::now();
        self.phi.fill_from(noise);
        self.phi.fft_forward(&self.engine);

        let volfac = self.params.volfac;
        let fixing = self.params.fixing;
        self.phi.apply_k(|x, k| {
            let kmod = (k[0] * k[0] + k[1] * k[1] + k[2] * k[2]).sqrt();
            if kmod == 0.0 {
                return Cplx::new(0.0, 0.0);
            }
            let x = if fixing && x.norm() != 0.0 {
                x / x.norm()
            } else {
                x
            };
            let delta = x * amplitude(kmod);
            -delta / (kmod * kmod) / volfac
        });
        self.phi.zero_dc();
        self.phi.check_finite("phi(1)")?;
        info!("computing phi(1) term took {:.3}s", t0.elapsed().as_secs_f64());
        Ok(())
    }

    /// φ(2) from the five pairwise Hessian products of φ.
    fn compute_phi2(&mut self) {
        let t0 = Instant::now();
        let conv = &mut self.conv;
        let phi = &self.phi;
        let phi2 = &mut self.phi2;
        phi2.mark_fourier();
        conv.convolve_sum_of_hessians(phi, (0, 0), phi, (1, 1), (2, 2), assign_to(phi2.kspace_mut()));
        conv.convolve_hessians(phi, (1, 1), phi, (2, 2), add_to(phi2.kspace_mut()));
        conv.convolve_hessians(phi, (0, 1), phi, (0, 1), subtract_from(phi2.kspace_mut()));
        conv.convolve_hessians(phi, (0, 2), phi, (0, 2), subtract_from(phi2.kspace_mut()));
        conv.convolve_hessians(phi, (1, 2), phi, (1, 2), subtract_from(phi2.kspace_mut()));
        inverse_laplacian(phi2);
        info!("computing phi(2) term took {:.3}s", t0.elapsed().as_secs_f64());
    }

    /// φ(3a): the determinant-like triple-Hessian combination of φ.
    fn compute_phi3a(&mut self) {
        let t0 = Instant::now();
        let conv = &mut self.conv;
        let phi = &self.phi;
        let phi3a = &mut self.phi3a;
        phi3a.mark_fourier();
        conv.convolve_hessians3(phi, (0, 0), phi, (1, 1), phi, (2, 2), assign_to(phi3a.kspace_mut()));
        conv.convolve_hessians3(phi, (0, 1), phi, (0, 2), phi, (1, 2), add_twice_to(phi3a.kspace_mut()));
        conv.convolve_hessians3(phi, (1, 2), phi, (1, 2), phi, (0, 0), subtract_from(phi3a.kspace_mut()));
        conv.convolve_hessians3(phi, (0, 2), phi, (0, 2), phi, (1, 1), subtract_from(phi3a.kspace_mut()));
        conv.convolve_hessians3(phi, (0, 1), phi, (0, 1), phi, (2, 2), subtract_from(phi3a.kspace_mut()));
        inverse_laplacian(phi3a);
        info!("computing phi(3a) term took {:.3}s", t0.elapsed().as_secs_f64());
    }

    /// φ(3b): mixed φ/φ₂ Hessian products, with the ½ from its definition.
    fn compute_phi3b(&mut self) {
        let t0 = Instant::now();
        let conv = &mut self.conv;
        let phi = &self.phi;
        let phi2 = &self.phi2;
        let phi3b = &mut self.phi3b;
        phi3b.mark_fourier();
        conv.convolve_sum_of_hessians(phi, (0, 0), phi2, (1, 1), (2, 2), assign_to(phi3b.kspace_mut()));
        conv.convolve_sum_of_hessians(phi, (1, 1), phi2, (2, 2), (0, 0), add_to(phi3b.kspace_mut()));
        conv.convolve_sum_of_hessians(phi, (2, 2), phi2, (0, 0), (1, 1), add_to(phi3b.kspace_mut()));
        conv.convolve_hessians(phi, (0, 1), phi2, (0, 1), subtract_twice_from(phi3b.kspace_mut()));
        conv.convolve_hessians(phi, (0, 2), phi2, (0, 2), subtract_twice_from(phi3b.kspace_mut()));
        conv.convolve_hessians(phi, (1, 2), phi2, (1, 2), subtract_twice_from(phi3b.kspace_mut()));
        inverse_laplacian(phi3b);
        phi3b.scale(0.5);
        info!("computing phi(3b) term took {:.3}s", t0.elapsed().as_secs_f64());
    }

    /// A(3): the transverse vector, one cyclic routine for all three
    /// components.
    fn compute_a3(&mut self) {
        let t0 = Instant::now();
        for d in 0..3 {
            let dp = (d + 1) % 3;
            let dpp = (d + 2) % 3;
            let conv = &mut self.conv;
            let phi = &self.phi;
            let phi2 = &self.phi2;
            let a = &mut self.a3[d];
            a.mark_fourier();
            conv.convolve_hessians(phi2, (d, dp), phi, (d, dpp), assign_to(a.kspace_mut()));
            conv.convolve_hessians(phi2, (d, dpp), phi, (d, dp), subtract_from(a.kspace_mut()));
            conv.convolve_difference_of_hessians(
                phi,
                (dp, dpp),
                phi2,
                (dp, dp),
                (dpp, dpp),
                add_to(a.kspace_mut()),
            );
            conv.convolve_difference_of_hessians(
                phi2,
                (dp, dpp),
                phi,
                (dp, dp),
                (dpp, dpp),
                subtract_from(a.kspace_mut()),
            );
            inverse_laplacian(a);
        }
        info!("computing A(3) term took {:.3}s", t0.elapsed().as_secs_f64());
    }

    /// Symplectic mode: A[d] carries the third-order velocity correction
    /// Σ_e φ_{,e}·φ₂_{,de} instead, with no inverse Laplacian.
    fn compute_symplectic_a3(&mut self) {
        let t0 = Instant::now();
        for d in 0..3 {
            let conv = &mut self.conv;
            let phi = &self.phi;
            let phi2 = &self.phi2;
            let a = &mut self.a3[d];
            a.mark_fourier();
            conv.convolve_gradient_and_hessian(phi, 0, phi2, (d, 0), assign_to(a.kspace_mut()));
            conv.convolve_gradient_and_hessian(phi, 1, phi2, (d, 1), add_to(a.kspace_mut()));
            conv.convolve_gradient_and_hessian(phi, 2, phi2, (d, 2), add_to(a.kspace_mut()));
        }
        info!("computing vNLO(3) term took {:.3}s", t0.elapsed().as_secs_f64());
    }

    fn apply_growth(&mut self) {
        self.phi.scale(self.params.g1);
        self.phi2.scale(self.params.g2);
        self.phi3a.scale(self.params.g3a);
        self.phi3b.scale(self.params.g3b);
        for a in &mut self.a3 {
            a.scale(self.params.g3c);
        }
    }

    /// Deterministic single-potential initializer used by validation runs:
    /// φ(q) = −2·cos(q₁ + cos q₂) with q centered on the box. Replaces the
    /// noise-driven φ(1); the rest of the cascade applies unchanged.
    pub fn set_analytic_phi1(&mut self) {
        let l = self.params.boxlen;
        self.phi.apply_r(|_, r| {
            let q1 = r.x - 0.5 * l;
            let q2 = r.y - 0.5 * l;
            -2.0 * (q1 + q2.cos()).cos()
        });
        self.phi.fft_forward(&self.engine);
    }
}
