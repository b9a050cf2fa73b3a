//! Distributed 3D scalar fields on a periodic box.
//!
//! A `DistGrid` owns a slab of a logically cubic (N,N,N) field, decomposed
//! along the slowest axis, and tracks whether its samples currently live in
//! real space or Fourier space. The spectral side uses the half-complex
//! layout of the real-to-complex transform: (N_loc, N, N/2+1) with Z fast.
//! All elementwise work is embarrassingly parallel per local cell; only the
//! FFT itself synchronizes.
//!
//! State or shape mismatches between operands are contract violations and
//! panic: an IC run has nothing sensible to do with a half-transformed
//! field, and restarting is cheaper than recovering.

use std::f64::consts::TAU;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use lin_alg::f64::Vec3;
use rayon::prelude::*;

use crate::error::IcError;
use crate::fft::FftEngine;
use crate::Cplx;

/// Which side of the transform the samples live on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Space {
    Real,
    Fourier,
}

/// Slab decomposition along axis 0. A single-process build owns the whole
/// axis, but index, ID and wavevector bookkeeping all go through the offset
/// so a distributed layout keeps the same arithmetic.
#[derive(Clone, Copy, Debug)]
pub struct Slab {
    pub n: usize,
    pub n0_local: usize,
    pub offset0: usize,
}

impl Slab {
    pub fn full(n: usize) -> Self {
        Self {
            n,
            n0_local: n,
            offset0: 0,
        }
    }

    pub fn nzc(&self) -> usize {
        self.n / 2 + 1
    }

    pub fn real_len(&self) -> usize {
        self.n0_local * self.n * self.n
    }

    pub fn spec_len(&self) -> usize {
        self.n0_local * self.n * self.nzc()
    }

    /// The DC bin (0,0,0) lives on the rank owning the start of axis 0.
    pub fn owns_dc(&self) -> bool {
        self.offset0 == 0
    }
}

/// FFT index convention → signed frequency bin, n ∈ [-N/2, N/2).
#[inline]
pub(crate) fn freq_bin(i: usize, n: usize) -> i64 {
    if i >= n / 2 {
        i as i64 - n as i64
    } else {
        i as i64
    }
}

/// Wavevector table for one axis: k = 2π·n/L with the Nyquist-folded bin.
pub(crate) fn make_k_array(n: usize, l: f64) -> Vec<f64> {
    let tau_div_l = TAU / l;
    (0..n).map(|i| tau_div_l * freq_bin(i, n) as f64).collect()
}

/// A real scalar field on the periodic box, with its half-complex spectrum.
pub struct DistGrid {
    slab: Slab,
    boxlen: f64,
    space: Space,
    re: Vec<f64>,
    ks: Vec<Cplx>,
    kx: Vec<f64>,
    ky: Vec<f64>,
    kz: Vec<f64>,
}

impl DistGrid {
    pub fn new(n: usize, boxlen: f64) -> Self {
        Self::with_slab(Slab::full(n), boxlen)
    }

    pub fn with_slab(slab: Slab, boxlen: f64) -> Self {
        assert!(slab.n > 0 && boxlen > 0.0, "grid needs positive shape and extent");
        let kx = make_k_array(slab.n, boxlen);
        let ky = kx.clone();
        // the half axis inherits the folded Nyquist bin
        let kz = kx[..slab.nzc()].to_vec();
        Self {
            slab,
            boxlen,
            space: Space::Real,
            re: vec![0.0; slab.real_len()],
            ks: vec![Cplx::new(0.0, 0.0); slab.spec_len()],
            kx,
            ky,
            kz,
        }
    }

    pub fn slab(&self) -> Slab {
        self.slab
    }

    pub fn n(&self) -> usize {
        self.slab.n
    }

    pub fn boxlen(&self) -> f64 {
        self.boxlen
    }

    pub fn space(&self) -> Space {
        self.space
    }

    #[track_caller]
    fn require(&self, s: Space) {
        assert!(
            self.space == s,
            "grid is in {:?} state, operation requires {:?}",
            self.space,
            s
        );
    }

    #[track_caller]
    fn require_same_shape(&self, other: &DistGrid) {
        assert!(
            self.slab.n == other.slab.n
                && self.slab.n0_local == other.slab.n0_local
                && self.slab.offset0 == other.slab.offset0,
            "grid shapes do not match"
        );
    }

    pub fn real(&self) -> &[f64] {
        self.require(Space::Real);
        &self.re
    }

    pub fn real_mut(&mut self) -> &mut [f64] {
        self.require(Space::Real);
        &mut self.re
    }

    pub fn kspace(&self) -> &[Cplx] {
        self.require(Space::Fourier);
        &self.ks
    }

    pub fn kspace_mut(&mut self) -> &mut [Cplx] {
        self.require(Space::Fourier);
        &mut self.ks
    }

    pub(crate) fn k_tables(&self) -> (&[f64], &[f64], &[f64]) {
        (&self.kx, &self.ky, &self.kz)
    }

    /// Declare the spectrum as the active side without transforming; the
    /// caller is about to overwrite every mode (convolver destinations,
    /// the emission scratch grid).
    pub(crate) fn mark_fourier(&mut self) {
        self.space = Space::Fourier;
    }

    /// Let `noise_source` write one real sample per locally owned cell,
    /// in (i,j,k) order with global indices. Sequential so that a seeded
    /// stream stays reproducible.
    pub fn fill_from<F: FnMut(usize, usize, usize) -> f64>(&mut self, mut noise_source: F) {
        self.space = Space::Real;
        let n = self.slab.n;
        let mut idx = 0;
        for i in 0..self.slab.n0_local {
            for j in 0..n {
                for k in 0..n {
                    self.re[idx] = noise_source(self.slab.offset0 + i, j, k);
                    idx += 1;
                }
            }
        }
    }

    pub fn fft_forward(&mut self, engine: &FftEngine) {
        self.require(Space::Real);
        engine.fft3d_r2c(&mut self.re, &mut self.ks, self.slab);
        self.space = Space::Fourier;
    }

    pub fn fft_backward(&mut self, engine: &FftEngine, normalize: bool) {
        self.require(Space::Fourier);
        engine.fft3d_c2r(&mut self.ks, &mut self.re, self.slab, normalize);
        self.space = Space::Real;
    }

    /// Evaluate `f(value, k_vec)` over every owned mode.
    pub fn apply_k<F>(&mut self, f: F)
    where
        F: Fn(Cplx, [f64; 3]) -> Cplx + Sync,
    {
        self.require(Space::Fourier);
        let n = self.slab.n;
        let nzc = self.slab.nzc();
        let off = self.slab.offset0;
        let (kx, ky, kz) = (&self.kx, &self.ky, &self.kz);
        self.ks.par_iter_mut().enumerate().for_each(|(idx, v)| {
            let iz = idx % nzc;
            let j = (idx / nzc) % n;
            let i = idx / (nzc * n);
            *v = f(*v, [kx[off + i], ky[j], kz[iz]]);
        });
    }

    /// Evaluate `f(value, r)` over every owned cell, r at cell centers
    /// (i+½)·L/N.
    pub fn apply_r<F>(&mut self, f: F)
    where
        F: Fn(f64, Vec3) -> f64 + Sync,
    {
        self.require(Space::Real);
        let n = self.slab.n;
        let off = self.slab.offset0;
        let h = self.boxlen / n as f64;
        self.re.par_iter_mut().enumerate().for_each(|(idx, v)| {
            let k = idx % n;
            let j = (idx / n) % n;
            let i = idx / (n * n);
            let r = Vec3 {
                x: ((off + i) as f64 + 0.5) * h,
                y: (j as f64 + 0.5) * h,
                z: (k as f64 + 0.5) * h,
            };
            *v = f(*v, r);
        });
    }

    /// Lattice coordinate of cell (i,j,k), normalized to [0,1).
    pub fn unit_r(&self, i: usize, j: usize, k: usize) -> Vec3 {
        let n = self.slab.n as f64;
        Vec3 {
            x: (self.slab.offset0 + i) as f64 / n,
            y: j as f64 / n,
            z: k as f64 / n,
        }
    }

    /// BCC sublattice coordinate: the primary site shifted by half a cell
    /// along the body diagonal.
    pub fn unit_r_staggered(&self, i: usize, j: usize, k: usize) -> Vec3 {
        let n = self.slab.n as f64;
        Vec3 {
            x: ((self.slab.offset0 + i) as f64 + 0.5) / n,
            y: (j as f64 + 0.5) / n,
            z: (k as f64 + 0.5) / n,
        }
    }

    /// Zero the (0,0,0) mode on the owning rank.
    pub fn zero_dc(&mut self) {
        self.require(Space::Fourier);
        if self.slab.owns_dc() {
            self.ks[0] = Cplx::new(0.0, 0.0);
        }
    }

    /// Multiply every mode by exp(iπ(nx+ny+nz)/N): a half-cell shift along
    /// the body diagonal.
    pub fn stagger(&mut self) {
        let s = self.boxlen / (2.0 * self.slab.n as f64);
        self.apply_k(|v, k| v * Cplx::new(0.0, (k[0] + k[1] + k[2]) * s).exp());
    }

    /// Scale the active buffer elementwise.
    pub fn scale(&mut self, alpha: f64) {
        match self.space {
            Space::Real => self.re.par_iter_mut().for_each(|v| *v *= alpha),
            Space::Fourier => self.ks.par_iter_mut().for_each(|v| *v *= alpha),
        }
    }

    /// self += alpha * other. States and shapes must match.
    pub fn axpy(&mut self, alpha: f64, other: &DistGrid) {
        self.require_same_shape(other);
        other.require(self.space);
        match self.space {
            Space::Real => self
                .re
                .par_iter_mut()
                .zip(other.re.par_iter())
                .for_each(|(a, b)| *a += alpha * b),
            Space::Fourier => self
                .ks
                .par_iter_mut()
                .zip(other.ks.par_iter())
                .for_each(|(a, b)| *a += *b * alpha),
        }
    }

    pub fn copy_from(&mut self, other: &DistGrid) {
        self.require_same_shape(other);
        self.space = other.space;
        match other.space {
            Space::Real => self.re.copy_from_slice(&other.re),
            Space::Fourier => self.ks.copy_from_slice(&other.ks),
        }
    }

    /// Mean of the real samples over the slab.
    pub fn mean(&self) -> f64 {
        self.require(Space::Real);
        self.re.par_iter().sum::<f64>() / self.re.len() as f64
    }

    /// Standard deviation of the real samples over the slab.
    pub fn std(&self) -> f64 {
        let mean = self.mean();
        let var = self
            .re
            .par_iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / self.re.len() as f64;
        var.sqrt()
    }

    /// Scan the active buffer for NaN/inf from a misbehaving callback.
    pub fn check_finite(&self, what: &str) -> Result<(), IcError> {
        let ok = match self.space {
            Space::Real => self.re.par_iter().all(|v| v.is_finite()),
            Space::Fourier => self
                .ks
                .par_iter()
                .all(|v| v.re.is_finite() && v.im.is_finite()),
        };
        if ok {
            Ok(())
        } else {
            Err(IcError::Numeric(format!("non-finite value in {what}")))
        }
    }

    /// Bin |δ(k)|²·V into spherical shells of width Δk = 2π/L and write a
    /// two-column ASCII table `k  P(k)`. Rank 0 writes in a distributed
    /// build; here every build is rank 0.
    pub fn write_power_spectrum(&self, path: impl AsRef<Path>) -> Result<(), IcError> {
        self.require(Space::Fourier);
        let n = self.slab.n;
        let nzc = self.slab.nzc();
        let off = self.slab.offset0;
        let dk = TAU / self.boxlen;
        let nbins = ((n as f64 / 2.0) * 3f64.sqrt()).ceil() as usize + 1;
        let mut power = vec![0.0f64; nbins];
        let mut count = vec![0u64; nbins];

        let npoints = (n * n * n) as f64;
        let vol = self.boxlen.powi(3);
        for i in 0..self.slab.n0_local {
            for j in 0..n {
                for iz in 0..nzc {
                    let kk = [self.kx[off + i], self.ky[j], self.kz[iz]];
                    let kmod = (kk[0] * kk[0] + kk[1] * kk[1] + kk[2] * kk[2]).sqrt();
                    if kmod == 0.0 {
                        continue;
                    }
                    // interior z modes stand in for their conjugates too
                    let w = if iz == 0 || iz == nzc - 1 { 1 } else { 2 };
                    let bin = (kmod / dk) as usize;
                    if bin < nbins {
                        let amp = self.ks[(i * n + j) * nzc + iz].norm_sqr() / (npoints * npoints);
                        power[bin] += w as f64 * amp * vol;
                        count[bin] += w as u64;
                    }
                }
            }
        }

        let mut out = BufWriter::new(File::create(path)?);
        for bin in 0..nbins {
            if count[bin] > 0 {
                let k_center = (bin as f64 + 0.5) * dk;
                writeln!(out, "{:.10e} {:.10e}", k_center, power[bin] / count[bin] as f64)?;
            }
        }
        Ok(())
    }
}

/// A full-complex field on the same box, used for the wavefunction ψ.
/// Z carries all N modes here, so spectral indices run over the full cube.
pub struct ComplexGrid {
    slab: Slab,
    boxlen: f64,
    space: Space,
    data: Vec<Cplx>,
    kx: Vec<f64>,
}

impl ComplexGrid {
    pub fn new(n: usize, boxlen: f64) -> Self {
        let slab = Slab::full(n);
        Self {
            slab,
            boxlen,
            space: Space::Real,
            data: vec![Cplx::new(0.0, 0.0); slab.n0_local * n * n],
            kx: make_k_array(n, boxlen),
        }
    }

    pub fn n(&self) -> usize {
        self.slab.n
    }

    #[track_caller]
    fn require(&self, s: Space) {
        assert!(
            self.space == s,
            "complex grid is in {:?} state, operation requires {:?}",
            self.space,
            s
        );
    }

    pub fn values(&self) -> &[Cplx] {
        self.require(Space::Real);
        &self.data
    }

    /// Overwrite every sample from its flat real-space index. The index
    /// convention matches `DistGrid`'s real layout, so a closure may read
    /// sibling real grids directly.
    pub fn fill_indexed<F>(&mut self, f: F)
    where
        F: Fn(usize) -> Cplx + Sync,
    {
        self.space = Space::Real;
        self.data
            .par_iter_mut()
            .enumerate()
            .for_each(|(idx, v)| *v = f(idx));
    }

    /// Map every sample in place, real space.
    pub fn map_indexed<F>(&mut self, f: F)
    where
        F: Fn(usize, Cplx) -> Cplx + Sync,
    {
        self.require(Space::Real);
        self.data
            .par_iter_mut()
            .enumerate()
            .for_each(|(idx, v)| *v = f(idx, *v));
    }

    pub fn apply_k<F>(&mut self, f: F)
    where
        F: Fn(Cplx, [f64; 3]) -> Cplx + Sync,
    {
        self.require(Space::Fourier);
        let n = self.slab.n;
        let off = self.slab.offset0;
        let kx = &self.kx;
        self.data.par_iter_mut().enumerate().for_each(|(idx, v)| {
            let k = idx % n;
            let j = (idx / n) % n;
            let i = idx / (n * n);
            *v = f(*v, [kx[off + i], kx[j], kx[k]]);
        });
    }

    pub fn fft_forward(&mut self, engine: &FftEngine) {
        self.require(Space::Real);
        engine.fft3d_c2c(&mut self.data, self.slab, true, false);
        self.space = Space::Fourier;
    }

    pub fn fft_backward(&mut self, engine: &FftEngine, normalize: bool) {
        self.require(Space::Fourier);
        engine.fft3d_c2c(&mut self.data, self.slab, false, normalize);
        self.space = Space::Real;
    }

    pub fn copy_from(&mut self, other: &ComplexGrid) {
        assert!(
            self.slab.n == other.slab.n && self.boxlen == other.boxlen,
            "complex grid shapes do not match"
        );
        self.space = other.space;
        self.data.copy_from_slice(&other.data);
    }
}
