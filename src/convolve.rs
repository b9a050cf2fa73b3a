//! Dealiased products of derivative fields.
//!
//! A product of two band-limited fields populates up to 2N modes per axis;
//! truncating at N folds the excess back into the band. The Orszag 3/2 rule
//! sidesteps this: zero-pad the operand spectra to N' ≥ 3N/2, multiply in
//! real space on the padded grid, transform forward and keep only the
//! central N-cube. Derivative kernels are applied in the padded k-space,
//! where they stay local, and the caller chooses how each truncated mode
//! enters its destination through a small writer closure. This keeps the
//! whole cascade running through one fixed set of padded buffers instead of
//! materializing partial-sum grids.

use rayon::prelude::*;

use crate::fft::FftEngine;
use crate::grid::{make_k_array, DistGrid, Slab, Space};
use crate::Cplx;

/// Derivative applied to one operand before the real-space product.
#[derive(Clone, Copy, Debug)]
enum Kernel {
    Hessian(usize, usize),
    HessianSum((usize, usize), (usize, usize)),
    HessianDifference((usize, usize), (usize, usize)),
    Gradient(usize),
}

impl Kernel {
    #[inline]
    fn multiplier(self, k: [f64; 3]) -> Cplx {
        match self {
            Kernel::Hessian(a, b) => Cplx::new(-k[a] * k[b], 0.0),
            Kernel::HessianSum((a, b), (c, d)) => Cplx::new(-k[a] * k[b] - k[c] * k[d], 0.0),
            Kernel::HessianDifference((a, b), (c, d)) => Cplx::new(-k[a] * k[b] + k[c] * k[d], 0.0),
            Kernel::Gradient(a) => Cplx::new(0.0, k[a]),
        }
    }
}

struct PaddedBuf {
    re: Vec<f64>,
    ks: Vec<Cplx>,
}

impl PaddedBuf {
    fn new(slab: Slab) -> Self {
        Self {
            re: vec![0.0; slab.real_len()],
            ks: vec![Cplx::new(0.0, 0.0); slab.spec_len()],
        }
    }
}

/// Round up to an even FFT-friendly (2·3·5·7-smooth) length.
fn next_fft_len(mut n: usize) -> usize {
    fn good(mut x: usize) -> bool {
        for p in [2, 3, 5, 7] {
            while x % p == 0 {
                x /= p;
            }
        }
        x == 1
    }
    if n < 2 {
        n = 2;
    }
    if n % 2 == 1 {
        n += 1;
    }
    while !good(n) {
        n += 2;
    }
    n
}

/// Evaluates tensor products of derivative fields at full resolution.
/// Owns two operand buffers and one product buffer on the padded grid;
/// they live for the whole cascade run.
pub struct DealiasedConvolver {
    n: usize,
    np: usize,
    slab_p: Slab,
    engine: FftEngine,
    kxp: Vec<f64>,
    kzp: Vec<f64>,
    op1: PaddedBuf,
    op2: PaddedBuf,
    prod: PaddedBuf,
    fac2: f64,
    fac3: f64,
}

impl DealiasedConvolver {
    pub fn new(n: usize, boxlen: f64) -> Self {
        let np = next_fft_len((3 * n).div_ceil(2));
        let slab_p = Slab::full(np);
        let kxp = make_k_array(np, boxlen);
        let kzp = kxp[..slab_p.nzc()].to_vec();
        let ratio = (np * np * np) as f64 / (n * n * n) as f64;
        Self {
            n,
            np,
            slab_p,
            engine: FftEngine::new(np),
            kxp,
            kzp,
            op1: PaddedBuf::new(slab_p),
            op2: PaddedBuf::new(slab_p),
            prod: PaddedBuf::new(slab_p),
            fac2: ratio,
            fac3: ratio * ratio,
        }
    }

    pub fn padded_n(&self) -> usize {
        self.np
    }

    /// 𝔉{Hess_{a} A · Hess_{b} B}, truncated.
    pub fn convolve_hessians<W>(
        &mut self,
        a: &DistGrid,
        pa: (usize, usize),
        b: &DistGrid,
        pb: (usize, usize),
        writer: W,
    ) where
        W: FnMut(usize, Cplx),
    {
        self.check_operand(a);
        self.check_operand(b);
        Self::prepare(
            &self.engine,
            &self.kxp,
            &self.kzp,
            self.slab_p,
            a,
            Kernel::Hessian(pa.0, pa.1),
            &mut self.op1,
        );
        Self::prepare(
            &self.engine,
            &self.kxp,
            &self.kzp,
            self.slab_p,
            b,
            Kernel::Hessian(pb.0, pb.1),
            &mut self.op2,
        );
        self.finish_two(writer);
    }

    /// Three-factor variant: 𝔉{Hess A · Hess B · Hess C}, truncated.
    pub fn convolve_hessians3<W>(
        &mut self,
        a: &DistGrid,
        pa: (usize, usize),
        b: &DistGrid,
        pb: (usize, usize),
        c: &DistGrid,
        pc: (usize, usize),
        writer: W,
    ) where
        W: FnMut(usize, Cplx),
    {
        self.check_operand(a);
        self.check_operand(b);
        self.check_operand(c);
        Self::prepare(
            &self.engine,
            &self.kxp,
            &self.kzp,
            self.slab_p,
            a,
            Kernel::Hessian(pa.0, pa.1),
            &mut self.op1,
        );
        Self::prepare(
            &self.engine,
            &self.kxp,
            &self.kzp,
            self.slab_p,
            b,
            Kernel::Hessian(pb.0, pb.1),
            &mut self.op2,
        );
        self.prod
            .re
            .par_iter_mut()
            .zip(self.op1.re.par_iter())
            .zip(self.op2.re.par_iter())
            .for_each(|((p, x), y)| *p = x * y);
        Self::prepare(
            &self.engine,
            &self.kxp,
            &self.kzp,
            self.slab_p,
            c,
            Kernel::Hessian(pc.0, pc.1),
            &mut self.op1,
        );
        self.prod
            .re
            .par_iter_mut()
            .zip(self.op1.re.par_iter())
            .for_each(|(p, x)| *p *= x);
        self.engine
            .fft3d_r2c(&mut self.prod.re, &mut self.prod.ks, self.slab_p);
        self.emit(writer, self.fac3);
    }

    /// 𝔉{Hess_{a} A · (Hess_{b1} B + Hess_{b2} B)}, truncated.
    pub fn convolve_sum_of_hessians<W>(
        &mut self,
        a: &DistGrid,
        pa: (usize, usize),
        b: &DistGrid,
        pb1: (usize, usize),
        pb2: (usize, usize),
        writer: W,
    ) where
        W: FnMut(usize, Cplx),
    {
        self.check_operand(a);
        self.check_operand(b);
        Self::prepare(
            &self.engine,
            &self.kxp,
            &self.kzp,
            self.slab_p,
            a,
            Kernel::Hessian(pa.0, pa.1),
            &mut self.op1,
        );
        Self::prepare(
            &self.engine,
            &self.kxp,
            &self.kzp,
            self.slab_p,
            b,
            Kernel::HessianSum(pb1, pb2),
            &mut self.op2,
        );
        self.finish_two(writer);
    }

    /// 𝔉{Hess_{a} A · (Hess_{b1} B − Hess_{b2} B)}, truncated.
    pub fn convolve_difference_of_hessians<W>(
        &mut self,
        a: &DistGrid,
        pa: (usize, usize),
        b: &DistGrid,
        pb1: (usize, usize),
        pb2: (usize, usize),
        writer: W,
    ) where
        W: FnMut(usize, Cplx),
    {
        self.check_operand(a);
        self.check_operand(b);
        Self::prepare(
            &self.engine,
            &self.kxp,
            &self.kzp,
            self.slab_p,
            a,
            Kernel::Hessian(pa.0, pa.1),
            &mut self.op1,
        );
        Self::prepare(
            &self.engine,
            &self.kxp,
            &self.kzp,
            self.slab_p,
            b,
            Kernel::HessianDifference(pb1, pb2),
            &mut self.op2,
        );
        self.finish_two(writer);
    }

    /// 𝔉{∂_a A · Hess_{bc} B}, truncated.
    pub fn convolve_gradient_and_hessian<W>(
        &mut self,
        a: &DistGrid,
        da: usize,
        b: &DistGrid,
        pb: (usize, usize),
        writer: W,
    ) where
        W: FnMut(usize, Cplx),
    {
        self.check_operand(a);
        self.check_operand(b);
        Self::prepare(
            &self.engine,
            &self.kxp,
            &self.kzp,
            self.slab_p,
            a,
            Kernel::Gradient(da),
            &mut self.op1,
        );
        Self::prepare(
            &self.engine,
            &self.kxp,
            &self.kzp,
            self.slab_p,
            b,
            Kernel::Hessian(pb.0, pb.1),
            &mut self.op2,
        );
        self.finish_two(writer);
    }

    #[track_caller]
    fn check_operand(&self, g: &DistGrid) {
        assert!(
            g.n() == self.n,
            "operand resolution {} does not match convolver {}",
            g.n(),
            self.n
        );
        assert!(
            g.space() == Space::Fourier,
            "convolver operands must be in Fourier state"
        );
    }

    /// Pad-insert the operand spectrum, apply the derivative kernel on the
    /// padded grid, transform to padded real samples.
    fn prepare(
        engine: &FftEngine,
        kxp: &[f64],
        kzp: &[f64],
        slab_p: Slab,
        src: &DistGrid,
        kernel: Kernel,
        buf: &mut PaddedBuf,
    ) {
        let n = src.n();
        let np = slab_p.n;
        let nzc = n / 2 + 1;
        let nzcp = slab_p.nzc();
        let shift = np - n;
        let ks = src.kspace();

        buf.ks.par_iter_mut().for_each(|v| *v = Cplx::new(0.0, 0.0));
        for i in 0..n {
            let ip = if i < n / 2 { i } else { i + shift };
            for j in 0..n {
                let jp = if j < n / 2 { j } else { j + shift };
                let row = (i * n + j) * nzc;
                let row_p = (ip * np + jp) * nzcp;
                buf.ks[row_p..row_p + nzc].copy_from_slice(&ks[row..row + nzc]);
            }
        }

        buf.ks.par_iter_mut().enumerate().for_each(|(idx, v)| {
            let iz = idx % nzcp;
            let j = (idx / nzcp) % np;
            let i = idx / (nzcp * np);
            *v *= kernel.multiplier([kxp[i], kxp[j], kzp[iz]]);
        });

        engine.fft3d_c2r(&mut buf.ks, &mut buf.re, slab_p, true);
    }

    fn finish_two<W: FnMut(usize, Cplx)>(&mut self, writer: W) {
        self.prod
            .re
            .par_iter_mut()
            .zip(self.op1.re.par_iter())
            .zip(self.op2.re.par_iter())
            .for_each(|((p, x), y)| *p = x * y);
        self.engine
            .fft3d_r2c(&mut self.prod.re, &mut self.prod.ks, self.slab_p);
        self.emit(writer, self.fac2);
    }

    /// Stream the central N-cube of the product spectrum into the caller's
    /// destination. `fac` restores the destination-grid DFT normalization
    /// after the padded-grid transforms.
    fn emit<W: FnMut(usize, Cplx)>(&self, mut writer: W, fac: f64) {
        let n = self.n;
        let np = self.np;
        let nzc = n / 2 + 1;
        let nzcp = np / 2 + 1;
        let shift = np - n;
        for i in 0..n {
            let ip = if i < n / 2 { i } else { i + shift };
            for j in 0..n {
                let jp = if j < n / 2 { j } else { j + shift };
                for iz in 0..nzc {
                    let v = self.prod.ks[(ip * np + jp) * nzcp + iz];
                    writer((i * n + j) * nzc + iz, v * fac);
                }
            }
        }
    }
}

/// Writer that overwrites the destination mode.
pub fn assign_to(dst: &mut [Cplx]) -> impl FnMut(usize, Cplx) + '_ {
    move |i, v| dst[i] = v
}

/// Writer that accumulates into the destination mode.
pub fn add_to(dst: &mut [Cplx]) -> impl FnMut(usize, Cplx) + '_ {
    move |i, v| dst[i] += v
}

/// Writer that accumulates twice the value.
pub fn add_twice_to(dst: &mut [Cplx]) -> impl FnMut(usize, Cplx) + '_ {
    move |i, v| dst[i] += v * 2.0
}

/// Writer that subtracts the value.
pub fn subtract_from(dst: &mut [Cplx]) -> impl FnMut(usize, Cplx) + '_ {
    move |i, v| dst[i] -= v
}

/// Writer that subtracts twice the value.
pub fn subtract_twice_from(dst: &mut [Cplx]) -> impl FnMut(usize, Cplx) + '_ {
    move |i, v| dst[i] -= v * 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectral::hessian_component;
    use std::f64::consts::TAU;

    const N: usize = 16;
    const L: f64 = 2.0;

    fn mode(axis: usize, m: usize) -> DistGrid {
        let mut g = DistGrid::new(N, L);
        let kf = TAU * m as f64 / L;
        g.apply_r(|_, r| match axis {
            0 => (kf * r.x).cos(),
            1 => (kf * r.y).cos(),
            _ => (kf * r.z).cos(),
        });
        g
    }

    #[test]
    fn padded_length_is_even_and_smooth() {
        assert_eq!(next_fft_len(24), 24);
        assert_eq!(next_fft_len(17), 18);
        assert_eq!(next_fft_len(97), 98);
        let c = DealiasedConvolver::new(N, L);
        assert!(c.padded_n() >= 3 * N / 2);
        assert_eq!(c.padded_n() % 2, 0);
    }

    /// Band-limited operands: the convolver must agree with the direct
    /// product taken on the small grid, which is alias-free for these modes.
    #[test]
    fn matches_direct_product_for_band_limited_fields() {
        let engine = FftEngine::new(N);
        let mut a = mode(0, 2);
        let mut b = mode(1, 2);
        a.fft_forward(&engine);
        b.fft_forward(&engine);

        let mut conv = DealiasedConvolver::new(N, L);
        let mut dst = DistGrid::new(N, L);
        dst.mark_fourier();
        conv.convolve_hessians(&a, (0, 0), &b, (1, 1), assign_to(dst.kspace_mut()));

        // reference: spectral Hessians, pointwise product, forward DFT
        let mut ha = DistGrid::new(N, L);
        ha.copy_from(&a);
        hessian_component(&mut ha, 0, 0);
        ha.fft_backward(&engine, true);
        let mut hb = DistGrid::new(N, L);
        hb.copy_from(&b);
        hessian_component(&mut hb, 1, 1);
        hb.fft_backward(&engine, true);
        let prod: Vec<f64> = ha
            .real()
            .iter()
            .zip(hb.real())
            .map(|(x, y)| x * y)
            .collect();
        let mut refg = DistGrid::new(N, L);
        refg.real_mut().copy_from_slice(&prod);
        refg.fft_forward(&engine);

        let scale: f64 = refg.kspace().iter().map(|v| v.norm()).fold(0.0, f64::max);
        for (x, y) in dst.kspace().iter().zip(refg.kspace()) {
            assert!(
                (x - y).norm() < 1e-9 * scale,
                "dealiased product deviates: {x} vs {y}"
            );
        }
    }

    #[test]
    fn three_factor_product_matches_direct() {
        let engine = FftEngine::new(N);
        let mut a = mode(0, 1);
        let mut b = mode(1, 1);
        let mut c = mode(2, 1);
        a.fft_forward(&engine);
        b.fft_forward(&engine);
        c.fft_forward(&engine);

        let mut conv = DealiasedConvolver::new(N, L);
        let mut dst = DistGrid::new(N, L);
        dst.mark_fourier();
        conv.convolve_hessians3(
            &a,
            (0, 0),
            &b,
            (1, 1),
            &c,
            (2, 2),
            assign_to(dst.kspace_mut()),
        );

        let mut reference = DistGrid::new(N, L);
        let kf = TAU / L;
        let amp = kf * kf;
        reference.apply_r(|_, r| {
            -amp * (kf * r.x).cos() * -amp * (kf * r.y).cos() * -amp * (kf * r.z).cos()
        });
        reference.fft_forward(&engine);

        let scale: f64 = reference
            .kspace()
            .iter()
            .map(|v| v.norm())
            .fold(0.0, f64::max);
        for (x, y) in dst.kspace().iter().zip(reference.kspace()) {
            assert!((x - y).norm() < 1e-9 * scale);
        }
    }

    #[test]
    fn writers_compose_linearly() {
        let engine = FftEngine::new(N);
        let mut a = mode(0, 2);
        a.fft_forward(&engine);

        let mut conv = DealiasedConvolver::new(N, L);
        let mut once = DistGrid::new(N, L);
        once.mark_fourier();
        conv.convolve_hessians(&a, (0, 0), &a, (0, 0), assign_to(once.kspace_mut()));

        let mut acc = DistGrid::new(N, L);
        acc.mark_fourier();
        conv.convolve_hessians(&a, (0, 0), &a, (0, 0), assign_to(acc.kspace_mut()));
        conv.convolve_hessians(&a, (0, 0), &a, (0, 0), add_twice_to(acc.kspace_mut()));
        conv.convolve_hessians(&a, (0, 0), &a, (0, 0), subtract_from(acc.kspace_mut()));
        conv.convolve_hessians(&a, (0, 0), &a, (0, 0), subtract_twice_from(acc.kspace_mut()));

        // 1 + 2 - 1 - 2 = 0
        for v in acc.kspace() {
            assert!(v.norm() < 1e-9);
        }
        assert!(once.kspace().iter().any(|v| v.norm() > 1e-6));
    }

    #[test]
    fn sum_and_difference_kernels_split() {
        let engine = FftEngine::new(N);
        let mut a = mode(0, 2);
        let mut b = mode(1, 2);
        a.fft_forward(&engine);
        b.fft_forward(&engine);

        let mut conv = DealiasedConvolver::new(N, L);
        let mut sum = DistGrid::new(N, L);
        sum.mark_fourier();
        conv.convolve_sum_of_hessians(&a, (0, 0), &b, (1, 1), (2, 2), assign_to(sum.kspace_mut()));

        let mut pieces = DistGrid::new(N, L);
        pieces.mark_fourier();
        conv.convolve_hessians(&a, (0, 0), &b, (1, 1), assign_to(pieces.kspace_mut()));
        conv.convolve_hessians(&a, (0, 0), &b, (2, 2), add_to(pieces.kspace_mut()));

        let scale: f64 = sum.kspace().iter().map(|v| v.norm()).fold(0.0, f64::max);
        for (x, y) in sum.kspace().iter().zip(pieces.kspace()) {
            assert!((x - y).norm() < 1e-9 * (scale + 1.0));
        }

        let mut diff = DistGrid::new(N, L);
        diff.mark_fourier();
        conv.convolve_difference_of_hessians(
            &a,
            (0, 0),
            &b,
            (1, 1),
            (2, 2),
            assign_to(diff.kspace_mut()),
        );
        let mut pieces2 = DistGrid::new(N, L);
        pieces2.mark_fourier();
        conv.convolve_hessians(&a, (0, 0), &b, (1, 1), assign_to(pieces2.kspace_mut()));
        conv.convolve_hessians(&a, (0, 0), &b, (2, 2), subtract_from(pieces2.kspace_mut()));
        for (x, y) in diff.kspace().iter().zip(pieces2.kspace()) {
            assert!((x - y).norm() < 1e-9 * (scale + 1.0));
        }
    }
}
