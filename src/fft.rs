//! Separable 3D FFT passes over slab-ordered storage.
//!
//! Z is the contiguous (fast) axis and is transformed real-to-complex; Y and
//! X follow as complex-to-complex column passes. Forward transforms are
//! unscaled, the backward direction divides by N³ when asked to, matching
//! the grid's normalization contract. Plans are created once per engine and
//! shared across threads; the Z-row passes run on the rayon pool.

use std::sync::Arc;

use rayon::prelude::*;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{Fft, FftPlanner};

use crate::grid::Slab;
use crate::Cplx;

/// FFT plans for one cubic transform size. Cheap to clone; the plans are
/// shared behind `Arc`.
#[derive(Clone)]
pub struct FftEngine {
    n: usize,
    r2c_z: Arc<dyn RealToComplex<f64>>,
    c2r_z: Arc<dyn ComplexToReal<f64>>,
    fwd: Arc<dyn Fft<f64>>,
    inv: Arc<dyn Fft<f64>>,
}

impl FftEngine {
    pub fn new(n: usize) -> Self {
        let mut rplanner = RealFftPlanner::<f64>::new();
        let mut planner = FftPlanner::<f64>::new();
        Self {
            n,
            r2c_z: rplanner.plan_fft_forward(n),
            c2r_z: rplanner.plan_fft_inverse(n),
            fwd: planner.plan_fft_forward(n),
            inv: planner.plan_fft_inverse(n),
        }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Real-to-complex forward 3D DFT of a slab. The real input is consumed
    /// as scratch. Unscaled.
    pub fn fft3d_r2c(&self, data_r: &mut [f64], out: &mut [Cplx], slab: Slab) {
        let n = self.n;
        let nzc = n / 2 + 1;
        assert_eq!(slab.n, n, "slab resolution does not match FFT plans");
        assert_eq!(data_r.len(), slab.real_len());
        assert_eq!(out.len(), slab.spec_len());

        // Z: R2C rows (contiguous)
        data_r
            .par_chunks_exact_mut(n)
            .zip(out.par_chunks_exact_mut(nzc))
            .for_each(|(row_r, row_k)| {
                self.r2c_z.process(row_r, row_k).unwrap();
            });

        self.pass_y(out, slab.n0_local, nzc, &self.fwd);
        self.pass_x(out, slab, nzc, &self.fwd);
    }

    /// Complex-to-real inverse 3D DFT. The spectrum is consumed as scratch.
    /// With `normalize` the output is divided by N³.
    pub fn fft3d_c2r(&self, data_k: &mut [Cplx], out: &mut [f64], slab: Slab, normalize: bool) {
        let n = self.n;
        let nzc = n / 2 + 1;
        assert_eq!(slab.n, n, "slab resolution does not match FFT plans");
        assert_eq!(data_k.len(), slab.spec_len());
        assert_eq!(out.len(), slab.real_len());

        self.pass_x(data_k, slab, nzc, &self.inv);
        self.pass_y(data_k, slab.n0_local, nzc, &self.inv);

        // Z: C2R rows (contiguous)
        data_k
            .par_chunks_exact_mut(nzc)
            .zip(out.par_chunks_exact_mut(n))
            .for_each(|(row_k, row_r)| {
                // real-signal constraint at DC / Nyquist along z
                row_k[0].im = 0.0;
                if n % 2 == 0 {
                    row_k[nzc - 1].im = 0.0;
                }
                self.c2r_z.process(row_k, row_r).unwrap();
            });

        if normalize {
            let norm = 1.0 / (n * n * n) as f64;
            out.par_iter_mut().for_each(|v| *v *= norm);
        }
    }

    /// Full-complex 3D DFT, used by the wavefunction grid. In-place.
    pub fn fft3d_c2c(&self, data: &mut [Cplx], slab: Slab, forward: bool, normalize: bool) {
        let n = self.n;
        assert_eq!(slab.n, n, "slab resolution does not match FFT plans");
        assert_eq!(data.len(), slab.n0_local * n * n);
        let fft = if forward { &self.fwd } else { &self.inv };

        // Z rows are contiguous complex rows here
        data.par_chunks_exact_mut(n).for_each_init(
            || vec![Cplx::new(0.0, 0.0); fft.get_inplace_scratch_len()],
            |scratch, row| fft.process_with_scratch(row, scratch),
        );

        self.pass_y(data, slab.n0_local, n, fft);
        self.pass_x(data, slab, n, fft);

        if normalize {
            let norm = 1.0 / (n * n * n) as f64;
            data.par_iter_mut().for_each(|v| *v *= norm);
        }
    }

    /// C2C columns along Y, one plane per rayon task. `nrow` is the row
    /// length along Z (N/2+1 for half-complex data, N for full-complex).
    fn pass_y(&self, data: &mut [Cplx], n0: usize, nrow: usize, fft: &Arc<dyn Fft<f64>>) {
        let n = self.n;
        debug_assert_eq!(data.len(), n0 * n * nrow);
        data.par_chunks_exact_mut(n * nrow).for_each_init(
            || {
                (
                    vec![Cplx::new(0.0, 0.0); n],
                    vec![Cplx::new(0.0, 0.0); fft.get_inplace_scratch_len()],
                )
            },
            |(tmp, scratch), plane| {
                for iz in 0..nrow {
                    for (c, j) in (0..n).enumerate() {
                        tmp[c] = plane[j * nrow + iz];
                    }
                    fft.process_with_scratch(tmp, scratch);
                    for (c, j) in (0..n).enumerate() {
                        plane[j * nrow + iz] = tmp[c];
                    }
                }
            },
        );
    }

    /// C2C columns along X (most strided). In a distributed build this is
    /// where the slab transpose would sit; here the whole axis is local.
    fn pass_x(&self, data: &mut [Cplx], slab: Slab, nrow: usize, fft: &Arc<dyn Fft<f64>>) {
        let n = self.n;
        assert_eq!(
            slab.n0_local, n,
            "axis-0 FFT pass requires the full axis on this rank"
        );
        let plane = n * nrow;
        let mut tmp = vec![Cplx::new(0.0, 0.0); n];
        let mut scratch = vec![Cplx::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        for j in 0..n {
            for iz in 0..nrow {
                for (c, i) in (0..n).enumerate() {
                    tmp[c] = data[i * plane + j * nrow + iz];
                }
                fft.process_with_scratch(&mut tmp, &mut scratch);
                for (c, i) in (0..n).enumerate() {
                    data[i * plane + j * nrow + iz] = tmp[c];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splat(seed: u64, len: usize) -> Vec<f64> {
        let mut x = seed;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                (x & 0xFFFF_FFFF) as f64 / (u32::MAX as f64 + 1.0) - 0.5
            })
            .collect()
    }

    #[test]
    fn r2c_roundtrip_recovers_input() {
        let n = 16;
        let slab = Slab::full(n);
        let engine = FftEngine::new(n);
        let orig = splat(0x5eed, slab.real_len());

        let mut re = orig.clone();
        let mut ks = vec![Cplx::new(0.0, 0.0); slab.spec_len()];
        engine.fft3d_r2c(&mut re, &mut ks, slab);
        engine.fft3d_c2r(&mut ks, &mut re, slab, true);

        let err: f64 = orig
            .iter()
            .zip(&re)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt();
        let norm: f64 = orig.iter().map(|a| a * a).sum::<f64>().sqrt();
        assert!(err / norm < 1e-12, "roundtrip error {}", err / norm);
    }

    #[test]
    fn c2c_roundtrip_recovers_input() {
        let n = 8;
        let slab = Slab::full(n);
        let engine = FftEngine::new(n);
        let re = splat(0xabcd, n * n * n);
        let im = splat(0x1234, n * n * n);
        let orig: Vec<Cplx> = re
            .iter()
            .zip(&im)
            .map(|(&a, &b)| Cplx::new(a, b))
            .collect();

        let mut data = orig.clone();
        engine.fft3d_c2c(&mut data, slab, true, false);
        engine.fft3d_c2c(&mut data, slab, false, true);

        for (a, b) in orig.iter().zip(&data) {
            assert!((a - b).norm() < 1e-12);
        }
    }

    #[test]
    fn forward_dc_is_plain_sum() {
        let n = 8;
        let slab = Slab::full(n);
        let engine = FftEngine::new(n);
        let mut re = vec![1.5; slab.real_len()];
        let mut ks = vec![Cplx::new(0.0, 0.0); slab.spec_len()];
        engine.fft3d_r2c(&mut re, &mut ks, slab);
        let expect = 1.5 * (n * n * n) as f64;
        assert!((ks[0].re - expect).abs() < 1e-9);
        assert!(ks[0].im.abs() < 1e-9);
    }
}
