//! Eulerian density and velocity fields from a semiclassical wavefunction.
//!
//! The Madelung picture of the displacement potential: build ψ = exp(iΦ/ℏ),
//! apply one kinetic drift in Fourier space, and read density and momentum
//! off the evolved wavefunction. ℏ is tied to the potential's scatter so
//! the phase stays resolvable on the grid.

use rayon::prelude::*;
use tracing::info;

use crate::cascade::LptSolver;
use crate::emit::{FluidComponent, OutputSink, Species};
use crate::error::IcError;
use crate::grid::{ComplexGrid, DistGrid};
use crate::Cplx;

/// Propagate the wavefunction one drift step and emit ρ = |ψ|²−1 and the
/// probability-current velocity through the sink.
pub fn propagate(
    solver: &mut LptSolver,
    sink: &mut dyn OutputSink,
    species: Species,
) -> Result<(), IcError> {
    let p = solver.params().clone();
    let engine = solver.engine().clone();
    let (n, l) = (p.n, p.boxlen);

    solver.phi.fft_backward(&engine, true);
    let std_phi1 = solver.phi.std();
    if std_phi1 == 0.0 {
        return Err(IcError::Numeric(
            "sigma(phi1) vanishes, cannot set hbar for the semiclassical step".into(),
        ));
    }
    let hbar = std::f64::consts::TAU / n as f64 * (2.0 * std_phi1 / p.dplus);
    info!("semiclassical PT: hbar = {hbar:.6e} from sigma(phi1) = {std_phi1:.6e}");

    // psi = exp(i (phi + phi2) / (D+ hbar)); first order drops phi2
    let mut psi = ComplexGrid::new(n, l);
    if p.lpt_order == 1 {
        let phi = solver.phi.real();
        psi.fill_indexed(|idx| (Cplx::new(0.0, 1.0 / hbar) * (phi[idx] / p.dplus)).exp());
    } else {
        solver.phi2.fft_backward(&engine, true);
        let phi = solver.phi.real();
        let phi2 = solver.phi2.real();
        psi.fill_indexed(|idx| {
            (Cplx::new(0.0, 1.0 / hbar) * ((phi[idx] + phi2[idx]) / p.dplus)).exp()
        });
    }

    // one kinetic drift: psi <- psi * exp(-i hbar k² D+ / 2)
    psi.fft_forward(&engine);
    psi.apply_k(|e, k| {
        let k2 = k[0] * k[0] + k[1] * k[1] + k[2] * k[2];
        e * (Cplx::new(0.0, -0.5) * (hbar * k2 * p.dplus)).exp()
    });
    psi.fft_backward(&engine, true);

    if p.lpt_order >= 2 {
        let phi2 = solver.phi2.real();
        psi.map_indexed(|idx, v| v * (Cplx::new(0.0, 1.0 / hbar) * (phi2[idx] / p.dplus)).exp());
    }

    // density
    let mut rho = DistGrid::new(n, l);
    {
        let pv = psi.values();
        rho.real_mut()
            .par_iter_mut()
            .enumerate()
            .for_each(|(idx, v)| *v = pv[idx].norm_sqr() - 1.0);
    }
    sink.write_grid_data(&rho, species, FluidComponent::Density)?;
    rho.fft_forward(&engine);
    rho.write_power_spectrum(format!(
        "{}_sampled_evolved_semiclassical.txt",
        p.fbase_analysis
    ))?;
    rho.fft_backward(&engine, true);

    // velocity: v_d = Im(conj(psi) ∂_d psi) / (hbar (1 + rho))
    let mut grad_psi = ComplexGrid::new(n, l);
    let mut tmp = DistGrid::new(n, l);
    for d in 0..3 {
        grad_psi.copy_from(&psi);
        grad_psi.fft_forward(&engine);
        grad_psi.apply_k(|x, k| x * Cplx::new(0.0, k[d]));
        grad_psi.fft_backward(&engine, true);
        {
            let pv = psi.values();
            let gv = grad_psi.values();
            let rv = rho.real();
            tmp.real_mut().par_iter_mut().enumerate().for_each(|(idx, v)| {
                *v = (pv[idx].conj() * gv[idx]).im / (hbar * (1.0 + rv[idx]));
            });
        }
        sink.write_grid_data(&tmp, species, FluidComponent::velocity(d))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GrowthFactors, RunConfig};
    use crate::emit::{OutputType, ParticleBuffer};

    struct FieldSink {
        density: Option<Vec<f64>>,
        velocities: usize,
    }

    impl OutputSink for FieldSink {
        fn write_species_as(&self, _s: Species) -> OutputType {
            OutputType::FieldEulerian
        }

        fn position_unit(&self) -> f64 {
            1.0
        }

        fn velocity_unit(&self) -> f64 {
            1.0
        }

        fn write_grid_data(
            &mut self,
            grid: &DistGrid,
            _s: Species,
            c: FluidComponent,
        ) -> Result<(), IcError> {
            match c {
                FluidComponent::Density => self.density = Some(grid.real().to_vec()),
                _ => self.velocities += 1,
            }
            Ok(())
        }

        fn write_particle_data(
            &mut self,
            _p: &ParticleBuffer,
            _s: Species,
        ) -> Result<(), IcError> {
            Ok(())
        }
    }

    /// The phase construction and the drift are unitary, so the sampled
    /// probability ∫(1+δ)dV must stay exactly N³.
    #[test]
    fn probability_is_conserved() {
        let n = 16;
        let cfg = RunConfig {
            grid_res: n,
            box_length: 100.0,
            zstart: 49.0,
            lpt_order: 2,
            fbase_analysis: "test_semiclassical_ps".into(),
            ..RunConfig::default()
        };
        let p = cfg
            .build(GrowthFactors {
                dplus: 0.02,
                vfac: 1.0,
            })
            .unwrap();
        let mut solver = LptSolver::new(&p);
        let mut noise = {
            let mut x = 77u64;
            move |_: usize, _: usize, _: usize| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                (x & 0xFFFF_FFFF) as f64 / (u32::MAX as f64 + 1.0) - 0.5
            }
        };
        solver.compute(&mut noise, |_| 1.0).unwrap();

        let mut sink = FieldSink {
            density: None,
            velocities: 0,
        };
        propagate(&mut solver, &mut sink, Species::DarkMatter).unwrap();

        let rho = sink.density.expect("density was written");
        let total: f64 = rho.iter().map(|d| 1.0 + d).sum();
        let expect = (n * n * n) as f64;
        assert!(
            (total - expect).abs() / expect < 1e-10,
            "probability drifted: {total} vs {expect}"
        );
        assert_eq!(sink.velocities, 3);
        let _ = std::fs::remove_file("test_semiclassical_ps_sampled_evolved_semiclassical.txt");
    }

    #[test]
    fn vanishing_phi_scatter_is_a_numeric_error() {
        let cfg = RunConfig {
            grid_res: 8,
            box_length: 10.0,
            zstart: 9.0,
            lpt_order: 1,
            ..RunConfig::default()
        };
        let p = cfg
            .build(GrowthFactors {
                dplus: 0.5,
                vfac: 1.0,
            })
            .unwrap();
        let mut solver = LptSolver::new(&p);
        solver.compute(|_, _, _| 0.25, |_| 0.0).unwrap();
        let mut sink = FieldSink {
            density: None,
            velocities: 0,
        };
        let err = propagate(&mut solver, &mut sink, Species::DarkMatter).unwrap_err();
        assert!(matches!(err, IcError::Numeric(_)));
    }
}
