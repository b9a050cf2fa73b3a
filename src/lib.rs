#![allow(clippy::needless_range_loop)]

//! Cosmological initial conditions from Lagrangian perturbation theory.
//!
//! Given a linear matter power spectrum and a Gaussian white-noise
//! realization on a periodic cubic grid, this crate produces particle
//! displacements and velocities (or Eulerian density/velocity fields)
//! consistent with LPT up to third order: Zel'dovich, 2LPT and the 3LPT
//! longitudinal terms φ(3a), φ(3b) plus the transverse vector A(3). The
//! API is split into the field machinery (`grid`, `fft`, `spectral`,
//! `convolve`), the cascade that assembles the potentials (`cascade`), and
//! the two output paths (`emit` for Lagrangian particles/fields,
//! `semiclassical` for Eulerian fields via a wavefunction drift).
//!
//! The cosmology calculator, random-number source and on-disk format are
//! collaborators supplied by the caller: an amplitude callback √P(k), a
//! per-cell noise closure, and an [`emit::OutputSink`] implementation.

use rustfft::num_complex::Complex;
use tracing::info;

pub mod cascade;
pub mod config;
pub mod convolve;
pub mod emit;
pub mod error;
pub mod fft;
pub mod grid;
pub mod semiclassical;
pub mod spectral;

pub use cascade::LptSolver;
pub use config::{GrowthFactors, Params, RunConfig};
pub use emit::{FluidComponent, OutputSink, OutputType, ParticleBuffer, Species};
pub use error::IcError;
pub use grid::{ComplexGrid, DistGrid, Slab, Space};

/// The complex scalar used throughout the spectral pipeline.
pub type Cplx = Complex<f64>;

/// Generate initial conditions for every species and dispatch them to the
/// output sink. `noise` delivers one white-noise sample per globally
/// indexed cell and is drawn from again for each species; `amplitude` is
/// the linear amplitude √P(k) from the cosmology calculator.
pub fn run<N, A>(
    cfg: &RunConfig,
    growth: GrowthFactors,
    mut noise: N,
    amplitude: A,
    sink: &mut dyn OutputSink,
) -> Result<(), IcError>
where
    N: FnMut(usize, usize, usize) -> f64,
    A: Fn(f64) -> f64 + Sync,
{
    let params = cfg.build(growth)?;

    for species in [Species::DarkMatter, Species::Baryon] {
        info!("computing ICs for species '{species}'");
        let mut solver = LptSolver::new(&params);
        solver.compute(&mut noise, &amplitude)?;

        if params.diagnostic_potentials {
            emit::emit_diagnostic_potentials(&mut solver, sink, species)?;
            continue;
        }

        match sink.write_species_as(species) {
            OutputType::FieldEulerian => semiclassical::propagate(&mut solver, sink, species)?,
            OutputType::Particles | OutputType::FieldLagrangian => {
                emit::emit_lagrangian(&mut solver, sink, species)?
            }
        }
    }
    Ok(())
}
