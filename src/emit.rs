//! Packs cascade results into particles or named grids and hands them to
//! the output collaborator.
//!
//! Displacement and velocity fields are assembled per axis in Fourier space
//! by combining the potentials with the curl of A(3), back-transformed into
//! one scratch grid, and either stored into the particle records or shipped
//! to the sink directly. The BCC sublattice reuses the same scratch field
//! after a half-cell stagger.

use std::fmt;

use lin_alg::f32::Vec3 as Vec3f;
use rayon::prelude::*;
use tracing::info;

use crate::cascade::LptSolver;
use crate::error::IcError;
use crate::grid::DistGrid;
use crate::spectral::negative_laplacian;
use crate::Cplx;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Species {
    DarkMatter,
    Baryon,
    Neutrino,
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Species::DarkMatter => "dark matter",
            Species::Baryon => "baryons",
            Species::Neutrino => "neutrinos",
        })
    }
}

/// What the output plugin wants for a species.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputType {
    Particles,
    FieldLagrangian,
    FieldEulerian,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FluidComponent {
    Density,
    Dx,
    Dy,
    Dz,
    Vx,
    Vy,
    Vz,
}

impl FluidComponent {
    pub fn displacement(d: usize) -> Self {
        [Self::Dx, Self::Dy, Self::Dz][d]
    }

    pub fn velocity(d: usize) -> Self {
        [Self::Vx, Self::Vy, Self::Vz][d]
    }
}

/// Contiguous particle storage: position and velocity triples plus a 64-bit
/// ID per particle. IDs are globally unique and contiguous across ranks.
pub struct ParticleBuffer {
    pos: Vec<Vec3f>,
    vel: Vec<Vec3f>,
    ids: Vec<u64>,
    local_offset: u64,
}

impl ParticleBuffer {
    pub fn allocate(len: usize, local_offset: u64) -> Self {
        Self {
            pos: vec![Vec3f::new_zero(); len],
            vel: vec![Vec3f::new_zero(); len],
            ids: vec![0; len],
            local_offset,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn local_offset(&self) -> u64 {
        self.local_offset
    }

    pub fn set_id(&mut self, i: usize, id: u64) {
        self.ids[i] = id;
    }

    pub fn id(&self, i: usize) -> u64 {
        self.ids[i]
    }

    pub fn set_pos(&mut self, i: usize, d: usize, v: f32) {
        match d {
            0 => self.pos[i].x = v,
            1 => self.pos[i].y = v,
            _ => self.pos[i].z = v,
        }
    }

    pub fn pos(&self, i: usize) -> Vec3f {
        self.pos[i]
    }

    pub fn set_vel(&mut self, i: usize, d: usize, v: f32) {
        match d {
            0 => self.vel[i].x = v,
            1 => self.vel[i].y = v,
            _ => self.vel[i].z = v,
        }
    }

    pub fn vel(&self, i: usize) -> Vec3f {
        self.vel[i]
    }
}

/// The output-plugin contract. Implementations own their on-disk format;
/// the core only streams slabs and particle buffers through it.
pub trait OutputSink {
    fn write_species_as(&self, species: Species) -> OutputType;

    /// Affine scale applied to positions before they reach the plugin.
    fn position_unit(&self) -> f64;

    /// Affine scale applied to velocities.
    fn velocity_unit(&self) -> f64;

    fn write_grid_data(
        &mut self,
        grid: &DistGrid,
        species: Species,
        component: FluidComponent,
    ) -> Result<(), IcError>;

    fn write_particle_data(
        &mut self,
        particles: &ParticleBuffer,
        species: Species,
    ) -> Result<(), IcError>;

    /// Diagnostic dataset dump (`phi`, `phi2`, ...). Plugins without a
    /// diagnostic store may ignore it.
    fn write_named_grid(
        &mut self,
        _grid: &DistGrid,
        _species: Species,
        _name: &str,
    ) -> Result<(), IcError> {
        Ok(())
    }
}

/// Ψ_d(k) or V_d(k): combine the potentials and the curl of A(3) for one
/// axis into the scratch grid's spectrum.
fn combine_axis(tmp: &mut DistGrid, s: &LptSolver, d: usize, unit: f64, velocity: bool) {
    let p = s.params().clone();
    let dp = (d + 1) % 3;
    let dpp = (d + 2) % 3;
    let n = tmp.n();
    let nzc = n / 2 + 1;
    let slab = tmp.slab();
    let boxlen = p.boxlen;

    let phi = s.phi.kspace();
    let phi2 = s.phi2.kspace();
    let phi3a = s.phi3a.kspace();
    let phi3b = s.phi3b.kspace();
    let a3: [&[Cplx]; 3] = [s.a3[0].kspace(), s.a3[1].kspace(), s.a3[2].kspace()];
    let (kx, ky, kz) = s.phi.k_tables();

    tmp.mark_fourier();
    tmp.kspace_mut()
        .par_iter_mut()
        .enumerate()
        .for_each(|(idx, v)| {
            let iz = idx % nzc;
            let j = (idx / nzc) % n;
            let i = idx / (nzc * n);
            let kk = [kx[slab.offset0 + i], ky[j], kz[iz]];
            *v = if !velocity {
                let phitot = phi[idx] + phi2[idx] + phi3a[idx] + phi3b[idx];
                Cplx::new(0.0, unit)
                    * (phitot * kk[d] + a3[dpp][idx] * kk[dp] - a3[dp][idx] * kk[dpp])
                    / boxlen
            } else if !p.symplectic {
                let phitot_v = phi[idx] * p.vfac1
                    + phi2[idx] * p.vfac2
                    + (phi3a[idx] + phi3b[idx]) * p.vfac3;
                Cplx::new(0.0, unit)
                    * (phitot_v * kk[d]
                        + (a3[dpp][idx] * kk[dp] - a3[dp][idx] * kk[dpp]) * p.vfac3)
                    / boxlen
            } else {
                let phitot_v = phi[idx] * p.vfac1 + phi2[idx] * p.vfac2;
                Cplx::new(0.0, unit) * phitot_v * kk[d] / boxlen + a3[d][idx] * p.vfac1
            };
        });
}

/// Store one axis of the scratch field into the particle records, primary
/// lattice first, then the staggered BCC copy.
fn store_particle_axis(
    tmp: &mut DistGrid,
    particles: &mut ParticleBuffer,
    d: usize,
    lunit: Option<f64>,
    engine: &crate::fft::FftEngine,
    bcc: bool,
) {
    let n = tmp.n();
    let n0 = tmp.slab().n0_local;
    let num = tmp.slab().real_len();
    {
        let re = tmp.real();
        let mut ip = 0;
        for i in 0..n0 {
            for j in 0..n {
                for k in 0..n {
                    let base = lunit.map_or(0.0, |u| axis_coord(tmp.unit_r(i, j, k), d) * u);
                    match lunit {
                        Some(_) => particles.set_pos(ip, d, (base + re[ip]) as f32),
                        None => particles.set_vel(ip, d, re[ip] as f32),
                    }
                    ip += 1;
                }
            }
        }
    }

    if bcc {
        tmp.fft_forward(engine);
        tmp.stagger();
        tmp.fft_backward(engine, true);
        let re = tmp.real();
        let mut ip = 0;
        for i in 0..n0 {
            for j in 0..n {
                for k in 0..n {
                    let base =
                        lunit.map_or(0.0, |u| axis_coord(tmp.unit_r_staggered(i, j, k), d) * u);
                    match lunit {
                        Some(_) => particles.set_pos(num + ip, d, (base + re[ip]) as f32),
                        None => particles.set_vel(num + ip, d, re[ip] as f32),
                    }
                    ip += 1;
                }
            }
        }
    }
}

fn axis_coord(r: lin_alg::f64::Vec3, d: usize) -> f64 {
    match d {
        0 => r.x,
        1 => r.y,
        _ => r.z,
    }
}

/// Lagrangian output: displacements and velocities as particles or grids.
pub fn emit_lagrangian(
    solver: &mut LptSolver,
    sink: &mut dyn OutputSink,
    species: Species,
) -> Result<(), IcError> {
    let p = solver.params().clone();
    let engine = solver.engine().clone();
    let out_type = sink.write_species_as(species);
    let mut tmp = DistGrid::new(p.n, p.boxlen);
    let slab = tmp.slab();

    let mut particles = if out_type == OutputType::Particles {
        let num = slab.real_len();
        let m = if p.bcc { 2 * num } else { num };
        let id_offset = (if p.bcc { 2 } else { 1 }) as u64 * (slab.offset0 * p.n * p.n) as u64;
        let mut pb = ParticleBuffer::allocate(m, id_offset);
        for c in 0..m {
            pb.set_id(c, id_offset + c as u64);
        }
        info!("storing {} particles for {}", m, species);
        Some(pb)
    } else {
        None
    };

    // positions
    let lunit = sink.position_unit();
    for d in 0..3 {
        combine_axis(&mut tmp, solver, d, lunit, false);
        tmp.fft_backward(&engine, true);
        match particles.as_mut() {
            Some(pb) => store_particle_axis(&mut tmp, pb, d, Some(lunit), &engine, p.bcc),
            None => sink.write_grid_data(&tmp, species, FluidComponent::displacement(d))?,
        }
    }

    // velocities
    let vunit = sink.velocity_unit();
    for d in 0..3 {
        combine_axis(&mut tmp, solver, d, vunit, true);
        tmp.fft_backward(&engine, true);
        match particles.as_mut() {
            Some(pb) => store_particle_axis(&mut tmp, pb, d, None, &engine, p.bcc),
            None => sink.write_grid_data(&tmp, species, FluidComponent::velocity(d))?,
        }
    }

    if let Some(pb) = particles {
        sink.write_particle_data(&pb, species)?;
    } else {
        // density from first-order SPT for the Lagrangian field output
        tmp.copy_from(&solver.phi);
        negative_laplacian(&mut tmp);
        tmp.write_power_spectrum(format!("{}_sampled_SPT.txt", p.fbase_analysis))?;
        tmp.fft_backward(&engine, true);
        sink.write_grid_data(&tmp, species, FluidComponent::Density)?;
    }

    Ok(())
}

/// Ship the assembled potentials to the sink as named real-space grids.
pub fn emit_diagnostic_potentials(
    solver: &mut LptSolver,
    sink: &mut dyn OutputSink,
    species: Species,
) -> Result<(), IcError> {
    let engine = solver.engine().clone();
    let [a3x, a3y, a3z] = &mut solver.a3;
    let named: [(&mut DistGrid, &str); 7] = [
        (&mut solver.phi, "phi"),
        (&mut solver.phi2, "phi2"),
        (&mut solver.phi3a, "phi3a"),
        (&mut solver.phi3b, "phi3b"),
        (a3x, "A3x"),
        (a3y, "A3y"),
        (a3z, "A3z"),
    ];
    for (grid, name) in named {
        grid.fft_backward(&engine, true);
        sink.write_named_grid(grid, species, name)?;
        grid.fft_forward(&engine);
    }
    Ok(())
}
