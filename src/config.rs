//! Run parameters and the coefficients derived from them.
//!
//! INI parsing lives with the caller; this module defines the typed shape
//! a loader deserializes into and turns it into the per-run constants the
//! cascade consumes. Growth factor and velocity factor come from the
//! external cosmology calculator.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::IcError;

/// The `setup` / `output` parameters of a run, with the file-format
/// defaults applied by serde.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Grid resolution N.
    pub grid_res: usize,
    /// Box side length L.
    pub box_length: f64,
    /// Starting redshift.
    pub zstart: f64,
    /// Requested LPT order; anything above 3 is clamped down.
    #[serde(default = "default_lpt_order")]
    pub lpt_order: i64,
    /// Put particles on a body-centered-cubic lattice (2N³ particles).
    #[serde(default)]
    pub bcc_lattice: bool,
    /// Symplectic PT: third-order velocity correction, order forced to 2.
    #[serde(default)]
    pub symplectic_pt: bool,
    /// Replace each Gaussian mode by its phase (|x_k| = 1).
    #[serde(default)]
    pub do_fixing: bool,
    /// Ship the assembled potentials to the output sink as named grids
    /// instead of displacements.
    #[serde(default)]
    pub diagnostic_potentials: bool,
    /// Target file for the sink's grid/particle datasets.
    #[serde(default)]
    pub fname_hdf5: String,
    /// Prefix for the diagnostic power spectra.
    #[serde(default = "default_fbase")]
    pub fbase_analysis: String,
}

fn default_lpt_order() -> i64 {
    100
}

fn default_fbase() -> String {
    "input_powerspec".into()
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            grid_res: 0,
            box_length: 0.0,
            zstart: 0.0,
            lpt_order: default_lpt_order(),
            bcc_lattice: false,
            symplectic_pt: false,
            do_fixing: false,
            diagnostic_potentials: false,
            fname_hdf5: String::new(),
            fbase_analysis: default_fbase(),
        }
    }
}

/// Outputs of the external cosmology calculator at the starting epoch:
/// D+(a_start)/D+(1) and the velocity conversion factor.
#[derive(Debug, Clone, Copy)]
pub struct GrowthFactors {
    pub dplus: f64,
    pub vfac: f64,
}

/// Validated run constants.
#[derive(Debug, Clone)]
pub struct Params {
    pub n: usize,
    pub boxlen: f64,
    pub zstart: f64,
    pub astart: f64,
    pub lpt_order: u32,
    pub bcc: bool,
    pub symplectic: bool,
    pub fixing: bool,
    pub diagnostic_potentials: bool,
    pub dplus: f64,
    pub vfac: f64,
    /// (L/N/2π)^{3/2}, the mode-amplitude volume factor of φ(1).
    pub volfac: f64,
    pub g1: f64,
    pub g2: f64,
    pub g3a: f64,
    pub g3b: f64,
    pub g3c: f64,
    pub vfac1: f64,
    pub vfac2: f64,
    pub vfac3: f64,
    pub fname_hdf5: String,
    pub fbase_analysis: String,
}

impl RunConfig {
    /// Validate and derive the run constants.
    pub fn build(&self, growth: GrowthFactors) -> Result<Params, IcError> {
        if self.grid_res == 0 {
            return Err(IcError::Config("setup.GridRes must be positive".into()));
        }
        if !(self.box_length > 0.0) {
            return Err(IcError::Config("setup.BoxLength must be positive".into()));
        }
        if !(self.zstart >= 0.0) {
            return Err(IcError::Config("setup.zstart must be non-negative".into()));
        }
        if !(growth.dplus.is_finite() && growth.dplus > 0.0 && growth.vfac.is_finite()) {
            return Err(IcError::Numeric(
                "growth factors from the cosmology calculator are not usable".into(),
            ));
        }

        let mut order = self.lpt_order.clamp(1, 3) as u32;
        if self.symplectic_pt && order != 2 {
            warn!("SymplecticPT has been selected and will overwrite chosen order of LPT to 2");
            order = 2;
        }

        let astart = 1.0 / (1.0 + self.zstart);
        let d = growth.dplus;
        let vfac = growth.vfac;
        let g2 = if order > 1 { -3.0 / 7.0 * d * d } else { 0.0 };
        let g3a = if order > 2 { -1.0 / 3.0 * d * d * d } else { 0.0 };
        let g3b = if order > 2 { 10.0 / 21.0 * d * d * d } else { 0.0 };
        // the symplectic velocity correction is third order too
        let g3c = if order > 2 || self.symplectic_pt {
            -1.0 / 7.0 * d * d * d
        } else {
            0.0
        };

        Ok(Params {
            n: self.grid_res,
            boxlen: self.box_length,
            zstart: self.zstart,
            astart,
            lpt_order: order,
            bcc: self.bcc_lattice,
            symplectic: self.symplectic_pt,
            fixing: self.do_fixing,
            diagnostic_potentials: self.diagnostic_potentials,
            dplus: d,
            vfac,
            volfac: (self.box_length / self.grid_res as f64 / std::f64::consts::TAU).powf(1.5),
            g1: -d,
            g2,
            g3a,
            g3b,
            g3c,
            vfac1: vfac,
            vfac2: 2.0 * vfac,
            vfac3: 3.0 * vfac,
            fname_hdf5: self.fname_hdf5.clone(),
            fbase_analysis: self.fbase_analysis.clone(),
        })
    }
}
