use nalgebra::{Matrix3, Vector3};

use crate::core::domain::Structure;

/// Uniaxial strain tensor `x·(d ⊗ d)` for a unit direction `d`.
#[inline]
pub fn uniaxial(direction: &Vector3<f64>, x: f64) -> Matrix3<f64> {
    direction * direction.transpose() * x
}

/// Builds the trial structure for strain `x` along `direction`.
///
/// The same strain is applied to the lattice vectors and to the Cartesian
/// positions, so fractional coordinates are preserved.
///
/// **Invariant**: `original` is never modified.
pub fn change_structure(original: &Structure, direction: &Vector3<f64>, x: f64) -> Structure {
    let strain = uniaxial(direction, x);
    let mut strained = original.clone();
    strained.cell += strain * original.cell;
    for atom in &mut strained.atoms {
        atom.position += strain * atom.position.coords;
    }
    strained
}

/// Directory key for a trial strain value.
///
/// Ten significant digits, left-aligned and padded with zeros to twelve
/// characters, so that `0.05` maps to `0.0500000000`. Non-zero values too
/// small for the fixed rendering use scientific notation, so they never share
/// the key of `0.0`.
pub fn strain_key(x: f64) -> String {
    let mut s = if x == 0.0 {
        "0.0".to_string()
    } else {
        let magnitude = x.abs().log10().floor() as i32;
        let decimals = (9 - magnitude).clamp(1, 17) as usize;
        let mut s = format!("{:.*}", decimals, x);
        while s.ends_with('0') && !s.ends_with(".0") {
            s.pop();
        }
        if s.trim_start_matches('-') == "0.0" {
            return format!("{:.9e}", x);
        }
        s
    };
    while s.len() < 12 {
        s.push('0');
    }
    s
}
