//! Seamless noise sampling for generated textures.
//!
//! An axis that must tile is mapped onto a circle in noise space, so `0` and
//! `1` resolve to the same point:
//!   (cos(2π·t), sin(2π·t)) · frequency
//! An axis that need not tile is mapped onto a straight line of the same
//! length (2π·frequency), which keeps the feature size equal on both axes.
//! Either way every UV pair becomes a 4D sample point.

use std::f64::consts::TAU;

use noise::NoiseFn;

/// Which texture axes wrap without a seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeamlessAxes {
    None,
    X,
    Y,
    #[default]
    Both,
}

impl SeamlessAxes {
    /// Parses the generator's axis notation: `"xy"`, `"x"`, `"y"`, or
    /// anything else for no tiling.
    pub fn parse(axes: &str) -> Self {
        let axes = axes.to_ascii_lowercase();
        match (axes.contains('x'), axes.contains('y')) {
            (true, true) => SeamlessAxes::Both,
            (true, false) => SeamlessAxes::X,
            (false, true) => SeamlessAxes::Y,
            (false, false) => SeamlessAxes::None,
        }
    }

    pub fn wraps_x(self) -> bool {
        matches!(self, SeamlessAxes::X | SeamlessAxes::Both)
    }

    pub fn wraps_y(self) -> bool {
        matches!(self, SeamlessAxes::Y | SeamlessAxes::Both)
    }
}

/// Samples a 4D noise function so the chosen axes tile.
pub struct SeamlessNoise<N> {
    noise: N,
    pub frequency: f64,
    pub axes: SeamlessAxes,
}

impl<N: NoiseFn<f64, 4>> SeamlessNoise<N> {
    pub fn new(noise: N, frequency: f64, axes: SeamlessAxes) -> Self {
        Self {
            noise,
            frequency,
            axes,
        }
    }

    /// Sample at normalised UV coordinates in [0, 1].
    pub fn get(&self, u: f64, v: f64) -> f64 {
        let [nx, ny] = self.axis(u, self.axes.wraps_x());
        let [nz, nw] = self.axis(v, self.axes.wraps_y());
        self.noise.get([nx, ny, nz, nw])
    }

    fn axis(&self, t: f64, wraps: bool) -> [f64; 2] {
        if wraps {
            [(TAU * t).cos() * self.frequency, (TAU * t).sin() * self.frequency]
        } else {
            [TAU * t * self.frequency, 0.0]
        }
    }
}

/// Samples a `width × height` grid, row-major, values in `[-1, 1]`.
pub fn sample_grid<N: NoiseFn<f64, 4>>(
    noise: &SeamlessNoise<N>,
    width: u32,
    height: u32,
) -> Vec<f64> {
    let w = width as f64;
    let h = height as f64;
    (0..height)
        .flat_map(|y| (0..width).map(move |x| noise.get(x as f64 / w, y as f64 / h)))
        .collect()
}

/// Map a raw noise sample from `[-1, 1]` to `[0, 1]`.
#[inline]
pub fn normalize(v: f64) -> f64 {
    (v * 0.5 + 0.5).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use noise::Perlin;

    use super::*;

    #[test]
    fn axis_notation_parses() {
        assert_eq!(SeamlessAxes::parse("xy"), SeamlessAxes::Both);
        assert_eq!(SeamlessAxes::parse("YX"), SeamlessAxes::Both);
        assert_eq!(SeamlessAxes::parse("x"), SeamlessAxes::X);
        assert_eq!(SeamlessAxes::parse("y"), SeamlessAxes::Y);
        assert_eq!(SeamlessAxes::parse("off"), SeamlessAxes::None);
        assert_eq!(SeamlessAxes::parse(""), SeamlessAxes::None);
    }

    #[test]
    fn samples_vary() {
        let noise = SeamlessNoise::new(Perlin::new(1), 4.0, SeamlessAxes::Both);
        let samples = sample_grid(&noise, 64, 64);
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let variance =
            samples.iter().map(|&s| (s - mean).powi(2)).sum::<f64>() / samples.len() as f64;
        assert!(variance.sqrt() > 0.1, "stddev {}", variance.sqrt());
    }

    #[test]
    fn wrapped_axes_have_no_seam() {
        let noise = SeamlessNoise::new(Perlin::new(42), 3.0, SeamlessAxes::Both);
        for t in [0.0, 0.25, 0.5, 0.75] {
            assert!((noise.get(0.0, t) - noise.get(1.0, t)).abs() < 1e-10);
            assert!((noise.get(t, 0.0) - noise.get(t, 1.0)).abs() < 1e-10);
        }
    }

    #[test]
    fn only_the_requested_axis_wraps() {
        let noise = SeamlessNoise::new(Perlin::new(7), 3.0, SeamlessAxes::X);
        let ts = [0.1, 0.3, 0.55, 0.8];
        for t in ts {
            assert!((noise.get(0.0, t) - noise.get(1.0, t)).abs() < 1e-10);
        }
        let seam: f64 = ts
            .iter()
            .map(|&t| (noise.get(t, 0.0) - noise.get(t, 1.0)).abs())
            .sum();
        assert!(seam > 1e-3, "y axis unexpectedly tiles");
    }
}
