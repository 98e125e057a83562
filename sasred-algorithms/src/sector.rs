//! Azimuthal/radial sector integration of 2-D detector frames.

use log::warn;
use ndarray::{Array2, ArrayD, IxDyn};
use sasred_core::{Error, FrameBuffer, Result, SectorGeometry};
use std::f64::consts::PI;

/// Per-pixel contribution table for one output axis.
///
/// A pixel's weight is split linearly between the two bins its coordinate
/// straddles, and every bin's accumulated intensity is divided by the
/// accumulated pixel area so partially covered bins are not biased low.
struct BinMap {
    bins: usize,
    axis: Vec<f64>,
    /// `(pixel, bin, weight)` triples for pixels inside the sector.
    weights: Vec<(usize, usize, f64)>,
    /// Per-bin sum of weights (effective area).
    area: Vec<f64>,
}

impl BinMap {
    fn accumulate(&self, values: &[f32], errors: Option<&[f64]>) -> (Vec<f32>, Option<Vec<f64>>) {
        let mut sums = vec![0.0f64; self.bins];
        let mut vars = errors.map(|_| vec![0.0f64; self.bins]);
        for &(pixel, bin, w) in &self.weights {
            sums[bin] += w * f64::from(values[pixel]);
            if let (Some(vars), Some(errors)) = (vars.as_mut(), errors) {
                vars[bin] += w * w * errors[pixel] * errors[pixel];
            }
        }
        let mut profile = vec![0.0f32; self.bins];
        for (bin, sum) in sums.iter().enumerate() {
            if self.area[bin] > 0.0 {
                #[allow(clippy::cast_possible_truncation)]
                {
                    profile[bin] = (sum / self.area[bin]) as f32;
                }
            }
        }
        let profile_errors = vars.map(|vars| {
            vars.iter()
                .zip(&self.area)
                .map(|(var, area)| if *area > 0.0 { var.sqrt() / area } else { 0.0 })
                .collect()
        });
        (profile, profile_errors)
    }
}

/// Sector integration stage: reduces each 2-D frame to 1-D radial and/or
/// azimuthal profiles inside an annular sector.
pub struct SectorIntegration {
    geometry: SectorGeometry,
    image_shape: [usize; 2],
    radial: Option<BinMap>,
    azimuthal: Option<BinMap>,
}

/// Integrated profiles for a block of frames, `(frames, bins)` each.
pub struct SectorProfiles {
    pub radial: Option<FrameBuffer>,
    pub azimuthal: Option<FrameBuffer>,
}

impl SectorIntegration {
    /// Build the pixel-to-bin maps for an image shape `[rows, cols]`.
    ///
    /// A mask whose shape disagrees with the image is dropped with a
    /// warning rather than aborting the pass.
    ///
    /// # Errors
    /// Returns `Error::Config` on degenerate geometry or when neither
    /// output is requested.
    pub fn new(
        geometry: &SectorGeometry,
        mask: Option<&Array2<bool>>,
        image_shape: [usize; 2],
        radial: bool,
        azimuthal: bool,
    ) -> Result<Self> {
        geometry.validate()?;
        if !(radial || azimuthal) {
            return Err(Error::Config(
                "sector integration requires radial or azimuthal output".to_string(),
            ));
        }
        let mask = match mask {
            Some(mask) if mask.shape() != image_shape => {
                warn!(
                    "mask shape {:?} incompatible with image {image_shape:?}, ignoring mask",
                    mask.shape()
                );
                None
            }
            other => other,
        };

        let [r_min, r_max] = geometry.radii;
        let [a_start, a_end] = geometry.angles;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let radial_bins = ((r_max - r_min).ceil() as usize).max(1);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let azimuthal_bins =
            (((a_end - a_start) * 0.5 * (r_min + r_max)).ceil() as usize).max(1);

        let mut maps = Self {
            geometry: geometry.clone(),
            image_shape,
            radial: radial.then(|| BinMap {
                bins: radial_bins,
                axis: bin_centres(r_min, r_max, radial_bins),
                weights: Vec::new(),
                area: vec![0.0; radial_bins],
            }),
            azimuthal: azimuthal.then(|| BinMap {
                bins: azimuthal_bins,
                axis: bin_centres(a_start, a_end, azimuthal_bins),
                weights: Vec::new(),
                area: vec![0.0; azimuthal_bins],
            }),
        };
        maps.build(mask);
        Ok(maps)
    }

    fn build(&mut self, mask: Option<&Array2<bool>>) {
        let [rows, cols] = self.image_shape;
        let [cx, cy] = self.geometry.centre;
        let [r_min, r_max] = self.geometry.radii;
        let [a_start, a_end] = self.geometry.angles;
        let fold = self.geometry.fold_symmetry;

        for row in 0..rows {
            for col in 0..cols {
                if mask.is_some_and(|m| m[[row, col]]) {
                    continue;
                }
                #[allow(clippy::cast_precision_loss)]
                let (dx, dy) = (col as f64 - cx, row as f64 - cy);
                let r = dx.hypot(dy);
                if !(r_min..r_max).contains(&r) {
                    continue;
                }
                let mut phi = normalise_angle(dy.atan2(dx), a_start);
                if phi >= a_end {
                    if !fold {
                        continue;
                    }
                    phi = normalise_angle(phi - PI, a_start);
                    if phi >= a_end {
                        continue;
                    }
                }
                let pixel = row * cols + col;
                if let Some(map) = self.radial.as_mut() {
                    split_weight(map, pixel, (r - r_min) / (r_max - r_min));
                }
                if let Some(map) = self.azimuthal.as_mut() {
                    split_weight(map, pixel, (phi - a_start) / (a_end - a_start));
                }
            }
        }
    }

    #[must_use]
    pub fn radial_bins(&self) -> Option<usize> {
        self.radial.as_ref().map(|m| m.bins)
    }

    #[must_use]
    pub fn azimuthal_bins(&self) -> Option<usize> {
        self.azimuthal.as_ref().map(|m| m.bins)
    }

    /// Radial bin centres in pixel units.
    #[must_use]
    pub fn radial_axis(&self) -> Option<&[f64]> {
        self.radial.as_ref().map(|m| m.axis.as_slice())
    }

    /// Azimuthal bin centres in radians.
    #[must_use]
    pub fn azimuthal_axis(&self) -> Option<&[f64]> {
        self.azimuthal.as_ref().map(|m| m.axis.as_slice())
    }

    #[must_use]
    pub fn geometry(&self) -> &SectorGeometry {
        &self.geometry
    }

    /// Integrate every frame in the buffer.
    ///
    /// # Errors
    /// Returns `Error::ShapeMismatch` if the trailing image shape differs
    /// from the shape the maps were built for.
    pub fn integrate(&self, buffer: &FrameBuffer) -> Result<SectorProfiles> {
        if buffer.frame_shape(2) != self.image_shape {
            return Err(Error::ShapeMismatch(format!(
                "frame shape {:?} does not match sector map {:?}",
                buffer.frame_shape(2),
                self.image_shape
            )));
        }
        let frames = buffer.frame_count(2);
        let frame_size = buffer.frame_size(2);
        let values = buffer
            .values()
            .as_slice()
            .ok_or_else(|| Error::InvalidInput("frame buffer is not contiguous".to_string()))?;
        let errors = buffer
            .errors()
            .map(|e| {
                e.as_slice().ok_or_else(|| {
                    Error::InvalidInput("error buffer is not contiguous".to_string())
                })
            })
            .transpose()?;

        let radial = self
            .radial
            .as_ref()
            .map(|map| profile_frames(map, frames, frame_size, values, errors))
            .transpose()?;
        let azimuthal = self
            .azimuthal
            .as_ref()
            .map(|map| profile_frames(map, frames, frame_size, values, errors))
            .transpose()?;

        Ok(SectorProfiles { radial, azimuthal })
    }
}

fn profile_frames(
    map: &BinMap,
    frames: usize,
    frame_size: usize,
    values: &[f32],
    errors: Option<&[f64]>,
) -> Result<FrameBuffer> {
    let mut out_values = Vec::with_capacity(frames * map.bins);
    let mut out_errors = errors.map(|_| Vec::with_capacity(frames * map.bins));
    for frame in 0..frames {
        let range = frame * frame_size..(frame + 1) * frame_size;
        let frame_errors = errors.map(|e| &e[range.clone()]);
        let (profile, profile_errors) = map.accumulate(&values[range], frame_errors);
        out_values.extend_from_slice(&profile);
        if let (Some(out), Some(err)) = (out_errors.as_mut(), profile_errors) {
            out.extend_from_slice(&err);
        }
    }
    let shape = IxDyn(&[frames, map.bins]);
    let values = ArrayD::from_shape_vec(shape.clone(), out_values)
        .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
    match out_errors {
        Some(err) => {
            let errors = ArrayD::from_shape_vec(shape, err)
                .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
            FrameBuffer::with_errors(values, errors)
        }
        None => Ok(FrameBuffer::new(values)),
    }
}

/// Split a unit pixel area between the two bins its coordinate straddles.
fn split_weight(map: &mut BinMap, pixel: usize, coord: f64) {
    #[allow(clippy::cast_precision_loss)]
    let u = coord * map.bins as f64 - 0.5;
    let lo = u.floor();
    let frac = u - lo;
    #[allow(clippy::cast_possible_truncation)]
    let lo = lo as isize;
    for (bin, w) in [(lo, 1.0 - frac), (lo + 1, frac)] {
        if w <= 0.0 {
            continue;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]
        if bin >= 0 && (bin as usize) < map.bins {
            let bin = bin as usize;
            map.weights.push((pixel, bin, w));
            map.area[bin] += w;
        }
    }
}

fn bin_centres(start: f64, end: f64, bins: usize) -> Vec<f64> {
    #[allow(clippy::cast_precision_loss)]
    let width = (end - start) / bins as f64;
    (0..bins)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            {
                start + (i as f64 + 0.5) * width
            }
        })
        .collect()
}

/// Bring an angle into `[base, base + 2*pi)`.
fn normalise_angle(angle: f64, base: f64) -> f64 {
    let mut a = angle;
    while a < base {
        a += 2.0 * PI;
    }
    while a >= base + 2.0 * PI {
        a -= 2.0 * PI;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn geometry() -> SectorGeometry {
        SectorGeometry {
            centre: [16.0, 16.0],
            radii: [2.0, 12.0],
            angles: [0.0, 2.0 * PI - 1e-9],
            fold_symmetry: false,
        }
    }

    fn flat_frame(shape: [usize; 2], value: f32) -> FrameBuffer {
        let data = ArrayD::from_elem(IxDyn(&[1, shape[0], shape[1]]), value);
        FrameBuffer::new(data)
    }

    #[test]
    fn flat_image_gives_flat_radial_profile() {
        let sector = SectorIntegration::new(&geometry(), None, [32, 32], true, false).unwrap();
        let profiles = sector.integrate(&flat_frame([32, 32], 3.0)).unwrap();
        let radial = profiles.radial.unwrap();
        assert_eq!(radial.shape(), &[1, 10]);
        // Area normalisation: a constant image integrates to the constant.
        for i in 0..10 {
            assert_relative_eq!(radial.values()[[0, i]], 3.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn masked_pixels_do_not_contribute() {
        let mut mask = Array2::from_elem((32, 32), false);
        // Poison one quadrant with an extreme value and mask it out.
        let mut data = ArrayD::from_elem(IxDyn(&[1, 32, 32]), 2.0f32);
        for row in 0..16 {
            for col in 0..16 {
                data[[0, row, col]] = 1.0e6;
                mask[[row, col]] = true;
            }
        }
        let sector =
            SectorIntegration::new(&geometry(), Some(&mask), [32, 32], true, false).unwrap();
        let profiles = sector.integrate(&FrameBuffer::new(data)).unwrap();
        let radial = profiles.radial.unwrap();
        for i in 0..10 {
            assert!(radial.values()[[0, i]] < 3.0);
        }
    }

    #[test]
    fn incompatible_mask_is_ignored() {
        let mask = Array2::from_elem((8, 8), true);
        let sector =
            SectorIntegration::new(&geometry(), Some(&mask), [32, 32], true, false).unwrap();
        let profiles = sector.integrate(&flat_frame([32, 32], 1.0)).unwrap();
        assert!(profiles.radial.is_some());
    }

    #[test]
    fn errors_are_propagated_per_bin() {
        let values = ArrayD::from_elem(IxDyn(&[1, 32, 32]), 1.0f32);
        let errors = ArrayD::from_elem(IxDyn(&[1, 32, 32]), 0.5f64);
        let buffer = FrameBuffer::with_errors(values, errors).unwrap();
        let sector = SectorIntegration::new(&geometry(), None, [32, 32], true, false).unwrap();
        let radial = sector.integrate(&buffer).unwrap().radial.unwrap();
        // err = sqrt(sum w^2 sigma^2) / area < sigma for area > 1.
        assert!(radial.errors().unwrap()[[0, 5]] < 0.5);
    }

    #[test]
    fn axis_metadata_spans_geometry() {
        let sector = SectorIntegration::new(&geometry(), None, [32, 32], true, true).unwrap();
        let axis = sector.radial_axis().unwrap();
        assert_eq!(axis.len(), 10);
        assert_relative_eq!(axis[0], 2.5);
        assert_relative_eq!(axis[9], 11.5);
    }
}
