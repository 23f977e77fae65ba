//! Colorspace conversion for 8-bit BGR / grayscale frames
//!
//! Float conventions follow the usual computer-vision definitions:
//! YCrCb in 0..=1 with chroma offset 0.5, and L*a*b* with L in 0..=100
//! (sRGB primaries, D65 white point).

use super::Plane;
use crate::error::{Error, Result};
use crate::types::{ColorSpace, Frame};

const CHROMA_DELTA: f32 = 0.5;

// D65 reference white
const WHITE_X: f32 = 0.950456;
const WHITE_Z: f32 = 1.088754;

const LAB_EPSILON: f32 = 0.008856;
const LAB_KAPPA: f32 = 7.787;
const LAB_OFFSET: f32 = 16.0 / 116.0;

/// Frame split into Y, Cr, Cb planes (chroma absent for grayscale input)
#[derive(Debug, Clone)]
pub struct YCrCbImage {
    pub y: Plane,
    pub chroma: Option<(Plane, Plane)>,
}

/// Frame in the L*a*b* working space
#[derive(Debug, Clone)]
pub struct LabImage {
    pub l: Plane,
    pub a: Plane,
    pub b: Plane,
}

fn check_shape(frame: &Frame) -> Result<()> {
    if frame.is_consistent() {
        Ok(())
    } else {
        Err(Error::Inference(format!(
            "Frame buffer holds {} bytes, {}x{}x{} needs {}",
            frame.data.len(),
            frame.width,
            frame.height,
            frame.channels(),
            frame.expected_len()
        )))
    }
}

#[inline]
fn quantize(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Split a frame into normalized YCrCb planes
pub fn bgr_to_ycrcb(frame: &Frame) -> Result<YCrCbImage> {
    check_shape(frame)?;
    let (w, h) = (frame.width, frame.height);

    match frame.color {
        ColorSpace::Gray => {
            let y = frame.data.iter().map(|&v| v as f32 / 255.0).collect();
            Ok(YCrCbImage {
                y: Plane::from_data(w, h, y),
                chroma: None,
            })
        }
        ColorSpace::Bgr => {
            let n = w as usize * h as usize;
            let mut y = Vec::with_capacity(n);
            let mut cr = Vec::with_capacity(n);
            let mut cb = Vec::with_capacity(n);

            for px in frame.data.chunks_exact(3) {
                let b = px[0] as f32 / 255.0;
                let g = px[1] as f32 / 255.0;
                let r = px[2] as f32 / 255.0;
                let luma = 0.299 * r + 0.587 * g + 0.114 * b;
                y.push(luma);
                cr.push((r - luma) * 0.713 + CHROMA_DELTA);
                cb.push((b - luma) * 0.564 + CHROMA_DELTA);
            }

            Ok(YCrCbImage {
                y: Plane::from_data(w, h, y),
                chroma: Some((Plane::from_data(w, h, cr), Plane::from_data(w, h, cb))),
            })
        }
    }
}

/// Recombine YCrCb planes into an 8-bit frame
///
/// Without chroma the result is grayscale.
pub fn ycrcb_to_bgr(image: &YCrCbImage) -> Result<Frame> {
    let (w, h) = (image.y.width, image.y.height);

    let Some((cr, cb)) = &image.chroma else {
        let data = image.y.data.iter().map(|&v| quantize(v)).collect();
        return Ok(Frame::from_data(data, w, h, ColorSpace::Gray));
    };

    if (cr.width, cr.height) != (w, h) || (cb.width, cb.height) != (w, h) {
        return Err(Error::Inference(format!(
            "Chroma planes {}x{} / {}x{} do not match luma {}x{}",
            cr.width, cr.height, cb.width, cb.height, w, h
        )));
    }

    let mut data = Vec::with_capacity(w as usize * h as usize * 3);
    for ((&y, &cr), &cb) in image.y.data.iter().zip(&cr.data).zip(&cb.data) {
        let dr = cr - CHROMA_DELTA;
        let db = cb - CHROMA_DELTA;
        let r = y + 1.403 * dr;
        let g = y - 0.714 * dr - 0.344 * db;
        let b = y + 1.773 * db;
        data.extend_from_slice(&[quantize(b), quantize(g), quantize(r)]);
    }

    Ok(Frame::from_data(data, w, h, ColorSpace::Bgr))
}

#[inline]
fn srgb_to_linear(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

#[inline]
fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

#[inline]
fn lab_f(t: f32) -> f32 {
    if t > LAB_EPSILON {
        t.cbrt()
    } else {
        LAB_KAPPA * t + LAB_OFFSET
    }
}

#[inline]
fn lab_f_inv(t: f32) -> f32 {
    let cube = t * t * t;
    if cube > LAB_EPSILON {
        cube
    } else {
        (t - LAB_OFFSET) / LAB_KAPPA
    }
}

/// Convert a frame to L*a*b* planes
///
/// Grayscale frames are treated as neutral BGR, giving zero chroma.
pub fn bgr_to_lab(frame: &Frame) -> Result<LabImage> {
    check_shape(frame)?;
    let (w, h) = (frame.width, frame.height);
    let n = w as usize * h as usize;
    let channels = frame.channels();

    let mut l = Vec::with_capacity(n);
    let mut a = Vec::with_capacity(n);
    let mut b = Vec::with_capacity(n);

    for px in frame.data.chunks_exact(channels) {
        let (bl, gr, rd) = match frame.color {
            ColorSpace::Bgr => (px[0], px[1], px[2]),
            ColorSpace::Gray => (px[0], px[0], px[0]),
        };
        let r = srgb_to_linear(rd as f32 / 255.0);
        let g = srgb_to_linear(gr as f32 / 255.0);
        let bb = srgb_to_linear(bl as f32 / 255.0);

        let x = (0.412453 * r + 0.357580 * g + 0.180423 * bb) / WHITE_X;
        let y = 0.212671 * r + 0.715160 * g + 0.072169 * bb;
        let z = (0.019334 * r + 0.119193 * g + 0.950227 * bb) / WHITE_Z;

        let (fx, fy, fz) = (lab_f(x), lab_f(y), lab_f(z));
        l.push(116.0 * fy - 16.0);
        a.push(500.0 * (fx - fy));
        b.push(200.0 * (fy - fz));
    }

    Ok(LabImage {
        l: Plane::from_data(w, h, l),
        a: Plane::from_data(w, h, a),
        b: Plane::from_data(w, h, b),
    })
}

/// Convert L*a*b* planes back to an 8-bit BGR frame, clamping out-of-gamut values
pub fn lab_to_bgr(image: &LabImage) -> Result<Frame> {
    let (w, h) = (image.l.width, image.l.height);
    for plane in [&image.a, &image.b] {
        if (plane.width, plane.height) != (w, h) {
            return Err(Error::Inference(format!(
                "Chrominance plane {}x{} does not match lightness {}x{}",
                plane.width, plane.height, w, h
            )));
        }
    }

    let mut data = Vec::with_capacity(w as usize * h as usize * 3);
    for ((&l, &a), &b) in image.l.data.iter().zip(&image.a.data).zip(&image.b.data) {
        let fy = (l + 16.0) / 116.0;
        let fx = fy + a / 500.0;
        let fz = fy - b / 200.0;

        let x = WHITE_X * lab_f_inv(fx);
        let y = lab_f_inv(fy);
        let z = WHITE_Z * lab_f_inv(fz);

        let r = 3.240479 * x - 1.537150 * y - 0.498535 * z;
        let g = -0.969256 * x + 1.875992 * y + 0.041556 * z;
        let bb = 0.055648 * x - 0.204043 * y + 1.057311 * z;

        data.extend_from_slice(&[
            quantize(linear_to_srgb(bb.max(0.0))),
            quantize(linear_to_srgb(g.max(0.0))),
            quantize(linear_to_srgb(r.max(0.0))),
        ]);
    }

    Ok(Frame::from_data(data, w, h, ColorSpace::Bgr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        Frame::from_data(
            vec![0, 0, 255, 0, 255, 0, 255, 0, 0, 128, 128, 128],
            2,
            2,
            ColorSpace::Bgr,
        )
    }

    #[test]
    fn test_ycrcb_roundtrip() {
        let frame = sample_frame();
        let image = bgr_to_ycrcb(&frame).unwrap();
        let back = ycrcb_to_bgr(&image).unwrap();
        for (a, b) in frame.data.iter().zip(&back.data) {
            assert!((*a as i32 - *b as i32).abs() <= 2, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_gray_ycrcb_has_no_chroma() {
        let frame = Frame::from_data(vec![0, 255], 2, 1, ColorSpace::Gray);
        let image = bgr_to_ycrcb(&frame).unwrap();
        assert!(image.chroma.is_none());
        assert_eq!(image.y.data, vec![0.0, 1.0]);
        assert_eq!(ycrcb_to_bgr(&image).unwrap().color, ColorSpace::Gray);
    }

    #[test]
    fn test_lab_neutral_gray() {
        let frame = Frame::from_data(vec![128], 1, 1, ColorSpace::Gray);
        let lab = bgr_to_lab(&frame).unwrap();
        assert!(lab.a.data[0].abs() < 0.5);
        assert!(lab.b.data[0].abs() < 0.5);
        assert!((lab.l.data[0] - 53.6).abs() < 1.0);
    }

    #[test]
    fn test_lab_roundtrip() {
        let frame = sample_frame();
        let back = lab_to_bgr(&bgr_to_lab(&frame).unwrap()).unwrap();
        for (a, b) in frame.data.iter().zip(&back.data) {
            assert!((*a as i32 - *b as i32).abs() <= 2, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_inconsistent_frame_rejected() {
        let frame = Frame::from_data(vec![1, 2], 2, 2, ColorSpace::Bgr);
        assert!(matches!(bgr_to_lab(&frame), Err(Error::Inference(_))));
    }
}
