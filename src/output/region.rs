// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Window crop and software binning of raw 16-bit frames.

use crate::error::{CamdError, Result};

/// 0-indexed inclusive detector region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x1: u32,
    pub x2: u32,
    pub y1: u32,
    pub y2: u32,
}

impl Region {
    pub fn from_window(w: [u32; 4]) -> Self {
        Self {
            x1: w[0],
            x2: w[1],
            y1: w[2],
            y2: w[3],
        }
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1 + 1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1 + 1
    }

    /// Header form `[x1:x2,y1:y2]`, 1-indexed.
    pub fn header_string(&self) -> String {
        format!("[{}:{},{}:{}]", self.x1 + 1, self.x2 + 1, self.y1 + 1, self.y2 + 1)
    }
}

/// A binned image, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinnedImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<i32>,
}

/// Crop `window` out of a full-sensor frame and sum `binning` blocks.
///
/// Partial blocks at the right and bottom edges are discarded. Returns the
/// image and the region actually covered by whole blocks.
pub fn crop_and_bin(
    pixels: &[u8],
    sensor_width: u32,
    sensor_height: u32,
    window: Region,
    binning: [u32; 2],
) -> Result<(BinnedImage, Region)> {
    let [bx, by] = binning;
    if bx == 0 || by == 0 {
        return Err(CamdError::Pool("binning factor of zero".into()));
    }
    if window.x1 > window.x2
        || window.y1 > window.y2
        || window.x2 >= sensor_width
        || window.y2 >= sensor_height
    {
        return Err(CamdError::Pool(format!("window {window:?} outside sensor")));
    }
    let expected = sensor_width as usize * sensor_height as usize * 2;
    if pixels.len() != expected {
        return Err(CamdError::Pool(format!(
            "frame has {} bytes, sensor needs {expected}",
            pixels.len()
        )));
    }

    let out_w = window.width() / bx;
    let out_h = window.height() / by;
    if out_w == 0 || out_h == 0 {
        return Err(CamdError::Pool("window smaller than one binned pixel".into()));
    }

    let stride = sensor_width as usize;
    let px = |x: usize, y: usize| -> i32 {
        let i = (y * stride + x) * 2;
        u16::from_le_bytes([pixels[i], pixels[i + 1]]) as i32
    };

    let mut data = Vec::with_capacity(out_w as usize * out_h as usize);
    for oy in 0..out_h {
        let y0 = (window.y1 + oy * by) as usize;
        for ox in 0..out_w {
            let x0 = (window.x1 + ox * bx) as usize;
            let mut sum = 0i32;
            for y in y0..y0 + by as usize {
                for x in x0..x0 + bx as usize {
                    sum += px(x, y);
                }
            }
            data.push(sum);
        }
    }

    let covered = Region {
        x1: window.x1,
        x2: window.x1 + out_w * bx - 1,
        y1: window.y1,
        y2: window.y1 + out_h * by - 1,
    };
    Ok((
        BinnedImage {
            width: out_w,
            height: out_h,
            data,
        },
        covered,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 4x3 frame with pixel value 10*y + x.
    fn frame() -> Vec<u8> {
        let mut v = Vec::new();
        for y in 0..3u16 {
            for x in 0..4u16 {
                v.extend_from_slice(&(10 * y + x).to_le_bytes());
            }
        }
        v
    }

    #[test]
    fn unbinned_full_frame_is_identity() {
        let (img, covered) = crop_and_bin(&frame(), 4, 3, Region::from_window([0, 3, 0, 2]), [1, 1]).unwrap();
        assert_eq!((img.width, img.height), (4, 3));
        assert_eq!(img.data[5], 11);
        assert_eq!(covered, Region::from_window([0, 3, 0, 2]));
    }

    #[test]
    fn binning_sums_blocks_and_drops_partial_edges() {
        let (img, covered) = crop_and_bin(&frame(), 4, 3, Region::from_window([0, 3, 0, 2]), [2, 2]).unwrap();
        assert_eq!((img.width, img.height), (2, 1));
        // (0 + 1 + 10 + 11), (2 + 3 + 12 + 13)
        assert_eq!(img.data, vec![22, 30]);
        assert_eq!(covered.header_string(), "[1:4,1:2]");
    }

    #[test]
    fn crop_selects_window() {
        let (img, _) = crop_and_bin(&frame(), 4, 3, Region::from_window([1, 2, 1, 2]), [1, 1]).unwrap();
        assert_eq!(img.data, vec![11, 12, 21, 22]);
    }

    #[test]
    fn window_outside_sensor_is_rejected() {
        assert!(crop_and_bin(&frame(), 4, 3, Region::from_window([0, 4, 0, 2]), [1, 1]).is_err());
        assert!(crop_and_bin(&frame(), 4, 3, Region::from_window([0, 0, 0, 0]), [2, 1]).is_err());
    }
}
