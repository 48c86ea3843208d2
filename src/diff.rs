//! Bitmap alignment and the weighted pixel-difference metric.

/// An 8-bit grayscale bitmap with row-major storage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GrayBitmap {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl GrayBitmap {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width * height],
        }
    }

    pub fn from_pixels(width: usize, height: usize, pixels: Vec<u8>) -> Option<Self> {
        (pixels.len() == width * height).then_some(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    fn insert_left_columns(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        let new_width = self.width + count;
        let mut pixels = vec![0; new_width * self.height];
        for y in 0..self.height {
            let src = &self.pixels[y * self.width..(y + 1) * self.width];
            pixels[y * new_width + count..(y + 1) * new_width].copy_from_slice(src);
        }
        self.width = new_width;
        self.pixels = pixels;
    }

    fn append_right_columns(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        let new_width = self.width + count;
        let mut pixels = vec![0; new_width * self.height];
        for y in 0..self.height {
            let src = &self.pixels[y * self.width..(y + 1) * self.width];
            pixels[y * new_width..y * new_width + self.width].copy_from_slice(src);
        }
        self.width = new_width;
        self.pixels = pixels;
    }

    fn insert_top_rows(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        let mut pixels = vec![0; self.width * count];
        pixels.extend_from_slice(&self.pixels);
        self.height += count;
        self.pixels = pixels;
    }

    fn append_bottom_rows(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        self.pixels.extend(std::iter::repeat(0).take(self.width * count));
        self.height += count;
    }
}

/// A 3-channel RGB bitmap used for composite difference images.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RgbBitmap {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl RgbBitmap {
    /// Interleaves three equally sized channels into an RGB image.
    ///
    /// Returns `None` when the channel sizes disagree with the stated
    /// dimensions.
    pub fn from_channels(
        width: usize,
        height: usize,
        r: &[u8],
        g: &[u8],
        b: &[u8],
    ) -> Option<Self> {
        let len = width * height;
        if r.len() != len || g.len() != len || b.len() != len {
            return None;
        }
        let mut pixels = Vec::with_capacity(len * 3);
        for i in 0..len {
            pixels.push(r[i]);
            pixels.push(g[i]);
            pixels.push(b[i]);
        }
        Some(Self {
            width,
            height,
            pixels,
        })
    }
}

/// Spatially aligns two rasterized bitmaps onto their union bounding box.
///
/// `left`/`top` are the FreeType bearing offsets of each bitmap relative to
/// the glyph origin. Zero padding is distributed so that both outputs have
/// identical dimensions with their ink at the correct relative positions:
/// the bitmap with the larger horizontal bearing is padded at its left edge,
/// the one with the smaller vertical bearing at its top edge, and both are
/// padded at the right/bottom until extents match.
pub fn align_bitmaps(
    a: (GrayBitmap, i32, i32),
    b: (GrayBitmap, i32, i32),
) -> (GrayBitmap, GrayBitmap) {
    let (mut a_bmp, a_left, a_top) = a;
    let (mut b_bmp, b_left, b_top) = b;

    let d = a_left.abs_diff(b_left) as usize;
    if a_left > b_left {
        a_bmp.insert_left_columns(d);
    } else {
        b_bmp.insert_left_columns(d);
    }
    if a_bmp.width < b_bmp.width {
        a_bmp.append_right_columns(b_bmp.width - a_bmp.width);
    } else {
        b_bmp.append_right_columns(a_bmp.width - b_bmp.width);
    }

    let d = a_top.abs_diff(b_top) as usize;
    if a_top < b_top {
        a_bmp.insert_top_rows(d);
    } else {
        b_bmp.insert_top_rows(d);
    }
    if a_bmp.height < b_bmp.height {
        a_bmp.append_bottom_rows(b_bmp.height - a_bmp.height);
    } else {
        b_bmp.append_bottom_rows(a_bmp.height - b_bmp.height);
    }

    (a_bmp, b_bmp)
}

/// Result of [`weighted_diff`]: the scalar weight and the composite image.
///
/// The composite degrades to a copy of the reference bitmap when channel
/// assembly fails, so a weight is always produced.
pub enum Composite {
    Rgb(RgbBitmap),
    Fallback(GrayBitmap),
}

/// Computes the visual-difference weight and composite image for two
/// equally shaped bitmaps.
///
/// The signed per-pixel difference `d = reference - modified` is taken at
/// 16-bit precision. The composite's red channel holds the magnitude where
/// the modified build is darker, blue where the reference is darker, and
/// green the total magnitude. The weight is the mean of `d²` over all
/// pixels; it is zero iff the bitmaps are identical.
pub fn weighted_diff(reference: &GrayBitmap, modified: &GrayBitmap) -> (f64, Composite) {
    debug_assert_eq!(reference.width, modified.width);
    debug_assert_eq!(reference.height, modified.height);
    let len = reference.pixels.len().min(modified.pixels.len());
    let mut excess_modified = Vec::with_capacity(len);
    let mut excess_reference = Vec::with_capacity(len);
    let mut magnitude = Vec::with_capacity(len);
    let mut sum_sq = 0.0f64;
    for i in 0..len {
        let d = reference.pixels[i] as i16 - modified.pixels[i] as i16;
        excess_modified.push((-d).max(0) as u8);
        excess_reference.push(d.max(0) as u8);
        magnitude.push(d.unsigned_abs() as u8);
        sum_sq += (d as f64) * (d as f64);
    }
    let weight = if len == 0 { 0.0 } else { sum_sq / len as f64 };
    match RgbBitmap::from_channels(
        reference.width,
        reference.height,
        &excess_modified,
        &magnitude,
        &excess_reference,
    ) {
        Some(rgb) => (weight, Composite::Rgb(rgb)),
        None => {
            log::warn!(
                "composite construction failed for {}x{} bitmap, serving reference instead",
                reference.width,
                reference.height
            );
            (weight, Composite::Fallback(reference.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap(width: usize, height: usize, pixels: &[u8]) -> GrayBitmap {
        GrayBitmap::from_pixels(width, height, pixels.to_vec()).unwrap()
    }

    #[test]
    fn weight_zero_iff_identical() {
        let a = bitmap(2, 2, &[0, 0, 0, 0]);
        let (weight, _) = weighted_diff(&a, &a.clone());
        assert_eq!(weight, 0.0);
        let b = bitmap(2, 2, &[10, 0, 0, 0]);
        let (weight, _) = weighted_diff(&a, &b);
        assert_eq!(weight, 25.0);
    }

    #[test]
    fn weight_is_symmetric_and_channels_swap() {
        let a = bitmap(2, 1, &[200, 10]);
        let b = bitmap(2, 1, &[50, 90]);
        let (w_ab, c_ab) = weighted_diff(&a, &b);
        let (w_ba, c_ba) = weighted_diff(&b, &a);
        assert_eq!(w_ab, w_ba);
        let (Composite::Rgb(ab), Composite::Rgb(ba)) = (c_ab, c_ba) else {
            panic!("expected composites");
        };
        for i in 0..2 {
            // red (excess in modified) and blue (excess in reference) swap
            assert_eq!(ab.pixels[i * 3], ba.pixels[i * 3 + 2]);
            assert_eq!(ab.pixels[i * 3 + 2], ba.pixels[i * 3]);
            // green magnitude is invariant
            assert_eq!(ab.pixels[i * 3 + 1], ba.pixels[i * 3 + 1]);
        }
    }

    #[test]
    fn composite_channel_order() {
        let r = bitmap(1, 1, &[100]);
        let m = bitmap(1, 1, &[140]);
        let (weight, composite) = weighted_diff(&r, &m);
        assert_eq!(weight, 1600.0);
        let Composite::Rgb(rgb) = composite else {
            panic!("expected rgb composite");
        };
        // modified darker by 40: red and green carry it, blue is zero
        assert_eq!(rgb.pixels, vec![40, 40, 0]);
    }

    #[test]
    fn empty_bitmaps_have_zero_weight() {
        let a = GrayBitmap::new(0, 0);
        let (weight, _) = weighted_diff(&a, &a.clone());
        assert_eq!(weight, 0.0);
    }

    #[test]
    fn alignment_covers_union_box() {
        // a spans x [2, 4), y rises to 3; b spans x [0, 3), y rises to 5
        let a = bitmap(2, 3, &[1; 6]);
        let b = bitmap(3, 5, &[2; 15]);
        let (a_out, b_out) = align_bitmaps((a.clone(), 2, 3), (b.clone(), 0, 5));
        // union: x [0, 4) -> width 4; top 5, bottom min(3-3, 5-5)=0 -> height 5
        assert_eq!((a_out.width, a_out.height), (4, 5));
        assert_eq!((b_out.width, b_out.height), (4, 5));
        // a was shifted right by its larger bearing and down by the
        // difference in tops
        assert_eq!(a_out.pixels[0], 0);
        assert_eq!(a_out.pixels[2 * 4 + 2], 1);
        // b's ink stays at the origin
        assert_eq!(b_out.pixels[0], 2);
    }

    #[test]
    fn alignment_is_invariant_to_input_order() {
        let a = bitmap(2, 3, &[1; 6]);
        let b = bitmap(3, 5, &[2; 15]);
        let (a1, b1) = align_bitmaps((a.clone(), 2, 3), (b.clone(), 0, 5));
        let (b2, a2) = align_bitmaps((b, 0, 5), (a, 2, 3));
        assert_eq!(a1, a2);
        assert_eq!(b1, b2);
    }

    #[test]
    fn alignment_of_equal_bearings_pads_extents_only() {
        let a = bitmap(1, 1, &[9]);
        let b = bitmap(2, 2, &[7; 4]);
        let (a_out, b_out) = align_bitmaps((a, 0, 1), (b, 0, 2));
        assert_eq!((a_out.width, a_out.height), (2, 2));
        assert_eq!((b_out.width, b_out.height), (2, 2));
        // a's single pixel lands one row below b's top
        assert_eq!(a_out.pixels, vec![0, 0, 9, 0]);
    }
}
