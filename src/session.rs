//! The diff session: batch orchestration and the read-only query surface.

use std::{
    collections::BTreeMap,
    path::Path,
};

use image::{codecs::png::PngEncoder, ColorType, ImageEncoder};

use crate::{
    diff::{align_bitmaps, weighted_diff, Composite, GrayBitmap, RgbBitmap},
    font::{FontFace, RasterGlyph, RenderMode},
    program::compare_programs,
    Error,
};

/// Configuration consumed from the CLI layer.
#[derive(Clone, Debug)]
pub struct Config {
    /// Point size of the large preview images on the main listing.
    pub label_size: u32,
    /// Enlargement factor for pixel maps in the glyph report.
    pub mag: u32,
    /// Enlargement factor for difference maps in the glyph report.
    pub diff_mag: u32,
    /// Point sizes to compare between the fonts.
    pub sizes: Vec<u32>,
    pub mode: RenderMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            label_size: 70,
            mag: 8,
            diff_mag: 8,
            sizes: vec![8, 10, 12, 14, 16, 20],
            mode: RenderMode::Grayscale,
        }
    }
}

/// A stored image, encoded to PNG only when queried.
#[derive(Clone, Debug)]
pub enum Image {
    Gray(GrayBitmap),
    Rgb(RgbBitmap),
    /// Gray-with-alpha overlay used for grid masks.
    Mask {
        width: usize,
        height: usize,
        alpha: Vec<u8>,
    },
}

impl Image {
    pub fn width(&self) -> usize {
        match self {
            Self::Gray(bitmap) => bitmap.width,
            Self::Rgb(bitmap) => bitmap.width,
            Self::Mask { width, .. } => *width,
        }
    }

    pub fn height(&self) -> usize {
        match self {
            Self::Gray(bitmap) => bitmap.height,
            Self::Rgb(bitmap) => bitmap.height,
            Self::Mask { height, .. } => *height,
        }
    }

    /// Encodes the image as PNG bytes. Glyph images are inverted so ink
    /// renders dark on a light background.
    pub fn encode_png(&self) -> Option<Vec<u8>> {
        let mut bytes = Vec::new();
        let encoder = PngEncoder::new(&mut bytes);
        let result = match self {
            Self::Gray(bitmap) => {
                let inverted: Vec<u8> = bitmap.pixels.iter().map(|p| 255 - p).collect();
                encoder.write_image(
                    &inverted,
                    bitmap.width as u32,
                    bitmap.height as u32,
                    ColorType::L8,
                )
            }
            Self::Rgb(bitmap) => {
                let inverted: Vec<u8> = bitmap.pixels.iter().map(|p| 255 - p).collect();
                encoder.write_image(
                    &inverted,
                    bitmap.width as u32,
                    bitmap.height as u32,
                    ColorType::Rgb8,
                )
            }
            Self::Mask {
                width,
                height,
                alpha,
            } => {
                let mut data = Vec::with_capacity(alpha.len() * 2);
                for a in alpha {
                    data.push(128);
                    data.push(*a);
                }
                encoder.write_image(&data, *width as u32, *height as u32, ColorType::La8)
            }
        };
        match result {
            Ok(()) => Some(bytes),
            Err(e) => {
                log::warn!("PNG encoding failed: {e}");
                None
            }
        }
    }
}

/// The three images stored for one glyph at one test size.
#[derive(Clone, Debug)]
pub struct SizeImages {
    pub reference: Image,
    pub modified: Image,
    pub difference: Image,
}

impl SizeImages {
    fn get(&self, category: Category) -> Option<&Image> {
        match category {
            Category::Reference => Some(&self.reference),
            Category::Modified => Some(&self.modified),
            Category::Difference => Some(&self.difference),
            Category::Label => None,
        }
    }
}

/// Size component of an image query path.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SizeKey {
    Label,
    Worst,
    Size(u32),
}

impl SizeKey {
    pub fn parse(segment: &str) -> Option<Self> {
        match segment {
            "label" => Some(Self::Label),
            "worst" => Some(Self::Worst),
            _ => segment.parse().ok().map(Self::Size),
        }
    }
}

/// Category component of an image query path.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Category {
    Reference,
    Modified,
    Difference,
    Label,
}

impl Category {
    pub fn parse(segment: &str) -> Option<Self> {
        match segment {
            "Reference" => Some(Self::Reference),
            "Modified" => Some(Self::Modified),
            "Difference" => Some(Self::Difference),
            "label" => Some(Self::Label),
            _ => None,
        }
    }
}

/// Everything recorded for one glyph whose outline program differs
/// between the two builds.
#[derive(Clone, Debug, Default)]
pub struct GlyphDiffRecord {
    /// Raw reference/modified program texts, for textual-diff rendering.
    pub programs: (String, String),
    /// Hint prologue pair, present only when the prologues differ.
    pub stems: Option<(String, String)>,
    /// Path body pair, present only when the bodies differ.
    pub body: Option<(String, String)>,
    /// Tested point size -> visual-difference weight. Shares its keys
    /// exactly with `images`: a size is present iff its weight is
    /// strictly positive.
    pub weights: BTreeMap<u32, f64>,
    pub images: BTreeMap<u32, SizeImages>,
    /// Reference rendering at the label size.
    pub label: Option<Image>,
    /// The size at which the rendering difference is most pronounced.
    pub worstsize: Option<u32>,
}

impl GlyphDiffRecord {
    /// Weight at the worst size, used for ranking. Glyphs whose hint edit
    /// never changed a rendered pixel have no weight and rank last.
    pub fn worst_weight(&self) -> Option<f64> {
        self.worstsize
            .and_then(|size| self.weights.get(&size))
            .copied()
    }

    pub fn image(&self, size: SizeKey, category: Category) -> Option<&Image> {
        match (size, category) {
            (SizeKey::Label, Category::Label) => self.label.as_ref(),
            (SizeKey::Label, _) => None,
            (SizeKey::Worst, category) => self
                .worstsize
                .and_then(|size| self.images.get(&size))
                .and_then(|bundle| bundle.get(category)),
            (SizeKey::Size(size), category) => {
                self.images.get(&size).and_then(|bundle| bundle.get(category))
            }
        }
    }
}

/// Checkerboard overlay marking sub-pixel sampling cells.
#[derive(Clone, Debug)]
pub struct GridMask {
    width: usize,
    height: usize,
    alpha: Vec<u8>,
}

impl GridMask {
    /// Builds the mask over the maximum observed glyph extent.
    ///
    /// No mask exists for 1x1 grids or when no glyph produced a non-zero
    /// weight bitmap.
    fn build((gx, gy): (u32, u32), (width, height): (usize, usize)) -> Option<Self> {
        if (gx, gy) == (1, 1) || width == 0 || height == 0 {
            return None;
        }
        let (gx, gy) = (gx as usize, gy as usize);
        let mut alpha = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let cx = if gx > 1 { x / gx } else { 0 };
                let cy = if gy > 1 { y / gy } else { 0 };
                alpha.push(if (cx + cy) % 2 == 1 { 128 } else { 0 });
            }
        }
        Some(Self {
            width,
            height,
            alpha,
        })
    }

    /// Crops the mask to one glyph's rendered size.
    fn crop(&self, width: usize, height: usize) -> Image {
        let width = width.min(self.width);
        let height = height.min(self.height);
        let mut alpha = Vec::with_capacity(width * height);
        for y in 0..height {
            alpha.extend_from_slice(&self.alpha[y * self.width..y * self.width + width]);
        }
        Image::Mask {
            width,
            height,
            alpha,
        }
    }
}

/// The per-process diff state: constructed once, populated by one batch
/// pass, read-only afterwards. Explicitly constructed and passed so that
/// multiple sessions can coexist (e.g. under test).
pub struct DiffSession {
    config: Config,
    ref_face: FontFace,
    mod_face: FontFace,
    records: BTreeMap<String, GlyphDiffRecord>,
    max_extent: (usize, usize),
    mask: Option<GridMask>,
}

impl DiffSession {
    /// Runs the full batch comparison of two font files.
    ///
    /// Worst-size selection runs eagerly here, before the session is ever
    /// exposed to a query path.
    pub fn new(ref_path: &Path, mod_path: &Path, config: Config) -> Result<Self, Error> {
        let ref_face = FontFace::new(ref_path, config.mode)?;
        let mod_face = FontFace::new(mod_path, config.mode)?;
        let mut session = Self {
            config,
            ref_face,
            mod_face,
            records: BTreeMap::new(),
            max_extent: (0, 0),
            mask: None,
        };
        session.build_records();
        session.build_images();
        session.select_worst_sizes();
        session.mask = GridMask::build(session.config.mode.factors(), session.max_extent);
        log::info!(
            "found {} glyphs with program differences",
            session.records.len()
        );
        Ok(session)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn has_mask(&self) -> bool {
        self.mask.is_some()
    }

    /// Compares outline programs across the glyph set of the modified
    /// font. Glyphs with identical programs are dropped and never
    /// rasterized.
    fn build_records(&mut self) {
        let names: Vec<String> = self
            .mod_face
            .glyph_names()
            .filter(|name| *name != ".notdef")
            .map(str::to_owned)
            .collect();
        for name in names {
            let ref_program = match self.ref_face.outline_program(&name) {
                Ok(program) => program,
                Err(e) => {
                    log::debug!("skipping {name}: no reference program ({e})");
                    continue;
                }
            };
            let mod_program = match self.mod_face.outline_program(&name) {
                Ok(program) => program,
                Err(e) => {
                    log::debug!("skipping {name}: no modified program ({e})");
                    continue;
                }
            };
            if let Some(diff) = compare_programs(&ref_program, &mod_program) {
                self.records.insert(
                    name,
                    GlyphDiffRecord {
                        programs: (ref_program, mod_program),
                        stems: diff.stems,
                        body: diff.body,
                        ..Default::default()
                    },
                );
            }
        }
    }

    /// Rasterizes every interesting glyph at the label size and each test
    /// size, recording weights and image bundles for sizes where the
    /// renderings differ.
    fn build_images(&mut self) {
        let label_size = self.config.label_size;
        let passes: Vec<(u32, bool)> = std::iter::once((label_size, true))
            .chain(self.config.sizes.iter().map(|&size| (size, false)))
            .collect();
        let names: Vec<String> = self.records.keys().cloned().collect();
        for (size, label_pass) in passes {
            if let Err(e) = self.ref_face.set_size(size) {
                log::warn!("cannot set reference face to {size}pt: {e}");
                continue;
            }
            if let Err(e) = self.mod_face.set_size(size) {
                log::warn!("cannot set modified face to {size}pt: {e}");
                continue;
            }
            for name in &names {
                // labels show only the reference build
                if label_pass {
                    match self.ref_face.rasterize(name, size, true) {
                        Ok(glyph) => {
                            if let Some(record) = self.records.get_mut(name) {
                                record.label = Some(Image::Gray(glyph.bitmap));
                            }
                        }
                        Err(e) => log::warn!("couldn't generate {name} label at {size}pt: {e}"),
                    }
                    continue;
                }
                let reference = self.ref_face.rasterize(name, size, false);
                let modified = self.mod_face.rasterize(name, size, false);
                let (reference, modified) = match (reference, modified) {
                    (Ok(r), Ok(m)) => (r, m),
                    (r, m) => {
                        for e in [r.err(), m.err()].into_iter().flatten() {
                            log::warn!("couldn't generate {name} at {size}pt: {e}");
                        }
                        continue;
                    }
                };
                if let Some(record) = self.records.get_mut(name) {
                    if let Some((width, height)) =
                        record_size_images(record, size, reference, modified)
                    {
                        self.max_extent.0 = self.max_extent.0.max(width);
                        self.max_extent.1 = self.max_extent.1.max(height);
                    }
                }
            }
        }
    }

    /// Picks each glyph's worst size: the maximal `(weight, size)` pair
    /// under combined ordering, so ties favor the larger size.
    fn select_worst_sizes(&mut self) {
        for record in self.records.values_mut() {
            record.worstsize = select_worst_size(&record.weights);
        }
    }

    pub fn record(&self, glyph: &str) -> Option<&GlyphDiffRecord> {
        self.records.get(glyph)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in descending order of worst-size weight; glyphs with no
    /// recorded weight sort last.
    pub fn records_by_weight(&self) -> Vec<(&str, &GlyphDiffRecord)> {
        let mut items: Vec<(&str, &GlyphDiffRecord)> = self
            .records
            .iter()
            .map(|(name, record)| (name.as_str(), record))
            .collect();
        items.sort_by(|a, b| {
            let wa = a.1.worst_weight().unwrap_or(f64::NEG_INFINITY);
            let wb = b.1.worst_weight().unwrap_or(f64::NEG_INFINITY);
            wb.total_cmp(&wa)
        });
        items
    }

    /// Raw outline-program pair for external textual-diff rendering.
    pub fn programs(&self, glyph: &str) -> Option<(&str, &str)> {
        self.records
            .get(glyph)
            .map(|record| (record.programs.0.as_str(), record.programs.1.as_str()))
    }

    /// Looks up a stored image by query path; `None` on any absent
    /// segment.
    pub fn image(&self, glyph: &str, size: SizeKey, category: Category) -> Option<&Image> {
        self.records.get(glyph)?.image(size, category)
    }

    /// Grid mask cropped to the glyph's rendered size at the given size
    /// key. Only available when a mask exists.
    pub fn mask_image(&self, glyph: &str, size: SizeKey) -> Option<Image> {
        let mask = self.mask.as_ref()?;
        let reference = self.image(glyph, size, Category::Reference)?;
        Some(mask.crop(reference.width(), reference.height()))
    }
}

/// Applies one size's rasterization pair to a record: aligns the bitmaps,
/// runs the metric, and stores the weight and image bundle only when the
/// renderings differ. Returns the aligned extent of a stored bundle so the
/// caller can track the maximum.
///
/// Keeps the record's key invariant: `weights` and `images` gain a size
/// together or not at all, and only for strictly positive weights.
fn record_size_images(
    record: &mut GlyphDiffRecord,
    size: u32,
    reference: RasterGlyph,
    modified: RasterGlyph,
) -> Option<(usize, usize)> {
    let (ref_bitmap, mod_bitmap) = align_bitmaps(
        (reference.bitmap, reference.left, reference.top),
        (modified.bitmap, modified.left, modified.top),
    );
    let (weight, composite) = weighted_diff(&ref_bitmap, &mod_bitmap);
    if weight <= 0.0 {
        return None;
    }
    let extent = (ref_bitmap.width, ref_bitmap.height);
    let difference = match composite {
        Composite::Rgb(rgb) => Image::Rgb(rgb),
        Composite::Fallback(gray) => Image::Gray(gray),
    };
    record.weights.insert(size, weight);
    record.images.insert(
        size,
        SizeImages {
            reference: Image::Gray(ref_bitmap),
            modified: Image::Gray(mod_bitmap),
            difference,
        },
    );
    Some(extent)
}

fn select_worst_size(weights: &BTreeMap<u32, f64>) -> Option<u32> {
    weights
        .iter()
        .max_by(|a, b| a.1.total_cmp(b.1).then(a.0.cmp(b.0)))
        .map(|(&size, _)| size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_size_tie_break_favors_larger_size() {
        let weights = BTreeMap::from([(8, 5.0), (10, 9.0), (12, 9.0)]);
        assert_eq!(select_worst_size(&weights), Some(12));
    }

    #[test]
    fn worst_size_of_empty_weights_is_none() {
        assert_eq!(select_worst_size(&BTreeMap::new()), None);
    }

    #[test]
    fn record_lookup_by_size_key() {
        let gray = || Image::Gray(GrayBitmap::new(2, 2));
        let mut record = GlyphDiffRecord {
            label: Some(gray()),
            ..Default::default()
        };
        record.weights.insert(10, 4.0);
        record.images.insert(
            10,
            SizeImages {
                reference: gray(),
                modified: gray(),
                difference: gray(),
            },
        );
        record.worstsize = Some(10);
        assert!(record.image(SizeKey::Label, Category::Label).is_some());
        assert!(record.image(SizeKey::Label, Category::Reference).is_none());
        assert!(record
            .image(SizeKey::Size(10), Category::Difference)
            .is_some());
        assert!(record
            .image(SizeKey::Worst, Category::Reference)
            .is_some());
        assert!(record.image(SizeKey::Size(12), Category::Reference).is_none());
        assert_eq!(record.worst_weight(), Some(4.0));
    }

    fn raster(width: usize, height: usize, pixels: &[u8], left: i32, top: i32) -> RasterGlyph {
        RasterGlyph {
            bitmap: GrayBitmap::from_pixels(width, height, pixels.to_vec()).unwrap(),
            left,
            top,
        }
    }

    #[test]
    fn identical_renderings_store_no_size() {
        let mut record = GlyphDiffRecord::default();
        let glyph = raster(2, 1, &[10, 20], 0, 1);
        assert_eq!(record_size_images(&mut record, 10, glyph.clone(), glyph), None);
        assert!(record.weights.is_empty());
        assert!(record.images.is_empty());
    }

    #[test]
    fn weights_and_images_share_size_keys() {
        let mut record = GlyphDiffRecord::default();
        let reference = raster(1, 1, &[100], 0, 1);
        let modified = raster(1, 1, &[200], 0, 1);
        let extent =
            record_size_images(&mut record, 10, reference.clone(), modified.clone());
        assert_eq!(extent, Some((1, 1)));
        // an identical pair at another size stores nothing
        assert_eq!(
            record_size_images(&mut record, 12, reference.clone(), reference),
            None
        );
        let weight_keys: Vec<u32> = record.weights.keys().copied().collect();
        let image_keys: Vec<u32> = record.images.keys().copied().collect();
        assert_eq!(weight_keys, vec![10]);
        assert_eq!(weight_keys, image_keys);
        assert!(record.weights.values().all(|weight| *weight > 0.0));
    }

    #[test]
    fn differing_bearings_store_aligned_extent() {
        let mut record = GlyphDiffRecord::default();
        let reference = raster(1, 1, &[255], 0, 1);
        let modified = raster(1, 1, &[255], 2, 1);
        let extent = record_size_images(&mut record, 8, reference, modified).unwrap();
        assert_eq!(extent, (3, 1));
        let bundle = &record.images[&8];
        assert_eq!(bundle.reference.width(), 3);
        assert_eq!(bundle.modified.width(), 3);
        assert_eq!(bundle.difference.width(), 3);
    }

    #[test]
    fn size_key_and_category_parsing() {
        assert_eq!(SizeKey::parse("label"), Some(SizeKey::Label));
        assert_eq!(SizeKey::parse("worst"), Some(SizeKey::Worst));
        assert_eq!(SizeKey::parse("12"), Some(SizeKey::Size(12)));
        assert_eq!(SizeKey::parse("x"), None);
        assert_eq!(Category::parse("Reference"), Some(Category::Reference));
        assert_eq!(Category::parse("label"), Some(Category::Label));
        assert_eq!(Category::parse("reference"), None);
    }

    #[test]
    fn grid_mask_checkerboard() {
        let mask = GridMask::build((2, 2), (4, 4)).unwrap();
        // cell (0,0) transparent, (1,0) shaded
        assert_eq!(mask.alpha[0], 0);
        assert_eq!(mask.alpha[2], 128);
        assert_eq!(mask.alpha[2 * 4], 128);
        assert_eq!(mask.alpha[2 * 4 + 2], 0);
        let Image::Mask { width, height, alpha } = mask.crop(3, 2) else {
            panic!("expected mask image");
        };
        assert_eq!((width, height), (3, 2));
        assert_eq!(alpha, vec![0, 0, 128, 0, 0, 128]);
    }

    #[test]
    fn grid_mask_skipped_for_unit_grid_or_empty_extent() {
        assert!(GridMask::build((1, 1), (10, 10)).is_none());
        assert!(GridMask::build((6, 1), (0, 10)).is_none());
        assert!(GridMask::build((6, 1), (10, 0)).is_none());
    }

    #[test]
    fn png_encoding_round_trips_dimensions() {
        let image = Image::Gray(GrayBitmap::new(3, 2));
        let bytes = image.encode_png().unwrap();
        // PNG signature
        assert_eq!(&bytes[..8], &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]);
    }
}
