//! Font faces and the pluggable rasterization backends.
//!
//! A [`FontFace`] couples a read-fonts view of a font's CFF table (glyph
//! names and outline programs) with a FreeType face used for
//! rasterization. The rendering backend is selected once at construction
//! via [`RenderMode`].

use std::{borrow::Borrow, collections::HashMap, ops::Range, path::Path, sync::Arc};

use freetype::{face::LoadFlag, render_mode::RenderMode as FtRenderMode, Library};
use read_fonts::{
    tables::postscript::{charstring, charstring::CommandSink, dict, FdSelect, Index},
    types::{Fixed, GlyphId},
    FontData, FontRead, FontRef, TableProvider,
};

use crate::{diff::GrayBitmap, Error};

/// Memory-mapped font data shared between the parser and FreeType.
#[derive(Clone)]
pub struct SharedFontData(Arc<memmap2::Mmap>);

impl Borrow<[u8]> for SharedFontData {
    fn borrow(&self) -> &[u8] {
        self.0.as_ref()
    }
}

/// Sub-pixel sampling grids supported by the sub-sampled backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SubGrid {
    G1x1,
    G6x1,
    G6x5,
    G8x1,
    G4x4,
}

impl SubGrid {
    /// Logical sub-cells packed per output pixel in each axis.
    pub fn factors(self) -> (u32, u32) {
        match self {
            Self::G1x1 => (1, 1),
            Self::G6x1 => (6, 1),
            Self::G6x5 => (6, 5),
            Self::G8x1 => (8, 1),
            Self::G4x4 => (4, 4),
        }
    }
}

/// The rendering backend a face rasterizes with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RenderMode {
    /// Antialiased grayscale rendering.
    Grayscale,
    /// 1-bit monochrome rendering, expanded to 0/255 grayscale.
    Monochrome,
    /// Oversampled rendering where each output pixel is one logical
    /// sub-cell of the configured grid.
    SubSampled(SubGrid),
}

impl RenderMode {
    pub fn factors(self) -> (u32, u32) {
        match self {
            Self::Grayscale | Self::Monochrome => (1, 1),
            Self::SubSampled(grid) => grid.factors(),
        }
    }
}

/// A rasterized glyph: 8-bit grayscale pixels plus bearing offsets.
#[derive(Clone, Debug)]
pub struct RasterGlyph {
    pub bitmap: GrayBitmap,
    /// Horizontal distance from the origin to the bitmap's left edge.
    pub left: i32,
    /// Vertical distance from the baseline to the bitmap's top row.
    pub top: i32,
}

/// Per-glyph/size failures. Recovered by the caller by skipping the
/// glyph/size combination.
#[derive(Debug, thiserror::Error)]
pub enum RasterizeError {
    #[error("glyph is not present in the font")]
    UnknownGlyph,
    #[error("FreeType error: {0}")]
    FreeType(#[from] freetype::Error),
    #[error("unsupported pixel mode {0}")]
    UnsupportedPixelMode(i32),
}

/// Bit order of a packed monochrome buffer, determined by its producer.
/// FreeType packs rows most-significant-bit first.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BitOrder {
    MsbFirst,
    LsbFirst,
}

/// Expands a bit-packed monochrome buffer to one byte per pixel.
///
/// Each row occupies `pitch` bytes; bits past `width` are padding and are
/// discarded. Set bits become 255, clear bits 0.
fn unpack_monochrome(
    buffer: &[u8],
    pitch: usize,
    width: usize,
    rows: usize,
    order: BitOrder,
) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(width * rows);
    for y in 0..rows {
        let row = &buffer[y * pitch..y * pitch + pitch];
        for x in 0..width {
            let byte = row[x / 8];
            let bit = match order {
                BitOrder::MsbFirst => (byte >> (7 - (x & 7))) & 1,
                BitOrder::LsbFirst => (byte >> (x & 7)) & 1,
            };
            pixels.push(if bit != 0 { 255 } else { 0 });
        }
    }
    pixels
}

/// One font plus its rasterizer.
///
/// Immutable after construction except for the current-size cursor set by
/// [`set_size`](Self::set_size); a face is therefore not reentrant across
/// concurrent sizes.
pub struct FontFace {
    data: SharedFontData,
    ft_face: freetype::Face<SharedFontData>,
    mode: RenderMode,
    names: Vec<String>,
    ids_by_name: HashMap<String, u32>,
    // Keeps the FT_Library alive for as long as the face.
    _ft_library: Library,
}

impl FontFace {
    /// Opens a font file and configures its rasterizer.
    ///
    /// Fails before any diffing begins when the font cannot be parsed, has
    /// no CFF outline programs, or cannot supply outlines to the
    /// sub-sampled backend.
    pub fn new(path: &Path, mode: RenderMode) -> Result<Self, Error> {
        let file = std::fs::File::open(path)?;
        let data = SharedFontData(Arc::new(unsafe { memmap2::Mmap::map(&file)? }));
        let font = FontRef::new(data.borrow())?;
        let cff = font.cff().map_err(|_| Error::MissingOutlinePrograms)?;
        let view = CffView::new(&cff)?;
        let names = view.glyph_names(&cff);
        let ids_by_name = names
            .iter()
            .enumerate()
            .map(|(gid, name)| (name.clone(), gid as u32))
            .collect();

        let library = Library::init()?;
        let ft_face = library.new_memory_face2(data.clone(), 0)?;
        if matches!(mode, RenderMode::SubSampled(_)) && !ft_face.is_scalable() {
            return Err(Error::SubSampledUnavailable);
        }
        Ok(Self {
            data,
            ft_face,
            mode,
            names,
            ids_by_name,
            _ft_library: library,
        })
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    /// Sub-sampling adjustment factors `(gx, gy)` of the active backend.
    pub fn factors(&self) -> (u32, u32) {
        self.mode.factors()
    }

    /// Glyph names in glyph order, including `.notdef`.
    pub fn glyph_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|name| name.as_str())
    }

    pub fn glyph_id(&self, name: &str) -> Option<u32> {
        self.ids_by_name.get(name).copied()
    }

    /// Serializes the glyph's outline program as newline-separated
    /// instruction lines. The serialization is stable for identical input
    /// data and is the basis for text-level comparison.
    pub fn outline_program(&self, name: &str) -> Result<String, Error> {
        let gid = self
            .glyph_id(name)
            .ok_or_else(|| Error::UnknownGlyph(name.to_string()))?;
        let font = FontRef::new(self.data.borrow())?;
        let cff = font.cff().map_err(|_| Error::MissingOutlinePrograms)?;
        let view = CffView::new(&cff)?;
        view.outline_program(gid)
    }

    /// Configures the rasterizer for subsequent [`rasterize`](Self::rasterize)
    /// calls at the given point size.
    ///
    /// The sub-sampled backend renders at `gx`/`gy` multiples of the
    /// nominal 72 dpi resolution so each output pixel covers one sub-cell.
    pub fn set_size(&mut self, point_size: u32) -> Result<(), freetype::Error> {
        let (gx, gy) = self.factors();
        self.ft_face
            .set_char_size((point_size * 64) as isize, 0, 72 * gx, 72 * gy)
    }

    /// Rasterizes one glyph at the given size.
    ///
    /// The label pass always renders at 1x1 fidelity regardless of the
    /// configured grid; label images are clean previews, not
    /// hinting-accuracy demonstrations.
    pub fn rasterize(
        &self,
        name: &str,
        point_size: u32,
        label_pass: bool,
    ) -> Result<RasterGlyph, RasterizeError> {
        let gid = self
            .glyph_id(name)
            .ok_or(RasterizeError::UnknownGlyph)?;
        if label_pass {
            self.ft_face
                .set_char_size((point_size * 64) as isize, 0, 72, 72)?;
        }
        let (load_flags, render_mode) = match (self.mode, label_pass) {
            (RenderMode::Monochrome, false) => {
                (LoadFlag::DEFAULT | LoadFlag::TARGET_MONO, FtRenderMode::Mono)
            }
            _ => (LoadFlag::DEFAULT, FtRenderMode::Normal),
        };
        self.ft_face.load_glyph(gid, load_flags)?;
        let slot = self.ft_face.glyph();
        slot.render_glyph(render_mode)?;
        let ft_bitmap = slot.bitmap();
        let width = ft_bitmap.width() as usize;
        let rows = ft_bitmap.rows() as usize;
        let pitch = ft_bitmap.pitch().unsigned_abs() as usize;
        let buffer = ft_bitmap.buffer();
        let pixels = match ft_bitmap.pixel_mode()? {
            freetype::bitmap::PixelMode::Gray => {
                let mut pixels = Vec::with_capacity(width * rows);
                for y in 0..rows {
                    pixels.extend_from_slice(&buffer[y * pitch..y * pitch + width]);
                }
                pixels
            }
            freetype::bitmap::PixelMode::Mono => {
                unpack_monochrome(buffer, pitch, width, rows, BitOrder::MsbFirst)
            }
            other => return Err(RasterizeError::UnsupportedPixelMode(other as i32)),
        };
        let bitmap = GrayBitmap::from_pixels(width, rows, pixels)
            .ok_or(RasterizeError::UnsupportedPixelMode(-1))?;
        Ok(RasterGlyph {
            bitmap,
            left: slot.bitmap_left(),
            top: slot.bitmap_top(),
        })
    }
}

/// Parsed offsets of the CFF structures needed for charstring access.
struct CffView<'a> {
    table_data: &'a [u8],
    charstrings: Index<'a>,
    font_dicts: Index<'a>,
    fd_select: Option<FdSelect<'a>>,
    private_dict_range: Option<Range<usize>>,
    global_subrs: Index<'a>,
    is_cid: bool,
}

impl<'a> CffView<'a> {
    fn new(cff: &read_fonts::tables::cff::Cff<'a>) -> Result<Self, Error> {
        let table_data = cff.offset_data().as_bytes();
        let top_dict_data = cff
            .top_dicts()
            .get(0)
            .map_err(|e| Error::Cff(e.to_string()))?;
        let mut view = Self {
            table_data,
            charstrings: Index::default(),
            font_dicts: Index::default(),
            fd_select: None,
            private_dict_range: None,
            global_subrs: cff.global_subrs().into(),
            is_cid: false,
        };
        for entry in dict::entries(top_dict_data, None) {
            match entry.map_err(|e| Error::Cff(e.to_string()))? {
                dict::Entry::CharstringsOffset(offset) => {
                    view.charstrings =
                        Index::new(table_data.get(offset..).unwrap_or_default(), false)
                            .map_err(|e| Error::Cff(e.to_string()))?;
                }
                dict::Entry::FdArrayOffset(offset) => {
                    view.font_dicts =
                        Index::new(table_data.get(offset..).unwrap_or_default(), false)
                            .map_err(|e| Error::Cff(e.to_string()))?;
                }
                dict::Entry::FdSelectOffset(offset) => {
                    view.fd_select = Some(
                        FdSelect::read(FontData::new(
                            table_data.get(offset..).unwrap_or_default(),
                        ))
                        .map_err(Error::Parse)?,
                    );
                }
                dict::Entry::PrivateDictRange(range) => {
                    view.private_dict_range = Some(range);
                }
                dict::Entry::Ros { .. } => view.is_cid = true,
                _ => {}
            }
        }
        if view.charstrings.count() == 0 {
            return Err(Error::MissingOutlinePrograms);
        }
        Ok(view)
    }

    /// Glyph names from the charset, or synthesized `gidNNNN` names when
    /// the charset maps to CIDs rather than name strings.
    fn glyph_names(&self, cff: &read_fonts::tables::cff::Cff<'a>) -> Vec<String> {
        let count = self.charstrings.count();
        let charset = if self.is_cid {
            None
        } else {
            cff.charset(0).ok().flatten()
        };
        (0..count)
            .map(|gid| {
                charset
                    .as_ref()
                    .and_then(|charset| charset.string_id(GlyphId::new(gid)).ok())
                    .and_then(|sid| cff.string(sid))
                    .map(|name| name.to_string())
                    .unwrap_or_else(|| format!("gid{gid}"))
            })
            .collect()
    }

    /// Local subroutine index for the glyph's subfont, when present.
    fn subrs(&self, gid: u32) -> Result<Option<Index<'a>>, Error> {
        let range = if self.font_dicts.count() != 0 {
            let index = self
                .fd_select
                .as_ref()
                .and_then(|select| select.font_index(GlyphId::new(gid)))
                .unwrap_or(0);
            let font_dict_data = self
                .font_dicts
                .get(index as usize)
                .map_err(|e| Error::Cff(e.to_string()))?;
            let mut range = None;
            for entry in dict::entries(font_dict_data, None) {
                if let dict::Entry::PrivateDictRange(r) =
                    entry.map_err(|e| Error::Cff(e.to_string()))?
                {
                    range = Some(r);
                }
            }
            range
        } else {
            self.private_dict_range.clone()
        };
        let Some(range) = range else {
            return Ok(None);
        };
        let private_dict_data = self
            .table_data
            .get(range.clone())
            .ok_or(Error::MissingOutlinePrograms)?;
        for entry in dict::entries(private_dict_data, None) {
            // Subrs offset is relative to the private DICT
            if let dict::Entry::SubrsOffset(offset) = entry.map_err(|e| Error::Cff(e.to_string()))?
            {
                let start = range.start + offset;
                let data = self.table_data.get(start..).unwrap_or_default();
                return Ok(Some(
                    Index::new(data, false).map_err(|e| Error::Cff(e.to_string()))?,
                ));
            }
        }
        Ok(None)
    }

    fn outline_program(&self, gid: u32) -> Result<String, Error> {
        let charstring_data = self
            .charstrings
            .get(gid as usize)
            .map_err(|e| Error::Cff(e.to_string()))?;
        let subrs = self.subrs(gid)?;
        let mut sink = ProgramSink::default();
        charstring::evaluate(
            charstring_data,
            self.global_subrs.clone(),
            subrs,
            None,
            &mut sink,
        )
        .map_err(|e| Error::Cff(e.to_string()))?;
        Ok(sink.finish())
    }
}

/// Formats a 16.16 fixed value the way the program text expects: integral
/// values without a fractional part.
fn fmt_fixed(value: Fixed) -> String {
    let f = value.to_f64();
    if f.fract() == 0.0 {
        format!("{}", f as i64)
    } else {
        format!("{f}")
    }
}

/// Command sink that serializes charstring evaluation into newline
/// separated instruction lines.
///
/// Consecutive stem hints are accumulated onto a single `hstem`/`vstem`
/// line so the hint prologue keeps the shape of the stored program. Path
/// coordinates are emitted as deltas from the current point, matching the
/// relative operators of the source charstring.
#[derive(Default)]
struct ProgramSink {
    text: String,
    x: Fixed,
    y: Fixed,
    pending_stems: Vec<Fixed>,
    pending_op: Option<&'static str>,
}

impl ProgramSink {
    fn flush_stems(&mut self) {
        if let Some(op) = self.pending_op.take() {
            let operands: Vec<_> = self.pending_stems.drain(..).map(fmt_fixed).collect();
            self.text.push_str(&operands.join(" "));
            self.text.push(' ');
            self.text.push_str(op);
            self.text.push('\n');
        }
    }

    fn stem(&mut self, op: &'static str, a: Fixed, b: Fixed) {
        if self.pending_op != Some(op) {
            self.flush_stems();
            self.pending_op = Some(op);
        }
        self.pending_stems.push(a);
        self.pending_stems.push(b);
    }

    fn mask(&mut self, op: &str, mask: &[u8]) {
        self.flush_stems();
        self.text.push_str(op);
        self.text.push(' ');
        for byte in mask {
            for bit in (0..8).rev() {
                self.text.push(if (byte >> bit) & 1 != 0 { '1' } else { '0' });
            }
        }
        self.text.push('\n');
    }

    fn op(&mut self, operands: &[Fixed], op: &str) {
        self.flush_stems();
        for operand in operands {
            self.text.push_str(&fmt_fixed(*operand));
            self.text.push(' ');
        }
        self.text.push_str(op);
        self.text.push('\n');
    }

    fn finish(mut self) -> String {
        self.flush_stems();
        self.text
    }
}

impl CommandSink for ProgramSink {
    fn hstem(&mut self, y: Fixed, dy: Fixed) {
        self.stem("hstem", y, dy);
    }

    fn vstem(&mut self, x: Fixed, dx: Fixed) {
        self.stem("vstem", x, dx);
    }

    fn hint_mask(&mut self, mask: &[u8]) {
        self.mask("hintmask", mask);
    }

    fn counter_mask(&mut self, mask: &[u8]) {
        self.mask("cntrmask", mask);
    }

    fn move_to(&mut self, x: Fixed, y: Fixed) {
        let (dx, dy) = (x - self.x, y - self.y);
        self.op(&[dx, dy], "rmoveto");
        self.x = x;
        self.y = y;
    }

    fn line_to(&mut self, x: Fixed, y: Fixed) {
        let (dx, dy) = (x - self.x, y - self.y);
        self.op(&[dx, dy], "rlineto");
        self.x = x;
        self.y = y;
    }

    fn curve_to(&mut self, cx0: Fixed, cy0: Fixed, cx1: Fixed, cy1: Fixed, x: Fixed, y: Fixed) {
        self.op(
            &[
                cx0 - self.x,
                cy0 - self.y,
                cx1 - cx0,
                cy1 - cy0,
                x - cx1,
                y - cy1,
            ],
            "rrcurveto",
        );
        self.x = x;
        self.y = y;
    }

    fn close(&mut self) {
        self.flush_stems();
        self.text.push_str("closepath\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpack_msb_first_discards_padding() {
        // two rows, width 10, pitch 2: padding bits after bit 9 ignored
        let buffer = [0b1010_0000, 0b1111_1111, 0b0000_0001, 0b0100_0000];
        let pixels = unpack_monochrome(&buffer, 2, 10, 2, BitOrder::MsbFirst);
        assert_eq!(pixels.len(), 20);
        assert_eq!(&pixels[..4], &[255, 0, 255, 0]);
        assert_eq!(&pixels[8..10], &[255, 255]);
        assert_eq!(&pixels[10..18], &[0, 0, 0, 0, 0, 0, 0, 255]);
        assert_eq!(&pixels[18..20], &[0, 255]);
    }

    #[test]
    fn unpack_lsb_first_reverses_bit_order() {
        let buffer = [0b0000_0001];
        let pixels = unpack_monochrome(&buffer, 1, 8, 1, BitOrder::LsbFirst);
        assert_eq!(pixels, vec![255, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn program_sink_accumulates_stems_and_masks() {
        let mut sink = ProgramSink::default();
        sink.hstem(Fixed::from_i32(10), Fixed::from_i32(20));
        sink.hstem(Fixed::from_i32(40), Fixed::from_i32(8));
        sink.vstem(Fixed::from_i32(5), Fixed::from_i32(60));
        sink.hint_mask(&[0b1011_0000]);
        sink.move_to(Fixed::from_i32(5), Fixed::from_i32(7));
        sink.line_to(Fixed::from_i32(15), Fixed::from_i32(7));
        sink.close();
        let text = sink.finish();
        assert_eq!(
            text,
            "10 20 40 8 hstem\n5 60 vstem\nhintmask 10110000\n5 7 rmoveto\n10 0 rlineto\nclosepath\n"
        );
    }

    #[test]
    fn program_sink_emits_relative_curves() {
        let mut sink = ProgramSink::default();
        sink.move_to(Fixed::from_i32(100), Fixed::from_i32(0));
        sink.curve_to(
            Fixed::from_i32(110),
            Fixed::from_i32(10),
            Fixed::from_i32(120),
            Fixed::from_i32(20),
            Fixed::from_i32(130),
            Fixed::from_i32(20),
        );
        let text = sink.finish();
        assert_eq!(text, "100 0 rmoveto\n10 10 10 10 10 0 rrcurveto\n");
    }
}
