//! Engine for comparing two hinted builds of the same font.
//!
//! The library computes, per glyph, structural differences between the
//! outline programs of a reference and a modified font along with visual
//! differences between their rasterizations at a set of point sizes. The
//! result is an immutable [`DiffSession`] that the serving shell queries
//! for ranked listings, program text and encoded images.

mod diff;
mod font;
mod program;
mod serve;
mod session;

pub use diff::{align_bitmaps, weighted_diff, Composite, GrayBitmap, RgbBitmap};
pub use font::{FontFace, RasterGlyph, RasterizeError, RenderMode, SubGrid};
pub use program::{compare_programs, split_program, ProgramDiff};
pub use serve::serve;
pub use session::{
    Category, Config, DiffSession, GlyphDiffRecord, GridMask, Image, SizeImages, SizeKey,
};

/// Fatal errors raised before any diffing begins.
///
/// Everything recoverable (a glyph that fails to rasterize at one size, a
/// composite image that cannot be assembled) is logged and skipped instead
/// of surfacing here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read font file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse font: {0}")]
    Parse(#[from] read_fonts::ReadError),
    #[error("font contains no CFF outline programs")]
    MissingOutlinePrograms,
    #[error("CFF parsing failed: {0}")]
    Cff(String),
    #[error("no glyph named {0:?} in this font")]
    UnknownGlyph(String),
    #[error("FreeType error: {0}")]
    FreeType(#[from] freetype::Error),
    #[error("sub-sampled rendering is not available for this font")]
    SubSampledUnavailable,
}
