//! Structural comparison of glyph outline programs.
//!
//! An outline program is the deterministic text serialization produced by
//! [`FontFace::outline_program`](crate::FontFace::outline_program). It is
//! split into a hinting prologue and a path body so that an edit to stem
//! hints can be distinguished from an edit to the outline itself.

/// The sections of an outline program that differ between two builds.
///
/// At least one of `stems` and `body` is present; glyphs with neither are
/// dropped before rasterization ever runs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProgramDiff {
    /// Reference/modified hint prologues, when they differ.
    pub stems: Option<(String, String)>,
    /// Reference/modified path bodies, when they differ.
    pub body: Option<(String, String)>,
}

/// Splits a program into its hint prologue and path body.
///
/// The split point is the first counter-mask or hint-mask instruction; the
/// prologue ends just before it (with a trailing newline appended) and the
/// body starts at the marker. Programs without masks split six characters
/// past the start of the first `vstem`/`hstem`, which covers the operator
/// and its newline. A program with no stem hints at all has no prologue
/// and every difference is attributed to the body.
pub fn split_program(program: &str) -> (Option<String>, String) {
    let mask = program
        .find("cntrmask")
        .or_else(|| program.find("hintmask"));
    if let Some(i) = mask {
        return (
            Some(format!("{}\n", &program[..i])),
            program[i..].to_string(),
        );
    }
    let stem = program.find("vstem").or_else(|| program.find("hstem"));
    if let Some(i) = stem {
        let end = (i + 6).min(program.len());
        return (Some(program[..end].to_string()), program[end..].to_string());
    }
    (None, program.to_string())
}

/// Compares the reference and modified programs for one glyph.
///
/// Returns `None` when both sections are identical; such glyphs are not
/// interesting and are never rasterized.
pub fn compare_programs(ref_program: &str, mod_program: &str) -> Option<ProgramDiff> {
    let (ref_stems, ref_body) = split_program(ref_program);
    let (mod_stems, mod_body) = split_program(mod_program);
    let mut diff = ProgramDiff::default();
    if ref_stems != mod_stems {
        diff.stems = Some((
            ref_stems.unwrap_or_default(),
            mod_stems.unwrap_or_default(),
        ));
    }
    if ref_body != mod_body {
        diff.body = Some((ref_body, mod_body));
    }
    (diff.stems.is_some() || diff.body.is_some()).then_some(diff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_prefers_mask_over_stem() {
        let program = "9 width\n10 20 hstem\nhintmask 11111111\n5 5 rmoveto\n";
        let (prologue, body) = split_program(program);
        let prologue = prologue.unwrap();
        assert_eq!(prologue, "9 width\n10 20 hstem\n\n");
        assert!(body.starts_with("hintmask 11111111"));
    }

    #[test]
    fn split_after_stem_covers_operator_and_newline() {
        let program = "10 20 hstem\n5 5 rmoveto\n";
        let (prologue, body) = split_program(program);
        // six characters past the marker start: "hstem\n"
        assert_eq!(prologue.unwrap(), "10 20 hstem\n");
        assert_eq!(body, "5 5 rmoveto\n");
    }

    #[test]
    fn split_without_hints_has_no_prologue() {
        let program = "5 5 rmoveto\n10 0 rlineto\n";
        let (prologue, body) = split_program(program);
        assert!(prologue.is_none());
        assert_eq!(body, program);
    }

    #[test]
    fn split_is_total() {
        for program in ["", "x", "vstem", "cntrmask 1\n", "10 20 hstem"] {
            let (prologue, body) = split_program(program);
            // both recoverable halves cover the input
            match prologue {
                Some(p) => assert!(p.len() + body.len() >= program.len()),
                None => assert_eq!(body, program),
            }
        }
    }

    #[test]
    fn identical_programs_produce_no_diff() {
        let program = "10 20 hstem\nhintmask 11110000\n5 5 rmoveto\n";
        assert_eq!(compare_programs(program, program), None);
    }

    #[test]
    fn stem_only_edit_sets_stems_and_not_body() {
        let reference = "10 20 hstem\nhintmask 11110000\n5 5 rmoveto\n";
        let modified = "10 21 hstem\nhintmask 11110000\n5 5 rmoveto\n";
        let diff = compare_programs(reference, modified).unwrap();
        assert!(diff.stems.is_some());
        assert!(diff.body.is_none());
    }

    #[test]
    fn body_edit_sets_body_only() {
        let reference = "10 20 hstem\nhintmask 11110000\n5 5 rmoveto\n";
        let modified = "10 20 hstem\nhintmask 11110000\n5 6 rmoveto\n";
        let diff = compare_programs(reference, modified).unwrap();
        assert!(diff.stems.is_none());
        assert!(diff.body.is_some());
    }

    #[test]
    fn missing_prologue_counts_as_difference() {
        let reference = "5 5 rmoveto\n";
        let modified = "10 20 hstem\n5 5 rmoveto\n";
        let diff = compare_programs(reference, modified).unwrap();
        assert!(diff.stems.is_some());
        assert!(diff.body.is_some());
    }
}
