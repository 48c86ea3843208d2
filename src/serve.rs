//! Minimal HTTP shell around the diff session.
//!
//! A deliberately small, single-threaded server: the session is computed
//! before the listener starts and is read-only here, so one connection at
//! a time is plenty for a local review tool. Encoded PNG bytes are
//! memoized per query path; entries are written once and never
//! invalidated.

use std::{
    collections::HashMap,
    io::{BufRead, BufReader, Write},
    net::{TcpListener, TcpStream},
};

use crate::session::{Category, DiffSession, SizeKey};

struct Response {
    status: &'static str,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn html(body: String) -> Self {
        Self {
            status: "200 OK",
            content_type: "text/html; charset=utf-8",
            body: body.into_bytes(),
        }
    }

    fn png(body: Vec<u8>) -> Self {
        Self {
            status: "200 OK",
            content_type: "image/png",
            body,
        }
    }

    fn not_found() -> Self {
        Self {
            status: "404 Not Found",
            content_type: "text/plain; charset=utf-8",
            body: b"not found".to_vec(),
        }
    }
}

/// Serves the session until the process is terminated.
pub fn serve(session: &DiffSession, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port))?;
    log::info!("serving on http://127.0.0.1:{port}/");
    let mut png_cache: HashMap<String, Vec<u8>> = HashMap::new();
    for stream in listener.incoming() {
        let Ok(mut stream) = stream else { continue };
        if let Err(e) = handle(session, &mut png_cache, &mut stream) {
            log::debug!("request failed: {e}");
        }
    }
    Ok(())
}

fn handle(
    session: &DiffSession,
    png_cache: &mut HashMap<String, Vec<u8>>,
    stream: &mut TcpStream,
) -> std::io::Result<()> {
    let path = match read_request_path(BufReader::new(&mut *stream)) {
        Some(path) => path,
        None => return Ok(()),
    };
    let response = route(session, png_cache, &path);
    write_response(stream, response)
}

/// Reads the request line and discards headers. Only GET is served.
fn read_request_path(mut reader: impl BufRead) -> Option<String> {
    let mut request_line = String::new();
    reader.read_line(&mut request_line).ok()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?;
    let path = parts.next()?;
    if method != "GET" {
        return None;
    }
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).is_err() || header.trim().is_empty() {
            break;
        }
    }
    Some(path.to_string())
}

fn write_response(stream: &mut TcpStream, response: Response) -> std::io::Result<()> {
    write!(
        stream,
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        response.content_type,
        response.body.len()
    )?;
    stream.write_all(&response.body)
}

/// A parsed request path.
#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Index,
    Script,
    Csdiff(&'a str),
    Report(&'a str),
    Image {
        glyph: &'a str,
        size: SizeKey,
        category: Category,
    },
    Mask {
        glyph: &'a str,
        size: SizeKey,
    },
}

/// Maps a path onto a [`Route`]; `None` on any malformed segment.
///
/// Image paths are `/image/<glyph>/<category>/<size>` plus the two
/// shorthands `/image/<glyph>/label` and `/image/<glyph>/max_diff` (the
/// difference image at the glyph's worst size).
fn parse_route(path: &str) -> Option<Route<'_>> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        [""] => Some(Route::Index),
        ["hintdiff.js"] => Some(Route::Script),
        ["csdiff", glyph] => Some(Route::Csdiff(glyph)),
        ["report", glyph] => Some(Route::Report(glyph)),
        ["image", glyph, "label"] => Some(Route::Image {
            glyph,
            size: SizeKey::Label,
            category: Category::Label,
        }),
        ["image", glyph, "max_diff"] => Some(Route::Image {
            glyph,
            size: SizeKey::Worst,
            category: Category::Difference,
        }),
        ["image", glyph, category, size] => Some(Route::Image {
            glyph,
            size: SizeKey::parse(size)?,
            category: Category::parse(category)?,
        }),
        ["mask", glyph, size] => Some(Route::Mask {
            glyph,
            size: SizeKey::parse(size)?,
        }),
        _ => None,
    }
}

fn route(
    session: &DiffSession,
    png_cache: &mut HashMap<String, Vec<u8>>,
    path: &str,
) -> Response {
    match parse_route(path) {
        Some(Route::Index) => index_page(session),
        Some(Route::Script) => script(session),
        Some(Route::Csdiff(glyph)) => csdiff_page(session, glyph),
        Some(Route::Report(glyph)) => report_page(session, glyph),
        Some(Route::Image {
            glyph,
            size,
            category,
        }) => match session.image(glyph, size, category) {
            Some(image) => cached_png(png_cache, path, || image.encode_png()),
            None => Response::not_found(),
        },
        Some(Route::Mask { glyph, size }) => match session.mask_image(glyph, size) {
            Some(image) => cached_png(png_cache, path, || image.encode_png()),
            None => Response::not_found(),
        },
        None => Response::not_found(),
    }
}

fn cached_png(
    png_cache: &mut HashMap<String, Vec<u8>>,
    path: &str,
    encode: impl FnOnce() -> Option<Vec<u8>>,
) -> Response {
    if let Some(bytes) = png_cache.get(path) {
        return Response::png(bytes.clone());
    }
    match encode() {
        Some(bytes) => {
            png_cache.insert(path.to_string(), bytes.clone());
            Response::png(bytes)
        }
        None => Response::not_found(),
    }
}

/// Escapes text for interpolation into element content or double-quoted
/// attribute values.
fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn script(session: &DiffSession) -> Response {
    let config = session.config();
    let body = format!(
        "const MAG = {};\nconst DIFFMAG = {};\n\
         window.addEventListener('DOMContentLoaded', () => {{\n\
           for (const img of document.querySelectorAll('img.pix')) {{\n\
             img.addEventListener('load', () => {{ img.width = img.naturalWidth * MAG; }});\n\
             if (img.complete) img.width = img.naturalWidth * MAG;\n\
           }}\n\
           for (const img of document.querySelectorAll('img.diff')) {{\n\
             img.addEventListener('load', () => {{ img.width = img.naturalWidth * DIFFMAG; }});\n\
             if (img.complete) img.width = img.naturalWidth * DIFFMAG;\n\
           }}\n\
         }});\n",
        config.mag, config.diff_mag
    );
    Response {
        status: "200 OK",
        content_type: "text/javascript; charset=utf-8",
        body: body.into_bytes(),
    }
}

const STYLE: &str = "<style>\
body { font-family: sans-serif; margin: 2em; }\
table { border-collapse: collapse; }\
td, th { border: 1px solid #ccc; padding: 4px 8px; vertical-align: top; }\
img { image-rendering: pixelated; }\
pre { margin: 0; }\
.del { background: #fdd; }\
.ins { background: #dfd; }\
</style>";

fn index_page(session: &DiffSession) -> Response {
    let mut rows = String::new();
    for (name, record) in session.records_by_weight() {
        let escaped = escape_html(name);
        let weights: Vec<String> = record
            .weights
            .iter()
            .map(|(size, weight)| format!("{size}pt: {weight:.2}"))
            .collect();
        let worst = record
            .worstsize
            .map(|size| format!("{size}pt"))
            .unwrap_or_else(|| "-".to_string());
        rows.push_str(&format!(
            "<tr><td><a href=\"/report/{escaped}\">{escaped}</a><br>\
             <a href=\"/csdiff/{escaped}\">program diff</a></td>\
             <td><img src=\"/image/{escaped}/label\" alt=\"{escaped}\"></td>\
             <td><img class=\"diff\" src=\"/image/{escaped}/max_diff\" alt=\"\"></td>\
             <td>{worst}</td><td>{}</td></tr>\n",
            weights.join("<br>")
        ));
    }
    let body = format!(
        "<!doctype html><html><head><title>hintdiff</title>\
         <script src=\"/hintdiff.js\"></script>{STYLE}</head><body>\
         <h1>Glyphs with hint differences</h1>\
         <table><tr><th>glyph</th><th>label</th><th>worst difference</th>\
         <th>worst size</th><th>weights</th></tr>\n{rows}</table>\
         </body></html>"
    );
    Response::html(body)
}

fn report_page(session: &DiffSession, glyph: &str) -> Response {
    let Some(record) = session.record(glyph) else {
        return Response::not_found();
    };
    let escaped = escape_html(glyph);
    let mut sections = String::new();
    sections.push_str(&format!(
        "<p>stem hints differ: <b>{}</b> &mdash; path body differs: <b>{}</b></p>",
        record.stems.is_some(),
        record.body.is_some()
    ));
    for (size, weight) in &record.weights {
        let mask = if session.has_mask() {
            format!(
                "<td><img class=\"pix\" src=\"/mask/{escaped}/{size}\" alt=\"grid\"></td>"
            )
        } else {
            String::new()
        };
        sections.push_str(&format!(
            "<h2>{size}pt (weight {weight:.2})</h2><table><tr>\
             <td><img class=\"pix\" src=\"/image/{escaped}/Reference/{size}\" alt=\"reference\"></td>\
             <td><img class=\"pix\" src=\"/image/{escaped}/Modified/{size}\" alt=\"modified\"></td>\
             <td><img class=\"diff\" src=\"/image/{escaped}/Difference/{size}\" alt=\"difference\"></td>\
             {mask}</tr>\
             <tr><td>reference</td><td>modified</td><td>difference</td></tr></table>\n"
        ));
    }
    if record.weights.is_empty() {
        sections.push_str("<p>No rendering differences at the tested sizes.</p>");
    }
    let body = format!(
        "<!doctype html><html><head><title>{escaped} - hintdiff</title>\
         <script src=\"/hintdiff.js\"></script>{STYLE}</head><body>\
         <h1>{escaped}</h1><p><a href=\"/\">index</a> | \
         <a href=\"/csdiff/{escaped}\">program diff</a></p>{sections}</body></html>"
    );
    Response::html(body)
}

/// Renders the raw program pair as a line diff, in the manner of a
/// unified diff with +/- markers.
fn csdiff_page(session: &DiffSession, glyph: &str) -> Response {
    let Some((ref_program, mod_program)) = session.programs(glyph) else {
        return Response::not_found();
    };
    let escaped = escape_html(glyph);
    let diff = similar::TextDiff::from_lines(ref_program, mod_program);
    let mut lines = String::new();
    for change in diff.iter_all_changes() {
        let (sign, class) = match change.tag() {
            similar::ChangeTag::Delete => ("-", " class=\"del\""),
            similar::ChangeTag::Insert => ("+", " class=\"ins\""),
            similar::ChangeTag::Equal => (" ", ""),
        };
        lines.push_str(&format!(
            "<pre{class}>{sign} {}</pre>",
            escape_html(change.value().trim_end_matches('\n'))
        ));
    }
    let body = format!(
        "<!doctype html><html><head><title>{escaped} program diff - hintdiff</title>\
         {STYLE}</head><body><h1>{escaped}</h1>\
         <p><a href=\"/\">index</a> | <a href=\"/report/{escaped}\">report</a></p>\
         {lines}</body></html>"
    );
    Response::html(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_path_parses_get() {
        let request = b"GET /report/A HTTP/1.1\r\nHost: x\r\n\r\n" as &[u8];
        assert_eq!(read_request_path(request).as_deref(), Some("/report/A"));
    }

    #[test]
    fn non_get_is_dropped() {
        let request = b"POST / HTTP/1.1\r\n\r\n" as &[u8];
        assert_eq!(read_request_path(request), None);
    }

    #[test]
    fn malformed_request_line_is_dropped() {
        assert_eq!(read_request_path(b"\r\n" as &[u8]), None);
        assert_eq!(read_request_path(b"GET\r\n" as &[u8]), None);
    }

    #[test]
    fn html_escaping() {
        assert_eq!(escape_html("a<b>&c"), "a&lt;b&gt;&amp;c");
        // quotes break out of attribute values if left alone
        assert_eq!(escape_html("a\"b"), "a&quot;b");
    }

    #[test]
    fn routes_dispatch_by_segment() {
        assert_eq!(parse_route("/"), Some(Route::Index));
        assert_eq!(parse_route("/hintdiff.js"), Some(Route::Script));
        assert_eq!(parse_route("/report/A"), Some(Route::Report("A")));
        assert_eq!(parse_route("/csdiff/A"), Some(Route::Csdiff("A")));
        assert_eq!(
            parse_route("/image/A/Difference/12"),
            Some(Route::Image {
                glyph: "A",
                size: SizeKey::Size(12),
                category: Category::Difference,
            })
        );
        assert_eq!(
            parse_route("/mask/A/10"),
            Some(Route::Mask {
                glyph: "A",
                size: SizeKey::Size(10),
            })
        );
    }

    #[test]
    fn image_shorthand_routes() {
        assert_eq!(
            parse_route("/image/A/label"),
            Some(Route::Image {
                glyph: "A",
                size: SizeKey::Label,
                category: Category::Label,
            })
        );
        assert_eq!(
            parse_route("/image/A/max_diff"),
            Some(Route::Image {
                glyph: "A",
                size: SizeKey::Worst,
                category: Category::Difference,
            })
        );
    }

    #[test]
    fn malformed_routes_are_rejected() {
        assert_eq!(parse_route("/nope"), None);
        assert_eq!(parse_route("/report/A/extra"), None);
        assert_eq!(parse_route("/image/A"), None);
        assert_eq!(parse_route("/image/A/Sideways/12"), None);
        assert_eq!(parse_route("/image/A/Difference/twelve"), None);
        assert_eq!(parse_route("/mask/A/x"), None);
    }
}
