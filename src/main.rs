use std::path::PathBuf;

use clap::Parser;

use hintdiff::{serve, Config, DiffSession, RenderMode, SubGrid};

/// Compares the hinting of two builds of a font and serves an HTML report.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Reference font file (OTF/CFF).
    ref_font: PathBuf,
    /// Modified font file (OTF/CFF).
    mod_font: PathBuf,
    /// Enlargement factor for pixel maps in the glyph report.
    #[arg(long, default_value_t = 8)]
    mag: u32,
    /// Enlargement factor for difference maps in the glyph report.
    #[arg(long, default_value_t = 8)]
    diffmag: u32,
    /// Point sizes to compare.
    #[arg(short = 'c', long, num_args = 1.., default_values_t = [8, 10, 12, 14, 16, 20])]
    sizes: Vec<u32>,
    /// Point size of the preview images on the main listing.
    #[arg(long, default_value_t = 70)]
    labelsize: u32,
    /// Rendering backend.
    #[arg(long, value_enum, default_value_t = Mode::Grayscale)]
    mode: Mode,
    /// Open the report in the default browser once the server is up.
    #[arg(long)]
    open: bool,
    /// Port to serve the report on.
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Mode {
    Grayscale,
    Mono,
    G1x1,
    G6x1,
    G6x5,
    G8x1,
    G4x4,
}

impl From<Mode> for RenderMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Grayscale => RenderMode::Grayscale,
            Mode::Mono => RenderMode::Monochrome,
            Mode::G1x1 => RenderMode::SubSampled(SubGrid::G1x1),
            Mode::G6x1 => RenderMode::SubSampled(SubGrid::G6x1),
            Mode::G6x5 => RenderMode::SubSampled(SubGrid::G6x5),
            Mode::G8x1 => RenderMode::SubSampled(SubGrid::G8x1),
            Mode::G4x4 => RenderMode::SubSampled(SubGrid::G4x4),
        }
    }
}

fn run(args: Args) -> Result<(), hintdiff::Error> {
    let config = Config {
        label_size: args.labelsize,
        mag: args.mag,
        diff_mag: args.diffmag,
        sizes: args.sizes,
        mode: args.mode.into(),
    };
    let session = DiffSession::new(&args.ref_font, &args.mod_font, config)?;
    if session.is_empty() {
        log::info!("no hint differences found");
    }
    if args.open {
        open_browser(&format!("http://127.0.0.1:{}/", args.port));
    }
    serve(&session, args.port)?;
    Ok(())
}

fn open_browser(url: &str) {
    let launcher = if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    };
    if let Err(e) = std::process::Command::new(launcher).arg(url).spawn() {
        log::warn!("failed to launch browser: {e}");
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
