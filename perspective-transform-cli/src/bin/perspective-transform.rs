use std::io::Write;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use eyre::Context;

use perspective_warp::{Interpolation, WarpOptions};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Also write log messages to this file.
    #[arg(long, global = true)]
    log_file: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct Markers {
    /// Tab-separated marker positions in image pixels, with a header line.
    pixel_markers: Utf8PathBuf,

    /// Tab-separated marker positions in world units, in the same order as
    /// the pixel markers.
    world_markers: Utf8PathBuf,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Transform the bottom-center point of every detection to world
    /// coordinates.
    Annotations {
        #[command(flatten)]
        markers: Markers,

        /// Tab-separated detections: frame_no, class_no, xmin, ymin, xmax, ymax.
        annotations: Utf8PathBuf,

        /// Output file. Defaults to stdout.
        #[arg(short, long)]
        output: Option<Utf8PathBuf>,
    },
    /// Warp an image into plan view.
    Image {
        #[command(flatten)]
        markers: Markers,

        /// Input image.
        image: Utf8PathBuf,

        /// Output image. The format follows the file extension.
        output: Utf8PathBuf,

        /// Width of the output image in pixels.
        #[arg(long)]
        width: u32,

        /// Height of the output image in pixels.
        #[arg(long)]
        height: u32,

        #[arg(long, value_enum, default_value_t = Interpolation::Bilinear)]
        interpolation: Interpolation,

        /// Value of every channel outside the input image.
        #[arg(long, default_value_t = 0)]
        fill: u8,
    },
    /// Print the estimated matrix and the per-marker error as YAML.
    Matrix {
        #[command(flatten)]
        markers: Markers,
    },
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    env_tracing_logger::initiate_logging(cli.log_file.as_deref().map(|p| p.as_std_path()))?;

    match cli.command {
        Commands::Annotations {
            markers,
            annotations,
            output,
        } => {
            let engine =
                perspective_transform_cli::load_engine(&markers.pixel_markers, &markers.world_markers)?;
            let out: Box<dyn Write> = match &output {
                Some(path) => Box::new(std::io::BufWriter::new(
                    std::fs::File::create(path).with_context(|| format!("creating {path}"))?,
                )),
                None => Box::new(std::io::stdout().lock()),
            };
            perspective_transform_cli::transform_annotations_path(&annotations, &engine, out)?;
        }
        Commands::Image {
            markers,
            image,
            output,
            width,
            height,
            interpolation,
            fill,
        } => {
            let engine =
                perspective_transform_cli::load_engine(&markers.pixel_markers, &markers.world_markers)?;
            let options = WarpOptions {
                interpolation,
                fill,
            };
            perspective_transform_cli::warp_image(&engine, &image, &output, width, height, options)?;
        }
        Commands::Matrix { markers } => {
            let engine =
                perspective_transform_cli::load_engine(&markers.pixel_markers, &markers.world_markers)?;
            let report = perspective_transform_cli::matrix_report(&engine)?;
            print!("{}", serde_yaml::to_string(&report)?);
        }
    }

    Ok(())
}
