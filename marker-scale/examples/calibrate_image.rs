//Detect square markers in an image and write the calibration record and overlay

use std::path::{Path, PathBuf};

use clap::Parser;
use image::Rgb;
use image_transform::overlay::draw_boxes;
use marker_scale::{candidate::boxes, CalibrationConfig, Calibrator};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    //path to a photo containing one or more markers
    image_path: PathBuf,
    //physical edge length of the marker in millimeters
    #[arg(short, long)]
    edge_mm: Option<f64>,
    //JSON file overriding the default configuration
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long, default_value = ".")]
    out_dir: PathBuf,
    //also write the top N screened candidate boxes
    #[arg(long)]
    candidates: Option<usize>,
    //also write the rectified view of every marker
    #[arg(long)]
    rectified: bool,
}

fn main() {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => CalibrationConfig::from_json_file(path).expect("could not load config"),
        None => CalibrationConfig::default(),
    };
    let edge_mm = args.edge_mm.unwrap_or(config.default_edge_mm);
    let calibrator = Calibrator::new(config).expect("invalid config");

    let image = image::open(&args.image_path)
        .expect("could not read image")
        .to_rgb8();
    let report = calibrator
        .calibrate_detailed(&image, edge_mm)
        .expect("calibration failed");

    let name = args
        .image_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = args
        .image_path
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let out = |suffix: &str| -> PathBuf { Path::new(&args.out_dir).join(format!("{}{}", stem, suffix)) };

    let record = report.record.with_image_name(name);
    std::fs::write(
        out(".calibration.json"),
        record.to_json_pretty().expect("could not serialize record"),
    )
    .expect("could not write record");
    report
        .overlay
        .save(out("_overlay.jpg"))
        .expect("could not write overlay");

    if let Some(n) = args.candidates {
        let mut canvas = image.clone();
        draw_boxes(&mut canvas, &boxes(&report.candidates, n), Rgb([0, 255, 0]), 2);
        canvas
            .save(out("_candidates.jpg"))
            .expect("could not write candidates");
    }
    if args.rectified {
        for marker in &report.markers {
            if let Some(view) = &marker.warped {
                view.save(out(&format!("_marker{}.png", marker.id)))
                    .expect("could not write rectified view");
            }
        }
    }

    for marker in &record.markers {
        println!(
            "marker {}: {:.5} mm/px ({:.2} px edge, {:?})",
            marker.id,
            marker.mm_per_px,
            edge_mm / marker.mm_per_px,
            report.markers[(marker.id - 1) as usize].precision
        );
    }
    if record.markers.is_empty() {
        println!("no markers found");
    }
}
