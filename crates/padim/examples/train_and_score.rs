use padim::{BackboneArch, Padim, PooledPyramid};
use std::error::Error;
use std::path::PathBuf;

fn list_images(dir: &str) -> Result<Vec<PathBuf>, Box<dyn Error>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| matches!(e, "png" | "jpg" | "bmp"))
        })
        .collect();
    paths.sort();
    Ok(paths)
}

fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <train_dir> <test_image>... [--json out.json]", args[0]);
        std::process::exit(2);
    }

    let train = list_images(&args[1])?;
    let mut tests = Vec::new();
    let mut json_out = None;
    let mut rest = args[2..].iter();
    while let Some(a) = rest.next() {
        if a == "--json" {
            json_out = rest.next().cloned();
        } else {
            tests.push(PathBuf::from(a));
        }
    }

    let padim = Padim::new(BackboneArch::Pooled);
    let mut extractor = PooledPyramid::new();
    let model = padim.fit(&mut extractor, &train)?;
    let out = padim.infer(&model, &mut extractor, &tests, None)?;

    for image in &out.report.images {
        println!("{}: {:.4}", image.path.display(), image.anomaly_score);
    }

    if let Some(path) = json_out {
        std::fs::write(&path, serde_json::to_string_pretty(&out.report)?)?;
        println!("Wrote {path}");
    }
    Ok(())
}
