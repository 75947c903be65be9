//! Snapshot and build command implementations

use crate::cli::{BuildArgs, CommonArgs, SnapshotArgs};
use crate::output::{self, StepReport};
use layerdiff::{
    ExclusionConfig, ExclusionFilter, LayerError, LayerSnapshot, Result, SnapshotOptions,
    Snapshotter,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Snapshot the root directory once and write it as `layer-000.tar`.
pub fn run_snapshot(args: SnapshotArgs) -> Result<()> {
    let common = args.common;
    let (mut snapshotter, output_dir) = prepare(&common, false)?;

    let layer = snapshotter.snapshot_full_tree()?;
    let report = StepReport {
        step: None,
        key: snapshotter.compute_key()?,
        added: layer.added.len(),
        whiteouts: layer.whiteouts.len(),
        layer: Some(publish_layer(&layer, &output_dir, 0)?),
    };

    output::print_reports(&[report], common.json)
}

/// Record the base state, then run each step and write the layer it produced.
pub fn run_build(args: BuildArgs) -> Result<()> {
    let common = args.common;
    let (mut snapshotter, output_dir) = prepare(&common, args.single_snapshot)?;
    let single_snapshot = snapshotter.options().single_snapshot;

    snapshotter.init()?;

    let mut reports = Vec::with_capacity(args.steps.len());
    let last = args.steps.len().saturating_sub(1);
    for (index, step) in args.steps.iter().enumerate() {
        tracing::info!("Running step {}: {}", index + 1, step);
        run_step(snapshotter.root(), step)?;

        if single_snapshot && index < last {
            tracing::info!("Skipping snapshot for step {}, single-snapshot mode", index + 1);
            continue;
        }

        let layer = snapshotter.snapshot_full_tree()?;
        let published = if layer.is_empty() {
            tracing::info!("Step {} changed nothing, no layer written", index + 1);
            discard_layer(&layer);
            None
        } else {
            Some(publish_layer(&layer, &output_dir, index + 1)?)
        };

        reports.push(StepReport {
            step: Some(step.clone()),
            key: snapshotter.compute_key()?,
            added: layer.added.len(),
            whiteouts: layer.whiteouts.len(),
            layer: published,
        });
    }

    output::print_reports(&reports, common.json)
}

/// Resolve options and paths and construct the snapshotter.
fn prepare(common: &CommonArgs, single_snapshot: bool) -> Result<(Snapshotter, PathBuf)> {
    let mut options = match &common.config {
        Some(path) => SnapshotOptions::load(path)?,
        None => SnapshotOptions::default(),
    };
    options.reproducible |= common.reproducible;
    options.single_snapshot |= single_snapshot;

    let root = fs::canonicalize(&common.root).map_err(|e| LayerError::Stat {
        path: common.root.clone(),
        source: e,
    })?;

    fs::create_dir_all(&common.output).map_err(LayerError::Io)?;
    let output_dir = fs::canonicalize(&common.output).map_err(|e| LayerError::Stat {
        path: common.output.clone(),
        source: e,
    })?;

    // Relative excludes are interpreted against the root being snapshotted
    options.extra_exclude_paths.extend(
        common
            .exclude
            .iter()
            .map(|path| if path.is_absolute() { path.clone() } else { root.join(path) }),
    );
    // Never archive our own output
    if output_dir.starts_with(&root) {
        options.extra_exclude_paths.push(output_dir.clone());
    }

    let exclusion = ExclusionFilter::new(ExclusionConfig::from_options(&options, &root))?;
    let snapshotter = Snapshotter::new(root, &options, Box::new(exclusion))?;
    Ok((snapshotter, output_dir))
}

/// Run one build step with `sh -c` in the root directory.
fn run_step(root: &Path, step: &str) -> Result<()> {
    let status = Command::new("sh")
        .arg("-c")
        .arg(step)
        .current_dir(root)
        .status()
        .map_err(LayerError::CommandExecution)?;

    if !status.success() {
        return Err(LayerError::StepFailed {
            step: step.to_string(),
            code: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

/// Move a layer archive out of the scratch directory as `layer-NNN.tar`.
fn publish_layer(layer: &LayerSnapshot, output_dir: &Path, number: usize) -> Result<PathBuf> {
    let target = output_dir.join(format!("layer-{number:03}.tar"));
    // Scratch and output may be on different filesystems
    if fs::rename(&layer.archive, &target).is_err() {
        fs::copy(&layer.archive, &target).map_err(|e| LayerError::Archive {
            path: target.clone(),
            source: e,
        })?;
        discard_layer(layer);
    }
    Ok(target)
}

fn discard_layer(layer: &LayerSnapshot) {
    if let Err(e) = fs::remove_file(&layer.archive) {
        tracing::warn!("Failed to remove {}: {}", layer.archive.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        root: PathBuf,
        output: PathBuf,
        config: PathBuf,
    }

    fn setup() -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path().join("rootfs");
        fs::create_dir_all(root.join("etc")).expect("create etc");
        fs::write(root.join("etc/os-release"), b"ID=test\n").expect("write os-release");
        let config = dir.path().join("layerdiff.toml");
        fs::write(
            &config,
            format!(
                "[snapshot]\nscratch_dir = {:?}\ndetect_mounts = false\n",
                dir.path().join("scratch")
            ),
        )
        .expect("write config");
        Fixture {
            output: dir.path().join("out"),
            root,
            config,
            dir,
        }
    }

    fn common(fx: &Fixture) -> CommonArgs {
        CommonArgs {
            root: fx.root.clone(),
            output: fx.output.clone(),
            config: Some(fx.config.clone()),
            exclude: Vec::new(),
            reproducible: true,
            json: true,
        }
    }

    fn archive_names(path: &Path) -> Vec<String> {
        let mut archive = tar::Archive::new(fs::File::open(path).expect("open archive"));
        let mut names: Vec<String> = archive
            .entries()
            .expect("entries")
            .map(|e| {
                e.expect("entry")
                    .path()
                    .expect("path")
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        names.sort();
        names
    }

    #[test]
    fn snapshot_writes_base_layer() {
        let fx = setup();
        run_snapshot(SnapshotArgs { common: common(&fx) }).expect("snapshot");

        let layer = fx.output.join("layer-000.tar");
        assert_eq!(archive_names(&layer), vec!["etc", "etc/os-release"]);
    }

    #[test]
    fn build_writes_layer_per_changing_step() {
        let fx = setup();
        run_build(BuildArgs {
            common: common(&fx),
            steps: vec![
                "mkdir -p app && echo hi > app/hello".to_string(),
                "true".to_string(),
                "rm etc/os-release".to_string(),
            ],
            single_snapshot: false,
        })
        .expect("build");

        assert_eq!(
            archive_names(&fx.output.join("layer-001.tar")),
            vec!["app", "app/hello"]
        );
        assert!(!fx.output.join("layer-002.tar").exists());
        assert_eq!(
            archive_names(&fx.output.join("layer-003.tar")),
            vec!["etc/.wh.os-release"]
        );
    }

    #[test]
    fn single_snapshot_writes_one_layer() {
        let fx = setup();
        run_build(BuildArgs {
            common: common(&fx),
            steps: vec!["echo a > a".to_string(), "echo b > b".to_string()],
            single_snapshot: true,
        })
        .expect("build");

        assert!(!fx.output.join("layer-001.tar").exists());
        assert_eq!(
            archive_names(&fx.output.join("layer-002.tar")),
            vec!["a", "b"]
        );
    }

    #[test]
    fn output_inside_root_is_not_archived() {
        let mut fx = setup();
        fx.output = fx.root.join("out");
        run_build(BuildArgs {
            common: common(&fx),
            steps: vec!["echo x > x".to_string()],
            single_snapshot: false,
        })
        .expect("build");

        assert_eq!(archive_names(&fx.output.join("layer-001.tar")), vec!["x"]);
    }

    #[test]
    fn failing_step_is_reported() {
        let fx = setup();
        let result = run_build(BuildArgs {
            common: common(&fx),
            steps: vec!["exit 3".to_string()],
            single_snapshot: false,
        });
        match result {
            Err(LayerError::StepFailed { step, code }) => {
                assert_eq!(step, "exit 3");
                assert_eq!(code, 3);
            }
            other => panic!("expected StepFailed, got {:?}", other),
        }
        assert!(fx.dir.path().join("scratch").exists());
    }
}
