//! Runs that publish through the real directory and tar sinks

mod fixtures;

use std::fs;

use crossbuild_lane::collect::{BundleManifest, MANIFEST_FILE};
use crossbuild_lane::mock::MockRuntime;
use crossbuild_lane::publish::BundleFormat;
use crossbuild_lane::{PipelineSettings, PlatformEntry, PlatformMatrix, RunReport};

use fixtures::{app_build, app_spec, list_files, matrix, Workbench};

fn two_entries() -> PlatformMatrix {
    matrix(vec![
        PlatformEntry::new("linux/amd64", "x86_64"),
        PlatformEntry::new("linux/arm64", "aarch64"),
    ])
}

fn bench() -> Workbench {
    Workbench::new(
        MockRuntime::new()
            .with_build("linux/amd64", app_build("x86_64"))
            .with_build("linux/arm64", app_build("aarch64")),
    )
}

fn run_with_configured_sink(bench: &Workbench, settings: PipelineSettings) -> RunReport {
    let sink = settings.bundle.sink(settings.output_dir.clone());
    let image = settings.image.clone();
    let entrypoint = settings.entrypoint.clone();
    bench
        .orchestrator_with_sink(settings, sink)
        .run_all(&two_entries(), &image, &entrypoint, &app_spec())
}

#[test]
fn test_directory_bundles_land_in_output_dir() {
    let bench = bench();
    let settings = bench.settings();
    let report = run_with_configured_sink(&bench, settings.clone());
    assert_eq!(report.exit_code, 0, "{}", report.human_summary);

    let mut bundles: Vec<String> = fs::read_dir(&settings.output_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    bundles.sort();
    assert_eq!(bundles, vec!["aarch64-linux".to_string(), "x86_64-linux".to_string()]);

    let bundle_dir = settings.output_dir.join("aarch64-linux");
    assert_eq!(fs::read_to_string(bundle_dir.join("app")).unwrap(), "app for aarch64");
    assert!(bundle_dir.join("packages/app_1.0_aarch64.deb").exists());

    let manifest = BundleManifest::from_file(&bundle_dir.join(MANIFEST_FILE)).unwrap();
    assert_eq!(manifest.platform, "linux/arm64");
    assert!(manifest.verify_entries(&bundle_dir).unwrap().is_empty());

    let receipt = report.entries[1].bundle.as_ref().unwrap();
    assert_eq!(receipt.location, bundle_dir.display().to_string());
    assert_eq!(receipt.bundle_root_sha256, manifest.bundle_root_sha256);
}

#[test]
fn test_rerun_replaces_bundles_without_copying_outputs() {
    let bench = bench();
    let settings = bench.settings();

    let first = run_with_configured_sink(&bench, settings.clone());
    let before = list_files(&settings.output_dir);
    let second = run_with_configured_sink(&bench, settings.clone());
    let after = list_files(&settings.output_dir);

    assert_eq!(first.exit_code, 0);
    assert_eq!(second.exit_code, 0);
    // Previous bundles under the source root are not harvested again
    assert_eq!(before, after);
    assert_eq!(
        first.entries[0].bundle.as_ref().map(|b| &b.bundle_root_sha256),
        second.entries[0].bundle.as_ref().map(|b| &b.bundle_root_sha256)
    );
}

#[test]
fn test_tar_bundles_are_reproducible() {
    let bench = bench();
    let mut settings = bench.settings();
    settings.bundle.format = BundleFormat::Tar;

    let first = run_with_configured_sink(&bench, settings.clone());
    assert_eq!(first.exit_code, 0, "{}", first.human_summary);
    let tar_path = settings.output_dir.join("x86_64-linux.tar");
    let first_bytes = fs::read(&tar_path).unwrap();

    run_with_configured_sink(&bench, settings.clone());
    let second_bytes = fs::read(&tar_path).unwrap();
    assert_eq!(first_bytes, second_bytes);

    let mut archive = tar::Archive::new(first_bytes.as_slice());
    let paths: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();
    assert!(paths.contains(&"app".to_string()));
    assert!(paths.contains(&MANIFEST_FILE.to_string()));
    assert!(paths.contains(&"locale/de/LC_MESSAGES/app.mo".to_string()));

    // Only finished archives remain
    assert_eq!(
        list_files(&settings.output_dir),
        vec!["aarch64-linux.tar".to_string(), "x86_64-linux.tar".to_string()]
    );
}
