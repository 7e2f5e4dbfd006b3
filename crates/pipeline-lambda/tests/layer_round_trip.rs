//! Build layers from a dependency tree, unpack them the way the platform
//! does, and serve invocations from the unpacked layers.

use pipeline_lambda::build::{self, BuildPlan, EstimatorChoice, Strategy};
use pipeline_lambda::runtime::{Bootstrap, Dispatcher, LayerSource, ProcessLoaderProvider};
use pipeline_lambda::{BuildError, Ceilings};
use pipeline_lambda_sdk::{ErrorKind, InvocationContext};
use serde_json::json;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

fn write(path: &Path, content: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// A small tree: a definitions unit, an engine unit and two packages
fn dependency_tree(root: &Path) {
    write(
        &root.join("pipelines/ndvi.json"),
        json!({
            "nodes": {
                "red": {"node": "datalib.Landsat8", "attrs": {"band": "B4"}},
                "nir": {"node": "datalib.Landsat8", "attrs": {"band": "B5"}},
                "ndvi": {"node": "algorithm.Arithmetic", "inputs": {"A": "red", "B": "nir"}}
            }
        })
        .to_string()
        .as_bytes(),
    );
    write(
        &root.join("bin/pipeline-engine"),
        b"#!/bin/sh\ncat > /dev/null\nprintf '\\000\\000\\000\\031{\"type\":\"json\",\"value\":1}'\n",
    );
    write(&root.join("numpy/core/umath.so"), &vec![1u8; 3000]);
    write(&root.join("numpy/__pycache__/core.cpython-37.pyc"), &vec![2u8; 500]);
    write(&root.join("scipy/linalg/blas.so"), &vec![3u8; 2500]);
}

fn plan(tmp: &Path) -> BuildPlan {
    let mut plan = BuildPlan::new(tmp.join("deps"), tmp.join("dist"));
    plan.ceilings = Ceilings {
        max_uncompressed_layer: 4000,
        max_compressed_layer: 4000,
        max_layers: 3,
    };
    plan.estimator = EstimatorChoice::Ratio(1.0);
    plan.strategy = Strategy::Sealing;
    plan
}

#[test]
fn test_build_respects_ceilings_and_prunes() {
    let tmp = tempfile::tempdir().unwrap();
    dependency_tree(&tmp.path().join("deps"));

    let report = build::run(&plan(tmp.path())).unwrap();

    assert_eq!(report.manifest.unit_sizes["numpy"], 3000);
    assert_eq!(report.manifest.layers.len(), 2);
    assert_eq!(report.manifest.layers[0].members[0], "numpy");
    assert_eq!(report.manifest.layers[1].members[0], "scipy");
    for layer in &report.manifest.layers {
        assert!(layer.uncompressed_total <= 4000);
    }

    build::verify(&tmp.path().join("dist"), &plan(tmp.path()).ceilings).unwrap();
}

#[test]
fn test_too_few_layers_fails_without_output() {
    let tmp = tempfile::tempdir().unwrap();
    dependency_tree(&tmp.path().join("deps"));

    let mut plan = plan(tmp.path());
    plan.ceilings.max_layers = 1;

    let err = build::run(&plan).unwrap_err();
    assert!(matches!(err, BuildError::CapacityExceeded { ref unit, .. } if unit == "scipy"));
    assert!(!tmp.path().join("dist").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_unpacked_layers_serve_pipelines() {
    let tmp = tempfile::tempdir().unwrap();
    dependency_tree(&tmp.path().join("deps"));
    {
        use std::os::unix::fs::PermissionsExt;
        let engine = tmp.path().join("deps/bin/pipeline-engine");
        fs::set_permissions(&engine, fs::Permissions::from_mode(0o755)).unwrap();
    }

    let report = build::run(&plan(tmp.path())).unwrap();

    // unpack each archive into layer-<id>, as the platform does
    let layers_root = tmp.path().join("opt");
    for archive in &report.archives {
        let target = layers_root.join(format!("layer-{}", archive.layer));
        let mut zip = zip::ZipArchive::new(File::open(&archive.path).unwrap()).unwrap();
        zip.extract(&target).unwrap();
    }

    let dispatcher = Dispatcher::new(Bootstrap::new(
        LayerSource::Discover(layers_root.clone()),
        Arc::new(ProcessLoaderProvider::new("pipeline-engine")),
    ));

    let response = dispatcher
        .handle(json!({"pipeline": "ndvi"}), InvocationContext::with_request_id("req-1"))
        .await
        .unwrap();
    assert!(response.is_success(), "{:?}", response);
    assert_eq!(response.body_json(), Some(json!(1)));

    let response = dispatcher
        .handle(json!({"pipeline": "smap"}), InvocationContext::default())
        .await
        .unwrap();
    assert_eq!(response.error_kind(), Some(ErrorKind::ResolutionError));
    assert_eq!(response.status_code, 400);

    assert_eq!(dispatcher.bootstrap().attempts(), 1);
    assert_eq!(
        dispatcher.bootstrap().search_path().unwrap().len(),
        report.archives.len()
    );
}
