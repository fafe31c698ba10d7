//! Loading `DeferredConfig` from disk.

use std::io::Write;

use studio_lighting::deferred::{DeferredConfig, DeferredError, LightClusterer};

#[test]
fn config_file_overrides_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "cluster": {{ "tiles_x": 8, "tiles_y": 4, "slices_z": 12 }},
            "shadow": {{ "max_casters": 2 }},
            "frames_in_flight": 3
        }}"#
    )
    .unwrap();

    let config = DeferredConfig::load(file.path()).unwrap();
    assert_eq!(config.cluster.cell_count(), 8 * 4 * 12);
    assert_eq!(config.cluster.max_lights_per_cluster, 32);
    assert_eq!(config.shadow.max_casters, 2);
    assert_eq!(config.shadow.resolution, 512);
    assert_eq!(config.frames_in_flight, 3);

    // The clusterer follows the configured grid
    let clusterer = LightClusterer::new(config.cluster);
    assert_eq!(clusterer.clusters().len(), 384);
}

#[test]
fn saved_config_loads_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("deferred.json");

    let mut config = DeferredConfig::default();
    config.max_lights = 64;
    config.shadow.compare_bias = 0.1;
    std::fs::write(&path, config.to_json_string().unwrap()).unwrap();

    assert_eq!(DeferredConfig::load(&path).unwrap(), config);
}

#[test]
fn bad_config_files_are_errors() {
    let dir = tempfile::tempdir().unwrap();

    let missing = DeferredConfig::load(dir.path().join("missing.json"));
    assert!(matches!(missing, Err(DeferredError::ConfigIo(_))));

    let garbled = dir.path().join("garbled.json");
    std::fs::write(&garbled, "{ cluster: ").unwrap();
    assert!(matches!(
        DeferredConfig::load(&garbled),
        Err(DeferredError::ConfigIo(_))
    ));

    let invalid = dir.path().join("invalid.json");
    std::fs::write(&invalid, r#"{ "cluster": { "tiles_x": 0 } }"#).unwrap();
    assert!(matches!(
        DeferredConfig::load(&invalid),
        Err(DeferredError::InvalidConfig(_))
    ));
}
