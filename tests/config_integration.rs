//! Integration tests for configuration-driven chains

mod common;

use common::mock_helpers::create_test_listener;
use common::recv_done;
use filterchain_rs::buffer::{Buffer, PixelFormat};
use filterchain_rs::chain::{ChainBuilder, PoolKind, StageKind};
use filterchain_rs::config::{ChainConfig, PropagationPolicy, StageConfig};
use filterchain_rs::filter::FilterState;
use filterchain_rs::hw::SimulatedGdc;
use filterchain_rs::types::{BufferUsage, ParamValue, Work};
use filterchain_rs::{FilterId, StageFactory};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_sample_round_trips_through_toml_and_json() {
    let dir = TempDir::new().unwrap();
    let sample = ChainConfig::sample();

    for name in ["chain.toml", "nested/chain.json"] {
        let path = dir.path().join(name);
        sample.save(&path).unwrap();
        let loaded = ChainConfig::load(&path).unwrap();
        assert_eq!(loaded, sample);
    }
}

#[test]
fn test_partial_file_takes_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("chain.toml");
    std::fs::write(
        &path,
        r#"
[engine]
control_timeout_ms = 500
propagation = "BestEffort"

[[stages]]
name = "only"
kind = "Passthrough"
"#,
    )
    .unwrap();

    let config = ChainConfig::load(&path).unwrap();
    assert_eq!(config.engine.control_timeout_ms, 500);
    assert_eq!(config.engine.propagation, PropagationPolicy::BestEffort);
    assert_eq!(config.engine.workers_per_stage, 1);
    assert_eq!(config.stages.len(), 1);
    assert_eq!(config.block_pool.default_pool_id, Some(1));
    assert_eq!(
        config.block_pool.find(2).map(|p| p.kind),
        Some(PoolKind::BufferQueue)
    );
}

#[test]
fn test_invalid_files_are_rejected() {
    let dir = TempDir::new().unwrap();

    let unknown_ext = dir.path().join("chain.yaml");
    std::fs::write(&unknown_ext, "stages: []").unwrap();
    assert!(ChainConfig::load(&unknown_ext).is_err());

    let duplicate = ChainConfig {
        stages: vec![
            StageConfig::new("a", StageKind::Passthrough),
            StageConfig::new("a", StageKind::Passthrough),
        ],
        ..Default::default()
    };
    let path = dir.path().join("dup.json");
    std::fs::write(&path, serde_json::to_string(&duplicate).unwrap()).unwrap();
    assert!(ChainConfig::load(&path).is_err());

    let missing = dir.path().join("missing.toml");
    assert_eq!(ChainConfig::load_or_sample(&missing), ChainConfig::sample());
}

#[test]
fn test_sample_chain_runs_end_to_end() {
    let config = ChainConfig::sample();
    let gdc = Arc::new(SimulatedGdc::new(false, Duration::from_millis(1)).unwrap());
    let factory = StageFactory::new(config.engine.clone()).with_gdc_device(gdc);
    let (listener, rx) = create_test_listener();
    let chain = ChainBuilder::from_config(&config, &factory, listener).unwrap();

    let info = chain.get_filter_list_info();
    let names: Vec<&str> = info.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["input", "gdc", "scaler"]);
    assert_eq!(info[0].id, FilterId(1));
    assert_eq!(info[2].id, FilterId(3));
    assert!(info.iter().all(|i| i.has_allocator));
    assert_eq!(info[1].allocator_store_id, Some(2));
    assert_eq!(info[1].usage, BufferUsage::HW_GDC);

    chain.start().unwrap();
    let frame = Buffer::graphic(64, 48, PixelFormat::Nv12);
    frame.set_param("frame", ParamValue::Int(1));
    chain
        .head()
        .unwrap()
        .queue_work(Work::new(1, vec![frame]).with_drain(true))
        .unwrap();

    // input bypasses, gdc corrects once, scaler splits the corrected frame in two
    let work = recv_done(&rx);
    assert!(work.drain);
    assert_eq!(work.unconsumed_count(), 2);
    assert_eq!(work.buffers.len(), 4);
    for out in work.unconsumed() {
        assert_eq!(out.param("frame"), Some(ParamValue::Int(1)));
        assert!(out.param("gdc.tag").is_some());
    }

    let report = serde_json::to_value(chain.get_filter_list_info()).unwrap();
    assert_eq!(report[1]["stats"]["retired"], 1);
    assert_eq!(report[2]["state"], "Started");

    chain.release().unwrap();
    assert!(chain
        .get_filter_list_info()
        .iter()
        .all(|i| i.state == FilterState::Released));
}
