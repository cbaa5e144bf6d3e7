//! Integration tests for the GDC stage
//!
//! These tests validate hardware offload end to end:
//! - Out-of-order completions matched back to their works
//! - Bypass for config-only buffers, disabled correction and queue failures
//! - Cancellation of in-flight jobs on stop

mod common;

use common::builders::WorkBuilder;
use common::mock_helpers::{create_test_listener, idle_gdc, MockGdc};
use common::{drain_for, recv_done, wait_until};
use filterchain_rs::buffer::{Buffer, BufferFlags, PixelFormat};
use filterchain_rs::chain::{ChainBuilder, StageKind};
use filterchain_rs::config::{ChainConfig, EngineConfig, StageConfig};
use filterchain_rs::filter::{Completion, Filter, FilterState};
use filterchain_rs::hw::{GdcDevice, SimulatedGdc};
use filterchain_rs::types::{BufferUsage, ParamValue};
use filterchain_rs::StageFactory;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

fn gdc_config(m2m: bool) -> ChainConfig {
    ChainConfig {
        stages: vec![
            StageConfig::new("input", StageKind::Passthrough),
            StageConfig::new("gdc", StageKind::Gdc)
                .with_store(2)
                .with_usage(BufferUsage::HW_GDC)
                .with_option("m2m", ParamValue::Bool(m2m))
                .with_option("poll_ms", ParamValue::Int(2)),
        ],
        ..Default::default()
    }
}

fn build(
    config: &ChainConfig,
    device: Arc<dyn GdcDevice>,
) -> (ChainBuilder, crossbeam_channel::Receiver<Completion>) {
    let factory = StageFactory::new(config.engine.clone()).with_gdc_device(device);
    let (listener, rx) = create_test_listener();
    let chain = ChainBuilder::from_config(config, &factory, listener).unwrap();
    (chain, rx)
}

#[test]
fn test_out_of_order_completions_find_their_works() {
    let device = Arc::new(SimulatedGdc::new(true, Duration::from_millis(5)).unwrap());
    let (chain, rx) = build(&gdc_config(true), device.clone());
    let head = chain.head().unwrap();
    chain.start().unwrap();

    let frames = 6u64;
    for frame in 0..frames {
        let input = Buffer::graphic(64, 32, PixelFormat::Nv12);
        input.set_param("frame", ParamValue::Int(frame as i64));
        head.queue_work(WorkBuilder::new(frame).buffer(input).build())
            .unwrap();
    }

    let mut seen = BTreeSet::new();
    for _ in 0..frames {
        // Outputs return to the pool when the work is dropped here
        let work = recv_done(&rx);
        assert!(!work.is_failed());
        assert_eq!(work.input_index, 1);
        assert_eq!(work.unconsumed_count(), 1);

        let input = &work.buffers[0];
        let output = &work.unconsumed()[0];
        assert_eq!(
            output.param("frame"),
            Some(ParamValue::Int(work.frame_index as i64))
        );
        assert!(output.param("gdc.tag").is_some());
        assert!(input.handoff().is_none());
        seen.insert(work.frame_index);
    }
    assert_eq!(seen, (0..frames).collect());
    assert_eq!(device.queued(), frames);

    let gdc = chain.get_filter("gdc").unwrap();
    assert_eq!(gdc.stats().retired, frames);
    chain.release().unwrap();
}

#[test]
fn test_tight_mode_processes_one_job_at_a_time() {
    let device = Arc::new(SimulatedGdc::new(false, Duration::from_millis(2)).unwrap());
    let (chain, rx) = build(&gdc_config(false), device.clone());
    let head = chain.head().unwrap();
    chain.start().unwrap();

    for frame in 0..3 {
        head.queue_work(WorkBuilder::new(frame).graphic(32, 32).build())
            .unwrap();
    }
    let mut order: Vec<u64> = (0..3).map(|_| recv_done(&rx).frame_index).collect();
    order.sort_unstable();
    assert_eq!(order, vec![0, 1, 2]);
    chain.release().unwrap();
}

#[test]
fn test_config_only_buffer_bypasses() {
    let device = Arc::new(SimulatedGdc::new(true, Duration::from_millis(1)).unwrap());
    let (chain, rx) = build(&gdc_config(true), device.clone());
    let head = chain.head().unwrap();
    chain.start().unwrap();

    let config_only = Buffer::graphic(16, 16, PixelFormat::Nv12);
    config_only.set_flags(BufferFlags {
        config_only: true,
        ..Default::default()
    });
    head.queue_work(WorkBuilder::new(0).buffer(config_only.clone()).build())
        .unwrap();

    let work = recv_done(&rx);
    assert_eq!(work.buffers, vec![config_only]);
    assert_eq!(work.input_index, 0);
    assert_eq!(device.queued(), 0);
    chain.release().unwrap();
}

#[test]
fn test_disabled_and_linear_buffers_bypass() {
    let mut config = gdc_config(true);
    config.stages[1]
        .options
        .insert("enabled".into(), ParamValue::Bool(false));
    let device = Arc::new(SimulatedGdc::new(true, Duration::from_millis(1)).unwrap());
    let (chain, rx) = build(&config, device.clone());
    let head = chain.head().unwrap();
    chain.start().unwrap();

    head.queue_work(WorkBuilder::new(0).graphic(16, 16).build())
        .unwrap();
    head.queue_work(WorkBuilder::new(1).linear(64).build())
        .unwrap();
    for _ in 0..2 {
        let work = recv_done(&rx);
        assert_eq!(work.buffers.len(), 1);
        assert_eq!(work.unconsumed_count(), 1);
    }
    assert_eq!(device.queued(), 0);
    assert_eq!(chain.get_filter("gdc").unwrap().stats().bypassed, 2);
    chain.release().unwrap();
}

#[test]
fn test_queue_failure_falls_back_to_bypass() {
    let device = Arc::new(SimulatedGdc::new(false, Duration::from_millis(1)).unwrap());
    device.set_fail_queue(true);
    let (chain, rx) = build(&gdc_config(false), device.clone());
    let head = chain.head().unwrap();
    chain.start().unwrap();

    let input = Buffer::graphic(16, 16, PixelFormat::Nv12);
    head.queue_work(WorkBuilder::new(0).buffer(input.clone()).build())
        .unwrap();

    let work = recv_done(&rx);
    assert!(!work.is_failed());
    assert_eq!(work.unconsumed(), &[input.clone()]);
    assert!(input.handoff().is_none());
    chain.release().unwrap();
}

#[test]
fn test_stop_abandons_in_flight_jobs() {
    let mut device = idle_gdc();
    device.expect_queue().returning(|_, _, _| Ok(()));
    let (chain, rx) = build(&gdc_config(true), Arc::new(device));
    let head = chain.head().unwrap();
    chain.start().unwrap();

    for frame in 0..2 {
        head.queue_work(WorkBuilder::new(frame).graphic(16, 16).build())
            .unwrap();
    }
    let gdc = chain.get_filter("gdc").unwrap();
    assert!(wait_until(|| gdc.stats().processed == 2));

    chain.stop().unwrap();
    assert_eq!(gdc.state(), FilterState::Stopped);

    let returned: usize = drain_for(&rx, Duration::from_millis(50))
        .into_iter()
        .map(|msg| match msg {
            Completion::Flushed { works, .. } => works.len(),
            Completion::Done { .. } => panic!("nothing should complete"),
            Completion::Error { .. } => 0,
        })
        .sum();
    assert_eq!(returned, 2);
    chain.release().unwrap();
}

#[test]
fn test_real_time_check_follows_device() {
    let mut device = MockGdc::new();
    device.expect_is_real_time_capable().return_const(false);
    let factory = StageFactory::new(EngineConfig::default()).with_gdc_device(Arc::new(device));
    let filter = factory
        .create(
            StageKind::Gdc,
            "gdc",
            &Default::default(),
            BufferUsage::HW_GDC,
        )
        .unwrap();
    assert!(!filter.check_real_time_resource());
}

#[test]
fn test_stream_on_failure_keeps_stage_startable() {
    let mut device = MockGdc::new();
    let mut attempts = 0;
    device.expect_stream_on().returning(move || {
        attempts += 1;
        if attempts == 1 {
            Err(filterchain_rs::FilterError::Hardware("busy".into()))
        } else {
            Ok(())
        }
    });
    device.expect_stream_off().returning(|| Ok(()));
    device.expect_has_m2m_path().return_const(true);
    device.expect_dequeue().returning(|timeout| {
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(None)
    });

    let factory = StageFactory::new(EngineConfig::default()).with_gdc_device(Arc::new(device));
    let filter = factory
        .create(StageKind::Gdc, "gdc", &Default::default(), BufferUsage::HW_GDC)
        .unwrap();

    assert!(filter.start().is_err());
    assert_eq!(filter.state(), FilterState::Created);
    filter.start().unwrap();
    assert_eq!(filter.state(), FilterState::Started);
    filter.release().unwrap();
}
