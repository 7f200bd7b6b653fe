use common::beamforming::{BeamformingEngine, PhaseProfile};
use common::geometry::{ArrayGeometry, PhaseQuantizer};
use common::protocol::{encode_command, read_codes, CommandFrame, FrameLayout, PAYLOAD_OFFSET};

fn phi_diff(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

#[test]
fn quantized_steering_profile_points_back_at_target() {
    let geometry = ArrayGeometry::new(4, 4, 5.8e9).unwrap();
    let engine = BeamformingEngine::new(geometry, 5.0);
    let quantizer = PhaseQuantizer::new(4).unwrap();
    assert_eq!(quantizer.levels(), 16);
    assert_eq!(quantizer.step_deg(), 22.5);

    let codes: Vec<u8> = engine.desired_phase(30.0, 45.0).quantize(&quantizer);
    assert!(codes.iter().all(|&c| c < 16));

    let wire: Vec<i8> = codes.iter().map(|&c| c as i8).collect();
    let profile = PhaseProfile::from_codes(engine.geometry(), &quantizer, &wire);
    let found = engine.estimate_direction(&profile);

    assert!((found.theta_deg - 30.0).abs() <= 5.0, "{found:?}");
    assert!(phi_diff(found.phi_deg, 45.0) <= 5.0, "{found:?}");
}

#[test]
fn steering_codes_survive_the_wire() {
    let geometry = ArrayGeometry::new(4, 4, 5.8e9).unwrap();
    let engine = BeamformingEngine::new(geometry, 5.0);
    let quantizer = PhaseQuantizer::new(4).unwrap();
    let codes = engine.desired_phase(20.0, 120.0).quantize(&quantizer);

    let datagram = encode_command(&CommandFrame::SetPhase(codes.clone())).unwrap();
    let echoed = read_codes(&datagram, PAYLOAD_OFFSET, 16);
    let as_u8: Vec<u8> = echoed.iter().map(|&c| c as u8).collect();
    assert_eq!(as_u8, codes);

    // the telemetry frame carries the same codes back in a peripheral block
    let layout = FrameLayout::CANONICAL;
    let mut frame = layout.encode(&Default::default());
    let at = layout.peripheral_offset(2) + PAYLOAD_OFFSET;
    frame[at..at + 16].copy_from_slice(&as_u8);
    let decoded = layout.decode(&frame).unwrap();
    assert_eq!(decoded.peripherals[2].phase_codes, echoed);
}
