//! OBD Request Dispatcher (C5)
//!
//! Classifies incoming CAN frames, parses single-frame ISO-TP, dispatches
//! mode handlers against a state snapshot, and frames the response.

use tracing::{debug, warn};

use crate::can::CanFrame;
use crate::codec::{self, Pid};
use crate::state::StateStore;

const FUNCTIONAL_REQUEST_ID: u16 = 0x7DF;
const PHYSICAL_REQUEST_RANGE: std::ops::RangeInclusive<u16> = 0x7E0..=0x7E7;
const FUNCTIONAL_RESPONSE_ID: u16 = 0x7E8;

const VIN: &str = "1HGCM82633A123456";
const CALIBRATION_ID: &str = "VECU0001PROD2026";

/// Decide whether a frame is addressed to this ECU at all (§4.5).
fn is_addressed_to_ecu(id: u16) -> bool {
    id == FUNCTIONAL_REQUEST_ID || PHYSICAL_REQUEST_RANGE.contains(&id)
}

fn response_id(request_id: u16) -> u16 {
    if request_id == FUNCTIONAL_REQUEST_ID {
        FUNCTIONAL_RESPONSE_ID
    } else {
        request_id + 8
    }
}

/// Build the final 8-byte frame: `[len, ...payload]`, truncated then
/// right-padded with zero (§4.5 "Response framing").
fn frame_response(payload: &[u8]) -> [u8; 8] {
    let mut full = Vec::with_capacity(payload.len() + 1);
    full.push(payload.len() as u8);
    full.extend_from_slice(payload);
    full.truncate(8);
    let mut out = [0u8; 8];
    out[..full.len()].copy_from_slice(&full);
    out
}

/// Supported-PID bitmask for a 32-entry window, rendered as its 4 response
/// bytes (big-endian u32).
fn supported_pid_bytes(base: u8) -> [u8; 4] {
    let supported: Vec<u8> = Pid::standard_pids().iter().map(|p| p.as_u8()).collect();
    let next_window_base = base.saturating_add(0x20);
    let next_has_support = supported
        .iter()
        .any(|&p| p > next_window_base && p <= next_window_base.saturating_add(32));
    let mask = codec::supported_pid_mask(base, &supported, next_has_support);
    mask.to_be_bytes()
}

fn encode_pid_value(pid: Pid, store: &StateStore) -> Option<Vec<u8>> {
    let snap = store.read_snapshot();
    Some(match pid {
        Pid::EngineLoad => codec::encode_percent_255(snap.engine.engine_load).to_vec(),
        Pid::CoolantTemp => codec::encode_temp(snap.engine.coolant_temp).to_vec(),
        Pid::ShortFuelTrimB1 => codec::encode_fuel_trim(snap.vehicle.short_fuel_trim_bank1).to_vec(),
        Pid::LongFuelTrimB1 => codec::encode_fuel_trim(snap.vehicle.long_fuel_trim_bank1).to_vec(),
        Pid::FuelPressure => codec::encode_fuel_pressure_kpa(snap.engine.fuel_pressure * 100.0).to_vec(),
        Pid::Rpm => codec::encode_rpm(snap.engine.rpm).to_vec(),
        Pid::Speed => codec::encode_speed(snap.vehicle.speed).to_vec(),
        Pid::TimingAdvance => codec::encode_timing_advance(snap.engine.timing_advance).to_vec(),
        Pid::IntakeAirTemp => codec::encode_temp(snap.engine.intake_air_temp).to_vec(),
        Pid::MafFlow => codec::encode_maf(snap.engine.maf_flow).to_vec(),
        Pid::ThrottlePosition => codec::encode_percent_255(snap.engine.throttle_position).to_vec(),
        Pid::O2Sensor1 => codec::encode_o2_voltage(snap.vehicle.o2_sensor1_voltage, snap.vehicle.short_fuel_trim_bank1).to_vec(),
        Pid::O2Sensor2 => codec::encode_o2_voltage(snap.vehicle.o2_sensor2_voltage, snap.vehicle.long_fuel_trim_bank1).to_vec(),
        Pid::RuntimeSinceStart => codec::encode_u16(snap.engine.runtime_since_start as u32).to_vec(),
        Pid::DistanceWithMil => codec::encode_u16(snap.vehicle.odometer as u32).to_vec(),
        Pid::FuelLevel => codec::encode_fuel_level(snap.vehicle.fuel_level).to_vec(),
        Pid::DistanceSinceClear => codec::encode_u16(snap.vehicle.odometer as u32).to_vec(),
        Pid::BaroPressure => codec::encode_baro_pressure(snap.vehicle.barometric_pressure).to_vec(),
        Pid::ModuleVoltage => codec::encode_module_voltage(snap.vehicle.battery_voltage).to_vec(),
        Pid::AmbientTemp => codec::encode_temp(snap.vehicle.ambient_temperature).to_vec(),
        Pid::CurrentGear => vec![snap.vehicle.gear],
        Pid::SpeedLimit => vec![snap.vehicle.speed_limit.min(255) as u8],
        Pid::Unknown(_) => return None,
    })
}

/// Mode 0x01: current data.
fn handle_mode_01(pid_byte: u8, store: &StateStore) -> Vec<u8> {
    if pid_byte == 0x00 || pid_byte == 0x20 || pid_byte == 0x40 {
        let mut payload = vec![0x41, pid_byte];
        payload.extend_from_slice(&supported_pid_bytes(pid_byte));
        return payload;
    }

    let pid = Pid::from_u8(pid_byte);
    match encode_pid_value(pid, store) {
        Some(bytes) => {
            let mut payload = vec![0x41, pid_byte];
            payload.extend_from_slice(&bytes);
            payload
        }
        None => vec![0x7F, 0x01, 0x12],
    }
}

/// Mode 0x03: read DTCs, up to 3 per single-frame response.
fn handle_mode_03(store: &StateStore) -> Vec<u8> {
    let confirmed = store.confirmed_dtcs();
    let mut payload = vec![0x43, confirmed.len().min(u8::MAX as usize) as u8];
    for dtc in confirmed.iter().take(3) {
        payload.extend_from_slice(&codec::encode_dtc(&dtc.code));
    }
    payload
}

/// Mode 0x04: clear codes, always acknowledged (§7).
fn handle_mode_04(store: &StateStore) -> Vec<u8> {
    store.clear_dtcs();
    vec![0x44]
}

/// Mode 0x09: vehicle info.
fn handle_mode_09(sub_function: u8) -> Vec<u8> {
    match sub_function {
        0x02 => {
            let mut payload = vec![0x49, 0x02, 0x01];
            payload.extend(VIN.bytes());
            payload
        }
        0x04 => {
            let mut payload = vec![0x49, 0x04];
            payload.extend(CALIBRATION_ID.bytes());
            payload
        }
        _ => vec![0x7F, 0x09, 0x12],
    }
}

/// Decode and dispatch one incoming frame; returns the outgoing payload
/// (pre-framing) if a reply should be sent.
fn dispatch_payload(data: &[u8], store: &StateStore) -> Option<Vec<u8>> {
    if data.len() < 3 {
        // Malformed: too short to carry PCI + service + PID (§4.5, §7.2).
        return None;
    }

    let pci = data[0];
    let length = (pci & 0x0F) as usize;
    if length == 0 || length > data.len() - 1 {
        return None;
    }

    let mode = data[1];
    let has_pid = length >= 2;
    match mode {
        0x01 if has_pid => Some(handle_mode_01(data[2], store)),
        0x03 => Some(handle_mode_03(store)),
        0x04 => Some(handle_mode_04(store)),
        0x09 if has_pid => Some(handle_mode_09(data[2])),
        0x01 | 0x09 => None,
        other => Some(vec![0x7F, other, 0x11]),
    }
}

/// Entry point invoked by the CAN receive loop for every frame read off
/// the bus. Returns the frame to transmit, if the request produced a
/// reply; statistics are updated on the store as a side effect.
pub fn handle_frame(frame: &CanFrame, store: &StateStore) -> Option<CanFrame> {
    if !is_addressed_to_ecu(frame.id) {
        return None;
    }

    store.stats.inc_requests_received();
    debug!(id = format!("{:#05x}", frame.id), data = ?frame.data, "frame received");

    let payload = match dispatch_payload(&frame.data, store) {
        Some(p) => p,
        None => {
            warn!(id = format!("{:#05x}", frame.id), "malformed or unparseable request, dropping");
            return None;
        }
    };

    let response_frame = CanFrame::new(response_id(frame.id), &frame_response(&payload));
    Some(response_frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStore;

    fn request(data: &[u8]) -> CanFrame {
        let mut full = [0u8; 8];
        full[..data.len()].copy_from_slice(data);
        CanFrame::new(FUNCTIONAL_REQUEST_ID, &full)
    }

    #[test]
    fn rpm_query_at_idle() {
        let store = StateStore::new("idle");
        store.apply(|engine, _| engine.rpm = 800.0);
        let req = request(&[0x02, 0x01, 0x0C, 0, 0, 0, 0, 0]);
        let resp = handle_frame(&req, &store).expect("reply expected");
        assert_eq!(resp.id, FUNCTIONAL_RESPONSE_ID);
        assert_eq!(resp.data, vec![0x04, 0x41, 0x0C, 0x0C, 0x80, 0, 0, 0]);
    }

    #[test]
    fn speed_query() {
        let store = StateStore::new("idle");
        store.apply(|_, vehicle| vehicle.speed = 65.0);
        let req = request(&[0x02, 0x01, 0x0D, 0, 0, 0, 0, 0]);
        let resp = handle_frame(&req, &store).unwrap();
        assert_eq!(resp.data[1], 0x41);
        assert_eq!(resp.data[2], 0x0D);
        assert_eq!(resp.data[3], 65);
        assert_eq!(&resp.data[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn coolant_query() {
        let store = StateStore::new("idle");
        store.apply(|engine, _| engine.coolant_temp = 90.0);
        let req = request(&[0x02, 0x01, 0x05, 0, 0, 0, 0, 0]);
        let resp = handle_frame(&req, &store).unwrap();
        assert_eq!(resp.data[3], 130);
    }

    #[test]
    fn unsupported_pid() {
        let store = StateStore::new("idle");
        let req = request(&[0x02, 0x01, 0xFF, 0, 0, 0, 0, 0]);
        let resp = handle_frame(&req, &store).unwrap();
        assert_eq!(resp.data, vec![0x03, 0x7F, 0x01, 0x12, 0, 0, 0, 0]);
    }

    #[test]
    fn clear_codes() {
        let store = StateStore::new("idle");
        store.inject_dtc("P0301", "Cylinder 1 Misfire Detected", true, chrono::Utc::now());
        assert!(store.read_snapshot().vehicle.mil_status);

        let req = request(&[0x01, 0x04, 0, 0, 0, 0, 0, 0]);
        let resp = handle_frame(&req, &store).unwrap();
        assert_eq!(resp.data[1], 0x44);
        assert!(!store.read_snapshot().vehicle.mil_status);
        assert_eq!(store.active_dtc_count(), 0);
    }

    #[test]
    fn vin_query() {
        let store = StateStore::new("idle");
        let req = request(&[0x02, 0x09, 0x02, 0, 0, 0, 0, 0]);
        let resp = handle_frame(&req, &store).unwrap();
        assert_eq!(&resp.data[1..4], &[0x49, 0x02, 0x01]);
        assert_eq!(&resp.data[4..8], VIN.as_bytes()[..4].to_vec().as_slice());
    }

    #[test]
    fn physical_request_gets_offset_response_id() {
        let store = StateStore::new("idle");
        let mut full = [0u8; 8];
        full[..3].copy_from_slice(&[0x02, 0x01, 0x0D]);
        let req = CanFrame::new(0x7E3, &full);
        let resp = handle_frame(&req, &store).unwrap();
        assert_eq!(resp.id, 0x7EB);
    }

    #[test]
    fn frames_not_addressed_to_ecu_are_ignored() {
        let store = StateStore::new("idle");
        let req = CanFrame::new(0x123, &[0x02, 0x01, 0x0D, 0, 0, 0, 0, 0]);
        assert!(handle_frame(&req, &store).is_none());
    }

    #[test]
    fn too_short_frame_is_dropped() {
        let store = StateStore::new("idle");
        let req = CanFrame::new(FUNCTIONAL_REQUEST_ID, &[0x01, 0x01]);
        assert!(handle_frame(&req, &store).is_none());
    }

    #[test]
    fn supported_pid_mask_reports_0x0c() {
        let store = StateStore::new("idle");
        let req = request(&[0x02, 0x01, 0x00, 0, 0, 0, 0, 0]);
        let resp = handle_frame(&req, &store).unwrap();
        assert_eq!(resp.data[1], 0x41);
        assert_eq!(resp.data[2], 0x00);
        let mask = u32::from_be_bytes([resp.data[3], resp.data[4], resp.data[5], resp.data[6]]);
        // PID 0x0C is bit 31-(0x0C-0-1) = 31-11 = 20
        assert_ne!(mask & (1 << 20), 0);
    }
}
