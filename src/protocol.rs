//! GATT UUIDs, sampling constants, and PMD wire-format helpers for Polar
//! optical heart-rate sensors.
//!
//! Standard Bluetooth SIG characteristics use the base UUID
//! `0000XXXX-0000-1000-8000-00805f9b34fb`; the Polar Measurement Data (PMD)
//! service lives in the vendor namespace `fb005cXX-02e7-f387-1cad-8acd2d8df0c8`.

use uuid::Uuid;

// ── Standard services and characteristics ────────────────────────────────────

/// Heart Rate service (0x180D), advertised by every supported sensor.
pub const HEART_RATE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

/// Heart Rate Measurement characteristic (0x2A37).
///
/// Notifies once per second with a flags byte, the heart-rate value, and
/// optional energy-expended and RR-interval fields.  Decoded by
/// [`crate::parse::decode_heart_rate`].
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// Battery Level characteristic (0x2A19): a single byte, 0–100 %.
pub const BATTERY_LEVEL_UUID: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

// ── Polar Measurement Data (PMD) ─────────────────────────────────────────────

/// PMD service carrying raw sensor streams (PPG, ACC, …).
pub const PMD_SERVICE_UUID: Uuid = Uuid::from_u128(0xfb005c80_02e7_f387_1cad_8acd2d8df0c8);

/// PMD control point.
///
/// The host writes request frames (see [`encode_get_settings`] and
/// [`encode_start_stream`]); the sensor answers with an indication on the same
/// characteristic.
pub const PMD_CONTROL_UUID: Uuid = Uuid::from_u128(0xfb005c81_02e7_f387_1cad_8acd2d8df0c8);

/// PMD data characteristic.  Every notification is one measurement frame
/// batch, decoded by [`crate::parse::decode_ppg`].
pub const PMD_DATA_UUID: Uuid = Uuid::from_u128(0xfb005c82_02e7_f387_1cad_8acd2d8df0c8);

/// Polar "electro" service found on OH1 firmware.  Not used for recording;
/// exposed so `read` can target its characteristics by name.
pub const ELECTRO_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000feee_0000_1000_8000_00805f9b34fb);

/// Characteristics of [`ELECTRO_SERVICE_UUID`].
pub const ELECTRO_CHARACTERISTICS: [Uuid; 3] = [
    Uuid::from_u128(0xfb005c51_02e7_f387_1cad_8acd2d8df0c8),
    Uuid::from_u128(0xfb005c52_02e7_f387_1cad_8acd2d8df0c8),
    Uuid::from_u128(0xfb005c53_02e7_f387_1cad_8acd2d8df0c8),
];

/// Human-readable name of a service this crate knows about.
pub fn service_name(uuid: Uuid) -> Option<&'static str> {
    match uuid {
        HEART_RATE_SERVICE_UUID => Some("Heart Rate"),
        PMD_SERVICE_UUID => Some("Polar Measurement Data"),
        ELECTRO_SERVICE_UUID => Some("Polar Electro"),
        u if ELECTRO_CHARACTERISTICS.contains(&u) => Some("Polar Electro characteristic"),
        _ => None,
    }
}

// ── PMD framing ──────────────────────────────────────────────────────────────

/// PMD control opcodes.
pub mod pmd_op {
    pub const GET_SETTINGS: u8 = 0x01;
    pub const START_STREAM: u8 = 0x02;
    pub const STOP_STREAM: u8 = 0x03;
}

/// PMD measurement type byte for optical (PPG) data.
pub const PMD_MEASUREMENT_PPG: u8 = 0x01;

/// PMD frame type for uncompressed PPG frames.  Delta-compressed frames set
/// the top bit and are not supported.
pub const PMD_FRAME_TYPE_RAW: u8 = 0x00;

/// Length of the PMD data header: measurement type, u64 sensor timestamp,
/// frame type.
pub const PMD_HEADER_LEN: usize = 10;

/// Optical channels per raw PPG frame: three photodiodes plus ambient.
pub const PPG_CHANNELS: usize = 4;

/// Width in bytes of one signed little-endian channel reading.
pub const PPG_READING_WIDTH: usize = 3;

/// Bytes per raw PPG frame.
pub const PPG_FRAME_LEN: usize = PPG_CHANNELS * PPG_READING_WIDTH;

/// Default OH1 optical sample rate in Hz.
pub const PPG_FREQUENCY: u16 = 135;

/// Default OH1 optical ADC resolution in bits.
pub const PPG_RESOLUTION: u16 = 22;

/// Encode a PMD "get measurement settings" request.
///
/// ```
/// # use polar_rec::protocol::{encode_get_settings, PMD_MEASUREMENT_PPG};
/// assert_eq!(encode_get_settings(PMD_MEASUREMENT_PPG), [0x01, 0x01]);
/// ```
pub fn encode_get_settings(measurement: u8) -> [u8; 2] {
    [pmd_op::GET_SETTINGS, measurement]
}

/// Encode a PMD "start stream" request with a sample rate and resolution.
///
/// Each setting is `type, count = 1, u16 LE value`:
/// ```text
/// [0x02, measurement, 0x00, 0x01, rate_lo, rate_hi, 0x01, 0x01, res_lo, res_hi]
/// ```
pub fn encode_start_stream(measurement: u8, sample_rate: u16, resolution: u16) -> Vec<u8> {
    let mut frame = vec![pmd_op::START_STREAM, measurement];
    frame.extend_from_slice(&[0x00, 0x01]);
    frame.extend_from_slice(&sample_rate.to_le_bytes());
    frame.extend_from_slice(&[0x01, 0x01]);
    frame.extend_from_slice(&resolution.to_le_bytes());
    frame
}

/// Encode a PMD "stop stream" request.
pub fn encode_stop_stream(measurement: u8) -> [u8; 2] {
    [pmd_op::STOP_STREAM, measurement]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_stream_frame_layout() {
        let frame = encode_start_stream(PMD_MEASUREMENT_PPG, PPG_FREQUENCY, PPG_RESOLUTION);
        assert_eq!(
            frame,
            vec![0x02, 0x01, 0x00, 0x01, 0x87, 0x00, 0x01, 0x01, 0x16, 0x00]
        );
    }

    #[test]
    fn known_services_have_names() {
        assert_eq!(service_name(PMD_SERVICE_UUID), Some("Polar Measurement Data"));
        assert_eq!(service_name(BATTERY_LEVEL_UUID), None);
    }

    #[test]
    fn stop_stream_frame_layout() {
        assert_eq!(encode_stop_stream(PMD_MEASUREMENT_PPG), [0x03, 0x01]);
    }
}
