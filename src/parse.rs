//! Binary decoders for heart-rate and PPG notification payloads.
//!
//! All public functions in this module are pure: no I/O, no shared state, and
//! identical input always yields identical output.  They are safe to call from
//! any async or sync context.
//!
//! | Function | Characteristic | Format |
//! |---|---|---|
//! | [`decode_heart_rate`] | Heart Rate Measurement (0x2A37) | flags + u8/u16 LE HR + optional fields |
//! | [`decode_ppg`] | PMD data | 10-byte header + 4 × i24 LE per frame |
//! | [`decode`] | either | dispatches on [`CharacteristicKind`] |

use chrono::{DateTime, Duration, Utc};

use crate::error::{Error, Result};
use crate::protocol::{
    PMD_FRAME_TYPE_RAW, PMD_HEADER_LEN, PMD_MEASUREMENT_PPG, PPG_CHANNELS, PPG_FRAME_LEN,
    PPG_READING_WIDTH,
};
use crate::types::{CharacteristicKind, HeartRateSample, PpgSample, Sample};

/// Decode one notification of `kind` received at `arrival`.
///
/// A heart-rate notification always yields exactly one sample; a PPG
/// notification yields one sample per frame it carries.  `ppg_interval` is the
/// sampling period used to spread PPG frames in time (see [`decode_ppg`]).
pub fn decode(
    kind: CharacteristicKind,
    data: &[u8],
    arrival: DateTime<Utc>,
    ppg_interval: Option<Duration>,
) -> Result<Vec<Sample>> {
    match kind {
        CharacteristicKind::HeartRate => {
            decode_heart_rate(data, arrival).map(|s| vec![Sample::HeartRate(s)])
        }
        CharacteristicKind::Ppg => Ok(decode_ppg(data, arrival, ppg_interval)?
            .into_iter()
            .map(Sample::Ppg)
            .collect()),
    }
}

// ── Heart rate ───────────────────────────────────────────────────────────────

/// Heart Rate Measurement flag bits.
mod hr_flag {
    /// Heart-rate value is u16 LE instead of u8.
    pub const VALUE_U16: u8 = 1 << 0;
    /// Sensor contact status (bit 2 is meaningful only when this is set).
    pub const CONTACT_SUPPORTED: u8 = 1 << 1;
    pub const CONTACT_DETECTED: u8 = 1 << 2;
    /// Energy expended field (u16 LE) present.
    pub const ENERGY_EXPENDED: u8 = 1 << 3;
    /// One or more RR intervals (u16 LE, 1/1024 s) follow.
    pub const RR_INTERVALS: u8 = 1 << 4;
}

/// Convert a raw RR interval in 1/1024 s units to whole milliseconds, rounding up.
pub fn rr_to_millis(raw: u16) -> u16 {
    ((raw as u32 * 1000).div_ceil(1024)) as u16
}

/// Decode a Heart Rate Measurement notification.
///
/// Layout:
/// ```text
/// byte 0      : flags
/// byte 1[..2] : heart rate, u8 or u16 LE (flags bit 0)
/// next 2      : energy expended, u16 LE (flags bit 3)
/// rest        : RR intervals, u16 LE each (flags bit 4)
/// ```
///
/// Fails with [`Error::MalformedPayload`] when the payload is shorter than its
/// flags require, or when the RR section ends in half a value.  When bit 4 is
/// clear, bytes after the last declared field are treated as padding and
/// ignored.
pub fn decode_heart_rate(data: &[u8], timestamp: DateTime<Utc>) -> Result<HeartRateSample> {
    let (&flags, body) = data
        .split_first()
        .ok_or_else(|| Error::MalformedPayload("empty heart-rate payload".into()))?;

    let value_width = if flags & hr_flag::VALUE_U16 != 0 { 2 } else { 1 };
    let energy_width = if flags & hr_flag::ENERGY_EXPENDED != 0 { 2 } else { 0 };
    let required = value_width + energy_width;
    if body.len() < required {
        return Err(Error::MalformedPayload(format!(
            "heart-rate flags 0x{flags:02x} need {} bytes, got {}",
            required + 1,
            data.len()
        )));
    }

    let bpm = if value_width == 2 {
        u16::from_le_bytes([body[0], body[1]])
    } else {
        body[0] as u16
    };

    let sensor_contact = (flags & hr_flag::CONTACT_SUPPORTED != 0)
        .then_some(flags & hr_flag::CONTACT_DETECTED != 0);

    let energy_expended = (energy_width != 0)
        .then(|| u16::from_le_bytes([body[value_width], body[value_width + 1]]));

    let rest = &body[required..];
    let rr_intervals = if flags & hr_flag::RR_INTERVALS != 0 {
        if rest.len() % 2 != 0 {
            return Err(Error::MalformedPayload(format!(
                "RR section has odd length {}",
                rest.len()
            )));
        }
        rest.chunks_exact(2)
            .map(|c| rr_to_millis(u16::from_le_bytes([c[0], c[1]])))
            .collect()
    } else {
        Vec::new()
    };

    Ok(HeartRateSample {
        timestamp,
        bpm,
        rr_intervals,
        sensor_contact,
        energy_expended,
    })
}

// ── PPG ──────────────────────────────────────────────────────────────────────

/// Sign-extend a 24-bit little-endian integer.
fn read_i24_le(b: &[u8]) -> i32 {
    let raw = (b[0] as u32) | ((b[1] as u32) << 8) | ((b[2] as u32) << 16);
    ((raw << 8) as i32) >> 8
}

/// Decode a PMD data notification carrying raw PPG frames.
///
/// Layout:
/// ```text
/// byte 0     : measurement type (0x01 = PPG)
/// bytes 1-8  : sensor timestamp, u64 LE ns (ignored)
/// byte 9     : frame type (0x00 = raw)
/// bytes 10.. : frames of 4 × i24 LE (ppg0, ppg1, ppg2, ambient)
/// ```
///
/// The sensor clock is not synchronised with the host, so frames are stamped
/// from `arrival`.  With an `interval`, the last frame gets `arrival` and each
/// earlier frame one interval less; without one, every frame repeats
/// `arrival`.  Either way this approximates the true sampling instants.
pub fn decode_ppg(
    data: &[u8],
    arrival: DateTime<Utc>,
    interval: Option<Duration>,
) -> Result<Vec<PpgSample>> {
    if data.len() < PMD_HEADER_LEN {
        return Err(Error::MalformedPayload(format!(
            "PMD frame shorter than its {PMD_HEADER_LEN}-byte header ({} bytes)",
            data.len()
        )));
    }
    if data[0] != PMD_MEASUREMENT_PPG {
        return Err(Error::MalformedPayload(format!(
            "unexpected PMD measurement type 0x{:02x}",
            data[0]
        )));
    }
    let frame_type = data[PMD_HEADER_LEN - 1];
    if frame_type != PMD_FRAME_TYPE_RAW {
        return Err(Error::MalformedPayload(format!(
            "unsupported PPG frame type 0x{frame_type:02x}"
        )));
    }

    let body = &data[PMD_HEADER_LEN..];
    if body.len() % PPG_FRAME_LEN != 0 {
        return Err(Error::MalformedPayload(format!(
            "PPG body of {} bytes is not a whole number of {PPG_FRAME_LEN}-byte frames",
            body.len()
        )));
    }

    let frames = body.len() / PPG_FRAME_LEN;
    let step = interval.unwrap_or_else(Duration::zero);
    Ok(body
        .chunks_exact(PPG_FRAME_LEN)
        .enumerate()
        .map(|(i, frame)| {
            let back = (frames - 1 - i) as i32;
            PpgSample {
                timestamp: arrival - step * back,
                channel_readings: frame
                    .chunks_exact(PPG_READING_WIDTH)
                    .take(PPG_CHANNELS)
                    .map(read_i24_le)
                    .collect(),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn ppg_payload(frames: &[[i32; 4]]) -> Vec<u8> {
        let mut data = vec![PMD_MEASUREMENT_PPG];
        data.extend_from_slice(&123_456_789u64.to_le_bytes());
        data.push(PMD_FRAME_TYPE_RAW);
        for frame in frames {
            for &v in frame {
                data.extend_from_slice(&v.to_le_bytes()[..3]);
            }
        }
        data
    }

    #[test]
    fn heart_rate_u8_without_optional_fields() {
        let s = decode_heart_rate(&[0x00, 72], t0()).unwrap();
        assert_eq!(s.bpm, 72);
        assert!(s.rr_intervals.is_empty());
        assert_eq!(s.sensor_contact, None);
        assert_eq!(s.energy_expended, None);
        assert_eq!(s.timestamp, t0());
    }

    #[test]
    fn heart_rate_u16_value() {
        let s = decode_heart_rate(&[0x01, 0x2c, 0x01], t0()).unwrap();
        assert_eq!(s.bpm, 300);
    }

    #[test]
    fn heart_rate_with_contact_energy_and_rr() {
        // contact supported + detected, energy, RR: 1024 → 1000 ms, 800 → 782 ms
        let data = [0x1e, 60, 0x10, 0x00, 0x00, 0x04, 0x20, 0x03];
        let s = decode_heart_rate(&data, t0()).unwrap();
        assert_eq!(s.bpm, 60);
        assert_eq!(s.sensor_contact, Some(true));
        assert_eq!(s.energy_expended, Some(16));
        assert_eq!(s.rr_intervals, vec![1000, 782]);
    }

    #[test]
    fn contact_bit_ignored_when_unsupported() {
        let s = decode_heart_rate(&[0x04, 80], t0()).unwrap();
        assert_eq!(s.sensor_contact, None);
    }

    #[test]
    fn rr_flag_with_no_intervals_is_empty() {
        let s = decode_heart_rate(&[0x10, 65], t0()).unwrap();
        assert!(s.rr_intervals.is_empty());
    }

    #[test]
    fn trailing_padding_is_ignored_without_rr_flag() {
        let s = decode_heart_rate(&[0x00, 70, 0xff, 0xff, 0xff], t0()).unwrap();
        assert_eq!(s.bpm, 70);
        assert!(s.rr_intervals.is_empty());
    }

    #[test]
    fn short_payloads_are_malformed() {
        for data in [
            &[][..],
            &[0x00][..],
            &[0x01, 0x50][..],
            &[0x08, 70, 0x01][..],
            &[0x09, 70, 0x00, 0x01][..],
        ] {
            assert!(
                matches!(decode_heart_rate(data, t0()), Err(Error::MalformedPayload(_))),
                "{data:02x?} should be rejected"
            );
        }
    }

    #[test]
    fn odd_rr_section_is_malformed() {
        let err = decode_heart_rate(&[0x10, 70, 0x00, 0x04, 0x20], t0()).unwrap_err();
        assert!(matches!(err, Error::MalformedPayload(_)));
    }

    #[test]
    fn heart_rate_decode_is_deterministic() {
        let data = [0x10, 58, 0x00, 0x04, 0x10, 0x04];
        let first = decode(CharacteristicKind::HeartRate, &data, t0(), None).unwrap();
        for _ in 0..10 {
            assert_eq!(
                decode(CharacteristicKind::HeartRate, &data, t0(), None).unwrap(),
                first
            );
        }
    }

    #[test]
    fn rr_conversion_rounds_up() {
        assert_eq!(rr_to_millis(0), 0);
        assert_eq!(rr_to_millis(1), 1);
        assert_eq!(rr_to_millis(1024), 1000);
        assert_eq!(rr_to_millis(u16::MAX), 64_000);
    }

    #[test]
    fn ppg_frames_expand_to_one_sample_each() {
        let frames = [
            [1, -1, 8_388_607, -8_388_608],
            [100, 200, 300, 400],
            [-5, 0, 5, 0],
        ];
        let samples = decode_ppg(&ppg_payload(&frames), t0(), None).unwrap();
        assert_eq!(samples.len(), 3);
        for (sample, frame) in samples.iter().zip(frames.iter()) {
            assert_eq!(sample.channel_readings, frame.to_vec());
            assert_eq!(sample.timestamp, t0());
            assert!(sample
                .channel_readings
                .iter()
                .all(|&v| (-8_388_608..=8_388_607).contains(&v)));
        }
    }

    #[test]
    fn ppg_frames_are_spread_backwards_by_interval() {
        let frames = [[0; 4], [0; 4], [0; 4]];
        let step = Duration::milliseconds(10);
        let samples = decode_ppg(&ppg_payload(&frames), t0(), Some(step)).unwrap();
        let stamps: Vec<_> = samples.iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![t0() - step * 2, t0() - step, t0()]);
    }

    #[test]
    fn ppg_empty_body_yields_nothing() {
        assert!(decode_ppg(&ppg_payload(&[]), t0(), None).unwrap().is_empty());
    }

    #[test]
    fn ppg_rejects_bad_frames() {
        let mut partial = ppg_payload(&[[1, 2, 3, 4]]);
        partial.pop();
        let mut compressed = ppg_payload(&[[1, 2, 3, 4]]);
        compressed[9] = 0x80;
        let mut ecg = ppg_payload(&[[1, 2, 3, 4]]);
        ecg[0] = 0x00;

        for data in [partial, compressed, ecg, vec![0x01, 0x00, 0x00]] {
            assert!(matches!(
                decode_ppg(&data, t0(), None),
                Err(Error::MalformedPayload(_))
            ));
        }
    }
}
