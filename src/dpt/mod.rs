use serde_json;
use thiserror::Error;

/// Custom error types for DPT encoding and decoding
#[derive(Error, Debug, PartialEq)]
pub enum DptError {
    #[error("Encoding failed: {0}")]
    EncodingFailed(String),
    #[error("Decoding failed: {0}")]
    DecodingFailed(String),
}

/// DPT 1.xxx - boolean, 1 byte
pub mod dpt1 {
    use super::DptError;

    pub fn encode(value: bool) -> Vec<u8> {
        return vec![if value { 0x01 } else { 0x00 }];
    }

    pub fn decode(data: &[u8]) -> Result<bool, DptError> {
        if data.is_empty() {
            return Err(DptError::DecodingFailed("DPT 1 payload is empty".to_string()));
        }
        return Ok(data[0] & 0x01 != 0);
    }
}

/// DPT 3.xxx - 3-bit controlled (dimming / blind stepping), 1 byte
pub mod dpt3 {
    use super::DptError;

    /// Bit 3 carries the direction, bits 0-2 the step code (0 = stop).
    pub fn encode(direction: bool, steps: u8) -> Result<Vec<u8>, DptError> {
        if steps > 7 {
            return Err(DptError::EncodingFailed(format!("DPT 3 step code {} > 7", steps)));
        }
        return Ok(vec![(if direction { 0x08 } else { 0x00 }) | steps]);
    }

    pub fn decode(data: &[u8]) -> Result<(bool, u8), DptError> {
        if data.is_empty() {
            return Err(DptError::DecodingFailed("DPT 3 payload is empty".to_string()));
        }
        return Ok((data[0] & 0x08 != 0, data[0] & 0x07));
    }
}

/// DPT 5.xxx - 8-bit unsigned scaled values, 1 byte
pub mod dpt5 {
    use super::DptError;

    /// DPT 5.001: percentage 0-100%. Out-of-range input is clamped.
    pub fn encode_percent(pct: f64) -> Vec<u8> {
        let pct = pct.clamp(0.0, 100.0);
        return vec![(pct * 255.0 / 100.0).round() as u8];
    }

    pub fn decode_percent(data: &[u8]) -> Result<f64, DptError> {
        if data.is_empty() {
            return Err(DptError::DecodingFailed("DPT 5.001 payload is empty".to_string()));
        }
        return Ok(data[0] as f64 * 100.0 / 255.0);
    }

    /// DPT 5.003: angle 0-360 degrees. Out-of-range input is clamped.
    pub fn encode_angle(deg: f64) -> Vec<u8> {
        let deg = deg.clamp(0.0, 360.0);
        return vec![(deg * 255.0 / 360.0).round() as u8];
    }

    pub fn decode_angle(data: &[u8]) -> Result<f64, DptError> {
        if data.is_empty() {
            return Err(DptError::DecodingFailed("DPT 5.003 payload is empty".to_string()));
        }
        return Ok(data[0] as f64 * 360.0 / 255.0);
    }

    /// DPT 5.004: raw 0-255, identity.
    pub fn encode_raw(value: u8) -> Vec<u8> {
        return vec![value];
    }

    pub fn decode_raw(data: &[u8]) -> Result<u8, DptError> {
        if data.is_empty() {
            return Err(DptError::DecodingFailed("DPT 5.004 payload is empty".to_string()));
        }
        return Ok(data[0]);
    }
}

/// DPT 9.xxx - KNX 16-bit float, 2 bytes
///
/// Format MEEEEMMM MMMMMMMM: value = (0.01 * M) * 2^E with an 11-bit
/// sign-magnitude mantissa whose sign lives in bit 15. 0x7FFF is the
/// "invalid data" sentinel sensors send on error.
pub mod dpt9 {
    use super::DptError;

    pub const INVALID: u16 = 0x7FFF;
    pub const MAX_VALUE: f64 = 670760.96;

    pub fn encode(value: f64) -> Result<Vec<u8>, DptError> {
        if !value.is_finite() || value.abs() > MAX_VALUE {
            return Err(DptError::EncodingFailed(format!("DPT 9 value {} out of range", value)));
        }

        let sign: u16 = if value < 0.0 { 0x8000 } else { 0x0000 };
        let mut magnitude = value.abs() * 100.0;
        let mut exponent: u16 = 0;

        while magnitude.round() > 2047.0 {
            magnitude /= 2.0;
            exponent += 1;
            if exponent > 15 {
                return Err(DptError::EncodingFailed(format!("DPT 9 value {} out of range", value)));
            }
        }

        let raw = sign | (exponent << 11) | magnitude.round() as u16;
        if raw == INVALID {
            /* The topmost encodable magnitude collides with the sentinel */
            return Err(DptError::EncodingFailed(format!("DPT 9 value {} encodes to the invalid-data sentinel", value)));
        }

        return Ok(raw.to_be_bytes().to_vec());
    }

    pub fn decode(data: &[u8]) -> Result<f64, DptError> {
        if data.len() != 2 {
            return Err(DptError::DecodingFailed(format!("DPT 9 needs 2 bytes, got {}", data.len())));
        }

        let raw = u16::from_be_bytes([data[0], data[1]]);
        if raw == INVALID {
            return Err(DptError::DecodingFailed("DPT 9 invalid-data sentinel 0x7FFF".to_string()));
        }

        let mantissa = (raw & 0x07FF) as f64;
        let exponent = ((raw >> 11) & 0x0F) as i32;
        let value = mantissa * 2f64.powi(exponent) / 100.0;

        return Ok(if raw & 0x8000 != 0 { -value } else { value });
    }
}

/// DPT 17.001 - scene number, 1 byte
pub mod dpt17 {
    use super::DptError;

    pub fn encode(scene: u8) -> Result<Vec<u8>, DptError> {
        if scene > 63 {
            return Err(DptError::EncodingFailed(format!("Scene number {} > 63", scene)));
        }
        return Ok(vec![scene & 0x3F]);
    }

    pub fn decode(data: &[u8]) -> Result<u8, DptError> {
        if data.is_empty() {
            return Err(DptError::DecodingFailed("DPT 17 payload is empty".to_string()));
        }
        return Ok(data[0] & 0x3F);
    }
}

/// DPT 18.001 - scene control (learn flag + scene number), 1 byte
pub mod dpt18 {
    use super::DptError;

    pub fn encode(learn: bool, scene: u8) -> Result<Vec<u8>, DptError> {
        if scene > 63 {
            return Err(DptError::EncodingFailed(format!("Scene number {} > 63", scene)));
        }
        return Ok(vec![(if learn { 0x80 } else { 0x00 }) | (scene & 0x3F)]);
    }

    pub fn decode(data: &[u8]) -> Result<(bool, u8), DptError> {
        if data.is_empty() {
            return Err(DptError::DecodingFailed("DPT 18 payload is empty".to_string()));
        }
        return Ok((data[0] & 0x80 != 0, data[0] & 0x3F));
    }
}

/// DPT 232.600 - RGB colour, 3 bytes
pub mod dpt232 {
    use super::DptError;

    pub fn encode(r: u8, g: u8, b: u8) -> Vec<u8> {
        return vec![r, g, b];
    }

    pub fn decode(data: &[u8]) -> Result<(u8, u8, u8), DptError> {
        if data.len() != 3 {
            return Err(DptError::DecodingFailed(format!("DPT 232 needs 3 bytes, got {}", data.len())));
        }
        return Ok((data[0], data[1], data[2]));
    }
}

/// Decode a telegram payload into the JSON value published on the state
/// topic, dispatching on the DPT major of the receiving binding. Types
/// without a structured mapping pass through as raw byte arrays.
pub fn decode_value(dpt: &str, data: &[u8]) -> Result<serde_json::Value, DptError> {
    if dpt.starts_with("1.") {
        return Ok(serde_json::Value::from(dpt1::decode(data)?));
    }

    if dpt.starts_with("5.") {
        let v = match dpt {
            "5.003" => dpt5::decode_angle(data)?,
            "5.004" => dpt5::decode_raw(data)? as f64,
            /* 5.001 and unknown 5.xxx minors read as percentages */
            _ => dpt5::decode_percent(data)?,
        };
        return Ok(serde_json::Value::from(v.round() as u64));
    }

    if dpt.starts_with("9.") {
        return Ok(serde_json::Value::from(dpt9::decode(data)?));
    }

    return Ok(serde_json::Value::from(data.to_vec()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dpt1() {
        assert_eq!(dpt1::encode(true), vec![0x01]);
        assert_eq!(dpt1::encode(false), vec![0x00]);
        assert_eq!(dpt1::decode(&[0x01]).unwrap(), true);
        assert_eq!(dpt1::decode(&[0x00]).unwrap(), false);
        /* only the low bit counts */
        assert_eq!(dpt1::decode(&[0xFE]).unwrap(), false);
        assert!(dpt1::decode(&[]).is_err());
    }

    #[test]
    fn test_dpt3() {
        assert_eq!(dpt3::encode(true, 4).unwrap(), vec![0x0C]);
        assert_eq!(dpt3::encode(false, 0).unwrap(), vec![0x00]);
        assert!(dpt3::encode(true, 8).is_err());
        assert_eq!(dpt3::decode(&[0x0C]).unwrap(), (true, 4));
        assert_eq!(dpt3::decode(&[0x01]).unwrap(), (false, 1));
    }

    #[test]
    fn test_dpt5_percent_vectors() {
        assert_eq!(dpt5::encode_percent(50.0), vec![0x80]);
        assert_eq!(dpt5::encode_percent(75.0), vec![0xBF]);
        assert_eq!(dpt5::encode_percent(0.0), vec![0x00]);
        assert_eq!(dpt5::encode_percent(100.0), vec![0xFF]);
        /* clamped */
        assert_eq!(dpt5::encode_percent(150.0), vec![0xFF]);
        assert_eq!(dpt5::encode_percent(-5.0), vec![0x00]);
    }

    #[test]
    fn test_dpt5_roundtrip_within_one_lsb() {
        for pct in 0..=100 {
            let enc = dpt5::encode_percent(pct as f64);
            let dec = dpt5::decode_percent(&enc).unwrap();
            assert!((dec - pct as f64).abs() <= 100.0 / 255.0, "pct {} decoded to {}", pct, dec);
        }
        let enc = dpt5::encode_angle(180.0);
        let dec = dpt5::decode_angle(&enc).unwrap();
        assert!((dec - 180.0).abs() <= 360.0 / 255.0);
        assert_eq!(dpt5::decode_raw(&dpt5::encode_raw(0xAB)).unwrap(), 0xAB);
    }

    #[test]
    fn test_dpt9_vectors() {
        assert_eq!(dpt9::encode(21.0).unwrap(), vec![0x0C, 0x1A]);
        assert_eq!(dpt9::encode(21.5).unwrap(), vec![0x0C, 0x33]);
        assert_eq!(dpt9::decode(&[0x0C, 0x1A]).unwrap(), 21.0);
        assert_eq!(dpt9::decode(&[0x0C, 0x33]).unwrap(), 21.5);
        assert_eq!(dpt9::decode(&[0x00, 0x00]).unwrap(), 0.0);
    }

    #[test]
    fn test_dpt9_invalid_sentinel() {
        let result = dpt9::decode(&[0x7F, 0xFF]);
        assert!(result.is_err());
    }

    #[test]
    fn test_dpt9_negative() {
        /* -21.0: sign bit set, same magnitude encoding as +21.0 */
        let enc = dpt9::encode(-21.0).unwrap();
        assert_eq!(enc, vec![0x8C, 0x1A]);
        assert_eq!(dpt9::decode(&enc).unwrap(), -21.0);
    }

    #[test]
    fn test_dpt9_range() {
        assert!(dpt9::encode(700000.0).is_err());
        assert!(dpt9::encode(-700000.0).is_err());
        assert!(dpt9::encode(f64::NAN).is_err());
        /* the maximum magnitude collides with the sentinel */
        assert!(dpt9::encode(670760.96).is_err());
    }

    #[test]
    fn test_dpt9_roundtrip_within_one_percent() {
        for v in [0.0, 0.01, -0.5, 1.0, 21.3, -40.0, 100.25, 3276.7, -5000.0, 670433.28] {
            let enc = dpt9::encode(v).unwrap();
            let dec = dpt9::decode(&enc).unwrap();
            let tolerance = (v.abs() * 0.01).max(0.01);
            assert!((dec - v).abs() <= tolerance, "{} decoded to {}", v, dec);
        }
    }

    #[test]
    fn test_dpt9_wrong_length() {
        assert!(dpt9::decode(&[0x0C]).is_err());
        assert!(dpt9::decode(&[0x0C, 0x1A, 0x00]).is_err());
    }

    #[test]
    fn test_dpt17_and_18() {
        assert_eq!(dpt17::encode(5).unwrap(), vec![0x05]);
        assert!(dpt17::encode(64).is_err());
        assert_eq!(dpt17::decode(&[0x3F]).unwrap(), 63);

        assert_eq!(dpt18::encode(true, 5).unwrap(), vec![0x85]);
        assert_eq!(dpt18::encode(false, 5).unwrap(), vec![0x05]);
        assert_eq!(dpt18::decode(&[0x85]).unwrap(), (true, 5));
        assert!(dpt18::encode(false, 64).is_err());
    }

    #[test]
    fn test_dpt232() {
        assert_eq!(dpt232::encode(255, 128, 0), vec![0xFF, 0x80, 0x00]);
        assert_eq!(dpt232::decode(&[0xFF, 0x80, 0x00]).unwrap(), (255, 128, 0));
        assert!(dpt232::decode(&[0xFF, 0x80]).is_err());
    }

    #[test]
    fn test_decode_value_dispatch() {
        assert_eq!(decode_value("1.001", &[0x01]).unwrap(), serde_json::json!(true));
        assert_eq!(decode_value("5.001", &[0xBF]).unwrap(), serde_json::json!(75));
        assert_eq!(decode_value("9.001", &[0x0C, 0x1A]).unwrap(), serde_json::json!(21.0));
        /* unsupported majors pass the raw bytes through */
        assert_eq!(decode_value("232.600", &[1, 2, 3]).unwrap(), serde_json::json!([1, 2, 3]));
        assert!(decode_value("9.001", &[0x7F, 0xFF]).is_err());
    }
}
