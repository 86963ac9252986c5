use crate::crypto::PLAINTEXT_LEN;
use crate::error::DecodeError;

/// Readings above this are sensor error codes, not glucose.
pub const MAX_VALID_GLUCOSE: u16 = 500;

pub const TREND_MINUTES_AGO: [u16; 7] = [0, 2, 4, 6, 7, 12, 15];
pub const HISTORY_MINUTES_AGO: [u16; 3] = [15, 30, 45];

const TREND_OFFSET: usize = 0;
const HISTORY_OFFSET: usize = 28;
const SENSOR_AGE_OFFSET: usize = 40;

fn u32_at(data: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn bits(word: u32, start: u32, len: u32) -> u32 {
    (word >> start) & ((1 << len) - 1)
}

/// One packed reading: glucose plus the temperature it was taken at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlucoseReading {
    raw_value: u16,
    raw_temperature: u16,
    temperature_adjustment: i16,
    minutes_ago: u16,
}

impl GlucoseReading {
    fn unpack(word: u32, minutes_ago: u16) -> GlucoseReading {
        let raw_value = bits(word, 0, 14) as u16;
        let raw_temperature = (bits(word, 14, 12) << 2) as u16;
        let mut temperature_adjustment = (bits(word, 26, 5) << 2) as i16;
        if bits(word, 31, 1) != 0 {
            temperature_adjustment = -temperature_adjustment;
        }
        GlucoseReading {
            raw_value,
            raw_temperature,
            temperature_adjustment,
            minutes_ago,
        }
    }

    /// Raw 14-bit glucose value (mg/dL domain)
    pub fn raw_value(&self) -> u16 {
        self.raw_value
    }

    pub fn raw_temperature(&self) -> u16 {
        self.raw_temperature
    }

    pub fn temperature_adjustment(&self) -> i16 {
        self.temperature_adjustment
    }

    pub fn minutes_ago(&self) -> u16 {
        self.minutes_ago
    }

    pub fn is_valid(&self) -> bool {
        self.raw_value <= MAX_VALID_GLUCOSE
    }
}

/// Everything one decrypted frame carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlucoseSample {
    current_glucose_raw: u16,
    trend: [GlucoseReading; 7],
    historical: [GlucoseReading; 3],
    sensor_age_minutes: u16,
}

impl GlucoseSample {
    /// Decode a CRC-checked 44-byte plaintext
    pub fn decode(plaintext: &[u8]) -> Result<GlucoseSample, DecodeError> {
        if plaintext.len() < PLAINTEXT_LEN {
            return Err(DecodeError::TooShort(plaintext.len()));
        }

        let trend = std::array::from_fn(|i| {
            GlucoseReading::unpack(u32_at(plaintext, TREND_OFFSET + i * 4), TREND_MINUTES_AGO[i])
        });
        let historical = std::array::from_fn(|i| {
            GlucoseReading::unpack(u32_at(plaintext, HISTORY_OFFSET + i * 4), HISTORY_MINUTES_AGO[i])
        });
        let current_glucose_raw = u16::from_le_bytes([plaintext[0], plaintext[1]]) & 0x3FFF;
        let sensor_age_minutes =
            u16::from_le_bytes([plaintext[SENSOR_AGE_OFFSET], plaintext[SENSOR_AGE_OFFSET + 1]]);

        Ok(GlucoseSample {
            current_glucose_raw,
            trend,
            historical,
            sensor_age_minutes,
        })
    }

    pub fn current_glucose_raw(&self) -> u16 {
        self.current_glucose_raw
    }

    /// Current glucose, or `None` when the sensor reported an error value.
    pub fn current_glucose(&self) -> Option<u16> {
        (self.current_glucose_raw <= MAX_VALID_GLUCOSE).then_some(self.current_glucose_raw)
    }

    /// Trend readings, newest first
    pub fn trend(&self) -> &[GlucoseReading; 7] {
        &self.trend
    }

    /// Historical readings, 15-minute spacing
    pub fn historical(&self) -> &[GlucoseReading; 3] {
        &self.historical
    }

    pub fn sensor_age_minutes(&self) -> u16 {
        self.sensor_age_minutes
    }
}

/// Shorthand for [`GlucoseSample::decode`].
pub fn decode(plaintext: &[u8]) -> Result<GlucoseSample, DecodeError> {
    GlucoseSample::decode(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::PLAINTEXT;

    fn pack(raw: u16, temperature: u16, adjustment: i16) -> [u8; 4] {
        let negative = u32::from(adjustment < 0);
        let word = u32::from(raw & 0x3FFF)
            | (u32::from((temperature >> 2) & 0xFFF) << 14)
            | (u32::from((adjustment.unsigned_abs() >> 2) & 0x1F) << 26)
            | (negative << 31);
        word.to_le_bytes()
    }

    #[test]
    fn decodes_golden_plaintext() {
        let sample = decode(&PLAINTEXT).unwrap();
        assert_eq!(sample.current_glucose_raw(), 112);
        assert_eq!(sample.current_glucose(), Some(112));
        assert_eq!(sample.sensor_age_minutes(), 5005);

        let trend: Vec<_> = sample
            .trend()
            .iter()
            .map(|r| (r.raw_value(), r.raw_temperature(), r.temperature_adjustment(), r.minutes_ago()))
            .collect();
        assert_eq!(
            trend,
            vec![
                (112, 6400, -8, 0),
                (110, 6392, 0, 2),
                (109, 6388, 4, 4),
                (108, 6380, -4, 6),
                (107, 6376, 0, 7),
                (104, 6368, 12, 12),
                (101, 6360, -124, 15),
            ]
        );

        let historical: Vec<_> = sample
            .historical()
            .iter()
            .map(|r| (r.raw_value(), r.temperature_adjustment(), r.minutes_ago()))
            .collect();
        assert_eq!(historical, vec![(98, 8, 15), (95, 0, 30), (93, -20, 45)]);
    }

    #[test]
    fn error_values_are_surfaced_not_clamped() {
        let mut plaintext = [0u8; 44];
        plaintext[..4].copy_from_slice(&pack(501, 6000, 0));
        let sample = decode(&plaintext).unwrap();
        assert_eq!(sample.current_glucose_raw(), 501);
        assert_eq!(sample.current_glucose(), None);
        assert!(!sample.trend()[0].is_valid());
    }

    #[test]
    fn extreme_fields() {
        let mut plaintext = [0u8; 44];
        plaintext[28..32].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        let sample = decode(&plaintext).unwrap();
        let reading = sample.historical()[0];
        assert_eq!(reading.raw_value(), 0x3FFF);
        assert_eq!(reading.raw_temperature(), 0xFFF << 2);
        assert_eq!(reading.temperature_adjustment(), -(0x1F << 2));
    }

    #[test]
    fn too_short() {
        assert_eq!(decode(&[0u8; 43]), Err(DecodeError::TooShort(43)));
        assert_eq!(decode(&[]), Err(DecodeError::TooShort(0)));
    }
}
