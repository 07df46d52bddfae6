// Sensor payload binary codec
//
// Compact, versioned, field-tagged encoding for sensor samples. A payload is
// a version byte followed by length-prefixed sample frames; each frame is a
// list of tagged fields. Decoders skip tags they do not recognize, so newer
// wearables can add fields without breaking older hosts. The version byte
// gates decode behavior outright.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{self, Cursor, Read};

use crate::sample::{SensorSample, Vec3};

/// Current payload encoding version.
pub const CODEC_VERSION: u8 = 1;

mod tag {
    pub const TIMESTAMP: u8 = 0x01;
    pub const ACCELERATION: u8 = 0x02;
    pub const ROTATION: u8 = 0x03;
    pub const GRAVITY: u8 = 0x04;
    pub const ATTITUDE: u8 = 0x05;
    pub const MAGNETIC_FIELD: u8 = 0x06;
    pub const FREQUENCY_HZ: u8 = 0x07;
    pub const SAMPLE_COUNT: u8 = 0x08;
}

/// Stable field name for a tag, kept for forward compatibility and
/// diagnostics. Unknown tags have no name and are skipped on decode.
pub fn field_name(t: u8) -> Option<&'static str> {
    match t {
        tag::TIMESTAMP => Some("timestamp"),
        tag::ACCELERATION => Some("acceleration"),
        tag::ROTATION => Some("rotation"),
        tag::GRAVITY => Some("gravity"),
        tag::ATTITUDE => Some("attitude"),
        tag::MAGNETIC_FIELD => Some("magnetic_field"),
        tag::FREQUENCY_HZ => Some("frequency_hz"),
        tag::SAMPLE_COUNT => Some("sample_count"),
        _ => None,
    }
}

/// Errors that can occur while encoding or decoding sensor payloads
#[derive(Debug)]
pub enum CodecError {
    /// Payload was written with a version this build cannot read
    UnsupportedVersion(u8),
    /// Payload ended mid-frame or mid-field
    Truncated,
    /// A known tag carried a body of the wrong length
    BadFieldLength { tag: u8, len: u8 },
    /// Underlying byte-level read/write failure
    Io(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedVersion(v) => {
                write!(f, "unsupported payload version {} (max {})", v, CODEC_VERSION)
            }
            Self::Truncated => write!(f, "payload truncated"),
            Self::BadFieldLength { tag, len } => write!(
                f,
                "field {} carries {} bytes",
                field_name(*tag).unwrap_or("unknown"),
                len
            ),
            Self::Io(msg) => write!(f, "payload I/O error: {}", msg),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<io::Error> for CodecError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Io(err.to_string())
        }
    }
}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;

/// An opaque, append-only encoded sample sequence.
///
/// This is the exact byte form persisted on a set and later copied verbatim
/// into history, so appends never rewrite previously encoded frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorPayload {
    bytes: Vec<u8>,
}

impl SensorPayload {
    pub fn empty() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Wrap previously encoded bytes, verifying they decode cleanly.
    pub fn from_bytes(bytes: Vec<u8>) -> CodecResult<Self> {
        let payload = Self { bytes };
        payload.decode()?;
        Ok(payload)
    }

    /// Wrap previously encoded bytes checking only the version byte.
    /// For bytes this process wrote itself; external input goes through
    /// [`SensorPayload::from_bytes`].
    pub fn from_bytes_unchecked(bytes: Vec<u8>) -> CodecResult<Self> {
        if let Some(&version) = bytes.first() {
            if version != CODEC_VERSION {
                return Err(CodecError::UnsupportedVersion(version));
            }
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Append samples, writing the version header on first use.
    pub fn append_samples(&mut self, samples: &[SensorSample]) -> CodecResult<()> {
        if samples.is_empty() {
            return Ok(());
        }
        if self.bytes.is_empty() {
            self.bytes.write_u8(CODEC_VERSION)?;
        } else if self.bytes[0] != CODEC_VERSION {
            return Err(CodecError::UnsupportedVersion(self.bytes[0]));
        }
        for sample in samples {
            let frame = encode_sample(sample)?;
            self.bytes.write_u16::<LittleEndian>(frame.len() as u16)?;
            self.bytes.extend_from_slice(&frame);
        }
        Ok(())
    }

    /// Decode every frame back into samples.
    pub fn decode(&self) -> CodecResult<Vec<SensorSample>> {
        if self.bytes.is_empty() {
            return Ok(Vec::new());
        }
        let mut cursor = Cursor::new(self.bytes.as_slice());
        let version = cursor.read_u8()?;
        if version != CODEC_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let mut samples = Vec::new();
        while (cursor.position() as usize) < self.bytes.len() {
            let frame_len = cursor.read_u16::<LittleEndian>()? as usize;
            let mut frame = vec![0u8; frame_len];
            cursor.read_exact(&mut frame)?;
            samples.push(decode_frame(&frame)?);
        }
        Ok(samples)
    }

    /// Number of encoded samples without materializing them.
    pub fn sample_count(&self) -> CodecResult<usize> {
        if self.bytes.is_empty() {
            return Ok(0);
        }
        let mut cursor = Cursor::new(self.bytes.as_slice());
        let version = cursor.read_u8()?;
        if version != CODEC_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let mut count = 0usize;
        while (cursor.position() as usize) < self.bytes.len() {
            let frame_len = cursor.read_u16::<LittleEndian>()? as u64;
            let skip_to = cursor.position() + frame_len;
            if skip_to as usize > self.bytes.len() {
                return Err(CodecError::Truncated);
            }
            cursor.set_position(skip_to);
            count += 1;
        }
        Ok(count)
    }
}

/// Encode a single sample as a tagged field frame (without length prefix).
pub fn encode_sample(sample: &SensorSample) -> CodecResult<Vec<u8>> {
    let mut out = Vec::with_capacity(128);
    write_scalar(&mut out, tag::TIMESTAMP, sample.timestamp)?;
    write_vec3(&mut out, tag::ACCELERATION, sample.acceleration)?;
    write_vec3(&mut out, tag::ROTATION, sample.rotation)?;
    write_vec3(&mut out, tag::GRAVITY, sample.gravity)?;
    write_vec3(&mut out, tag::ATTITUDE, sample.attitude)?;
    write_vec3(&mut out, tag::MAGNETIC_FIELD, sample.magnetic_field)?;
    if let Some(hz) = sample.frequency_hz {
        write_scalar(&mut out, tag::FREQUENCY_HZ, hz)?;
    }
    if let Some(n) = sample.sample_count {
        out.write_u8(tag::SAMPLE_COUNT)?;
        out.write_u8(4)?;
        out.write_u32::<LittleEndian>(n)?;
    }
    Ok(out)
}

fn write_scalar(out: &mut Vec<u8>, t: u8, value: f64) -> CodecResult<()> {
    out.write_u8(t)?;
    out.write_u8(8)?;
    out.write_f64::<LittleEndian>(value)?;
    Ok(())
}

fn write_vec3(out: &mut Vec<u8>, t: u8, value: Option<Vec3>) -> CodecResult<()> {
    if let Some(v) = value {
        out.write_u8(t)?;
        out.write_u8(24)?;
        out.write_f64::<LittleEndian>(v.x)?;
        out.write_f64::<LittleEndian>(v.y)?;
        out.write_f64::<LittleEndian>(v.z)?;
    }
    Ok(())
}

/// Decode a field frame produced by [`encode_sample`]. Unknown tags are
/// skipped by their declared length.
pub fn decode_frame(frame: &[u8]) -> CodecResult<SensorSample> {
    let mut cursor = Cursor::new(frame);
    let mut sample = SensorSample::at(0.0);
    while (cursor.position() as usize) < frame.len() {
        let t = cursor.read_u8()?;
        let len = cursor.read_u8()?;
        match t {
            tag::TIMESTAMP => {
                expect_len(t, len, 8)?;
                sample.timestamp = cursor.read_f64::<LittleEndian>()?;
            }
            tag::ACCELERATION => sample.acceleration = Some(read_vec3(t, len, &mut cursor)?),
            tag::ROTATION => sample.rotation = Some(read_vec3(t, len, &mut cursor)?),
            tag::GRAVITY => sample.gravity = Some(read_vec3(t, len, &mut cursor)?),
            tag::ATTITUDE => sample.attitude = Some(read_vec3(t, len, &mut cursor)?),
            tag::MAGNETIC_FIELD => sample.magnetic_field = Some(read_vec3(t, len, &mut cursor)?),
            tag::FREQUENCY_HZ => {
                expect_len(t, len, 8)?;
                sample.frequency_hz = Some(cursor.read_f64::<LittleEndian>()?);
            }
            tag::SAMPLE_COUNT => {
                expect_len(t, len, 4)?;
                sample.sample_count = Some(cursor.read_u32::<LittleEndian>()?);
            }
            _ => {
                // Forward compatibility: unknown field, skip its body
                let skip_to = cursor.position() + len as u64;
                if skip_to as usize > frame.len() {
                    return Err(CodecError::Truncated);
                }
                cursor.set_position(skip_to);
            }
        }
    }
    Ok(sample)
}

fn expect_len(t: u8, actual: u8, expected: u8) -> CodecResult<()> {
    if actual != expected {
        return Err(CodecError::BadFieldLength {
            tag: t,
            len: actual,
        });
    }
    Ok(())
}

fn read_vec3(t: u8, len: u8, cursor: &mut Cursor<&[u8]>) -> CodecResult<Vec3> {
    expect_len(t, len, 24)?;
    Ok(Vec3::new(
        cursor.read_f64::<LittleEndian>()?,
        cursor.read_f64::<LittleEndian>()?,
        cursor.read_f64::<LittleEndian>()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_sample() -> SensorSample {
        SensorSample {
            timestamp: 1_700_000_123.25,
            acceleration: Some(Vec3::new(0.1, -9.81, 0.2)),
            rotation: Some(Vec3::new(0.01, 0.02, -0.03)),
            gravity: Some(Vec3::new(0.0, -1.0, 0.0)),
            attitude: Some(Vec3::new(0.5, 0.25, -0.75)),
            magnetic_field: Some(Vec3::new(22.5, -3.0, 41.0)),
            frequency_hz: Some(50.0),
            sample_count: Some(1234),
        }
    }

    fn sparse_sample() -> SensorSample {
        let mut sample = SensorSample::at(1_700_000_124.0);
        sample.acceleration = Some(Vec3::new(0.4, 0.5, 0.6));
        sample
    }

    #[test]
    fn test_payload_round_trip() {
        let mut payload = SensorPayload::empty();
        payload
            .append_samples(&[full_sample(), sparse_sample()])
            .unwrap();

        let decoded = payload.decode().unwrap();
        assert_eq!(decoded, vec![full_sample(), sparse_sample()]);
        assert_eq!(payload.sample_count().unwrap(), 2);
    }

    #[test]
    fn test_append_is_concatenation() {
        let mut one_shot = SensorPayload::empty();
        one_shot
            .append_samples(&[full_sample(), sparse_sample()])
            .unwrap();

        let mut incremental = SensorPayload::empty();
        incremental.append_samples(&[full_sample()]).unwrap();
        incremental.append_samples(&[sparse_sample()]).unwrap();

        assert_eq!(one_shot.as_bytes(), incremental.as_bytes());
    }

    #[test]
    fn test_empty_payload_decodes_to_nothing() {
        let payload = SensorPayload::empty();
        assert!(payload.decode().unwrap().is_empty());
        assert_eq!(payload.sample_count().unwrap(), 0);
    }

    #[test]
    fn test_unknown_field_is_skipped() {
        let mut frame = encode_sample(&sparse_sample()).unwrap();
        // Unknown tag 0x7f with a 2-byte body
        frame.extend_from_slice(&[0x7f, 2, 0xde, 0xad]);

        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded, sparse_sample());
    }

    #[test]
    fn test_future_version_is_rejected() {
        let mut payload = SensorPayload::empty();
        payload.append_samples(&[sparse_sample()]).unwrap();

        let mut bytes = payload.into_bytes();
        bytes[0] = CODEC_VERSION + 1;

        let err = SensorPayload { bytes }.sample_count().unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedVersion(_)));
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let mut payload = SensorPayload::empty();
        payload.append_samples(&[full_sample()]).unwrap();

        let mut bytes = payload.into_bytes();
        bytes.truncate(bytes.len() - 3);

        assert!(SensorPayload::from_bytes(bytes).is_err());
    }

    #[test]
    fn test_field_names_are_stable() {
        assert_eq!(field_name(0x01), Some("timestamp"));
        assert_eq!(field_name(0x06), Some("magnetic_field"));
        assert_eq!(field_name(0x7f), None);
    }
}
