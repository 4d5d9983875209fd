//! RIFF/WAVE helpers: header inspection and segment splicing
//!
//! Segments produced by the model are self-contained WAV files. Splicing
//! keeps the first segment's header, appends the sample data of every later
//! segment and patches the two size fields.

use crate::error::{SpeechError, SpeechResult};
use bytes::{Bytes, BytesMut};
use std::io::Cursor;

/// Sample layout of a WAV container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavFormat {
    pub audio_format: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

/// Where the pieces of a WAV container live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavLayout {
    pub format: WavFormat,
    /// Offset of the first sample byte, i.e. the header length
    pub data_offset: usize,
    /// Length of the sample data actually present in the buffer
    pub data_len: usize,
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Walk the chunk list of a WAV buffer
pub fn inspect(buf: &[u8]) -> SpeechResult<WavLayout> {
    if buf.len() < 12 || &buf[0..4] != b"RIFF" || &buf[8..12] != b"WAVE" {
        return Err(SpeechError::Format("Not a RIFF/WAVE buffer".to_string()));
    }

    let mut format = None;
    let mut pos = 12;

    while pos + 8 <= buf.len() {
        let id = &buf[pos..pos + 4];
        let size = read_u32(buf, pos + 4) as usize;
        let body = pos + 8;

        match id {
            b"fmt " => {
                if size < 16 || body + 16 > buf.len() {
                    return Err(SpeechError::Format("Truncated fmt chunk".to_string()));
                }
                format = Some(WavFormat {
                    audio_format: read_u16(buf, body),
                    channels: read_u16(buf, body + 2),
                    sample_rate: read_u32(buf, body + 4),
                    bits_per_sample: read_u16(buf, body + 14),
                });
            }
            b"data" => {
                let format = format
                    .ok_or_else(|| SpeechError::Format("data chunk before fmt chunk".to_string()))?;
                let data_len = size.min(buf.len() - body);
                return Ok(WavLayout {
                    format,
                    data_offset: body,
                    data_len,
                });
            }
            _ => {}
        }

        // Chunks are word aligned
        pos = body.saturating_add(size).saturating_add(size & 1);
    }

    Err(SpeechError::Format("No data chunk".to_string()))
}

/// Combine WAV segments into one container.
///
/// A single segment is returned untouched. Segments whose format differs from
/// the first are rejected.
pub fn splice(segments: &[Bytes]) -> SpeechResult<Bytes> {
    let first = segments
        .first()
        .ok_or_else(|| SpeechError::Format("Nothing to splice".to_string()))?;
    if segments.len() == 1 {
        return Ok(first.clone());
    }

    let head = inspect(first)?;
    let mut layouts = Vec::with_capacity(segments.len() - 1);
    for (index, segment) in segments.iter().enumerate().skip(1) {
        let layout = inspect(segment)?;
        if layout.format != head.format {
            return Err(SpeechError::Format(format!(
                "Segment {} is {:?}, expected {:?}",
                index, layout.format, head.format
            )));
        }
        layouts.push((segment, layout));
    }

    let header_len = head.data_offset;
    let total = header_len
        + head.data_len
        + layouts.iter().map(|(_, l)| l.data_len).sum::<usize>();
    if total > u32::MAX as usize {
        return Err(SpeechError::Format("Spliced audio exceeds 4 GiB".to_string()));
    }

    let mut out = BytesMut::with_capacity(total);
    out.extend_from_slice(&first[..header_len + head.data_len]);
    for (segment, layout) in &layouts {
        out.extend_from_slice(&segment[layout.data_offset..layout.data_offset + layout.data_len]);
    }

    write_u32(&mut out, 4, (total - 8) as u32);
    write_u32(&mut out, header_len - 4, (total - header_len) as u32);

    Ok(out.freeze())
}

/// Playable duration of a WAV buffer in seconds
pub fn duration_secs(buf: &[u8]) -> SpeechResult<f64> {
    let reader = hound::WavReader::new(Cursor::new(buf))?;
    let rate = reader.spec().sample_rate;
    if rate == 0 {
        return Err(SpeechError::Format("Zero sample rate".to_string()));
    }
    Ok(f64::from(reader.duration()) / f64::from(rate))
}

/// Encode mono 16-bit PCM samples as a WAV buffer
pub fn encode_pcm16(sample_rate: u32, samples: &[i16]) -> SpeechResult<Bytes> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(Bytes::from(cursor.into_inner()))
}

/// A mono 16-bit sine tone
pub fn tone(sample_rate: u32, frequency_hz: f32, amplitude: f32, secs: f32) -> SpeechResult<Bytes> {
    let count = (sample_rate as f32 * secs).round() as usize;
    let peak = f32::from(i16::MAX) * amplitude.clamp(0.0, 1.0);
    let samples: Vec<i16> = (0..count)
        .map(|n| {
            let t = n as f32 / sample_rate as f32;
            (peak * (2.0 * std::f32::consts::PI * frequency_hz * t).sin()) as i16
        })
        .collect();
    encode_pcm16(sample_rate, &samples)
}
