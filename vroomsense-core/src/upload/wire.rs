//! Wire encodings for the two upload paths.
//!
//! Streaming path: each channel as raw little-endian 16-bit PCM bytes.
//! Snapshot/finalize path: both channels interleaved into a stereo WAV
//! container (the server's `audio_file` field expects a real audio file).

use std::io::Cursor;

use crate::buffering::window::AudioWindow;
use crate::error::{Result, VroomError};

/// Serialize one channel to raw little-endian PCM16 bytes.
pub fn encode_pcm16_le(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Parse raw little-endian PCM16 bytes back into samples.
///
/// A trailing odd byte is rejected rather than silently dropped.
pub fn decode_pcm16_le(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(VroomError::MalformedResponse(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Encode a window as a 16-bit stereo WAV file in memory.
pub fn encode_wav(window: &AudioWindow) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: window.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| VroomError::Other(anyhow::anyhow!("wav writer: {e}")))?;
        for (&left, &right) in window.left().iter().zip(window.right().iter()) {
            writer
                .write_sample(left)
                .and_then(|_| writer.write_sample(right))
                .map_err(|e| VroomError::Other(anyhow::anyhow!("wav write: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| VroomError::Other(anyhow::anyhow!("wav finalize: {e}")))?;
    }
    Ok(cursor.into_inner())
}
