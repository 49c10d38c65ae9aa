use std::sync::atomic::{AtomicBool, Ordering};

use byteorder::{ByteOrder, LittleEndian};

use crate::wfm::{
    iq_sample_rate, AnalogWaveform, DigitalWaveform, IqMetadata, IqWaveform, Samples, Waveform,
};
use crate::wire::{ChunkStream, WaveformHeader};
use crate::Error;

/// Result of decoding one source's chunk stream. Only `Complete` leads to a
/// publish; the other outcomes withhold the source from this acquisition.
#[derive(Debug)]
pub(crate) enum DecodeOutcome {
    Complete(Waveform),
    /// Chunk bytes diverged from `noofsamples * sourcewidth`.
    Mismatch { expected: usize, received: usize },
    /// The stop flag fired mid-stream; the partial buffer is discarded.
    Cancelled,
    /// The header carried a waveform-type tag outside the known families.
    UnsupportedType(i32),
}

/// Decodes the streamed payload for one validated header into a typed
/// waveform. Chunks are little-endian on the wire; the sample buffer is
/// allocated once at the header-implied length and never grown.
pub(crate) fn decode_waveform(
    header: &WaveformHeader,
    chunks: ChunkStream,
    stop: &AtomicBool,
) -> Result<DecodeOutcome, Error> {
    let mut samples = match alloc_samples(header) {
        Some(samples) => samples,
        None => return Ok(DecodeOutcome::UnsupportedType(header.wfmtype)),
    };

    let expected = header.payload_bytes();
    let mut received = 0;
    let mut written = 0;

    let mut chunks = chunks;
    while let Some(chunk) = chunks.next() {
        let chunk = chunk?;

        if stop.load(Ordering::Acquire) {
            return Ok(DecodeOutcome::Cancelled);
        }

        received += chunk.len();
        written = match fill(&mut samples, written, &chunk) {
            Some(written) => written,
            // Misaligned or overlong chunk; drain the rest of the stream
            // into the byte count so the log shows the full divergence.
            None => {
                for rest in chunks.by_ref() {
                    received += rest?.len();
                }
                return Ok(DecodeOutcome::Mismatch { expected, received });
            }
        };
    }

    if received != expected {
        return Ok(DecodeOutcome::Mismatch { expected, received });
    }

    Ok(DecodeOutcome::Complete(build(header, samples)))
}

/// Element storage implied by the waveform-type tag and source width. The
/// digital families convey packed bus bytes, so their buffers hold
/// `noofsamples * sourcewidth` one-byte elements.
fn alloc_samples(header: &WaveformHeader) -> Option<Samples> {
    let n = header.noofsamples as usize;

    match header.wfmtype {
        1..=3 => match header.sourcewidth {
            1 => Some(Samples::I8(vec![0; n])),
            2 => Some(Samples::I16(vec![0; n])),
            4 => Some(Samples::F32(vec![0.0; n])),
            _ => None,
        },
        4..=5 => Some(Samples::I8(vec![0; n * header.sourcewidth as usize])),
        6..=7 => match header.sourcewidth {
            1 => Some(Samples::I8(vec![0; n])),
            2 => Some(Samples::I16(vec![0; n])),
            4 => Some(Samples::I32(vec![0; n])),
            _ => None,
        },
        _ => None,
    }
}

/// Writes one chunk into the next unfilled region, returning the new fill
/// count in elements. `None` means the chunk does not fit the buffer.
fn fill(samples: &mut Samples, written: usize, chunk: &[u8]) -> Option<usize> {
    let width = samples.element_width();
    if chunk.len() % width != 0 {
        return None;
    }

    let count = chunk.len() / width;
    if written + count > samples.len() {
        return None;
    }

    match samples {
        Samples::I8(buf) => {
            for (dst, src) in buf[written..written + count].iter_mut().zip(chunk) {
                *dst = *src as i8;
            }
        }
        Samples::I16(buf) => {
            LittleEndian::read_i16_into(chunk, &mut buf[written..written + count]);
        }
        Samples::I32(buf) => {
            LittleEndian::read_i32_into(chunk, &mut buf[written..written + count]);
        }
        Samples::F32(buf) => {
            LittleEndian::read_f32_into(chunk, &mut buf[written..written + count]);
        }
    }

    Some(written + count)
}

fn build(header: &WaveformHeader, samples: Samples) -> Waveform {
    match header.wfmtype {
        1..=3 => Waveform::Analog(AnalogWaveform {
            source_name: header.sourcename.clone(),
            y_axis_values: samples,
            y_axis_spacing: header.verticalspacing,
            y_axis_offset: header.verticaloffset,
            y_axis_units: header.verticalunits.clone(),
            x_axis_spacing: header.horizontalspacing,
            x_axis_units: header.horizontal_units.clone(),
            trigger_index: header.horizontalzeroindex,
        }),
        4..=5 => Waveform::Digital(DigitalWaveform {
            source_name: header.sourcename.clone(),
            y_axis_byte_values: samples,
            y_axis_units: header.verticalunits.clone(),
            x_axis_spacing: header.horizontalspacing,
            x_axis_units: header.horizontal_units.clone(),
            trigger_index: header.horizontalzeroindex,
        }),
        _ => Waveform::Iq(IqWaveform {
            source_name: header.sourcename.clone(),
            interleaved_iq_axis_values: samples,
            iq_axis_spacing: header.verticalspacing,
            iq_axis_offset: header.verticaloffset,
            iq_axis_units: header.verticalunits.clone(),
            x_axis_spacing: header.horizontalspacing,
            x_axis_units: header.horizontal_units.clone(),
            trigger_index: header.horizontalzeroindex,
            meta: IqMetadata {
                center_frequency: header.iq_center_frequency,
                fft_length: header.iq_fft_length,
                resolution_bandwidth: header.iq_rbw,
                span: header.iq_span,
                window_type: header.iq_window_type.clone(),
                sample_rate: iq_sample_rate(
                    header.iq_fft_length,
                    header.iq_rbw,
                    header.iq_span,
                    &header.iq_window_type,
                ),
            },
        }),
    }
}
