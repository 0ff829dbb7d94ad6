//! Sample records produced by the analyzer and consumed by the writer.
//!
//! A capture run yields one of two record shapes depending on the capture
//! mode: individual IQ samples (in-phase/quadrature pairs) or real-time
//! spectral frames paired with the device's running max-hold trace. Records
//! are immutable once produced and move by value through the ring buffer.

/// One complex-valued measurement of the signal at a single instant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IqSample {
    /// In-phase component
    pub i: f32,
    /// Quadrature component
    pub q: f32,
    /// Position of the sample in the capture, starting at 0
    pub index: u64,
}

/// One snapshot of the real-time spectrum.
#[derive(Clone, Debug, PartialEq)]
pub struct SpectralFrame {
    /// Sweep amplitudes, one per frequency bin (dBm)
    pub bins: Vec<f32>,
    /// Running maximum per bin since the device was armed (dBm)
    pub max_hold: Vec<f32>,
    /// Position of the frame in the capture, starting at 0
    pub frame_index: u64,
}

impl SpectralFrame {
    /// Largest amplitude in the frame, or `NaN` for an empty sweep.
    pub fn peak(&self) -> f32 {
        peak_of(&self.bins)
    }

    /// Largest amplitude in the max-hold trace, or `NaN` for an empty sweep.
    pub fn max_hold_peak(&self) -> f32 {
        peak_of(&self.max_hold)
    }
}

fn peak_of(values: &[f32]) -> f32 {
    values.iter().copied().reduce(f32::max).unwrap_or(f32::NAN)
}

/// A single record flowing through the acquisition pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum SampleRecord {
    /// IQ block capture
    Iq(IqSample),
    /// Real-time sweep capture
    Frame(SpectralFrame),
}

impl SampleRecord {
    /// Capture-relative sequence number of the record.
    pub fn sequence(&self) -> u64 {
        match self {
            SampleRecord::Iq(sample) => sample.index,
            SampleRecord::Frame(frame) => frame.frame_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_peaks() {
        let frame = SpectralFrame {
            bins: vec![-90.0, -42.5, -60.0],
            max_hold: vec![-80.0, -40.0, -55.0],
            frame_index: 3,
        };
        assert_eq!(frame.peak(), -42.5);
        assert_eq!(frame.max_hold_peak(), -40.0);
        assert_eq!(SampleRecord::Frame(frame).sequence(), 3);
    }

    #[test]
    fn test_empty_frame_peak_is_nan() {
        let frame = SpectralFrame {
            bins: vec![],
            max_hold: vec![],
            frame_index: 0,
        };
        assert!(frame.peak().is_nan());
    }

    #[test]
    fn test_iq_sequence() {
        let record = SampleRecord::Iq(IqSample {
            i: 1.0,
            q: -1.0,
            index: 7,
        });
        assert_eq!(record.sequence(), 7);
    }
}
