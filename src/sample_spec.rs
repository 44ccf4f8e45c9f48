//! Sample format descriptor carried in tagged records and used for
//! latency/byte-rate arithmetic.

use enum_primitive_derive::Primitive;

/// Describes how individual samples are encoded.
#[derive(Debug, Copy, Clone, Primitive, PartialEq, Eq, Default)]
pub enum SampleFormat {
    /// Unsigned 8 bit PCM.
    U8 = 0,
    /// 8 bit a-Law.
    Alaw = 1,
    /// 8 bit mu-Law.
    Ulaw = 2,
    /// Signed 16 bit PCM, little endian.
    #[default]
    S16Le = 3,
    /// Signed 16 bit PCM, big endian.
    S16Be = 4,
    /// 32 bit IEEE float, little endian, range -1.0 to 1.0.
    Float32Le = 5,
    /// 32 bit IEEE float, big endian, range -1.0 to 1.0.
    Float32Be = 6,
    /// Signed 32 bit PCM, little endian.
    S32Le = 7,
    /// Signed 32 bit PCM, big endian.
    S32Be = 8,
}

impl SampleFormat {
    /// Number of bytes used to store a single sample.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 | SampleFormat::Alaw | SampleFormat::Ulaw => 1,
            SampleFormat::S16Le | SampleFormat::S16Be => 2,
            SampleFormat::Float32Le
            | SampleFormat::Float32Be
            | SampleFormat::S32Le
            | SampleFormat::S32Be => 4,
        }
    }
}

/// Fully describes the format of a sample stream between two endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSpec {
    /// Encoding of individual samples.
    pub format: SampleFormat,
    /// Number of independent channels.
    pub channels: u8,
    /// Samples per second, per channel.
    pub rate: u32,
}

impl SampleSpec {
    /// Bytes consumed by one frame (one sample per channel).
    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }

    /// Converts a byte count in this format to microseconds of audio.
    pub fn bytes_to_usec(&self, bytes: u64) -> u64 {
        let fs = self.frame_size() as u64;
        if fs == 0 || self.rate == 0 {
            return 0;
        }

        // usec = frames / rate * 1_000_000, reordered to keep precision.
        (bytes / fs) * 1_000_000 / self.rate as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_stereo_s16le() {
        let ss = SampleSpec {
            format: SampleFormat::S16Le,
            channels: 2,
            rate: 44100,
        };
        assert_eq!(ss.frame_size(), 4);
    }

    #[test]
    fn bytes_to_usec_one_second() {
        let ss = SampleSpec {
            format: SampleFormat::S16Le,
            channels: 2,
            rate: 44100,
        };
        let one_second_bytes = ss.frame_size() as u64 * ss.rate as u64;
        assert_eq!(ss.bytes_to_usec(one_second_bytes), 1_000_000);
    }
}
