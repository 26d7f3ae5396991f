pub mod error;

pub use error::{DecoderError, EncoderError};

/// Which compression mode a session offers on its connections.
///
/// Compression is negotiated per connection during the handshake: a payload
/// is only sent compressed when both peers advertised the capability, so a
/// non-negotiating peer always receives plain bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompressionMode {
    /// Compress with the given zstd level.
    Default(i32),
    /// Compress with the given zstd level and a pre-trained dictionary.
    Dictionary(i32, Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressionConfig {
    pub mode: CompressionMode,
}

impl CompressionConfig {
    pub fn new(mode: CompressionMode) -> Self {
        Self { mode }
    }
}

cfg_if! {
    if #[cfg(feature = "zstd_support")]
    {
        use zstd::bulk::{Compressor, Decompressor};

        pub struct Encoder {
            result: Vec<u8>,
            encoder: Compressor<'static>,
        }

        impl Encoder {
            pub fn try_new(config: &CompressionConfig) -> Result<Self, EncoderError> {
                let encoder = match &config.mode {
                    CompressionMode::Default(level) => Compressor::new(*level)
                        .map_err(|_| EncoderError::CompressorCreationFailed { level: *level })?,
                    CompressionMode::Dictionary(level, dictionary) => {
                        Compressor::with_dictionary(*level, dictionary).map_err(|_| {
                            EncoderError::CompressorWithDictionaryFailed { level: *level }
                        })?
                    }
                };
                Ok(Self {
                    result: Vec::new(),
                    encoder,
                })
            }

            pub fn try_encode(&mut self, payload: &[u8]) -> Result<&[u8], EncoderError> {
                self.result = self
                    .encoder
                    .compress(payload)
                    .map_err(|_| EncoderError::CompressionFailed {
                        payload_size: payload.len(),
                    })?;
                Ok(&self.result)
            }
        }

        pub struct Decoder {
            result: Vec<u8>,
            decoder: Decompressor<'static>,
        }

        impl Decoder {
            pub fn try_new(config: &CompressionConfig) -> Result<Self, DecoderError> {
                let decoder = match &config.mode {
                    CompressionMode::Default(_) => Decompressor::new()
                        .map_err(|_| DecoderError::DecompressorCreationFailed)?,
                    CompressionMode::Dictionary(_, dictionary) => {
                        Decompressor::with_dictionary(dictionary)
                            .map_err(|_| DecoderError::DecompressorWithDictionaryFailed)?
                    }
                };
                Ok(Self {
                    result: Vec::new(),
                    decoder,
                })
            }

            /// Decode an untrusted payload. Any malformed or malicious input
            /// returns an error instead of panicking.
            pub fn try_decode(&mut self, payload: &[u8]) -> Result<&[u8], DecoderError> {
                let upper_bound = Decompressor::<'static>::upper_bound(payload).ok_or_else(|| {
                    DecoderError::UpperBoundCalculationFailed {
                        payload_size: payload.len(),
                    }
                })?;
                self.result = self
                    .decoder
                    .decompress(payload, upper_bound)
                    .map_err(|_| DecoderError::DecompressionFailed {
                        payload_size: payload.len(),
                    })?;
                Ok(&self.result)
            }
        }

        #[cfg(test)]
        mod tests {
            use super::*;

            #[test]
            fn encode_decode_round_trip() {
                let config = CompressionConfig::new(CompressionMode::Default(3));
                let mut encoder = Encoder::try_new(&config).unwrap();
                let mut decoder = Decoder::try_new(&config).unwrap();

                let payload: Vec<u8> = (0..2048u32).map(|i| (i % 7) as u8).collect();
                let encoded = encoder.try_encode(&payload).unwrap().to_vec();
                assert!(encoded.len() < payload.len());

                let decoded = decoder.try_decode(&encoded).unwrap();
                assert_eq!(decoded, &payload[..]);
            }

            #[test]
            fn garbage_input_does_not_panic() {
                let config = CompressionConfig::new(CompressionMode::Default(3));
                let mut decoder = Decoder::try_new(&config).unwrap();
                assert!(decoder.try_decode(&[0xDE, 0xAD, 0xBE, 0xEF]).is_err());
            }
        }
    }
}
