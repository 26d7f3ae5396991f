use thiserror::Error;

/// Errors that can occur while compressing outbound payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncoderError {
    /// Failed to create a compressor with the specified configuration
    #[error("Failed to create compressor with compression level {level}")]
    CompressorCreationFailed { level: i32 },

    /// Failed to create a compressor with a dictionary
    #[error("Failed to create compressor with dictionary (compression level {level})")]
    CompressorWithDictionaryFailed { level: i32 },

    /// Compression operation failed
    #[error("Failed to compress payload of {payload_size} bytes")]
    CompressionFailed { payload_size: usize },
}

/// Errors that can occur while decompressing inbound payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecoderError {
    /// Failed to create a decompressor
    #[error("Failed to create decompressor")]
    DecompressorCreationFailed,

    /// Failed to create a decompressor with a dictionary
    #[error("Failed to create decompressor with dictionary")]
    DecompressorWithDictionaryFailed,

    /// Failed to calculate the upper bound for decompression
    #[error("Failed to calculate upper bound for payload of {payload_size} bytes")]
    UpperBoundCalculationFailed { payload_size: usize },

    /// Decompression failed; the payload may be malformed or malicious
    #[error("Failed to decompress payload of {payload_size} bytes (possible malformed or malicious data)")]
    DecompressionFailed { payload_size: usize },
}
