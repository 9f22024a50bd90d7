mod decoder;

pub use decoder::{DecoderError, Decoder, ROOT_LOCAL_NAME, ROOT_NAMESPACE};
