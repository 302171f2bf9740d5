mod error;
pub use error::{Context, Error, ErrorKind, Result};

mod encode;
pub use encode::{
    encode, encode_value, encode_with, ByteStr, DictEncoder, Encode, Encoder, EncoderConfig,
    ListEncoder,
};

mod decode;
pub use decode::{decode, decode_value, Dict, FromValue, Value, ValueData};
