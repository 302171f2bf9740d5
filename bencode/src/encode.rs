use crate::decode::{Value, ValueData};

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Emit dictionary keys in sorted order, as canonical bencode requires.
    pub sort_dict: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self { sort_dict: true }
    }
}

/// Appends bencode to a byte buffer. Lists and dictionaries are closed when their
/// sub-encoder is dropped.
#[derive(Debug)]
pub struct Encoder<'a> {
    out: &'a mut Vec<u8>,
    config: &'a EncoderConfig,
}

impl<'a> Encoder<'a> {
    pub fn new(out: &'a mut Vec<u8>, config: &'a EncoderConfig) -> Self {
        Self { out, config }
    }

    /// Any integer type, written in decimal without leading zeros.
    pub fn integer(&mut self, value: impl ToString) {
        self.out.push(b'i');
        self.out.extend_from_slice(value.to_string().as_bytes());
        self.out.push(b'e');
    }

    pub fn string(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes.len().to_string().as_bytes());
        self.out.push(b':');
        self.out.extend_from_slice(bytes);
    }

    pub fn list<'e>(&'e mut self) -> ListEncoder<'e, 'a> {
        self.out.push(b'l');
        ListEncoder { parent: self }
    }

    pub fn dict<'e>(&'e mut self) -> DictEncoder<'e, 'a> {
        self.out.push(b'd');
        DictEncoder {
            parent: self,
            entries: Vec::new(),
        }
    }
}

pub struct ListEncoder<'e, 'a> {
    parent: &'e mut Encoder<'a>,
}

impl ListEncoder<'_, '_> {
    pub fn push<T: Encode>(&mut self, item: T) {
        item.encode(self.parent);
    }
}

impl Drop for ListEncoder<'_, '_> {
    fn drop(&mut self) {
        self.parent.out.push(b'e');
    }
}

/// Buffers entries so keys can be sorted before anything is written.
pub struct DictEncoder<'e, 'a> {
    parent: &'e mut Encoder<'a>,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl DictEncoder<'_, '_> {
    pub fn push<T: Encode>(&mut self, key: impl AsRef<[u8]>, value: T) {
        let encoded = encode_with(self.parent.config, value);
        self.entries.push((key.as_ref().to_vec(), encoded));
    }
}

impl Drop for DictEncoder<'_, '_> {
    fn drop(&mut self) {
        let mut entries = std::mem::take(&mut self.entries);
        if self.parent.config.sort_dict {
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        }
        for (key, encoded) in entries {
            self.parent.string(&key);
            self.parent.out.extend_from_slice(&encoded);
        }
        self.parent.out.push(b'e');
    }
}

pub trait Encode {
    fn encode(&self, encoder: &mut Encoder);
}

pub fn encode_with<T: Encode>(config: &EncoderConfig, value: T) -> Vec<u8> {
    let mut out = Vec::new();
    value.encode(&mut Encoder::new(&mut out, config));
    out
}

pub fn encode<T: Encode>(value: T) -> Vec<u8> {
    encode_with(&EncoderConfig::default(), value)
}

/// Re-encodes a decoded value, keeping dictionary entries in the order they were decoded.
///
/// For canonical input the output is byte-identical to the input.
pub fn encode_value(value: &Value) -> Vec<u8> {
    encode_with(&EncoderConfig { sort_dict: false }, value)
}

/// A byte string. Plain `&[u8]` slices encode as lists of integers.
#[derive(Debug, Clone, Copy)]
pub struct ByteStr<'a>(pub &'a [u8]);

impl Encode for ByteStr<'_> {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.string(self.0);
    }
}

macro_rules! integer_encode {
    ($($t:ty),*) => {$(
        impl Encode for $t {
            fn encode(&self, encoder: &mut Encoder) {
                encoder.integer(self);
            }
        }
    )*};
}
integer_encode!(i32, i64, u16, u32, u64);

impl Encode for str {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.string(self.as_bytes());
    }
}

impl Encode for String {
    fn encode(&self, encoder: &mut Encoder) {
        self.as_str().encode(encoder);
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, encoder: &mut Encoder) {
        T::encode(self, encoder);
    }
}

impl<T: Encode> Encode for [T] {
    fn encode(&self, encoder: &mut Encoder) {
        let mut list = encoder.list();
        self.iter().for_each(|item| list.push(item));
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, encoder: &mut Encoder) {
        self.as_slice().encode(encoder);
    }
}

impl Encode for Value<'_> {
    fn encode(&self, encoder: &mut Encoder) {
        match &self.data {
            ValueData::Integer(v) => encoder.integer(v),
            ValueData::Bytes(v) => encoder.string(v),
            ValueData::List(items) => items.as_slice().encode(encoder),
            ValueData::Dict(dict) => {
                let mut entries = encoder.dict();
                dict.iter().for_each(|(key, value)| entries.push(key, value));
            }
        }
    }
}
