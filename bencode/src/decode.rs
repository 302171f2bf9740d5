use crate::error::{Context as _, Error, ErrorKind, Result, TryDisplayUtf8};

// nesting limit, decoded input can come from untrusted peers and trackers
const MAX_DEPTH: usize = 64;

pub enum ValueData<'a> {
    Integer(i64),
    Bytes(&'a [u8]),
    List(Vec<Value<'a>>),
    Dict(Dict<'a>),
}

impl std::fmt::Debug for ValueData<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(v) => f.debug_tuple("Integer").field(v).finish(),
            Self::Bytes(v) => match std::str::from_utf8(v) {
                Ok(str) => write!(f, "{str:?}"),
                _ => write!(f, "<{} bytes>", v.len()),
            },
            Self::List(v) => f.debug_tuple("List").field(v).finish(),
            Self::Dict(v) => f.debug_tuple("Dict").field(v).finish(),
        }
    }
}

/// A decoded value together with the exact input bytes it was decoded from.
pub struct Value<'a> {
    pub offset: usize,
    pub bytes: &'a [u8],
    pub data: ValueData<'a>,
}

impl std::fmt::Debug for Value<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.data.fmt(f)
    }
}

impl<'a> Value<'a> {
    pub fn as_integer(&self) -> Result<i64> {
        match self.data {
            ValueData::Integer(v) => Ok(v),
            _ => Err(Error::message("expected integer")),
        }
    }

    pub fn as_bytes(&self) -> Result<&'a [u8]> {
        match self.data {
            ValueData::Bytes(v) => Ok(v),
            _ => Err(Error::message("expected byte string")),
        }
    }

    pub fn as_str(&self) -> Result<&'a str> {
        std::str::from_utf8(self.as_bytes()?)
            .map_err(|_| Error::message("byte string contains invalid utf-8"))
    }

    pub fn as_list(&self) -> Result<&[Value<'a>]> {
        match &self.data {
            ValueData::List(v) => Ok(v.as_slice()),
            _ => Err(Error::message("expected list")),
        }
    }

    pub fn as_dict(&self) -> Result<&Dict<'a>> {
        match &self.data {
            ValueData::Dict(dict) => Ok(dict),
            _ => Err(Error::message("expected dictionary")),
        }
    }
}

pub struct Dict<'a> {
    entries: Vec<(&'a [u8], Value<'a>)>,
}

impl std::fmt::Debug for Dict<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut m = f.debug_map();
        for (key, value) in &self.entries {
            m.entry(&TryDisplayUtf8(key).to_string(), value);
        }
        m.finish()
    }
}

impl<'a> Dict<'a> {
    pub fn find<T: FromValue>(&self, key: &[u8]) -> Result<Option<T>> {
        self.find_value(key)
            .map(|value| {
                T::from_value(value)
                    .with_context(|| format!("decoding key '{}'", TryDisplayUtf8(key)))
            })
            .transpose()
    }

    pub fn require<T: FromValue>(&self, key: &[u8]) -> Result<T> {
        let value = self.require_value(key)?;
        T::from_value(value).with_context(|| format!("decoding key '{}'", TryDisplayUtf8(key)))
    }

    fn find_value(&self, key: &[u8]) -> Option<&Value<'a>> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, value)| value)
    }

    pub fn require_value(&self, key: &[u8]) -> Result<&Value<'a>> {
        self.find_value(key).ok_or_else(|| Error::missing_key(key))
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.find_value(key).is_some()
    }

    /// Entries in the order they appeared in the input.
    pub fn iter(&self) -> impl Iterator<Item = (&'a [u8], &Value<'a>)> + '_ {
        self.entries.iter().map(|(key, value)| (*key, value))
    }
}

struct Parser<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.offset)
            .copied()
            .ok_or(Error::at(ErrorKind::UnexpectedEof, self.offset))
    }

    fn take_until(&mut self, delim: u8) -> Result<&'a [u8]> {
        let rest = &self.data[self.offset..];
        match rest.iter().position(|&c| c == delim) {
            Some(n) => {
                self.offset += n + 1;
                Ok(&rest[..n])
            }
            None => Err(Error::at(ErrorKind::UnexpectedEof, self.data.len())),
        }
    }

    fn value(&mut self, depth: usize) -> Result<Value<'a>> {
        if depth > MAX_DEPTH {
            return Err(Error::at(ErrorKind::InvalidData, self.offset))
                .context("nesting too deep");
        }

        let start = self.offset;
        let data = match self.peek()? {
            b'i' => {
                self.offset += 1;
                let digits = self.take_until(b'e')?;
                ValueData::Integer(parse_integer(digits).map_err(|_| {
                    Error::at(ErrorKind::InvalidData, start)
                })?)
            }
            b'0'..=b'9' => ValueData::Bytes(self.byte_string()?),
            b'l' => {
                self.offset += 1;
                let mut values = Vec::new();
                while self.peek()? != b'e' {
                    values.push(self.value(depth + 1)?);
                }
                self.offset += 1;
                ValueData::List(values)
            }
            b'd' => {
                self.offset += 1;
                let mut entries = Vec::new();
                while self.peek()? != b'e' {
                    if !self.peek()?.is_ascii_digit() {
                        return Err(Error::at(ErrorKind::InvalidData, self.offset))
                            .context("dictionary key must be a byte string");
                    }
                    let key = self.byte_string()?;
                    let value = self.value(depth + 1)?;
                    entries.push((key, value));
                }
                self.offset += 1;
                ValueData::Dict(Dict { entries })
            }
            _ => return Err(Error::at(ErrorKind::InvalidData, start)),
        };

        Ok(Value {
            offset: start,
            bytes: &self.data[start..self.offset],
            data,
        })
    }

    fn byte_string(&mut self) -> Result<&'a [u8]> {
        let start = self.offset;
        let digits = self.take_until(b':')?;
        let canonical = digits == b"0" || (!digits.is_empty() && digits[0] != b'0');
        if !canonical || !digits.iter().all(u8::is_ascii_digit) {
            return Err(Error::at(ErrorKind::InvalidData, start));
        }
        let len = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(Error::at(ErrorKind::InvalidData, start))?;
        if self.offset.saturating_add(len) > self.data.len() {
            return Err(Error::at(ErrorKind::UnexpectedEof, self.data.len()));
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }
}

fn parse_integer(digits: &[u8]) -> std::result::Result<i64, ()> {
    let (negative, magnitude) = match digits.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, digits),
    };
    if magnitude.is_empty() || !magnitude.iter().all(u8::is_ascii_digit) {
        return Err(());
    }
    // no leading zeros and no negative zero
    if magnitude[0] == b'0' && (magnitude.len() > 1 || negative) {
        return Err(());
    }
    let str = std::str::from_utf8(digits).map_err(|_| ())?;
    str.parse::<i64>().map_err(|_| ())
}

pub fn decode<T: FromValue>(buf: &[u8]) -> Result<T> {
    let value = decode_value(buf)?;
    T::from_value(&value)
}

pub fn decode_value(buf: &[u8]) -> Result<Value<'_>> {
    let mut parser = Parser {
        data: buf,
        offset: 0,
    };
    let value = parser.value(0)?;
    if parser.offset != buf.len() {
        return Err(Error::at(ErrorKind::TrailingData, parser.offset));
    }
    Ok(value)
}

pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

macro_rules! integer_from_value {
    ($($t:ty),*) => {$(
        impl FromValue for $t {
            fn from_value(value: &Value) -> Result<Self> {
                <$t>::try_from(value.as_integer()?).map_err(|_| {
                    Error::message(concat!("integer out of range for ", stringify!($t)))
                })
            }
        }
    )*};
}
integer_from_value!(i32, i64, u16, u32, u64);

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.as_str()?.to_owned())
    }
}

impl<T> FromValue for Vec<T>
where
    T: FromValue,
{
    fn from_value(value: &Value) -> Result<Self> {
        value.as_list()?.iter().map(T::from_value).collect()
    }
}
