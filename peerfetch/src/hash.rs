#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha1(pub(crate) [u8; 20]);

impl Sha1 {
    pub const LENGTH: usize = 20;

    pub fn hash(buf: &[u8]) -> Sha1 {
        use sha1::Digest;
        Sha1(sha1::Sha1::digest(buf).into())
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Sha1> {
        bytes.try_into().ok().map(Sha1)
    }

    /// Parses the 40 character hex form used by magnet links.
    pub fn from_hex(hex: &str) -> Option<Sha1> {
        let mut out = [0u8; 20];
        hex::decode_to_slice(hex, &mut out).ok()?;
        Some(Sha1(out))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 20]> for Sha1 {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for Sha1 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sha1({self})")
    }
}

impl std::fmt::Display for Sha1 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
