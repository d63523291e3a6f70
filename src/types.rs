/// Rank of a participant in a process group (0-indexed).
pub type Rank = u32;

/// Element types supported by collective and point-to-point operations.
///
/// Every variant has a sum defined on it: integers wrap on overflow,
/// floats follow IEEE-754 addition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    I8 = 2,
    I32 = 3,
    I64 = 4,
    U8 = 5,
    U32 = 6,
    U64 = 7,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

mod private {
    pub trait Sealed {}
}

/// Host element types that can be passed to the typed slice API.
///
/// Sealed: the set matches [`DataType`] one-to-one.
pub trait Element: Copy + Send + Sync + private::Sealed + 'static {
    const DTYPE: DataType;
}

macro_rules! impl_element {
    ($($ty:ty => $dt:ident),* $(,)?) => {
        $(
            impl private::Sealed for $ty {}
            impl Element for $ty {
                const DTYPE: DataType = DataType::$dt;
            }
        )*
    };
}

impl_element!(
    f32 => F32,
    f64 => F64,
    i8 => I8,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u32 => U32,
    u64 => U64,
);

/// Opaque identifier shared by every member of one rendezvous instance.
///
/// Peers presenting a different token are rejected, which keeps stale
/// processes from a previous run out of a freshly forming group.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct GroupToken(Vec<u8>);

impl GroupToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// A fresh random token (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for GroupToken {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for GroupToken {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

// Tokens may be secrets; only print a short fingerprint.
impl std::fmt::Debug for GroupToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GroupToken({} bytes)", self.0.len())
    }
}

/// Current control protocol version.
pub const PROTOCOL_VERSION: u16 = 1;
