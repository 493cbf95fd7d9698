//! Per-version configuration consumed by the shared decode loop.

use super::{DecompressError, Result};

/// Algorithm generation of a packed member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatVersion {
    /// RAR 1.5 adaptive Huffman.
    V15,
    /// RAR 2.x, with multimedia audio blocks.
    V20,
    /// RAR 3.x/4.x, with PPMd blocks and VM filters.
    V29,
    /// RAR 5.x and 7.x.
    V50,
}

/// How the table describing the code lengths is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaLayout {
    /// 19 meta symbols, 16 repeats with a 2-bit count.
    Rar20,
    /// 20 meta symbols, zero-run escape in the header, added to the old table.
    Rar29,
    /// Same coding as `Rar29`, lengths stand alone.
    Rar50,
}

impl MetaLayout {
    pub const fn meta_symbols(self) -> usize {
        match self {
            Self::Rar20 => 19,
            Self::Rar29 | Self::Rar50 => 20,
        }
    }
}

/// Which filter machinery the format declares filters with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterFlavor {
    None,
    /// Programs for the RAR VM.
    Bytecode,
    /// Fixed transforms selected by a type code.
    BuiltIn,
}

/// Static parameters of one format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatConfig {
    pub version: FormatVersion,
    pub main_symbols: usize,
    pub dist_symbols: usize,
    pub low_dist_symbols: usize,
    pub rep_symbols: usize,
    pub meta: Option<MetaLayout>,
    pub filters: FilterFlavor,
    /// Free window space the loop keeps ahead of the decode pointer.
    pub flush_slack: usize,
    /// Upper bound for one flush, 0 for unbounded.
    pub max_write: usize,
    /// Member ends once the declared size is produced rather than on a
    /// stream marker.
    pub ends_by_size: bool,
}

const V15: FormatConfig = FormatConfig {
    version: FormatVersion::V15,
    main_symbols: 0,
    dist_symbols: 0,
    low_dist_symbols: 0,
    rep_symbols: 0,
    meta: None,
    filters: FilterFlavor::None,
    flush_slack: 270,
    max_write: 0,
    ends_by_size: true,
};

const V20: FormatConfig = FormatConfig {
    version: FormatVersion::V20,
    main_symbols: 298,
    dist_symbols: 48,
    low_dist_symbols: 0,
    rep_symbols: 28,
    meta: Some(MetaLayout::Rar20),
    filters: FilterFlavor::None,
    flush_slack: 270,
    max_write: 0,
    ends_by_size: true,
};

const V29: FormatConfig = FormatConfig {
    version: FormatVersion::V29,
    main_symbols: 299,
    dist_symbols: 60,
    low_dist_symbols: 17,
    rep_symbols: 28,
    meta: Some(MetaLayout::Rar29),
    filters: FilterFlavor::Bytecode,
    flush_slack: 260,
    max_write: 0,
    ends_by_size: false,
};

const V50: FormatConfig = FormatConfig {
    version: FormatVersion::V50,
    main_symbols: 306,
    dist_symbols: 64,
    low_dist_symbols: 16,
    rep_symbols: 44,
    meta: Some(MetaLayout::Rar50),
    filters: FilterFlavor::BuiltIn,
    flush_slack: 0x1004,
    max_write: 0x400000,
    ends_by_size: false,
};

impl FormatVersion {
    /// Map the unpack version stored in a file header.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            15 => Ok(Self::V15),
            20 | 26 => Ok(Self::V20),
            29 => Ok(Self::V29),
            50 | 70 => Ok(Self::V50),
            other => Err(DecompressError::UnsupportedVersion(other)),
        }
    }

    pub const fn config(self) -> &'static FormatConfig {
        match self {
            Self::V15 => &V15,
            Self::V20 => &V20,
            Self::V29 => &V29,
            Self::V50 => &V50,
        }
    }
}

impl TryFrom<u8> for FormatVersion {
    type Error = DecompressError;

    fn try_from(code: u8) -> Result<Self> {
        Self::from_code(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_codes() {
        assert_eq!(FormatVersion::from_code(15).unwrap(), FormatVersion::V15);
        assert_eq!(FormatVersion::from_code(26).unwrap(), FormatVersion::V20);
        assert_eq!(FormatVersion::from_code(29).unwrap(), FormatVersion::V29);
        assert_eq!(FormatVersion::from_code(70).unwrap(), FormatVersion::V50);
        assert!(matches!(
            FormatVersion::from_code(36),
            Err(DecompressError::UnsupportedVersion(36))
        ));
    }

    #[test]
    fn test_configs_are_consistent() {
        for v in [FormatVersion::V15, FormatVersion::V20, FormatVersion::V29, FormatVersion::V50] {
            let c = v.config();
            assert_eq!(c.version, v);
            assert!(c.flush_slack >= 258);
        }
        assert_eq!(FormatVersion::V50.config().main_symbols, 306);
        assert_eq!(FormatVersion::V20.config().meta.unwrap().meta_symbols(), 19);
    }
}
