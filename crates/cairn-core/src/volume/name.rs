use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use rand::RngCore;

use crate::compress::Compression;
use crate::error::{CairnError, Result};

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// The three kinds of remote volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeKind {
    /// Raw data blocks.
    Dblock,
    /// Block-to-dblock index.
    Dindex,
    /// Snapshot manifest.
    Dfileset,
}

impl VolumeKind {
    pub fn letter(&self) -> char {
        match self {
            VolumeKind::Dblock => 'b',
            VolumeKind::Dindex => 'i',
            VolumeKind::Dfileset => 'f',
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeKind::Dblock => "dblock",
            VolumeKind::Dindex => "dindex",
            VolumeKind::Dfileset => "dfileset",
        }
    }

    pub fn from_letter(c: char) -> Result<Self> {
        match c {
            'b' => Ok(VolumeKind::Dblock),
            'i' => Ok(VolumeKind::Dindex),
            'f' => Ok(VolumeKind::Dfileset),
            other => Err(CairnError::InvalidFormat(format!(
                "unknown volume kind letter: '{other}'"
            ))),
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "dblock" => Ok(VolumeKind::Dblock),
            "dindex" => Ok(VolumeKind::Dindex),
            "dfileset" => Ok(VolumeKind::Dfileset),
            other => Err(CairnError::InvalidFormat(format!(
                "unknown volume kind: '{other}'"
            ))),
        }
    }
}

impl fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed remote volume filename:
/// `{prefix}-{random6}-{kind}-{yyyyMMddTHHmmssZ}.{compressor}[.{encrypter}]`
///
/// The random suffix makes names unique across the repository lifetime; the
/// timestamp (UTC, second resolution) orders dfileset volumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeName {
    pub prefix: String,
    pub random: String,
    pub kind: VolumeKind,
    pub timestamp: DateTime<Utc>,
    pub compression: Compression,
    pub encrypted: bool,
}

impl VolumeName {
    /// Generate a fresh name with a random 6-hex-char suffix.
    /// The timestamp is truncated to whole seconds.
    pub fn generate(
        prefix: &str,
        kind: VolumeKind,
        timestamp: DateTime<Utc>,
        compression: Compression,
        encrypted: bool,
    ) -> Self {
        let mut bytes = [0u8; 3];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            prefix: prefix.to_string(),
            random: hex::encode(bytes),
            kind,
            timestamp: truncate_to_seconds(timestamp),
            compression,
            encrypted,
        }
    }

    /// Parse a blob name back into its components.
    pub fn parse(raw: &str) -> Result<Self> {
        let bad = |reason: &str| {
            CairnError::InvalidFormat(format!("invalid volume name '{raw}': {reason}"))
        };

        let (stem, encrypted) = match raw.strip_suffix(".aes") {
            Some(s) => (s, true),
            None => (raw, false),
        };

        let (stem, comp_ext) = stem
            .rsplit_once('.')
            .ok_or_else(|| bad("missing compression extension"))?;
        let compression = Compression::from_ext(comp_ext)?;

        let mut parts = stem.split('-');
        let prefix = parts.next().ok_or_else(|| bad("missing prefix"))?;
        let random = parts.next().ok_or_else(|| bad("missing random suffix"))?;
        let kind_str = parts.next().ok_or_else(|| bad("missing kind letter"))?;
        let ts_str = parts.next().ok_or_else(|| bad("missing timestamp"))?;
        if parts.next().is_some() {
            return Err(bad("too many '-' separated fields"));
        }

        if prefix.is_empty() {
            return Err(bad("empty prefix"));
        }
        if random.len() != 6 || !random.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(bad("random suffix must be 6 hex characters"));
        }
        let mut kind_chars = kind_str.chars();
        let kind_letter = kind_chars.next().ok_or_else(|| bad("empty kind"))?;
        if kind_chars.next().is_some() {
            return Err(bad("kind must be a single letter"));
        }
        let kind = VolumeKind::from_letter(kind_letter)?;

        let naive = NaiveDateTime::parse_from_str(ts_str, TIMESTAMP_FORMAT)
            .map_err(|e| bad(&format!("bad timestamp: {e}")))?;
        let timestamp = naive.and_utc();

        Ok(Self {
            prefix: prefix.to_string(),
            random: random.to_string(),
            kind,
            timestamp,
            compression,
            encrypted,
        })
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}.{}",
            self.prefix,
            self.random,
            self.kind.letter(),
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.compression.ext(),
        )?;
        if self.encrypted {
            f.write_str(".aes")?;
        }
        Ok(())
    }
}

fn truncate_to_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).expect("timestamp in range")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn format_matches_layout() {
        let name = VolumeName {
            prefix: "cairn".into(),
            random: "b7a4f1".into(),
            kind: VolumeKind::Dblock,
            timestamp: ts(),
            compression: Compression::Zstd { level: 3 },
            encrypted: true,
        };
        assert_eq!(name.to_string(), "cairn-b7a4f1-b-20250101T120000Z.zst.aes");
    }

    #[test]
    fn parse_roundtrip() {
        for kind in [VolumeKind::Dblock, VolumeKind::Dindex, VolumeKind::Dfileset] {
            for encrypted in [false, true] {
                let name =
                    VolumeName::generate("cairn", kind, ts(), Compression::Lz4, encrypted);
                let text = name.to_string();
                let parsed = VolumeName::parse(&text).unwrap();
                assert_eq!(parsed, name, "roundtrip failed for {text}");
            }
        }
    }

    #[test]
    fn generate_truncates_subsecond_precision() {
        let with_nanos = ts() + chrono::Duration::nanoseconds(999_999_000);
        let name = VolumeName::generate(
            "cairn",
            VolumeKind::Dfileset,
            with_nanos,
            Compression::None,
            false,
        );
        assert_eq!(name.timestamp, ts());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(VolumeName::parse("not-a-volume").is_err());
        assert!(VolumeName::parse("cairn-xyzxyz-b-20250101T120000Z.zst").is_err());
        assert!(VolumeName::parse("cairn-aabbcc-q-20250101T120000Z.zst").is_err());
        assert!(VolumeName::parse("cairn-aabbcc-b-2025Jan01.zst").is_err());
        assert!(VolumeName::parse("cairn-aabbcc-b-20250101T120000Z.zip").is_err());
    }
}
