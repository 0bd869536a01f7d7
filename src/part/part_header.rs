use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fs::filename::{generate_filename_static, FileType};
use crate::fs::write_file_sync;

/// Summary of a part: item and block counts plus the item range.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartHeader {
    pub items_count: u64,
    pub blocks_count: u64,
    pub first_item: Vec<u8>,
    pub last_item: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PartHeaderJson {
    items_count: u64,
    blocks_count: u64,
    #[serde(with = "hex_bytes")]
    first_item: Vec<u8>,
    #[serde(with = "hex_bytes")]
    last_item: Vec<u8>,
}

impl PartHeader {
    /// Directory name of a part: `<items>_<blocks>_<merge_idx:016X>`.
    pub fn dir_name(&self, merge_idx: u64) -> String {
        format!(
            "{}_{}_{:016X}",
            self.items_count, self.blocks_count, merge_idx
        )
    }

    /// Parses the item and block counts out of a part directory name.
    pub fn parse_dir_name(name: &str) -> Result<(u64, u64)> {
        let mut fields = name.split('_');
        let mut next_count = |what: &str| -> Result<u64> {
            let field = fields.next().unwrap_or_default();
            field.parse::<u64>().map_err(|e| {
                Error::Validation(format!("cannot parse {what} from part name {name:?}: {e}"))
            })
        };
        let items_count = next_count("items count")?;
        let blocks_count = next_count("blocks count")?;
        Ok((items_count, blocks_count))
    }

    /// Parses the trailing merge index of a part directory name, if present.
    pub fn parse_merge_idx(name: &str) -> Option<u64> {
        let idx = name.split('_').nth(2)?;
        u64::from_str_radix(idx, 16).ok()
    }

    pub fn write_metadata(&self, dir: &Path) -> Result<()> {
        let phj = PartHeaderJson {
            items_count: self.items_count,
            blocks_count: self.blocks_count,
            first_item: self.first_item.clone(),
            last_item: self.last_item.clone(),
        };
        let data = serde_json::to_vec(&phj)?;
        write_file_sync(generate_filename_static(dir, FileType::Metadata), &data)
    }

    pub fn read_metadata(dir: &Path) -> Result<Self> {
        let data = std::fs::read(generate_filename_static(dir, FileType::Metadata))?;
        let phj: PartHeaderJson = serde_json::from_slice(&data)?;
        let ph = Self {
            items_count: phj.items_count,
            blocks_count: phj.blocks_count,
            first_item: phj.first_item,
            last_item: phj.last_item,
        };
        ph.validate()?;
        Ok(ph)
    }

    /// Reads the header of the part stored in `dir`, checking the metadata
    /// against the counts encoded in the directory name.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let name = dir
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::Validation(format!("invalid part path {}", dir.display())))?;
        let (items_count, blocks_count) = Self::parse_dir_name(name)?;
        let ph = Self::read_metadata(dir)?;
        if ph.items_count != items_count || ph.blocks_count != blocks_count {
            return Err(Error::Validation(format!(
                "part {name:?} holds {} items in {} blocks according to its metadata",
                ph.items_count, ph.blocks_count
            )));
        }
        Ok(ph)
    }

    pub fn validate(&self) -> Result<()> {
        if self.items_count == 0 || self.blocks_count == 0 {
            return Err(Error::Validation(format!(
                "part must hold items; got {} items in {} blocks",
                self.items_count, self.blocks_count
            )));
        }
        if self.blocks_count > self.items_count {
            return Err(Error::Validation(format!(
                "part holds more blocks ({}) than items ({})",
                self.blocks_count, self.items_count
            )));
        }
        if self.first_item > self.last_item {
            return Err(Error::Validation(format!(
                "first item {:?} is bigger than last item {:?}",
                self.first_item, self.last_item
            )));
        }
        Ok(())
    }
}

mod hex_bytes {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    const DIGITS: &[u8; 16] = b"0123456789abcdef";

    pub fn serialize<S: Serializer>(b: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = String::with_capacity(2 * b.len());
        for x in b {
            s.push(DIGITS[(x >> 4) as usize] as char);
            s.push(DIGITS[(x & 0xf) as usize] as char);
        }
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.len() % 2 != 0 {
            return Err(D::Error::custom(format!("odd length hex string {s:?}")));
        }
        s.as_bytes()
            .chunks_exact(2)
            .map(|pair| {
                let hi = nibble(pair[0]);
                let lo = nibble(pair[1]);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
                    _ => Err(D::Error::custom(format!("invalid hex string {s:?}"))),
                }
            })
            .collect()
    }

    fn nibble(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        }
    }
}
