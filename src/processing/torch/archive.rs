//! Reading and writing `torch.save` zip archives.
//!
//! Entries are kept in their original order and rewritten uncompressed with
//! 64-byte alignment, the layout torch itself writes so storages can be
//! memory-mapped.

use std::io::{Cursor, Read, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::utils::{OptimizerError, OptimizerResult};

const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";
const PICKLE_PROTO: u8 = 0x80;
const ENTRY_ALIGNMENT: u16 = 64;

/// One file inside the archive.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub name: String,
    pub data: Vec<u8>,
}

/// An in-memory torch archive.
#[derive(Debug, Clone)]
pub struct TorchArchive {
    pub entries: Vec<Entry>,
    /// Directory prefix shared by all records, e.g. `archive/`
    pub prefix: String,
}

impl TorchArchive {
    pub fn read(bytes: &[u8]) -> OptimizerResult<Self> {
        if !bytes.starts_with(ZIP_MAGIC) {
            if bytes.first() == Some(&PICKLE_PROTO) {
                return Err(OptimizerError::format(
                    "Legacy (pre-zip) torch serialization is not supported; re-save with torch >= 1.6",
                ));
            }
            return Err(OptimizerError::format("Not a torch.save archive (missing zip header)"));
        }

        let mut zip = ZipArchive::new(Cursor::new(bytes))?;
        let mut entries = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let mut file = zip.by_index(i)?;
            if file.is_dir() {
                continue;
            }
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data)?;
            entries.push(Entry {
                name: file.name().to_string(),
                data,
            });
        }

        let prefix = entries
            .iter()
            .find_map(|e| e.name.strip_suffix("data.pkl"))
            .filter(|p| p.is_empty() || p.ends_with('/'))
            .map(str::to_string)
            .ok_or_else(|| OptimizerError::format("Torch archive has no data.pkl record"))?;

        Ok(Self { entries, prefix })
    }

    fn entry(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn pickle(&self) -> OptimizerResult<&[u8]> {
        self.entry(&format!("{}data.pkl", self.prefix))
            .map(|e| e.data.as_slice())
            .ok_or_else(|| OptimizerError::format("Torch archive has no data.pkl record"))
    }

    /// `true` unless the archive declares big-endian storages.
    pub fn is_little_endian(&self) -> bool {
        self.entry(&format!("{}byteorder", self.prefix))
            .map(|e| String::from_utf8_lossy(&e.data).trim() != "big")
            .unwrap_or(true)
    }

    pub fn storage_name(&self, key: &str) -> String {
        format!("{}data/{}", self.prefix, key)
    }

    pub fn storage_mut(&mut self, key: &str) -> Option<&mut Vec<u8>> {
        let name = self.storage_name(key);
        self.entries.iter_mut().find(|e| e.name == name).map(|e| &mut e.data)
    }

    pub fn write(&self) -> OptimizerResult<Vec<u8>> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for entry in &self.entries {
            let options = SimpleFileOptions::default()
                .compression_method(CompressionMethod::Stored)
                .with_alignment(ENTRY_ALIGNMENT)
                .large_file(entry.data.len() as u64 >= u32::MAX as u64);
            zip.start_file(entry.name.as_str(), options)?;
            zip.write_all(&entry.data)?;
        }
        Ok(zip.finish()?.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn build(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let archive = TorchArchive {
            entries: entries
                .iter()
                .map(|(n, d)| Entry { name: n.to_string(), data: d.to_vec() })
                .collect(),
            prefix: String::new(),
        };
        archive.write().unwrap()
    }

    #[test]
    fn entries_survive_rewrite_in_order() {
        let bytes = build(&[
            ("model/data.pkl", &b"\x80\x02."[..]),
            ("model/byteorder", &b"little"[..]),
            ("model/data/0", &[1u8, 2, 3, 4][..]),
            ("model/version", &b"3\n"[..]),
        ]);
        let archive = TorchArchive::read(&bytes).unwrap();
        assert_eq!(archive.prefix, "model/");
        let names: Vec<_> = archive.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["model/data.pkl", "model/byteorder", "model/data/0", "model/version"]);
        assert_eq!(archive.pickle().unwrap(), b"\x80\x02.");
        assert!(archive.is_little_endian());

        let again = TorchArchive::read(&archive.write().unwrap()).unwrap();
        assert_eq!(again.entries, archive.entries);
    }

    #[test]
    fn big_endian_archives_are_detected() {
        let bytes = build(&[("a/data.pkl", &b"."[..]), ("a/byteorder", &b"big"[..])]);
        assert!(!TorchArchive::read(&bytes).unwrap().is_little_endian());
    }

    #[test]
    fn legacy_pickle_is_rejected_with_hint() {
        let err = TorchArchive::read(&[0x80, 0x02, 0x8a, 0x0a]).unwrap_err();
        assert!(err.to_string().contains("Legacy"));
    }

    #[test]
    fn archive_without_pickle_is_rejected() {
        let bytes = build(&[("a/version", &b"3"[..])]);
        assert!(TorchArchive::read(&bytes).is_err());
    }
}
