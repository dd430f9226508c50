//! 烘焙资产的容器格式 (PAK)
//!
//! 布局（小端）：
//! - header 16 字节：magic `OXPK`、version u16、source id u16、entry count u32、保留 u32
//! - entry 表：每项 24 字节 `(asset key u64, offset u64, size u64)`，offset 相对文件起始
//! - 数据区
//!
//! source id 的高半区是保留的：`0x8000..0xFFFF` 分配给松散的烘焙目录，`0xFFFF` 表示运行时合成的资产。

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::asset_loader::AssetSource;

pub const PAK_MAGIC: [u8; 4] = *b"OXPK";
pub const PAK_VERSION: u16 = 1;

const HEADER_SIZE: usize = 16;
const ENTRY_SIZE: usize = 24;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u16);

impl SourceId {
    /// 运行时合成的资产，没有存储
    pub const SYNTHETIC: SourceId = SourceId(0xFFFF);
    /// 松散烘焙目录的起始 id
    pub const LOOSE_COOKED_BASE: SourceId = SourceId(0x8000);

    #[inline]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn value(self) -> u16 {
        self.0
    }

    /// 是否落在保留区间，mount 的 PAK 不能使用
    #[inline]
    pub const fn is_reserved(self) -> bool {
        self.0 >= Self::LOOSE_COOKED_BASE.0
    }
}

impl fmt::Debug for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceId({:#06x})", self.0)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// 全局唯一的资产地址
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetKey {
    pub source: SourceId,
    pub key: u64,
}

impl AssetKey {
    pub const fn new(source: SourceId, key: u64) -> Self {
        Self { source, key }
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:016x}", self.source, self.key)
    }
}

#[derive(Error, Debug)]
pub enum PakError {
    #[error("bad magic {0:?}")]
    BadMagic([u8; 4]),

    #[error("unsupported pak version {0}")]
    UnsupportedVersion(u16),

    #[error("pak truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("entry {key:016x} [{offset}, +{size}) is outside the pak ({len} bytes)")]
    EntryOutOfRange { key: u64, offset: u64, size: u64, len: usize },

    #[error("duplicate asset key {0:016x}")]
    DuplicateKey(u64),

    #[error("source id {0} is reserved")]
    ReservedSourceId(SourceId),

    #[error("source id {0} is already mounted")]
    AlreadyMounted(SourceId),

    #[error("source id {0} is not mounted")]
    NotMounted(SourceId),

    #[error("no loose source id left")]
    LooseSourcesExhausted,

    #[error("asset {0} is synthetic and has no storage")]
    Synthetic(AssetKey),

    #[error("asset {0} not found")]
    MissingEntry(AssetKey),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn read_bytes<const N: usize>(bytes: &[u8], at: usize) -> Result<[u8; N], PakError> {
    bytes
        .get(at..at + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(PakError::Truncated {
            needed: at + N,
            available: bytes.len(),
        })
}

fn read_u16(bytes: &[u8], at: usize) -> Result<u16, PakError> {
    read_bytes::<2>(bytes, at).map(u16::from_le_bytes)
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, PakError> {
    read_bytes::<4>(bytes, at).map(u32::from_le_bytes)
}

fn read_u64(bytes: &[u8], at: usize) -> Result<u64, PakError> {
    read_bytes::<8>(bytes, at).map(u64::from_le_bytes)
}

/// 写 PAK 文件
pub struct PakBuilder {
    source_id: SourceId,
    entries: BTreeMap<u64, Vec<u8>>,
}

impl PakBuilder {
    pub fn new(source_id: SourceId) -> Self {
        Self {
            source_id,
            entries: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, key: u64, payload: impl Into<Vec<u8>>) -> Result<&mut Self, PakError> {
        if self.entries.contains_key(&key) {
            return Err(PakError::DuplicateKey(key));
        }
        self.entries.insert(key, payload.into());
        Ok(self)
    }

    /// 按 key 升序写出
    pub fn build(&self) -> Vec<u8> {
        let table_size = self.entries.len() * ENTRY_SIZE;
        let data_size: usize = self.entries.values().map(Vec::len).sum();
        let mut out = Vec::with_capacity(HEADER_SIZE + table_size + data_size);

        out.extend_from_slice(&PAK_MAGIC);
        out.extend_from_slice(&PAK_VERSION.to_le_bytes());
        out.extend_from_slice(&self.source_id.value().to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());

        let mut offset = (HEADER_SIZE + table_size) as u64;
        for (key, payload) in &self.entries {
            out.extend_from_slice(&key.to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
            offset += payload.len() as u64;
        }
        for payload in self.entries.values() {
            out.extend_from_slice(payload);
        }
        out
    }
}

/// 解析后的只读 PAK
pub struct PakArchive {
    source_id: SourceId,
    /// key -> (offset, size)
    entries: BTreeMap<u64, (u64, u64)>,
    data: Vec<u8>,
}

// new & init
impl PakArchive {
    pub fn parse(data: Vec<u8>) -> Result<Self, PakError> {
        let magic = read_bytes::<4>(&data, 0)?;
        if magic != PAK_MAGIC {
            return Err(PakError::BadMagic(magic));
        }
        let version = read_u16(&data, 4)?;
        if version != PAK_VERSION {
            return Err(PakError::UnsupportedVersion(version));
        }
        let source_id = SourceId::new(read_u16(&data, 6)?);
        let count = read_u32(&data, 8)? as usize;

        let mut entries = BTreeMap::new();
        for i in 0..count {
            let at = HEADER_SIZE + i * ENTRY_SIZE;
            let key = read_u64(&data, at)?;
            let offset = read_u64(&data, at + 8)?;
            let size = read_u64(&data, at + 16)?;
            if offset.checked_add(size).is_none_or(|end| end > data.len() as u64) {
                return Err(PakError::EntryOutOfRange {
                    key,
                    offset,
                    size,
                    len: data.len(),
                });
            }
            if entries.insert(key, (offset, size)).is_some() {
                return Err(PakError::DuplicateKey(key));
            }
        }

        Ok(Self {
            source_id,
            entries,
            data,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, PakError> {
        let _span = tracy_client::span!("PakArchive::open");
        let data = std::fs::read(path.as_ref())?;
        log::info!("open pak {:?} ({} bytes)", path.as_ref(), data.len());
        Self::parse(data)
    }
}

// getters
impl PakArchive {
    #[inline]
    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.keys().copied()
    }

    pub fn get(&self, key: u64) -> Option<&[u8]> {
        let &(offset, size) = self.entries.get(&key)?;
        self.data.get(offset as usize..(offset + size) as usize)
    }
}

/// 已 mount 的资产来源
///
/// PAK 使用文件中的 source id；松散目录从 `LOOSE_COOKED_BASE` 开始分配。
#[derive(Default)]
pub struct PakMountTable {
    paks: BTreeMap<SourceId, Arc<PakArchive>>,
    loose: BTreeMap<SourceId, PathBuf>,
    next_loose: u16,
}

impl PakMountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(&mut self, archive: Arc<PakArchive>) -> Result<SourceId, PakError> {
        let id = archive.source_id();
        if id.is_reserved() {
            return Err(PakError::ReservedSourceId(id));
        }
        if self.paks.contains_key(&id) {
            return Err(PakError::AlreadyMounted(id));
        }
        log::info!("mount pak {} with {} entries", id, archive.len());
        self.paks.insert(id, archive);
        Ok(id)
    }

    /// mount 一个松散的烘焙目录，每个资产是 `<key:016x>.bin`
    pub fn mount_loose(&mut self, root: impl Into<PathBuf>) -> Result<SourceId, PakError> {
        let id = SourceId::new(SourceId::LOOSE_COOKED_BASE.value() + self.next_loose);
        if id == SourceId::SYNTHETIC {
            return Err(PakError::LooseSourcesExhausted);
        }
        self.next_loose += 1;

        let root = root.into();
        log::info!("mount loose cooked dir {:?} as {}", root, id);
        self.loose.insert(id, root);
        Ok(id)
    }

    pub fn unmount(&mut self, id: SourceId) -> Result<(), PakError> {
        let removed = self.paks.remove(&id).is_some() || self.loose.remove(&id).is_some();
        if removed { Ok(()) } else { Err(PakError::NotMounted(id)) }
    }

    #[inline]
    pub fn is_mounted(&self, id: SourceId) -> bool {
        self.paks.contains_key(&id) || self.loose.contains_key(&id)
    }

    pub fn resolve(&self, key: AssetKey) -> Result<AssetSource, PakError> {
        if key.source == SourceId::SYNTHETIC {
            return Err(PakError::Synthetic(key));
        }
        if let Some(archive) = self.paks.get(&key.source) {
            if archive.get(key.key).is_none() {
                return Err(PakError::MissingEntry(key));
            }
            return Ok(AssetSource::Pak {
                archive: archive.clone(),
                key: key.key,
            });
        }
        match self.loose.get(&key.source) {
            Some(root) => Ok(AssetSource::File(root.join(format!("{:016x}.bin", key.key)))),
            None => Err(PakError::NotMounted(key.source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(source: u16) -> PakArchive {
        let mut builder = PakBuilder::new(SourceId::new(source));
        builder.add(7, b"seven".to_vec()).unwrap().add(3, vec![1, 2, 3]).unwrap();
        PakArchive::parse(builder.build()).unwrap()
    }

    #[test]
    fn test_build_and_parse() {
        let pak = sample(1);
        assert_eq!(pak.source_id(), SourceId::new(1));
        assert_eq!(pak.keys().collect::<Vec<_>>(), vec![3, 7]);
        assert_eq!(pak.get(7), Some(&b"seven"[..]));
        assert_eq!(pak.get(3), Some(&[1, 2, 3][..]));
        assert_eq!(pak.get(4), None);
    }

    #[test]
    fn test_parse_rejects_corruption() {
        let mut builder = PakBuilder::new(SourceId::new(1));
        builder.add(1, vec![0; 8]).unwrap();
        let bytes = builder.build();

        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(matches!(PakArchive::parse(bad), Err(PakError::BadMagic(_))));

        let short = bytes[..bytes.len() - 4].to_vec();
        assert!(matches!(PakArchive::parse(short), Err(PakError::EntryOutOfRange { key: 1, .. })));

        assert!(matches!(PakArchive::parse(bytes[..10].to_vec()), Err(PakError::Truncated { .. })));
        assert!(matches!(builder.add(1, vec![]), Err(PakError::DuplicateKey(1))));
    }

    #[test]
    fn test_reserved_source_ids() {
        let mut mounts = PakMountTable::new();
        assert!(matches!(
            mounts.mount(Arc::new(sample(0x8000))),
            Err(PakError::ReservedSourceId(_))
        ));
        assert!(matches!(
            mounts.mount(Arc::new(sample(0xFFFF))),
            Err(PakError::ReservedSourceId(_))
        ));

        assert_eq!(mounts.mount(Arc::new(sample(2))).unwrap(), SourceId::new(2));
        assert!(matches!(mounts.mount(Arc::new(sample(2))), Err(PakError::AlreadyMounted(_))));

        let loose = mounts.mount_loose("cooked").unwrap();
        assert_eq!(loose, SourceId::LOOSE_COOKED_BASE);
        assert_ne!(mounts.mount_loose("cooked2").unwrap(), loose);
    }

    #[test]
    fn test_resolve() {
        let mut mounts = PakMountTable::new();
        let id = mounts.mount(Arc::new(sample(5))).unwrap();
        let loose = mounts.mount_loose("cooked").unwrap();

        assert!(matches!(mounts.resolve(AssetKey::new(id, 7)), Ok(AssetSource::Pak { key: 7, .. })));
        assert!(matches!(mounts.resolve(AssetKey::new(id, 8)), Err(PakError::MissingEntry(_))));
        match mounts.resolve(AssetKey::new(loose, 0xab)).unwrap() {
            AssetSource::File(path) => assert_eq!(path, PathBuf::from("cooked").join("00000000000000ab.bin")),
            _ => panic!("expected a loose file"),
        }
        assert!(matches!(
            mounts.resolve(AssetKey::new(SourceId::SYNTHETIC, 1)),
            Err(PakError::Synthetic(_))
        ));

        mounts.unmount(id).unwrap();
        assert!(matches!(mounts.resolve(AssetKey::new(id, 7)), Err(PakError::NotMounted(_))));
        assert!(matches!(mounts.unmount(id), Err(PakError::NotMounted(_))));
    }
}
