use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use quire_types::{BlockInfo, KeyPair};

use crate::error::{LogError, LogResult};
use crate::memory::set_info;
use crate::storage::{BlockStorage, StoredFeed};

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: u64 = 8;

const KEY_FILE: &str = "key";
const JOURNAL_FILE: &str = "journal";

/// One journal frame.
///
/// On-disk format:
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (bincode-serialized JournalRecord)]
/// ```
#[derive(Debug, Serialize, Deserialize)]
enum JournalRecord {
    Infos { from: u64, infos: Vec<BlockInfo> },
    Block { index: u64, data: Vec<u8> },
}

/// Location of a block's frame inside the journal.
#[derive(Clone, Copy, Debug)]
struct FrameLocation {
    offset: u64,
    length: u32,
}

struct Journal {
    writer: BufWriter<File>,
    offset: u64,
    infos: Vec<BlockInfo>,
    blocks: BTreeMap<u64, FrameLocation>,
}

/// Directory-backed block storage.
///
/// Blocks and block infos are appended to a single CRC-framed journal; the
/// in-memory index is rebuilt on open by reading the journal front to back.
/// A torn tail (from a crash mid-write) is truncated away.
pub struct FileStorage {
    dir: PathBuf,
    journal: Mutex<Journal>,
}

impl FileStorage {
    /// Open (or create) storage in `dir`.
    pub fn open(dir: &Path) -> LogResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let (infos, blocks, good_len) = recover(&path)?;
        let file_len = file.metadata()?.len();
        if good_len < file_len {
            warn!(
                path = %path.display(),
                good_len,
                file_len,
                "truncating torn journal tail"
            );
            file.set_len(good_len)?;
        }

        debug!(path = %path.display(), blocks = blocks.len(), infos = infos.len(), "journal opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            journal: Mutex::new(Journal {
                writer: BufWriter::new(file),
                offset: good_len,
                infos,
                blocks,
            }),
        })
    }

    /// Directory holding this feed's files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn append(journal: &mut Journal, record: &JournalRecord) -> LogResult<FrameLocation> {
        let payload =
            bincode::serialize(record).map_err(|e| LogError::Serialization(e.to_string()))?;
        let length = payload.len() as u32;
        let crc = crc32fast::hash(&payload);

        let location = FrameLocation {
            offset: journal.offset,
            length,
        };
        journal.writer.write_all(&length.to_le_bytes())?;
        journal.writer.write_all(&crc.to_le_bytes())?;
        journal.writer.write_all(&payload)?;
        journal.writer.flush()?;
        journal.offset += HEADER_SIZE + payload.len() as u64;
        Ok(location)
    }
}

/// Rebuild the index from the journal. Returns the infos, the block
/// locations, and the length of the valid prefix of the file.
fn recover(path: &Path) -> LogResult<(Vec<BlockInfo>, BTreeMap<u64, FrameLocation>, u64)> {
    let mut file = BufReader::new(File::open(path)?);
    let file_len = file.get_ref().metadata()?.len();
    let mut infos = Vec::new();
    let mut blocks = BTreeMap::new();
    let mut offset = 0u64;

    while offset + HEADER_SIZE <= file_len {
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if length == 0 || offset + HEADER_SIZE + length as u64 > file_len {
            warn!(offset, length, file_len, "invalid journal frame length; stopping recovery");
            break;
        }

        let mut payload = vec![0u8; length as usize];
        file.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != expected_crc {
            warn!(offset, "journal CRC mismatch; stopping recovery");
            break;
        }

        match bincode::deserialize::<JournalRecord>(&payload) {
            Ok(JournalRecord::Infos { from, infos: batch }) => {
                for (i, info) in batch.into_iter().enumerate() {
                    set_info(&mut infos, from + i as u64, info);
                }
            }
            Ok(JournalRecord::Block { index, data }) => {
                set_info(&mut infos, index, BlockInfo::of(&data));
                blocks.insert(index, FrameLocation { offset, length });
            }
            Err(e) => {
                warn!(offset, error = %e, "undecodable journal frame; stopping recovery");
                break;
            }
        }
        offset += HEADER_SIZE + length as u64;
    }

    Ok((infos, blocks, offset))
}

impl BlockStorage for FileStorage {
    fn load(&self) -> LogResult<StoredFeed> {
        let keys = match fs::read(self.dir.join(KEY_FILE)) {
            Ok(bytes) => Some(
                bincode::deserialize::<KeyPair>(&bytes)
                    .map_err(|e| LogError::Serialization(e.to_string()))?,
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let journal = self.journal.lock().expect("journal mutex poisoned");
        Ok(StoredFeed {
            keys,
            infos: journal.infos.clone(),
            present: journal.blocks.keys().copied().collect(),
        })
    }

    fn write_key(&self, keys: &KeyPair) -> LogResult<()> {
        let bytes = bincode::serialize(keys).map_err(|e| LogError::Serialization(e.to_string()))?;
        let tmp = self.dir.join(format!("{KEY_FILE}.tmp"));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, self.dir.join(KEY_FILE))?;
        Ok(())
    }

    fn put_infos(&self, from: u64, infos: &[BlockInfo]) -> LogResult<()> {
        if infos.is_empty() {
            return Ok(());
        }
        let mut journal = self.journal.lock().expect("journal mutex poisoned");
        Self::append(
            &mut journal,
            &JournalRecord::Infos {
                from,
                infos: infos.to_vec(),
            },
        )?;
        for (i, info) in infos.iter().enumerate() {
            set_info(&mut journal.infos, from + i as u64, *info);
        }
        Ok(())
    }

    fn put_block(&self, index: u64, data: &[u8]) -> LogResult<()> {
        let mut journal = self.journal.lock().expect("journal mutex poisoned");
        if journal.blocks.contains_key(&index) {
            return Ok(());
        }
        let location = Self::append(
            &mut journal,
            &JournalRecord::Block {
                index,
                data: data.to_vec(),
            },
        )?;
        set_info(&mut journal.infos, index, BlockInfo::of(data));
        journal.blocks.insert(index, location);
        Ok(())
    }

    fn get_block(&self, index: u64) -> LogResult<Option<Bytes>> {
        let location = {
            let journal = self.journal.lock().expect("journal mutex poisoned");
            match journal.blocks.get(&index) {
                Some(location) => *location,
                None => return Ok(None),
            }
        };

        let mut file = File::open(self.dir.join(JOURNAL_FILE))?;
        file.seek(SeekFrom::Start(location.offset + HEADER_SIZE))?;
        let mut payload = vec![0u8; location.length as usize];
        file.read_exact(&mut payload)?;

        match bincode::deserialize::<JournalRecord>(&payload) {
            Ok(JournalRecord::Block { index: stored, data }) if stored == index => {
                Ok(Some(Bytes::from(data)))
            }
            Ok(_) => Err(LogError::Corrupt {
                offset: location.offset,
                reason: format!("frame does not hold block {index}"),
            }),
            Err(e) => Err(LogError::Corrupt {
                offset: location.offset,
                reason: e.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage").field("dir", &self.dir).finish()
    }
}
