use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};
use serde_derive::{Deserialize, Serialize};
use sha1::Digest;
use url::Url;
use crate::InfoHash;

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {

    #[error("bencode error whilst encoding info dict: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("nothing to seed at {0}")]
    Empty(PathBuf),

    #[error("path is not valid utf-8: {0}")]
    NonUtf8Path(PathBuf),

    #[error("not a magnet link: {0}")]
    NotMagnet(String),

    #[error("magnet link has no btih topic")]
    MissingTopic,

}

type Result<T> = std::result::Result<T, DescriptorError>;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct File {

    // Length of the file in bytes.
    pub length: u64,

    // Path components relative to the torrent directory.
    pub path: Vec<String>,

}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Info {

    // A list of dictionaries, one for each file. Absent for single file torrents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,

    // Length of the file in bytes, single file torrents only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,

    // Suggested file or directory name.
    pub name: String,

    // Number of bytes in each piece.
    #[serde(rename = "piece length")]
    pub piece_length: u32,

    // Concatenation of all 20-byte SHA1 piece hashes.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

}

impl Info {

    // Walks `path`, hashing every file in sorted order as one continuous stream.
    // Blocking, run it off the async runtime.
    pub fn from_path(path: &Path, piece_length: u32) -> Result<Info> {

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DescriptorError::NonUtf8Path(path.to_path_buf()))?
            .to_string();

        let single = fs::metadata(path)?.is_file();
        let mut entries = Vec::new();
        if single {
            entries.push((path.to_path_buf(), Vec::new()));
        } else {
            collect_files(path, &mut Vec::new(), &mut entries)?;
            entries.sort_by(|a, b| a.1.cmp(&b.1));
        }

        let mut hasher = PieceHasher::new(piece_length as usize);
        let mut files = Vec::with_capacity(entries.len());
        for (file_path, components) in entries {
            let length = hasher.hash_file(&file_path)?;
            if length == 0 {
                continue;
            }
            files.push(File { length, path: components });
        }

        let total: u64 = files.iter().map(|f| f.length).sum();
        if total == 0 {
            return Err(DescriptorError::Empty(path.to_path_buf()));
        }

        let (length, files) = if single { (Some(total), None) } else { (None, Some(files)) };
        Ok(Info {
            files,
            length,
            name,
            piece_length,
            pieces: hasher.finish(),
        })
    }

    // Calculates the sha1 hash of the bencoded info dict.
    pub fn info_hash(&self) -> Result<InfoHash> {
        let mut hasher = sha1::Sha1::new();
        hasher.update(serde_bencode::to_bytes(self)?);
        Ok(InfoHash(hasher.finalize().into()))
    }
}

// Everything needed to register local content with the engine and share it.
#[derive(Debug, Clone)]
pub struct Descriptor {

    pub info: Info,

    pub info_bytes: Vec<u8>,

    pub info_hash: InfoHash,

    pub trackers: Vec<Vec<Url>>,

    // Directory the info dict's file paths are relative to.
    pub root: PathBuf,

    pub creation_date: i64,

}

impl Descriptor {

    pub fn build(path: &Path, piece_length: u32, trackers: Vec<Vec<Url>>) -> Result<Descriptor> {
        let info = Info::from_path(path, piece_length)?;
        let info_bytes = serde_bencode::to_bytes(&info)?;
        let info_hash = info.info_hash()?;
        let root = if info.files.is_some() {
            path.to_path_buf()
        } else {
            path.parent().map(Path::to_path_buf).unwrap_or_default()
        };
        tracing::debug!("built descriptor {} for {}", info_hash, path.display());

        Ok(Descriptor {
            info,
            info_bytes,
            info_hash,
            trackers,
            root,
            creation_date: chrono::Utc::now().timestamp(),
        })
    }

    pub fn magnet(&self) -> String {
        let mut uri = format!(
            "magnet:?xt=urn:btih:{}&dn={}",
            self.info_hash,
            urlencoding::encode(&self.info.name),
        );
        for url in self.trackers.iter().flatten() {
            uri.push_str("&tr=");
            uri.push_str(&urlencoding::encode(url.as_str()));
        }
        uri
    }
}

// The parts of a magnet link the client cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {

    // None when the topic is base32 encoded, the engine resolves those.
    pub info_hash: Option<InfoHash>,

    pub name: Option<String>,

    pub trackers: Vec<String>,

}

impl MagnetLink {

    pub fn parse(uri: &str) -> Result<MagnetLink> {
        let url = Url::parse(uri.trim()).map_err(|_| DescriptorError::NotMagnet(uri.to_string()))?;
        if url.scheme() != "magnet" {
            return Err(DescriptorError::NotMagnet(uri.to_string()));
        }

        let mut topic = None;
        let mut name = None;
        let mut trackers = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if let Some(hash) = value.strip_prefix("urn:btih:") {
                        topic = Some(hash.to_string());
                    }
                }
                "dn" => name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                _ => {}
            }
        }

        let topic = topic.ok_or(DescriptorError::MissingTopic)?;
        let info_hash = match topic.len() {
            40 => Some(topic.parse().map_err(|_| DescriptorError::MissingTopic)?),
            32 => None,
            _ => return Err(DescriptorError::MissingTopic),
        };

        Ok(MagnetLink { info_hash, name, trackers })
    }
}

fn collect_files(dir: &Path, prefix: &mut Vec<String>, out: &mut Vec<(PathBuf, Vec<String>)>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry
            .file_name()
            .into_string()
            .map_err(|_| DescriptorError::NonUtf8Path(entry.path()))?;
        prefix.push(name);
        if entry.file_type()?.is_dir() {
            collect_files(&entry.path(), prefix, out)?;
        } else {
            out.push((entry.path(), prefix.clone()));
        }
        prefix.pop();
    }
    Ok(())
}

// Hashes a stream of files into fixed length pieces, pieces may span files.
struct PieceHasher {
    piece_len: usize,
    buf: Vec<u8>,
    pieces: Vec<u8>,
}

impl PieceHasher {

    fn new(piece_len: usize) -> Self {
        Self {
            piece_len,
            buf: Vec::with_capacity(piece_len),
            pieces: Vec::new(),
        }
    }

    fn hash_file(&mut self, path: &Path) -> Result<u64> {
        let mut file = fs::File::open(path)?;
        let mut chunk = vec![0; self.piece_len];
        let mut total = 0;
        loop {
            let want = self.piece_len - self.buf.len();
            let n = file.read(&mut chunk[..want])?;
            if n == 0 {
                break;
            }
            total += n as u64;
            self.buf.extend_from_slice(&chunk[..n]);
            if self.buf.len() == self.piece_len {
                self.flush();
            }
        }
        Ok(total)
    }

    fn flush(&mut self) {
        let mut hasher = sha1::Sha1::new();
        hasher.update(&self.buf);
        self.pieces.extend_from_slice(&hasher.finalize());
        self.buf.clear();
    }

    fn finish(mut self) -> Vec<u8> {
        if !self.buf.is_empty() {
            self.flush();
        }
        self.pieces
    }
}
