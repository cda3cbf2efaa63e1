use std::{collections::HashMap, fmt, str::FromStr};
use serde_bencode::value::Value;
use serde_derive::Deserialize;
use sha1::{Digest, Sha1};
use url::Url;
use crate::source::Resolved;

pub type Result<T> = std::result::Result<T, MetaInfoError>;

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("metainfo has no info dictionary")]
    MissingInfo,

    #[error("invalid magnet link: {0}")]
    InvalidMagnet(String),

    #[error("invalid info hash: {0}")]
    InvalidInfoHash(String),

}

// 20 byte SHA1 hash of a torrent's info dictionary, the identity of its content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {

    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    // Decodes the 32 character base32 form found in older magnet links.
    fn from_base32(s: &str) -> Option<Self> {
        const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
        if s.len() != 32 {
            return None;
        }

        let mut bytes = [0u8; 20];
        let mut acc: u64 = 0;
        let mut bits = 0;
        let mut i = 0;
        for c in s.bytes() {
            let value = ALPHABET.iter().position(|&a| a == c.to_ascii_uppercase())?;
            acc = (acc << 5) | value as u64;
            bits += 5;
            if bits >= 8 {
                bits -= 8;
                bytes[i] = (acc >> bits) as u8;
                i += 1;
            }
        }
        Some(Self(bytes))
    }

}

impl From<[u8; 20]> for InfoHash {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl FromStr for InfoHash {
    type Err = MetaInfoError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || MetaInfoError::InvalidInfoHash(s.to_string());
        match s.len() {
            40 => {
                let mut bytes = [0u8; 20];
                hex::decode_to_slice(s, &mut bytes).map_err(|_| invalid())?;
                Ok(Self(bytes))
            },
            32 => Self::from_base32(s).ok_or_else(invalid),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InfoHash({})", self)
    }
}

// Only the parts of a metainfo file needed before a session exists.
#[derive(Deserialize)]
struct RawTorrent {

    #[serde(default)]
    #[serde(deserialize_with = "crate::de::announce_deserialize")]
    announce: Option<Url>,

    #[serde(default)]
    #[serde(rename = "announce-list")]
    #[serde(deserialize_with = "crate::de::announce_list_deserialize")]
    announce_list: Vec<Vec<Url>>,

    // Kept as a raw value so the hash covers keys this crate doesn't know about.
    #[serde(default)]
    info: Option<Value>,

}

// What is known about a torrent once its source has been resolved.
#[derive(Debug, Clone)]
pub struct TorrentMeta {

    pub info_hash: InfoHash,

    // Suggested name, from the info dict or a magnet's `dn`.
    pub name: Option<String>,

    // Announce urls, de-duplicated, in announce then announce-list order.
    pub trackers: Vec<Url>,

    // Total content length, unknown for magnets.
    pub total_len: Option<u64>,

    pub source: Resolved,

}

impl TorrentMeta {

    pub fn from_resolved(source: Resolved) -> Result<Self> {
        match source {
            Resolved::Torrent(data) => Self::from_torrent(data),
            Resolved::Magnet(link) => Self::from_magnet(link),
        }
    }

    pub fn from_torrent(data: Vec<u8>) -> Result<Self> {
        let raw: RawTorrent = serde_bencode::from_bytes(&data)?;
        let info = raw.info.ok_or(MetaInfoError::MissingInfo)?;
        let Value::Dict(dict) = &info else {
            return Err(MetaInfoError::MissingInfo);
        };

        let info_hash = InfoHash(Sha1::digest(serde_bencode::to_bytes(&info)?).into());
        let name = match dict.get(b"name".as_slice()) {
            Some(Value::Bytes(name)) => Some(String::from_utf8_lossy(name).into_owned()),
            _ => None,
        };
        let total_len = total_len(dict);

        let mut trackers = Vec::new();
        for url in raw.announce.into_iter().chain(raw.announce_list.into_iter().flatten()) {
            if !trackers.contains(&url) {
                trackers.push(url);
            }
        }

        tracing::debug!("peeked torrent {} ({:?}), {} trackers", info_hash, name, trackers.len());
        Ok(Self {
            info_hash,
            name,
            trackers,
            total_len,
            source: Resolved::Torrent(data),
        })
    }

    pub fn from_magnet(link: String) -> Result<Self> {
        let url = Url::parse(&link).map_err(|e| MetaInfoError::InvalidMagnet(e.to_string()))?;
        if url.scheme() != "magnet" {
            return Err(MetaInfoError::InvalidMagnet(format!("unexpected scheme {}", url.scheme())));
        }

        let mut info_hash = None;
        let mut name = None;
        let mut trackers = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" if info_hash.is_none() => {
                    if let Some(hash) = value.strip_prefix("urn:btih:") {
                        info_hash = Some(hash.parse::<InfoHash>()?);
                    }
                },
                "dn" => name = Some(value.into_owned()),
                "tr" => match Url::parse(&value) {
                    Ok(tracker) if !trackers.contains(&tracker) => trackers.push(tracker),
                    Ok(_) => {},
                    Err(e) => tracing::debug!("ignoring magnet tracker {:?}: {}", value, e),
                },
                _ => {},
            }
        }

        let info_hash = info_hash
            .ok_or_else(|| MetaInfoError::InvalidMagnet("no urn:btih exact topic".to_string()))?;
        tracing::debug!("peeked magnet {} ({:?}), {} trackers", info_hash, name, trackers.len());
        Ok(Self {
            info_hash,
            name,
            trackers,
            total_len: None,
            source: Resolved::Magnet(link),
        })
    }

    pub fn is_magnet(&self) -> bool {
        matches!(self.source, Resolved::Magnet(_))
    }

}

// Single file torrents carry `length`, multi file ones a `length` per entry of `files`.
fn total_len(info: &HashMap<Vec<u8>, Value>) -> Option<u64> {
    let as_len = |value: Option<&Value>| match value {
        Some(Value::Int(n)) => u64::try_from(*n).ok(),
        _ => None,
    };

    if let Some(len) = as_len(info.get(b"length".as_slice())) {
        return Some(len);
    }
    match info.get(b"files".as_slice()) {
        Some(Value::List(files)) => files
            .iter()
            .map(|file| match file {
                Value::Dict(file) => as_len(file.get(b"length".as_slice())),
                _ => None,
            })
            .sum(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;
    use super::*;
    use crate::test_util;

    const ALPHA_HASH: InfoHash = InfoHash::new(hex!("995b7aa8884ab582e13ef9f2df6565cd646babbf"));

    #[test]
    fn test_info_hash_of_known_torrent() {
        let meta = TorrentMeta::from_torrent(test_util::torrent("alpha.bin", 1024)).unwrap();
        assert_eq!(meta.info_hash, ALPHA_HASH);
        assert_eq!(meta.name.as_deref(), Some("alpha.bin"));
        assert_eq!(meta.total_len, Some(1024));
        assert_eq!(meta.trackers, vec![Url::parse("http://tracker.example/announce").unwrap()]);
        assert!(!meta.is_magnet());
    }

    #[test]
    fn test_different_info_different_hash() {
        let a = TorrentMeta::from_torrent(test_util::torrent("alpha.bin", 1024)).unwrap();
        let b = TorrentMeta::from_torrent(test_util::torrent("alpha.bin", 2048)).unwrap();
        assert_ne!(a.info_hash, b.info_hash);
    }

    #[test]
    fn test_multi_file_length() {
        let file = |len: i64| {
            Value::Dict(HashMap::from([
                (b"length".to_vec(), Value::Int(len)),
                (b"path".to_vec(), Value::List(vec![Value::Bytes(b"a".to_vec())])),
            ]))
        };
        let info = HashMap::from([
            (b"name".to_vec(), Value::Bytes(b"dir".to_vec())),
            (b"files".to_vec(), Value::List(vec![file(100), file(23)])),
        ]);
        assert_eq!(total_len(&info), Some(123));
    }

    #[test]
    fn test_announce_list_merged_and_bad_urls_skipped() {
        let torrent = Value::Dict(HashMap::from([
            (b"announce".to_vec(), Value::Bytes(b"http://a.example/announce".to_vec())),
            (
                b"announce-list".to_vec(),
                Value::List(vec![
                    Value::List(vec![
                        Value::Bytes(b"http://a.example/announce".to_vec()),
                        Value::Bytes(b"not a url".to_vec()),
                    ]),
                    Value::List(vec![Value::Bytes(b"udp://b.example:80".to_vec())]),
                ]),
            ),
            (b"info".to_vec(), test_util::info("alpha.bin", 1024)),
        ]));
        let meta = TorrentMeta::from_torrent(serde_bencode::to_bytes(&torrent).unwrap()).unwrap();
        assert_eq!(meta.info_hash, ALPHA_HASH);
        assert_eq!(
            meta.trackers,
            vec![
                Url::parse("http://a.example/announce").unwrap(),
                Url::parse("udp://b.example:80").unwrap(),
            ]
        );
    }

    #[test]
    fn test_missing_info() {
        let torrent = Value::Dict(HashMap::from([
            (b"announce".to_vec(), Value::Bytes(b"http://a.example/announce".to_vec())),
        ]));
        let err = TorrentMeta::from_torrent(serde_bencode::to_bytes(&torrent).unwrap()).unwrap_err();
        assert!(matches!(err, MetaInfoError::MissingInfo));
    }

    #[test]
    fn test_garbage_is_bencode_error() {
        let err = TorrentMeta::from_torrent(b"this is not bencode".to_vec()).unwrap_err();
        assert!(matches!(err, MetaInfoError::Bencode(_)));
    }

    #[test]
    fn test_magnet_hex_and_base32_agree() {
        let hex = TorrentMeta::from_magnet(
            "magnet:?xt=urn:btih:C12FE1C06BBA254A9DC9F519B335AA7C1367A88A&dn=Some+Name&tr=udp%3A%2F%2Ftracker.example%3A1337"
                .to_string(),
        )
        .unwrap();
        let base32 = TorrentMeta::from_magnet(
            "magnet:?xt=urn:btih:YEX6DQDLXISUVHOJ6UM3GNNKPQJWPKEK".to_string(),
        )
        .unwrap();

        assert_eq!(hex.info_hash, InfoHash::new(hex!("c12fe1c06bba254a9dc9f519b335aa7c1367a88a")));
        assert_eq!(hex.info_hash, base32.info_hash);
        assert_eq!(hex.name.as_deref(), Some("Some Name"));
        assert_eq!(hex.trackers, vec![Url::parse("udp://tracker.example:1337").unwrap()]);
        assert_eq!(hex.total_len, None);
        assert!(hex.is_magnet());
    }

    #[test]
    fn test_invalid_magnets() {
        let no_topic = TorrentMeta::from_magnet("magnet:?dn=nothing".to_string()).unwrap_err();
        assert!(matches!(no_topic, MetaInfoError::InvalidMagnet(_)));

        let bad_hash = TorrentMeta::from_magnet("magnet:?xt=urn:btih:abc".to_string()).unwrap_err();
        assert!(matches!(bad_hash, MetaInfoError::InvalidInfoHash(_)));
    }

    #[test]
    fn test_info_hash_display_round_trip() {
        let text = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";
        let hash: InfoHash = text.parse().unwrap();
        assert_eq!(hash.to_string(), text);
        assert!("zz2fe1c06bba254a9dc9f519b335aa7c1367a88a".parse::<InfoHash>().is_err());
        assert!("0189".parse::<InfoHash>().is_err());
    }
}
