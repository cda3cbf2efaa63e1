// Builders shared by the unit tests.
use std::collections::HashMap;
use serde_bencode::value::Value;
use crate::InfoHash;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// Single file info dict, 16 KiB pieces with a fixed piece hash.
pub fn info(name: &str, len: i64) -> Value {
    Value::Dict(HashMap::from([
        (b"length".to_vec(), Value::Int(len)),
        (b"name".to_vec(), Value::Bytes(name.as_bytes().to_vec())),
        (b"piece length".to_vec(), Value::Int(16384)),
        (b"pieces".to_vec(), Value::Bytes(vec![0xab; 20])),
    ]))
}

// Bencoded .torrent with one http tracker.
pub fn torrent(name: &str, len: i64) -> Vec<u8> {
    let torrent = Value::Dict(HashMap::from([
        (b"announce".to_vec(), Value::Bytes(b"http://tracker.example/announce".to_vec())),
        (b"info".to_vec(), info(name, len)),
    ]));
    serde_bencode::to_bytes(&torrent).expect("encode test torrent")
}

pub fn info_hash(torrent: &[u8]) -> InfoHash {
    crate::TorrentMeta::from_torrent(torrent.to_vec())
        .expect("decode test torrent")
        .info_hash
}
