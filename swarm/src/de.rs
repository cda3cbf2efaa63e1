use serde::{de, Deserialize};
use url::Url;

// Deserialiser functions for metainfo.
// Tracker urls are advisory, so malformed ones are dropped instead of failing the torrent.

pub fn announce_deserialize<'de, D>(deserializer: D) -> Result<Option<Url>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|s| parse_tracker(&s)))
}

pub fn announce_list_deserialize<'de, D>(deserializer: D) -> Result<Vec<Vec<Url>>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let raw = Option::<Vec<Vec<String>>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .map(|tier| tier.iter().filter_map(|s| parse_tracker(s)).collect::<Vec<_>>())
        .filter(|tier| !tier.is_empty())
        .collect())
}

fn parse_tracker(s: &str) -> Option<Url> {
    match Url::parse(s) {
        Ok(url) => Some(url),
        Err(e) => {
            tracing::debug!("ignoring tracker {:?}: {}", s, e);
            None
        },
    }
}
