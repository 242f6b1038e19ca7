//! Normalization from raw source JSON into the canonical [`AnimeRecord`]
//! shape. Pure functions, no store access. Shared by the HTTP gateway and
//! the snapshot decoder, so both tolerate the same field spellings.

use crate::database::{AnimeRecord, EpisodeRecord};
use crate::error::AppError;
use serde_json::Value;

/// Normalize one raw anime object. `url` and `name` are required non-empty
/// strings; everything else is optional and absent fields degrade to empty.
pub fn anime_from_value(value: &Value) -> Result<AnimeRecord, AppError> {
    let obj = value
        .as_object()
        .ok_or_else(|| AppError::Normalize("anime entry is not an object".to_string()))?;

    let url = required_str(obj, "url")?;
    let name = required_str(obj, "name")?;

    let episodes = match obj.get("episodes").and_then(|v| v.as_array()) {
        Some(entries) => {
            let mut episodes = Vec::with_capacity(entries.len());
            for entry in entries {
                episodes.push(episode_from_value(entry)?);
            }
            episodes
        }
        None => Vec::new(),
    };

    Ok(AnimeRecord {
        url,
        name,
        cover: optional_str(obj, "cover"),
        state: optional_str(obj, "state"),
        kind: optional_str(obj, "type"),
        genres: string_list(obj, "genres"),
        relations: string_list(obj, "relations"),
        episodes,
    })
}

pub fn episode_from_value(value: &Value) -> Result<EpisodeRecord, AppError> {
    let obj = value
        .as_object()
        .ok_or_else(|| AppError::Normalize("episode entry is not an object".to_string()))?;
    Ok(EpisodeRecord {
        url: required_str(obj, "url")?,
        number: obj.get("number").and_then(|v| v.as_f64()),
        cover: optional_str(obj, "cover"),
    })
}

fn required_str(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<String, AppError> {
    match obj.get(key).and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => Ok(s.to_string()),
        _ => Err(AppError::Normalize(format!("missing field \"{}\"", key))),
    }
}

fn optional_str(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn string_list(obj: &serde_json::Map<String, Value>, key: &str) -> Vec<String> {
    obj.get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_full_record() {
        let value = json!({
            "url": "/anime/abc",
            "name": "ABC",
            "cover": "/img/abc.jpg",
            "state": "Airing",
            "type": "TV",
            "genres": ["Action", "Drama"],
            "relations": ["/anime/def"],
            "episodes": [{"url": "/ep/abc-1", "number": 1.0, "cover": "/img/abc-1.jpg"}]
        });
        let record = anime_from_value(&value).unwrap();
        assert_eq!(record.url, "/anime/abc");
        assert_eq!(record.kind.as_deref(), Some("TV"));
        assert_eq!(record.genres, vec!["Action", "Drama"]);
        assert_eq!(record.episodes.len(), 1);
        assert_eq!(record.episodes[0].number, Some(1.0));
    }

    #[test]
    fn test_missing_url_is_rejected() {
        let value = json!({"name": "No Url"});
        assert!(anime_from_value(&value).is_err());
    }

    #[test]
    fn test_missing_name_is_rejected() {
        let value = json!({"url": "/anime/x", "name": ""});
        assert!(anime_from_value(&value).is_err());
    }

    #[test]
    fn test_absent_lists_degrade_to_empty() {
        let value = json!({"url": "/anime/x", "name": "X"});
        let record = anime_from_value(&value).unwrap();
        assert!(record.genres.is_empty());
        assert!(record.relations.is_empty());
        assert!(record.episodes.is_empty());
    }

    #[test]
    fn test_non_object_entry_is_rejected() {
        assert!(anime_from_value(&json!([1, 2, 3])).is_err());
        assert!(anime_from_value(&json!("x")).is_err());
    }
}
