use serde::{Deserialize, Serialize};

/// A catalog anime as stored, with taxonomy references resolved to labels.
///
/// `aid` is the local sequence id; `url` is the stable external identifier
/// assigned by the source and is unique across the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anime {
    pub aid: i64,
    pub url: String,
    pub name: String,
    pub cover: Option<String>,
    pub state: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub genres: Vec<String>,
    /// External ids of cross-referenced animes (sequels, prequels, …),
    /// in source order. May point at animes not fetched yet.
    pub relations: Vec<String>,
    pub added_date: String,
    pub updated_date: Option<String>,
}

/// A single installment, owned by exactly one anime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub aid: i64,
    pub url: String,
    pub number: Option<f64>,
    pub cover: Option<String>,
}

/// One row of a flat reference table (`states`, `types`, `genres`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taxonomy {
    pub id: i64,
    pub label: String,
}

/// Canonical normalized shape of a fetched or restored anime, before it has
/// a local id. Taxonomy fields travel as labels, never environment-specific
/// ids. Episodes may be absent (snapshot entries omit them by design).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnimeRecord {
    pub url: String,
    pub name: String,
    pub cover: Option<String>,
    pub state: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub relations: Vec<String>,
    #[serde(default)]
    pub episodes: Vec<EpisodeRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub url: String,
    pub number: Option<f64>,
    pub cover: Option<String>,
}

/// Catalog counters for the CLI summary line.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogStats {
    pub animes: i64,
    pub episodes: i64,
    pub relations: i64,
}
