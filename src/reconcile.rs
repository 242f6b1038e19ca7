//! Reconciliation engine: resolves the source's recent-episode feed against
//! the local catalog, fetching and creating missing animes (and their
//! one-hop related animes) on demand, and rebuilds the full directory in
//! bulk.

use crate::batch::{run_batch, BatchReport};
use crate::database::{Anime, Database, Episode};
use crate::error::AppError;
use crate::gateway::SourceGateway;
use serde::Serialize;
use std::collections::HashSet;

/// Fully materialized view of one recent episode. Explicit projection —
/// deliberately not the persistence row shape.
#[derive(Debug, Clone, Serialize)]
pub struct RecentEpisode {
    pub url: String,
    pub number: Option<f64>,
    pub cover: Option<String>,
    pub anime: RecentAnime,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentAnime {
    pub name: String,
    pub cover: Option<String>,
    pub aid: i64,
}

pub struct Reconciler<'a, G> {
    db: &'a Database,
    gateway: &'a G,
}

impl<'a, G: SourceGateway> Reconciler<'a, G> {
    pub fn new(db: &'a Database, gateway: &'a G) -> Self {
        Self { db, gateway }
    }

    /// Resolve an ordered batch of recent-episode external ids into views.
    ///
    /// Per id: a locally known episode is emitted straight from the store
    /// (no gateway access). Otherwise the owner is resolved at the source;
    /// an unresolvable id is dropped silently. A known owner is refreshed
    /// in place, a new owner is created together with its one-hop related
    /// animes. Output preserves input order; the whole call is one unit of
    /// work, so a propagated gateway fault leaves the store untouched.
    pub async fn resolve_recents(
        &self,
        links: &[String],
    ) -> Result<Vec<RecentEpisode>, AppError> {
        let uow = self.db.begin()?;
        let mut recents = Vec::new();

        for link in links {
            if let Some(episode) = self.db.find_episode_by_url(link)? {
                recents.push(self.project(episode)?);
                continue;
            }

            let anime_url = match self.gateway.resolve_episode_owner(link).await? {
                Some(url) => url,
                None => {
                    log::info!("Dropping unresolvable episode {}", link);
                    continue;
                }
            };

            match self.db.find_anime_by_url(&anime_url)? {
                Some(existing) => {
                    let record = self.gateway.fetch_anime(&anime_url).await?;
                    self.db.update_anime(existing.aid, &record)?;

                    // Still missing after a refresh means the source and the
                    // normalizer disagree about this anime; surface it.
                    let episode = self.db.find_episode_by_url(link)?.ok_or_else(|| {
                        AppError::Other(format!(
                            "episode {} missing after refresh of {}",
                            link, anime_url
                        ))
                    })?;
                    recents.push(self.project(episode)?);
                }
                None => {
                    let record = self.gateway.fetch_anime(&anime_url).await?;
                    let anime = self.db.create_anime(&record)?;

                    let episode = self.db.find_episode_by_url(link)?.ok_or_else(|| {
                        AppError::Other(format!(
                            "episode {} missing after create of {}",
                            link, anime_url
                        ))
                    })?;
                    recents.push(self.project(episode)?);

                    self.cascade_relations(&anime).await?;
                }
            }
        }

        uow.commit()?;
        Ok(recents)
    }

    /// Materialize the direct relations of a freshly created anime: refresh
    /// the ones already stored, create the absent ones. One hop only —
    /// relations of relations are left for their own first contact.
    async fn cascade_relations(&self, anime: &Anime) -> Result<(), AppError> {
        for url in &anime.relations {
            match self.db.find_anime_by_url(url)? {
                Some(existing) => {
                    let record = self.gateway.fetch_anime(url).await?;
                    self.db.update_anime(existing.aid, &record)?;
                }
                None => {
                    let record = self.gateway.fetch_anime(url).await?;
                    self.db.create_anime(&record)?;
                }
            }
        }
        Ok(())
    }

    fn project(&self, episode: Episode) -> Result<RecentEpisode, AppError> {
        let anime = self.db.get_anime(episode.aid)?.ok_or_else(|| {
            AppError::Database(format!(
                "episode {} references missing anime {}",
                episode.url, episode.aid
            ))
        })?;
        Ok(RecentEpisode {
            url: episode.url,
            number: episode.number,
            cover: episode.cover,
            anime: RecentAnime {
                name: anime.name,
                cover: anime.cover,
                aid: anime.aid,
            },
        })
    }

    /// Full directory build: fetch every anime the source lists that the
    /// catalog does not have yet. Fetch and persistence failures are
    /// recorded per item; the batch always runs to completion.
    pub async fn build_directory(&self) -> Result<BatchReport, AppError> {
        let links = self.gateway.list_anime_urls().await?;
        let saved: HashSet<String> = self.db.list_anime_urls()?.into_iter().collect();

        log::info!(
            "Directory build: {} listed, {} already stored",
            links.len(),
            saved.len()
        );

        let mut fetch_errors = Vec::new();
        let mut records = Vec::new();
        for link in links.iter().filter(|l| !saved.contains(*l)) {
            match self.gateway.fetch_anime(link).await {
                Ok(record) => records.push(record),
                Err(e) => {
                    fetch_errors.push(format!("Error saving anime \"{}\": {}", e, link));
                }
            }
        }

        let mut report = run_batch(self.db, &records, |r| &r.url, |r| {
            self.db.create_anime(r)?;
            Ok(())
        })?;

        // Fetch-phase failures happened first
        fetch_errors.append(&mut report.errors);
        report.errors = fetch_errors;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{AnimeRecord, EpisodeRecord};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// In-memory gateway with call accounting.
    #[derive(Default)]
    struct FakeGateway {
        animes: HashMap<String, AnimeRecord>,
        owners: HashMap<String, String>,
        directory: Vec<String>,
        fetch_calls: Mutex<Vec<String>>,
        owner_calls: Mutex<Vec<String>>,
        broken_urls: Vec<String>,
    }

    impl FakeGateway {
        fn with_anime(mut self, record: AnimeRecord) -> Self {
            for ep in &record.episodes {
                self.owners.insert(ep.url.clone(), record.url.clone());
            }
            self.animes.insert(record.url.clone(), record);
            self
        }

        fn broken(mut self, url: &str) -> Self {
            self.broken_urls.push(url.to_string());
            self
        }

        fn fetch_count(&self) -> usize {
            self.fetch_calls.lock().unwrap().len()
        }

        fn owner_count(&self) -> usize {
            self.owner_calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SourceGateway for FakeGateway {
        async fn fetch_anime(&self, url: &str) -> Result<AnimeRecord, AppError> {
            self.fetch_calls.lock().unwrap().push(url.to_string());
            if self.broken_urls.iter().any(|b| b == url) {
                return Err(AppError::Gateway("connection reset".to_string()));
            }
            self.animes
                .get(url)
                .cloned()
                .ok_or_else(|| AppError::NotFound(url.to_string()))
        }

        async fn resolve_episode_owner(
            &self,
            episode_url: &str,
        ) -> Result<Option<String>, AppError> {
            self.owner_calls.lock().unwrap().push(episode_url.to_string());
            Ok(self.owners.get(episode_url).cloned())
        }

        async fn list_anime_urls(&self) -> Result<Vec<String>, AppError> {
            Ok(self.directory.clone())
        }
    }

    fn setup_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path).unwrap();
        (db, temp_dir)
    }

    fn anime_record(url: &str, name: &str, episodes: &[&str]) -> AnimeRecord {
        AnimeRecord {
            url: url.to_string(),
            name: name.to_string(),
            cover: Some(format!("{}/cover.jpg", url)),
            state: Some("Airing".to_string()),
            kind: Some("TV".to_string()),
            genres: vec!["Action".to_string()],
            episodes: episodes
                .iter()
                .enumerate()
                .map(|(i, url)| EpisodeRecord {
                    url: url.to_string(),
                    number: Some((i + 1) as f64),
                    cover: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_cached_episode_makes_no_gateway_calls() {
        let (db, _temp) = setup_test_db();
        db.create_anime(&anime_record("/anime/abc", "ABC", &["/ep/123"]))
            .unwrap();

        let gateway = FakeGateway::default();
        let reconciler = Reconciler::new(&db, &gateway);

        let recents = reconciler
            .resolve_recents(&["/ep/123".to_string()])
            .await
            .unwrap();

        assert_eq!(recents.len(), 1);
        assert_eq!(recents[0].url, "/ep/123");
        assert_eq!(recents[0].anime.name, "ABC");
        assert_eq!(gateway.fetch_count(), 0);
        assert_eq!(gateway.owner_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_anime_is_created_with_relations() {
        let (db, _temp) = setup_test_db();

        let mut abc = anime_record("/anime/abc", "ABC", &["/ep/999"]);
        abc.relations = vec!["/anime/def".to_string()];
        let gateway = FakeGateway::default()
            .with_anime(abc)
            .with_anime(anime_record("/anime/def", "DEF", &[]));
        let reconciler = Reconciler::new(&db, &gateway);

        let recents = reconciler
            .resolve_recents(&["/ep/999".to_string()])
            .await
            .unwrap();

        assert_eq!(recents.len(), 1);
        assert_eq!(recents[0].anime.name, "ABC");
        assert_eq!(
            recents[0].anime.cover.as_deref(),
            Some("/anime/abc/cover.jpg")
        );

        let abc = db.find_anime_by_url("/anime/abc").unwrap().unwrap();
        assert_eq!(abc.relations, vec!["/anime/def"]);
        assert!(db.find_anime_by_url("/anime/def").unwrap().is_some());
        assert_eq!(db.stats().unwrap().animes, 2);
    }

    #[tokio::test]
    async fn test_unresolvable_episode_is_dropped_without_writes() {
        let (db, _temp) = setup_test_db();
        let gateway = FakeGateway::default();
        let reconciler = Reconciler::new(&db, &gateway);

        let recents = reconciler
            .resolve_recents(&["/ep/ghost".to_string()])
            .await
            .unwrap();

        assert!(recents.is_empty());
        assert_eq!(db.stats().unwrap().animes, 0);
        assert_eq!(db.stats().unwrap().episodes, 0);
        assert_eq!(gateway.owner_count(), 1);
        assert_eq!(gateway.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_known_anime_is_refreshed_in_place() {
        let (db, _temp) = setup_test_db();
        let stale = db
            .create_anime(&anime_record("/anime/abc", "ABC (old name)", &["/ep/1"]))
            .unwrap();

        // The source now has a second episode and a corrected name
        let gateway = FakeGateway::default().with_anime(anime_record(
            "/anime/abc",
            "ABC",
            &["/ep/1", "/ep/2"],
        ));
        let reconciler = Reconciler::new(&db, &gateway);

        let recents = reconciler
            .resolve_recents(&["/ep/2".to_string()])
            .await
            .unwrap();

        assert_eq!(recents.len(), 1);
        assert_eq!(recents[0].number, Some(2.0));
        assert_eq!(recents[0].anime.aid, stale.aid);
        assert_eq!(recents[0].anime.name, "ABC");

        let refreshed = db.find_anime_by_url("/anime/abc").unwrap().unwrap();
        assert_eq!(refreshed.aid, stale.aid);
        assert_eq!(refreshed.name, "ABC");
        assert_eq!(db.episodes_of(stale.aid).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_episode_still_missing_after_refresh_fails_loudly() {
        let (db, _temp) = setup_test_db();
        db.create_anime(&anime_record("/anime/abc", "ABC", &["/ep/1"]))
            .unwrap();

        // Owner resolution points at abc, but the fetched record does not
        // actually contain the episode
        let mut gateway =
            FakeGateway::default().with_anime(anime_record("/anime/abc", "ABC", &["/ep/1"]));
        gateway
            .owners
            .insert("/ep/phantom".to_string(), "/anime/abc".to_string());
        let reconciler = Reconciler::new(&db, &gateway);

        let result = reconciler.resolve_recents(&["/ep/phantom".to_string()]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_gateway_fault_during_cascade_rolls_back_everything() {
        let (db, _temp) = setup_test_db();

        let mut abc = anime_record("/anime/abc", "ABC", &["/ep/999"]);
        abc.relations = vec!["/anime/def".to_string()];
        let gateway = FakeGateway::default().with_anime(abc).broken("/anime/def");
        let reconciler = Reconciler::new(&db, &gateway);

        let result = reconciler.resolve_recents(&["/ep/999".to_string()]).await;
        assert!(result.is_err());

        // The parent creation must not survive the failed cascade
        assert!(db.find_anime_by_url("/anime/abc").unwrap().is_none());
        assert_eq!(db.stats().unwrap().animes, 0);
    }

    #[tokio::test]
    async fn test_worked_example_from_recent_feed() {
        // Feed ["/ep/123", "/ep/999"]: /ep/123 is cached, /ep/999 belongs
        // to the unknown /anime/abc which relates to /anime/def. Expect 2
        // views, 2 new animes, 1 new episode.
        let (db, _temp) = setup_test_db();
        db.create_anime(&anime_record("/anime/old", "Old", &["/ep/123"]))
            .unwrap();
        let before = db.stats().unwrap();

        let mut abc = anime_record("/anime/abc", "ABC", &["/ep/999"]);
        abc.relations = vec!["/anime/def".to_string()];
        let gateway = FakeGateway::default()
            .with_anime(abc)
            .with_anime(anime_record("/anime/def", "DEF", &[]));
        let reconciler = Reconciler::new(&db, &gateway);

        let recents = reconciler
            .resolve_recents(&["/ep/123".to_string(), "/ep/999".to_string()])
            .await
            .unwrap();

        assert_eq!(recents.len(), 2);
        assert_eq!(recents[0].url, "/ep/123");
        assert_eq!(recents[1].url, "/ep/999");
        assert_eq!(recents[1].anime.name, "ABC");

        let after = db.stats().unwrap();
        assert_eq!(after.animes, before.animes + 2);
        assert_eq!(after.episodes, before.episodes + 1);
    }

    #[tokio::test]
    async fn test_build_directory_skips_stored_and_records_failures() {
        let (db, _temp) = setup_test_db();
        db.create_anime(&anime_record("/anime/stored", "Stored", &[]))
            .unwrap();

        let mut gateway = FakeGateway::default()
            .with_anime(anime_record("/anime/new1", "New 1", &[]))
            .with_anime(anime_record("/anime/new2", "New 2", &[]))
            .broken("/anime/bad");
        gateway.directory = vec![
            "/anime/stored".to_string(),
            "/anime/new1".to_string(),
            "/anime/bad".to_string(),
            "/anime/new2".to_string(),
        ];
        let reconciler = Reconciler::new(&db, &gateway);

        let report = reconciler.build_directory().await.unwrap();

        assert_eq!(report.applied, 2);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("/anime/bad"));
        assert_eq!(db.stats().unwrap().animes, 3);
        // Stored animes are never re-fetched
        assert!(!gateway
            .fetch_calls
            .lock()
            .unwrap()
            .contains(&"/anime/stored".to_string()));
    }
}
