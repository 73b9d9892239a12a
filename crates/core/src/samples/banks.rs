use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value as JsonValue;
use tracing::{debug, info};

use super::AssetFetcher;
use crate::{BridgeError, Result};

/// Registry of sound names to their source URLs.
#[derive(Debug, Default)]
pub struct SampleBanks {
    banks: RwLock<HashMap<String, Vec<String>>>,
}

impl SampleBanks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every name in `map`, joining relative URLs onto `base_url`.
    /// A name registered again replaces its previous URL list.
    pub fn register_bank<I, S>(&self, map: I, base_url: Option<&str>) -> Result<usize>
    where
        I: IntoIterator<Item = (S, Vec<String>)>,
        S: Into<String>,
    {
        let mut banks = self.write()?;
        let mut registered = 0;
        for (name, urls) in map {
            let name = name.into();
            if urls.is_empty() {
                debug!(sound = %name, "skipping bank entry without urls");
                continue;
            }
            let urls = urls.iter().map(|url| join_url(base_url, url)).collect();
            banks.insert(name, urls);
            registered += 1;
        }
        Ok(registered)
    }

    /// Source URLs registered for `name`.
    pub fn lookup(&self, name: &str) -> Result<Vec<String>> {
        self.read()?
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::SoundNotFound {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().map(|banks| banks.contains_key(name)).unwrap_or(false)
    }

    /// Registered names in lexical order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .read()
            .map(|banks| banks.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().map(|banks| banks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetches a JSON manifest and registers its banks.
    ///
    /// The manifest maps names to a URL or a list of URLs. `_base` overrides
    /// the base URL, which otherwise is the manifest's own directory.
    pub async fn load_manifest(&self, fetcher: &dyn AssetFetcher, source: &str) -> Result<usize> {
        let url = resolve_manifest_url(source);
        let bytes = fetcher.fetch(&url).await.map_err(|e| BridgeError::Manifest {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        let json: HashMap<String, JsonValue> =
            serde_json::from_slice(&bytes).map_err(|e| BridgeError::Manifest {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        let base = match json.get("_base") {
            Some(JsonValue::String(base)) => base.clone(),
            _ => manifest_dir(&url),
        };

        let entries = json.into_iter().filter_map(|(name, value)| {
            if name.starts_with('_') {
                return None;
            }
            match value {
                JsonValue::String(url) => Some((name, vec![url])),
                JsonValue::Array(items) => {
                    let urls = items
                        .into_iter()
                        .filter_map(|item| match item {
                            JsonValue::String(url) => Some(url),
                            _ => None,
                        })
                        .collect();
                    Some((name, urls))
                }
                _ => {
                    debug!(sound = %name, "ignoring manifest entry that is not a url list");
                    None
                }
            }
        });

        let registered = self.register_bank(entries, Some(&base))?;
        info!(manifest = %url, registered, "registered sample manifest");
        Ok(registered)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Vec<String>>>> {
        self.banks
            .read()
            .map_err(|_| BridgeError::msg("sample bank registry has been poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Vec<String>>>> {
        self.banks
            .write()
            .map_err(|_| BridgeError::msg("sample bank registry has been poisoned"))
    }
}

/// Joins `path` onto `base` unless it already carries a scheme.
pub fn join_url(base: Option<&str>, path: &str) -> String {
    match base {
        Some(base) if !base.is_empty() && !path.contains("://") => {
            match (base.ends_with('/'), path.starts_with('/')) {
                (true, true) => format!("{base}{}", &path[1..]),
                (false, false) => format!("{base}/{path}"),
                _ => format!("{base}{path}"),
            }
        }
        _ => path.to_string(),
    }
}

/// Resolves shorthand manifest schemes to a fetchable URL.
///
/// - `github:user/repo[/branch]` points at `strudel.json` on the raw host,
///   `main` when no branch is given.
/// - `local:path` becomes a `file://` URL.
pub fn resolve_manifest_url(source: &str) -> String {
    if let Some(repo) = source.strip_prefix("github:") {
        let parts: Vec<&str> = repo.trim_matches('/').split('/').collect();
        let (user_repo, branch) = match parts.as_slice() {
            [user, repo] => (format!("{user}/{repo}"), "main".to_string()),
            [user, repo, rest @ ..] => (format!("{user}/{repo}"), rest.join("/")),
            _ => (repo.to_string(), "main".to_string()),
        };
        return format!("https://raw.githubusercontent.com/{user_repo}/{branch}/strudel.json");
    }
    if let Some(path) = source.strip_prefix("local:") {
        return format!("file://{path}");
    }
    source.to_string()
}

fn manifest_dir(url: &str) -> String {
    match url.rfind('/') {
        Some(index) => url[..=index].to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use futures::future::{BoxFuture, FutureExt};

    use super::*;

    struct StaticFetcher(HashMap<String, Vec<u8>>);

    impl AssetFetcher for StaticFetcher {
        fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Vec<u8>>> {
            let found = self.0.get(url).cloned();
            let url = url.to_string();
            async move {
                found.ok_or_else(|| BridgeError::Fetch {
                    url,
                    reason: "not found".into(),
                })
            }
            .boxed()
        }
    }

    #[test]
    fn joins_relative_urls_onto_the_base() {
        assert_eq!(join_url(Some("https://a.org/s/"), "kick.wav"), "https://a.org/s/kick.wav");
        assert_eq!(join_url(Some("https://a.org/s"), "kick.wav"), "https://a.org/s/kick.wav");
        assert_eq!(join_url(Some("https://a.org/s/"), "/kick.wav"), "https://a.org/s/kick.wav");
        assert_eq!(join_url(Some("https://a.org/"), "http://b.org/x.wav"), "http://b.org/x.wav");
        assert_eq!(join_url(None, "kick.wav"), "kick.wav");
    }

    #[test]
    fn resolves_manifest_shorthands() {
        assert_eq!(
            resolve_manifest_url("github:tidalcycles/dirt-samples"),
            "https://raw.githubusercontent.com/tidalcycles/dirt-samples/main/strudel.json"
        );
        assert_eq!(
            resolve_manifest_url("github:user/repo/dev"),
            "https://raw.githubusercontent.com/user/repo/dev/strudel.json"
        );
        assert_eq!(resolve_manifest_url("local:/srv/s.json"), "file:///srv/s.json");
        assert_eq!(resolve_manifest_url("https://x.org/a.json"), "https://x.org/a.json");
    }

    #[test]
    fn registration_replaces_and_reports_missing_names() {
        let banks = SampleBanks::new();
        banks
            .register_bank([("kick", vec!["a.wav".to_string()])], Some("https://s.org"))
            .unwrap();
        banks
            .register_bank([("kick", vec!["b.wav".to_string()])], None)
            .unwrap();

        assert_eq!(banks.lookup("kick").unwrap(), vec!["b.wav".to_string()]);
        assert!(banks.lookup("snare").unwrap_err().is_sound_not_found());
    }

    #[tokio::test]
    async fn loads_manifest_with_base_and_mixed_entries() {
        let manifest = br#"{
            "_base": "https://cdn.org/dirt/",
            "bd": ["bd/0.wav", "bd/1.wav"],
            "cp": "cp/0.wav",
            "piano": {"c4": ["p.wav"]}
        }"#;
        let fetcher = Arc::new(StaticFetcher(HashMap::from([(
            "https://raw.githubusercontent.com/u/r/main/strudel.json".to_string(),
            manifest.to_vec(),
        )])));

        let banks = SampleBanks::new();
        let count = banks
            .load_manifest(fetcher.as_ref(), "github:u/r")
            .await
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(banks.names(), vec!["bd".to_string(), "cp".to_string()]);
        assert_eq!(
            banks.lookup("bd").unwrap()[1],
            "https://cdn.org/dirt/bd/1.wav".to_string()
        );
    }

    #[tokio::test]
    async fn manifest_without_base_is_relative_to_itself() {
        let fetcher = StaticFetcher(HashMap::from([(
            "https://x.org/packs/strudel.json".to_string(),
            br#"{"hh": ["hh.wav"]}"#.to_vec(),
        )]));

        let banks = SampleBanks::new();
        banks
            .load_manifest(&fetcher, "https://x.org/packs/strudel.json")
            .await
            .unwrap();

        assert_eq!(banks.lookup("hh").unwrap(), vec!["https://x.org/packs/hh.wav".to_string()]);
    }

    #[tokio::test]
    async fn unreachable_manifest_is_reported() {
        let fetcher = StaticFetcher(HashMap::new());
        let err = SampleBanks::new()
            .load_manifest(&fetcher, "https://x.org/none.json")
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Manifest { .. }));
    }
}
