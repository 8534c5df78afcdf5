//! The catalog of downloadable container images.
//!
//! The image server publishes a simplestreams index whose `products` are
//! `distribution:release:architecture:variant` tuples. The raw index is cached on disk for an
//! hour and re-derived into a distribution tree on every read.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{
    config::{DEFAULT_IMAGE_SERVER, IMAGE_CACHE_TTL, IMAGE_INDEX_PATH},
    utils::{host_architecture, IMAGE_INDEX_CACHE_FILENAME},
    LxcoreError, LxcoreResult,
};

use super::ContainerManager;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The distribution tree: distribution → release → available images.
pub type ImageTree = BTreeMap<String, BTreeMap<String, ReleaseImages>>;

/// The images available for one release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseImages {
    /// Architectures the host can run, sorted.
    pub architectures: Vec<String>,

    /// Image variants, e.g. `default` or `cloud`, sorted.
    pub variants: Vec<String>,
}

/// The image catalog as presented to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageCatalog {
    /// The runnable images.
    pub distributions: ImageTree,

    /// Product tuples left out because the host cannot run their architecture.
    pub filtered: Vec<String>,

    /// Whether the index came from the on-disk cache.
    pub cached: bool,

    /// When the index was downloaded.
    pub last_updated: DateTime<Utc>,
}

/// The on-disk copy of the raw image index.
#[derive(Debug, Clone)]
pub struct ImageCatalogCache {
    path: PathBuf,
    ttl: Duration,
}

/// A raw index read from the cache file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedIndex {
    /// The index document.
    pub body: String,

    /// When the cache file was written.
    pub modified: SystemTime,

    /// Whether the file is younger than the cache lifetime.
    pub fresh: bool,
}

#[derive(Debug, Deserialize)]
struct IndexDocument {
    index: IndexSections,
}

#[derive(Debug, Deserialize)]
struct IndexSections {
    images: ImageSection,
}

#[derive(Debug, Deserialize)]
struct ImageSection {
    #[serde(default)]
    products: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageCatalogCache {
    /// Creates a cache stored in `cache_dir`.
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            path: cache_dir.as_ref().join(IMAGE_INDEX_CACHE_FILENAME),
            ttl: IMAGE_CACHE_TTL,
        }
    }

    /// Overrides the cache lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Returns the cache file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the cached index, fresh or not. Returns `None` if nothing is cached.
    pub async fn read(&self) -> LxcoreResult<Option<CachedIndex>> {
        let metadata = match fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let modified = metadata.modified()?;
        let fresh = modified
            .elapsed()
            .map(|age| age < self.ttl)
            .unwrap_or(true);

        Ok(Some(CachedIndex {
            body: fs::read_to_string(&self.path).await?,
            modified,
            fresh,
        }))
    }

    /// Replaces the cached index with `body`, verbatim.
    pub async fn store(&self, body: &str) -> LxcoreResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(&self.path, body).await?;
        Ok(())
    }
}

impl ContainerManager {
    /// Returns the image catalog, downloading the index when the cached copy is missing or older
    /// than an hour.
    ///
    /// If the download fails, a stale cached index is served instead.
    pub async fn get_images(&self) -> LxcoreResult<ImageCatalog> {
        let settings = self.settings().await?;
        let cache = ImageCatalogCache::new(settings.get_cache().get_dir());

        let mut supported: HashSet<String> = settings
            .get_emulation()
            .get_architectures()
            .iter()
            .cloned()
            .collect();
        supported.insert(host_architecture().to_string());

        let cached = match cache.read().await {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(path = %cache.path().display(), error = %e, "could not read image cache");
                None
            }
        };

        if let Some(index) = cached.as_ref().filter(|index| index.fresh) {
            match catalog_from(&index.body, &supported, true, index.modified) {
                Ok(catalog) => return Ok(catalog),
                Err(e) => tracing::warn!(error = %e, "cached image index is unreadable, downloading"),
            }
        }

        let url = image_index_url(settings.get_lxc().get_registry_mirror().as_deref());
        match self.download_index(&url).await {
            Ok(body) => {
                let catalog = catalog_from(&body, &supported, false, SystemTime::now())?;
                if let Err(e) = cache.store(&body).await {
                    tracing::warn!(path = %cache.path().display(), error = %e, "could not cache image index");
                }
                tracing::info!(%url, distributions = catalog.distributions.len(), "image index downloaded");
                Ok(catalog)
            }
            Err(e) => match cached {
                Some(index) => {
                    tracing::warn!(%url, error = %e, "image index download failed, serving stale cache");
                    catalog_from(&index.body, &supported, true, index.modified)
                }
                None => Err(e),
            },
        }
    }

    async fn download_index(&self, url: &str) -> LxcoreResult<String> {
        let request = self.http().get(url).build()?;
        let response = self.http().execute(request).await?;
        let response = response.error_for_status()?;
        Ok(response.text().await?)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the index URL of `mirror`, or of the default image server.
///
/// A mirror given as a bare host is reached over HTTPS.
pub fn image_index_url(mirror: Option<&str>) -> String {
    let server = mirror
        .map(str::trim)
        .filter(|mirror| !mirror.is_empty())
        .unwrap_or(DEFAULT_IMAGE_SERVER);

    let base = if server.contains("://") {
        server.trim_end_matches('/').to_string()
    } else {
        format!("https://{}", server.trim_end_matches('/'))
    };

    format!("{}{}", base, IMAGE_INDEX_PATH)
}

/// Splits the products of an image index into the runnable tree and the filtered tuples.
///
/// Releases without any supported architecture do not appear in the tree.
pub fn parse_image_index(
    json: &str,
    supported: &HashSet<String>,
) -> LxcoreResult<(ImageTree, Vec<String>)> {
    let document: IndexDocument = serde_json::from_str(json)?;

    let mut tree: BTreeMap<String, BTreeMap<String, (BTreeSet<String>, BTreeSet<String>)>> =
        BTreeMap::new();
    let mut filtered = BTreeSet::new();

    for product in document.index.images.products {
        let parts: Vec<&str> = product.split(':').collect();
        let [distribution, release, architecture, variant] = parts.as_slice() else {
            tracing::debug!(%product, "skipping malformed image product");
            continue;
        };

        if !supported.contains(*architecture) {
            filtered.insert(product.clone());
            continue;
        }

        let (architectures, variants) = tree
            .entry(distribution.to_string())
            .or_default()
            .entry(release.to_string())
            .or_default();
        architectures.insert(architecture.to_string());
        variants.insert(variant.to_string());
    }

    let tree = tree
        .into_iter()
        .map(|(distribution, releases)| {
            let releases = releases
                .into_iter()
                .filter(|(_, (architectures, _))| !architectures.is_empty())
                .map(|(release, (architectures, variants))| {
                    (
                        release,
                        ReleaseImages {
                            architectures: architectures.into_iter().collect(),
                            variants: variants.into_iter().collect(),
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>();
            (distribution, releases)
        })
        .filter(|(_, releases)| !releases.is_empty())
        .collect();

    Ok((tree, filtered.into_iter().collect()))
}

fn catalog_from(
    json: &str,
    supported: &HashSet<String>,
    cached: bool,
    modified: SystemTime,
) -> LxcoreResult<ImageCatalog> {
    let (distributions, filtered) = parse_image_index(json, supported)
        .map_err(|e| LxcoreError::custom(anyhow::anyhow!("invalid image index: {}", e)))?;

    Ok(ImageCatalog {
        distributions,
        filtered,
        cached,
        last_updated: DateTime::<Utc>::from(modified),
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
