use futures::future::join_all;
use geojson::{Feature, FeatureCollection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::capabilities::http::HttpTransport;
use crate::codec;
use crate::event::Credential;
use crate::model::{DatasetId, Position, VersionToken};
use crate::schema::display_value;
use crate::sync::{RemoteClient, SyncError};

/// Layer colours, assigned by position in the configured file list.
pub const PALETTE: [&str; 5] = ["#e6194B", "#3cb44b", "#ffe119", "#4363d8", "#f58231"];

#[must_use]
pub fn palette_color(index: usize) -> &'static str {
    PALETTE[index % PALETTE.len()]
}

/// Display name for a dataset file: last path segment, no extension, `_` as spaces.
#[must_use]
pub fn layer_name(path: &str) -> String {
    let file = path.rsplit('/').next().unwrap_or(path);
    let stem = file.strip_suffix(".geojson").unwrap_or(file);
    stem.replace('_', " ")
}

/// Non-owning reference to a feature: the dataset's file id and the feature's
/// position in its collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureRef {
    pub dataset: DatasetId,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub id: DatasetId,
    pub name: String,
    pub color: &'static str,
    pub collection: FeatureCollection,
    /// Sha of the remote content `collection` was derived from.
    pub version: VersionToken,
}

impl Dataset {
    pub fn new(
        id: DatasetId,
        collection: FeatureCollection,
        version: VersionToken,
        order: usize,
    ) -> Self {
        Self {
            name: layer_name(id.as_str()),
            color: palette_color(order),
            id,
            collection,
            version,
        }
    }

    pub fn features(&self) -> &[Feature] {
        &self.collection.features
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetStore {
    datasets: Vec<Dataset>,
}

impl DatasetStore {
    /// Adds a dataset, replacing any previous one with the same id in place.
    pub fn insert(&mut self, dataset: Dataset) {
        match self.datasets.iter_mut().find(|d| d.id == dataset.id) {
            Some(existing) => *existing = dataset,
            None => self.datasets.push(dataset),
        }
    }

    pub fn clear(&mut self) {
        self.datasets.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.iter()
    }

    pub fn get(&self, id: &DatasetId) -> Option<&Dataset> {
        self.datasets.iter().find(|d| &d.id == id)
    }

    pub fn get_mut(&mut self, id: &DatasetId) -> Option<&mut Dataset> {
        self.datasets.iter_mut().find(|d| &d.id == id)
    }

    /// Checks that `index` names a feature of dataset `id`.
    pub fn resolve(&self, id: &DatasetId, index: usize) -> Option<FeatureRef> {
        let dataset = self.get(id)?;
        (index < dataset.features().len()).then(|| FeatureRef {
            dataset: id.clone(),
            index,
        })
    }

    pub fn feature(&self, feature: &FeatureRef) -> Option<&Feature> {
        self.get(&feature.dataset)?.collection.features.get(feature.index)
    }

    pub fn feature_mut(&mut self, feature: &FeatureRef) -> Option<&mut Feature> {
        self.get_mut(&feature.dataset)?
            .collection
            .features
            .get_mut(feature.index)
    }

    /// Point position of a feature, `None` for anything that is not a valid point.
    pub fn point_of(&self, feature: &FeatureRef) -> Option<Position> {
        point_position(self.feature(feature)?)
    }

    /// Sorted distinct non-empty values of `key` across every feature of every dataset.
    pub fn distinct_values(&self, key: &str) -> Vec<String> {
        self.datasets
            .iter()
            .flat_map(|d| d.features())
            .filter_map(|f| f.properties.as_ref()?.get(key))
            .map(display_value)
            .filter(|v| !v.trim().is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

pub fn point_position(feature: &Feature) -> Option<Position> {
    match &feature.geometry.as_ref()?.value {
        geojson::Value::Point(coords) => Position::from_coordinates(coords).ok(),
        _ => None,
    }
}

/// A file fetched and parsed by [`load_all`], not yet attached to the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadedFile {
    pub id: DatasetId,
    pub collection: FeatureCollection,
    pub version: VersionToken,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileFailure {
    pub file: DatasetId,
    pub error: SyncError,
}

impl fmt::Display for FileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.file, self.error)
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("failed to load {}", failed_files(.failures))]
pub struct LoadError {
    pub failures: Vec<FileFailure>,
}

fn failed_files(failures: &[FileFailure]) -> String {
    failures
        .iter()
        .map(|f| f.file.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl LoadError {
    pub fn is_auth(&self) -> bool {
        self.failures.iter().any(|f| f.error.is_auth())
    }

    pub fn files(&self) -> Vec<&DatasetId> {
        self.failures.iter().map(|f| &f.file).collect()
    }
}

/// Fetches and parses every file concurrently.
///
/// The batch is all-or-nothing: if any file fails, the error lists each
/// failing file and none of the successful ones are returned.
#[instrument(skip_all, fields(count = files.len()))]
pub async fn load_all<T: HttpTransport>(
    client: &RemoteClient<T>,
    files: &[DatasetId],
    credential: &Credential,
) -> Result<Vec<LoadedFile>, LoadError> {
    let fetches = files.iter().map(|id| async move {
        let remote = client.fetch_file(id.as_str(), credential).await?;
        let collection =
            codec::parse_collection(&remote.text).map_err(|source| SyncError::Decode {
                path: id.to_string(),
                source,
            })?;
        Ok::<_, SyncError>(LoadedFile {
            id: id.clone(),
            collection,
            version: remote.version,
        })
    });

    let mut loaded = Vec::with_capacity(files.len());
    let mut failures = Vec::new();
    for (id, result) in files.iter().zip(join_all(fetches).await) {
        match result {
            Ok(file) => loaded.push(file),
            Err(error) => {
                warn!(file = %id, %error, "dataset failed to load");
                failures.push(FileFailure {
                    file: id.clone(),
                    error,
                });
            }
        }
    }

    if failures.is_empty() {
        info!(count = loaded.len(), "datasets loaded");
        Ok(loaded)
    } else {
        Err(LoadError { failures })
    }
}
