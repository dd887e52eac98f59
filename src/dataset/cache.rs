use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};

use log::info;
use serde_json::Value;

use crate::error::Result;

/// The metadata key under which the cache key of a processed dataset is stored.
pub const CHECKSUM: &str = "checksum";

/// The persistence layer of processed datasets, owned by the caching subsystem.
pub trait DatasetManager {
    type Dataset;

    /// The file extension of persisted datasets.
    fn data_format(&self) -> &str;

    /// Whether a processed dataset for `input` may be persisted.
    fn can_cache(
        &self,
        input: Option<&Path>,
        config: &Value,
        skip_save_processed_input: bool,
    ) -> bool;

    /// Fingerprint of an input file together with the config it was processed with.
    fn checksum(&self, input: &Path, config: &Value) -> Result<String>;

    /// Persists a dataset and returns the dataset to continue working with.
    fn save(
        &self,
        cache_path: &Path,
        dataset: Self::Dataset,
        config: &Value,
        metadata: &Value,
    ) -> Result<Self::Dataset>;
}

/// The output of preprocessing: the splits plus the training set metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedDataset<D> {
    pub training: D,
    pub test: Option<D>,
    pub validation: Option<D>,
    pub metadata: Value,
}

/// A cache lookup hit.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedDataset {
    /// The stored checksum matches the current key and the training split exists.
    pub valid: bool,
    pub metadata: Value,
    pub training: PathBuf,
    pub test: PathBuf,
    pub validation: PathBuf,
}

/// Decides where processed datasets are cached and whether a cached copy can be reused.
pub struct CacheManager<M> {
    manager: M,
    cache_dir: Option<PathBuf>,
}

impl<M: DatasetManager> CacheManager<M> {
    /// Creates a new `CacheManager`.
    ///
    /// # Args
    /// * `manager` - The persistence layer.
    /// * `cache_dir` - Where to cache, by default next to each input file.
    pub fn new(manager: M, cache_dir: Option<PathBuf>) -> Self {
        Self { manager, cache_dir }
    }

    /// Persists every split of `processed` unless the manager refuses to cache it.
    ///
    /// # Args
    /// * `input` - The raw input file, `None` for in-memory data.
    /// * `config` - The config the input was processed with.
    /// * `processed` - The preprocessing output.
    /// * `skip_save_processed_input` - The caller's cache bypass.
    ///
    /// # Returns
    /// The splits as returned by the manager after saving, or `processed` untouched.
    pub fn put_dataset(
        &self,
        input: Option<&Path>,
        config: &Value,
        processed: ProcessedDataset<M::Dataset>,
        skip_save_processed_input: bool,
    ) -> Result<ProcessedDataset<M::Dataset>> {
        if !self
            .manager
            .can_cache(input, config, skip_save_processed_input)
        {
            return Ok(processed);
        }

        let key = self.cache_key(input, config)?;
        let ProcessedDataset {
            training,
            test,
            validation,
            metadata,
        } = processed;

        info!("writing train set metadata");
        let meta_path = self.cache_path(input, &key, Some("meta"), Some("json"));
        if let Some(dir) = meta_path.parent() {
            fs::create_dir_all(dir)?;
        }
        serde_json::to_writer(BufWriter::new(File::create(&meta_path)?), &metadata)?;

        info!("writing preprocessed training set cache");
        let path = self.cache_path(input, &key, None, None);
        let training = self.manager.save(&path, training, config, &metadata)?;

        let test = match test {
            Some(test) => {
                info!("writing preprocessed test set cache");
                let path = self.cache_path(input, &key, Some("test"), None);
                Some(self.manager.save(&path, test, config, &metadata)?)
            }
            None => None,
        };

        let validation = match validation {
            Some(validation) => {
                info!("writing preprocessed validation set cache");
                let path = self.cache_path(input, &key, Some("val"), None);
                Some(self.manager.save(&path, validation, config, &metadata)?)
            }
            None => None,
        };

        Ok(ProcessedDataset {
            training,
            test,
            validation,
            metadata,
        })
    }

    /// Looks up the cached copy of `input` processed with `config`.
    ///
    /// # Returns
    /// `None` on a miss, otherwise the cached metadata and split paths.
    pub fn get_dataset(
        &self,
        input: Option<&Path>,
        config: &Value,
    ) -> Result<Option<CachedDataset>> {
        let key = self.cache_key(input, config)?;
        let meta_path = self.cache_path(input, &key, Some("meta"), Some("json"));

        if !meta_path.exists() {
            return Ok(None);
        }

        let metadata: Value = serde_json::from_reader(File::open(&meta_path)?)?;
        let training = self.cache_path(input, &key, None, None);
        let valid = metadata.get(CHECKSUM).and_then(Value::as_str) == Some(key.as_str())
            && training.exists();

        Ok(Some(CachedDataset {
            valid,
            metadata,
            test: self.cache_path(input, &key, Some("test"), None),
            validation: self.cache_path(input, &key, Some("val"), None),
            training,
        }))
    }

    /// The cache key of `input` processed with `config`. In-memory inputs get a fresh random
    /// key, so they never hit the cache.
    pub fn cache_key(&self, input: Option<&Path>, config: &Value) -> Result<String> {
        match input {
            Some(input) => self.manager.checksum(input, config),
            None => Ok(format!("{:032x}", rand::random::<u128>())),
        }
    }

    /// Where a cached split lives.
    ///
    /// # Args
    /// * `input` - The raw input file.
    /// * `key` - The cache key.
    /// * `tag` - The split tag, defaults to the input's file stem.
    /// * `ext` - The file extension, defaults to the manager's data format.
    pub fn cache_path(
        &self,
        input: Option<&Path>,
        key: &str,
        tag: Option<&str>,
        ext: Option<&str>,
    ) -> PathBuf {
        let stem = input
            .and_then(Path::file_stem)
            .map(|stem| stem.to_string_lossy().into_owned());
        let tag = tag
            .map(str::to_owned)
            .or(stem)
            .unwrap_or_else(|| "dataset".to_owned());
        let ext = ext.unwrap_or_else(|| self.manager.data_format());

        let file_name = match self.cache_dir {
            Some(_) => format!("{key}.{tag}.{ext}"),
            None => format!("{tag}.{ext}"),
        };

        self.cache_directory(input).join(file_name)
    }

    /// The directory caches of `input` are written to.
    pub fn cache_directory(&self, input: Option<&Path>) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }

        input
            .and_then(Path::parent)
            .filter(|dir| !dir.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    }

    /// The persistence layer's data format.
    pub fn data_format(&self) -> &str {
        self.manager.data_format()
    }
}
