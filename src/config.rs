// imports
use crate::apss::{ApssAlgorithm, ApssOptions, PairFilter};
use crate::count::CountFiles;
use crate::error::{Error, Result};
use crate::filter::{FilterFiles, Filters};
use crate::io::open_reader;
use crate::knn::DEFAULT_K;
use crate::measure::{MeasureSpec, ScoreWeighting};
use crate::weighting::FeatureWeighting;
use crate::scheduler::default_threads;
use crate::sort::{SortOptions, DEFAULT_CHUNK_SIZE};

use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SortSection {
    pub chunk_size: usize,
    pub reverse: bool,
}

impl Default for SortSection {
    fn default() -> Self {
        Self { chunk_size: DEFAULT_CHUNK_SIZE, reverse: false }
    }
}

impl Display for SortSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sort parameters:
        chunk_size: {},
        reverse: {}",
        self.chunk_size, self.reverse)
    }
}

/// Thresholds and token lists applied to the counts before all pairs. Zero
/// thresholds and unset lists reject nothing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSection {
    pub min_entry_freq: f64,
    pub entry_pattern: Option<String>,
    pub entry_whitelist: Option<PathBuf>,
    pub min_feature_freq: f64,
    pub feature_pattern: Option<String>,
    pub feature_whitelist: Option<PathBuf>,
    pub min_event_freq: f64,
}

impl FilterSection {
    pub fn is_active(&self) -> bool {
        self.min_entry_freq > 0.0
            || self.min_feature_freq > 0.0
            || self.min_event_freq > 0.0
            || self.entry_pattern.is_some()
            || self.feature_pattern.is_some()
            || self.entry_whitelist.is_some()
            || self.feature_whitelist.is_some()
    }
}

impl Display for FilterSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "filter parameters:
        min_entry_freq: {},
        entry_pattern: {:?},
        entry_whitelist: {:?},
        min_feature_freq: {},
        feature_pattern: {:?},
        feature_whitelist: {:?},
        min_event_freq: {}",
        self.min_entry_freq, self.entry_pattern, self.entry_whitelist, self.min_feature_freq,
        self.feature_pattern, self.feature_whitelist, self.min_event_freq)
    }
}

/// Unset similarity bounds mean unbounded, JSON has no infinities. Pruning
/// in the inverted index only happens when `min_similarity` is set above the
/// score of pairs sharing no feature, usually 0.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllPairsSection {
    pub measure: MeasureSpec,
    pub min_similarity: Option<f64>,
    pub max_similarity: Option<f64>,
    pub identity_pairs: bool,
    pub measure_reversed: bool,
    pub weighting: ScoreWeighting,
    pub feature_weighting: FeatureWeighting,
    pub algorithm: ApssAlgorithm,
    pub stripe_size: Option<usize>,
}

impl AllPairsSection {
    pub fn filter(&self) -> PairFilter {
        PairFilter {
            min_similarity: self.min_similarity.unwrap_or(f64::NEG_INFINITY),
            max_similarity: self.max_similarity.unwrap_or(f64::INFINITY),
            identity_pairs: self.identity_pairs,
        }
    }
}

impl Display for AllPairsSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "all pairs parameters:
        measure: {},
        similarity range: {},
        measure_reversed: {},
        weighting: {:?},
        feature_weighting: {:?},
        algorithm: {:?},
        stripe_size: {:?}",
        self.measure, self.filter(), self.measure_reversed, self.weighting, self.feature_weighting, self.algorithm,
        self.stripe_size)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnnSection {
    pub k: usize,
}

impl Default for KnnSection {
    fn default() -> Self {
        Self { k: DEFAULT_K }
    }
}

/// A run description, read from a JSON file. Only `input_file` and
/// `output_dir` are required.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub input_file: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    #[serde(default)]
    pub cleanup_on_failure: bool,
    #[serde(default)]
    pub compress_temp_files: bool,
    #[serde(default)]
    pub saved_counts: bool,
    #[serde(default)]
    pub sort: SortSection,
    #[serde(default)]
    pub filter: FilterSection,
    #[serde(default)]
    pub allpairs: AllPairsSection,
    #[serde(default)]
    pub knn: KnnSection,
}

impl Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "using parameters:
        input_file: {}
        output_dir: {}
        threads: {}
        temp_dir: {:?}
        cleanup_on_failure: {}
        compress_temp_files: {}
        saved_counts: {}
        k: {}
        {}
        {}
        {}",
        self.input_file.display(), self.output_dir.display(), self.threads(), self.temp_dir, self.cleanup_on_failure,
        self.compress_temp_files, self.saved_counts, self.knn.k, self.sort, self.filter, self.allpairs)
    }
}

/// Every file a full run writes, derived from the output directory.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputFiles {
    pub counts: CountFiles,
    pub filtered: FilterFiles,
    pub similarities: PathBuf,
    pub neighbours: PathBuf,
    pub neighbours_strings: PathBuf,
    pub sorted: PathBuf,
}

impl Config {

    pub fn from_file(path: &Path) -> Result<Config> {
        let reader = open_reader(path)?;
        let config: Config = serde_json::from_reader(reader)?;
        Ok(config)
    }

    pub fn threads(&self) -> usize {
        self.threads.unwrap_or_else(default_threads)
    }

    pub fn files(&self) -> OutputFiles {
        let dir = &self.output_dir;
        OutputFiles {
            counts: CountFiles::in_dir(dir),
            filtered: FilterFiles::in_dir(dir),
            similarities: dir.join("similarities.bin"),
            neighbours: dir.join("neighbours.bin"),
            neighbours_strings: dir.join("neighbours.strings.tsv"),
            sorted: dir.join("sorted.tsv"),
        }
    }

    pub fn sort_options(&self) -> SortOptions {
        SortOptions {
            chunk_size: self.sort.chunk_size,
            reverse: self.sort.reverse,
            cleanup_on_failure: self.cleanup_on_failure,
            temp_dir: self.temp_dir.clone(),
        }
    }

    pub fn apss_options(&self) -> Result<ApssOptions> {
        Ok(ApssOptions {
            measure: self.allpairs.measure.kind()?,
            weighting: self.allpairs.weighting,
            filter: self.allpairs.filter(),
            feature_weighting: self.allpairs.feature_weighting,
            reversed: self.allpairs.measure_reversed,
            algorithm: self.allpairs.algorithm,
            stripe_size: self.allpairs.stripe_size,
        })
    }

    /// Checks everything that can be checked before any work starts.
    pub fn validate(&self) -> Result<()> {
        if self.threads == Some(0) {
            return Err(Error::config("threads", "must be at least 1"));
        }
        if self.sort.chunk_size < 1 {
            return Err(Error::config("sort.chunk_size", "must be at least 1"));
        }
        if self.knn.k < 1 {
            return Err(Error::config("knn.k", "must be at least 1"));
        }
        if self.allpairs.stripe_size == Some(0) {
            return Err(Error::config("allpairs.stripe_size", "must be at least 1"));
        }
        let filter = self.allpairs.filter();
        if filter.min_similarity.is_nan() || filter.max_similarity.is_nan() {
            return Err(Error::config("allpairs", "similarity bounds must be numbers"));
        }
        if filter.min_similarity > filter.max_similarity {
            return Err(Error::config("allpairs.min_similarity", format!(
                "{} exceeds max_similarity {}", filter.min_similarity, filter.max_similarity)));
        }
        self.allpairs.measure.kind()?;
        Filters::from_section(&self.filter)?;

        if !self.saved_counts && !self.input_file.is_file() {
            return Err(Error::config("input_file", format!("{} is not a readable file", self.input_file.display())));
        }
        if self.output_dir.is_file() {
            return Err(Error::config("output_dir", format!("{} is a file", self.output_dir.display())));
        }
        // creating it catches a temp_dir anywhere below a file as well
        if let Some(temp_dir) = &self.temp_dir {
            fs::create_dir_all(temp_dir)
                .map_err(|e| Error::config("temp_dir", format!("cannot create {}: {}", temp_dir.display(), e)))?;
        }

        let files = self.files();
        let outputs = [
            &files.counts.entries,
            &files.counts.features,
            &files.counts.events,
            &files.counts.entries_tsv,
            &files.counts.features_tsv,
            &files.counts.events_tsv,
            &files.counts.entries_index,
            &files.counts.features_index,
            &files.filtered.entries,
            &files.filtered.features,
            &files.filtered.events,
            &files.similarities,
            &files.neighbours,
            &files.neighbours_strings,
            &files.sorted,
        ];
        let input = normalise(&self.input_file);
        if let Some(clash) = outputs.iter().find(|out| normalise(out) == input) {
            return Err(Error::config("input_file", format!("{} is also an output file", clash.display())));
        }
        Ok(())
    }
}

// absolute form of a path that may not exist yet
fn normalise(path: &Path) -> PathBuf {
    if let Ok(path) = path.canonicalize() {
        return path;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };
            match parent.canonicalize() {
                Ok(parent) => parent.join(name),
                Err(_) => path.to_path_buf(),
            }
        }
        _ => path.to_path_buf(),
    }
}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::measure::MeasureKind;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, json: &str) -> PathBuf {
        let path = dir.path().join("config.json");
        std::fs::write(&path, json).unwrap();
        path
    }

    fn with_input(dir: &TempDir) -> PathBuf {
        let input = dir.path().join("instances.tsv");
        std::fs::write(&input, "a\tf\n").unwrap();
        input
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let dir = TempDir::new().unwrap();
        let input = with_input(&dir);
        let json = format!(r#"{{"input_file": "{}", "output_dir": "{}"}}"#,
            input.display(), dir.path().join("out").display());
        let config = Config::from_file(&write_config(&dir, &json)).unwrap();

        assert_eq!(config.sort.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.knn.k, 100);
        assert!(!config.cleanup_on_failure);
        assert_eq!(config.allpairs.algorithm, ApssAlgorithm::Inverted);
        assert_eq!(config.allpairs.filter(), PairFilter::default());
        assert_eq!(config.apss_options().unwrap().measure, MeasureKind::Lin);
        assert!(config.threads() >= 2);
        config.validate().unwrap();
    }

    #[test]
    fn nested_sections_parse() {
        let dir = TempDir::new().unwrap();
        let input = with_input(&dir);
        let json = format!(r#"{{
            "input_file": "{}",
            "output_dir": "{}",
            "threads": 3,
            "cleanup_on_failure": true,
            "sort": {{"chunk_size": 10}},
            "allpairs": {{"measure": {{"name": "weeds", "weeds_beta": 0.2}}, "min_similarity": 0.1,
                          "weighting": "inverse", "algorithm": "naive"}},
            "knn": {{"k": 5}}
        }}"#, input.display(), dir.path().join("out").display());
        let config = Config::from_file(&write_config(&dir, &json)).unwrap();
        config.validate().unwrap();

        assert_eq!(config.threads(), 3);
        assert_eq!(config.sort_options().chunk_size, 10);
        assert!(config.sort_options().cleanup_on_failure);
        let apss = config.apss_options().unwrap();
        assert_eq!(apss.measure, MeasureKind::Weeds { beta: 0.2, gamma: 0.5 });
        assert_eq!(apss.weighting, ScoreWeighting::Inverse);
        assert_eq!(apss.filter.min_similarity, 0.1);
        assert_eq!(config.knn.k, 5);
    }

    #[test]
    fn validation_errors() {
        let dir = TempDir::new().unwrap();
        let input = with_input(&dir);
        let base = Config {
            input_file: input.clone(),
            output_dir: dir.path().join("out"),
            threads: None,
            temp_dir: None,
            cleanup_on_failure: false,
            compress_temp_files: false,
            saved_counts: false,
            sort: SortSection::default(),
            filter: FilterSection::default(),
            allpairs: AllPairsSection::default(),
            knn: KnnSection::default(),
        };
        base.validate().unwrap();

        let mut c = base.clone();
        c.sort.chunk_size = 0;
        assert!(c.validate().unwrap_err().is_config());

        let mut c = base.clone();
        c.knn.k = 0;
        assert!(c.validate().unwrap_err().is_config());

        let mut c = base.clone();
        c.allpairs.min_similarity = Some(0.9);
        c.allpairs.max_similarity = Some(0.1);
        assert!(c.validate().unwrap_err().is_config());

        let mut c = base.clone();
        c.allpairs.measure.name = String::from("nonsense");
        assert!(matches!(c.validate(), Err(Error::UnknownMeasure(_))));

        let mut c = base.clone();
        c.input_file = dir.path().join("missing.tsv");
        assert!(c.validate().unwrap_err().is_config());

        // input doubling as an output
        let mut c = base.clone();
        c.output_dir = dir.path().to_path_buf();
        c.input_file = dir.path().join("sorted.tsv");
        std::fs::write(&c.input_file, "").unwrap();
        assert!(c.validate().unwrap_err().is_config());

        let mut c = base.clone();
        c.filter.feature_pattern = Some(String::from("[a-"));
        assert!(c.validate().unwrap_err().is_config());
    }

    #[test]
    fn temp_dir_below_a_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let input = with_input(&dir);
        let json = format!(r#"{{"input_file": "{}", "output_dir": "{}", "temp_dir": "{}"}}"#,
            input.display(), dir.path().join("out").display(), input.join("tmp").display());
        let config = Config::from_file(&write_config(&dir, &json)).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("temp_dir"), "{}", err);

        let mut config = config;
        config.temp_dir = Some(dir.path().join("fresh").join("tmp"));
        config.validate().unwrap();
        assert!(dir.path().join("fresh").join("tmp").is_dir());
    }

    #[test]
    fn filter_and_feature_weighting_parse() {
        let dir = TempDir::new().unwrap();
        let input = with_input(&dir);
        let json = format!(r#"{{
            "input_file": "{}",
            "output_dir": "{}",
            "filter": {{"min_entry_freq": 2, "feature_pattern": "^amod:"}},
            "allpairs": {{"feature_weighting": "positivepmi"}}
        }}"#, input.display(), dir.path().join("out").display());
        let config = Config::from_file(&write_config(&dir, &json)).unwrap();
        config.validate().unwrap();
        assert!(config.filter.is_active());
        assert_eq!(config.filter.min_entry_freq, 2.0);
        assert_eq!(config.apss_options().unwrap().feature_weighting, FeatureWeighting::PositivePmi);
        assert!(!FilterSection::default().is_active());
    }

    #[test]
    fn missing_required_field_is_json_error() {
        let dir = TempDir::new().unwrap();
        let err = Config::from_file(&write_config(&dir, r#"{"output_dir": "x"}"#)).unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }
}
