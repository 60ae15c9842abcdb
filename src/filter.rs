// Frequency, pattern and whitelist filtering of counted entries, features
// and events. Rejected weight is not thrown away but folded into a reserved
// token so marginals and totals stay as counted.

use crate::config::FilterSection;
use crate::count::CountFiles;
use crate::enumerator::Enumerator;
use crate::error::{Error, Result};
use crate::io::{copy_into_place, move_file, read_to_string, BinaryCodec, RecordCodec, RecordSink, TempFileFactory};
use crate::observer::RunObserver;
use crate::records::{Token, TokenId, TokenPair, Weighted};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use regex::Regex;

/// Stands in for every entry or feature a filter rejected.
pub const FILTERED_TOKEN: &str = "___FILTERED___";

/// Where the filter stage puts its outputs inside the output directory.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterFiles {
    pub entries: PathBuf,
    pub features: PathBuf,
    pub events: PathBuf,
}

impl FilterFiles {
    pub fn in_dir(dir: &Path) -> FilterFiles {
        Self {
            entries: dir.join("entries.filtered.bin"),
            features: dir.join("features.filtered.bin"),
            events: dir.join("events.filtered.bin"),
        }
    }
}

/// Acceptance test for one side, entries or features.
#[derive(Debug, Default)]
pub struct TokenFilter {
    min_freq: f64,
    pattern: Option<Regex>,
    whitelist: Option<HashSet<String>>,
}

impl TokenFilter {

    /// `name` prefixes the config keys in error messages, e.g. "entry".
    pub fn new(name: &str, min_freq: f64, pattern: Option<&str>, whitelist: Option<&Path>) -> Result<TokenFilter> {
        if min_freq.is_nan() {
            return Err(Error::config(format!("filter.min_{}_freq", name), "must be a number"));
        }
        let pattern = match pattern {
            Some(pattern) => Some(
                Regex::new(pattern).map_err(|e| Error::config(format!("filter.{}_pattern", name), e.to_string()))?,
            ),
            None => None,
        };
        let whitelist = match whitelist {
            Some(path) => {
                let text = read_to_string(path).map_err(|e| {
                    Error::config(format!("filter.{}_whitelist", name), format!("cannot read {}: {}", path.display(), e))
                })?;
                Some(text.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_owned).collect())
            }
            None => None,
        };
        Ok(Self { min_freq, pattern, whitelist })
    }

    pub fn is_active(&self) -> bool {
        self.min_freq > 0.0 || self.pattern.is_some() || self.whitelist.is_some()
    }

    /// `name` is only called when a pattern or whitelist needs the string.
    pub fn accepts<F>(&self, weight: f64, name: F) -> Result<bool>
    where
        F: FnOnce() -> Result<String>,
    {
        if weight < self.min_freq {
            return Ok(false);
        }
        if self.pattern.is_none() && self.whitelist.is_none() {
            return Ok(true);
        }
        let name = name()?;
        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(&name) {
                return Ok(false);
            }
        }
        Ok(self.whitelist.as_ref().map_or(true, |w| w.contains(&name)))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterReport {
    pub passes: usize,
    pub entries_rejected: usize,
    pub features_rejected: usize,
    pub events_rejected: u64,
}

/// The filters of one run, compiled from the `filter` config section.
#[derive(Debug, Default)]
pub struct Filters {
    entries: TokenFilter,
    features: TokenFilter,
    min_event_freq: f64,
}

impl Filters {

    pub fn from_section(section: &FilterSection) -> Result<Filters> {
        if section.min_event_freq.is_nan() {
            return Err(Error::config("filter.min_event_freq", "must be a number"));
        }
        Ok(Self {
            entries: TokenFilter::new(
                "entry",
                section.min_entry_freq,
                section.entry_pattern.as_deref(),
                section.entry_whitelist.as_deref(),
            )?,
            features: TokenFilter::new(
                "feature",
                section.min_feature_freq,
                section.feature_pattern.as_deref(),
                section.feature_whitelist.as_deref(),
            )?,
            min_event_freq: section.min_event_freq,
        })
    }

    pub fn is_active(&self) -> bool {
        self.entries.is_active() || self.features.is_active() || self.min_event_freq > 0.0
    }

    /// Filters the counted files into `out`. Passes repeat until no filter
    /// has anything left to reject: dropping an entry can leave a feature
    /// without events and the other way round.
    pub fn run(
        &self,
        counts: &CountFiles,
        out: &FilterFiles,
        compress_temp_files: bool,
        temp_dir: Option<&Path>,
        cleanup_on_failure: bool,
        observer: &RunObserver,
    ) -> Result<FilterReport> {
        let temp = TempFileFactory::new(temp_dir)?;
        let mut run = FilterRun::open(self, counts, compress_temp_files, &temp)?;
        let outcome = run.execute(observer).and_then(|report| {
            run.finish(out)?;
            run.entries.names.save(&counts.entries_index)?;
            run.features.names.save(&counts.features_index)?;
            Ok(report)
        });
        if outcome.is_err() && cleanup_on_failure {
            let removed = temp.cleanup();
            observer.debug(&format!("removed {} temp files after failure", removed));
        }
        outcome
    }
}

// one side of the filter, entries or features
struct Side {
    name: &'static str,
    names: Enumerator,
    filtered: TokenId,
    blacklist: HashSet<TokenId>,
    input: PathBuf,
    active: PathBuf,
    required: bool,
}

impl Side {

    fn open(name: &'static str, input: &Path, index: &Path, required: bool) -> Result<Side> {
        let names = Enumerator::load(index)?;
        let filtered = names.index_of(FILTERED_TOKEN)?;
        Ok(Self {
            name,
            names,
            filtered,
            blacklist: HashSet::new(),
            input: input.to_path_buf(),
            active: input.to_path_buf(),
            required,
        })
    }

    // the counted input is never deleted, only temp outputs of earlier passes
    fn replace_active(&mut self, next: PathBuf, temp: &TempFileFactory) -> Result<()> {
        if self.active != self.input {
            temp.delete(&self.active)?;
        }
        self.active = next;
        Ok(())
    }

    fn blacklist_all(&mut self, ids: impl Iterator<Item = TokenId>) -> bool {
        let before = self.blacklist.len();
        for id in ids.filter(|&id| id != self.filtered) {
            self.blacklist.insert(id);
        }
        self.blacklist.len() > before
    }

    fn finish(&self, dst: &Path, temp: &TempFileFactory) -> Result<()> {
        if self.active == self.input {
            copy_into_place(&self.input, dst)
        } else {
            move_file(&self.active, dst)?;
            temp.release(&self.active);
            Ok(())
        }
    }
}

// smallest and largest id seen in a pass
#[derive(Default)]
struct IdRange(Option<(TokenId, TokenId)>);

impl IdRange {
    fn include(&mut self, id: TokenId) {
        self.0 = Some(match self.0 {
            Some((lo, hi)) => (lo.min(id), hi.max(id)),
            None => (id, id),
        });
    }

    fn ids(&self) -> impl Iterator<Item = TokenId> {
        self.0.map(|(lo, hi)| lo..=hi).into_iter().flatten()
    }
}

struct FilterRun<'a> {
    filters: &'a Filters,
    temp: &'a TempFileFactory,
    tokens: BinaryCodec<Weighted<Token>>,
    pairs: BinaryCodec<Weighted<TokenPair>>,
    entries: Side,
    features: Side,
    events_input: PathBuf,
    events_active: PathBuf,
    events_required: bool,
    report: FilterReport,
}

impl<'a> FilterRun<'a> {

    fn open(filters: &'a Filters, counts: &CountFiles, compress: bool, temp: &'a TempFileFactory) -> Result<FilterRun<'a>> {
        Ok(Self {
            filters,
            temp,
            tokens: BinaryCodec::new(compress),
            pairs: BinaryCodec::new(compress),
            entries: Side::open("entries", &counts.entries, &counts.entries_index, filters.entries.is_active())?,
            features: Side::open("features", &counts.features, &counts.features_index, filters.features.is_active())?,
            events_input: counts.events.clone(),
            events_active: counts.events.clone(),
            events_required: filters.min_event_freq > 0.0,
            report: FilterReport::default(),
        })
    }

    fn execute(&mut self, observer: &RunObserver) -> Result<FilterReport> {
        while self.entries.required || self.events_required || self.features.required {
            self.report.passes += 1;
            observer.stage(&format!("pass {}", self.report.passes));
            if self.entries.required {
                self.filter_entries(observer)?;
            }
            if self.events_required {
                self.filter_events(observer)?;
            }
            if self.features.required {
                self.filter_features(observer)?;
            }
            if self.events_required {
                self.filter_events(observer)?;
            }
            if self.entries.required {
                self.filter_entries(observer)?;
            }
        }
        self.report.entries_rejected = self.entries.blacklist.len();
        self.report.features_rejected = self.features.blacklist.len();
        observer.info(&format!(
            "filtered in {} passes, rejected {} entries, {} features, {} events",
            self.report.passes, self.report.entries_rejected, self.report.features_rejected, self.report.events_rejected
        ));
        Ok(self.report)
    }

    fn filter_entries(&mut self, observer: &RunObserver) -> Result<()> {
        if filter_tokens(&mut self.entries, &self.filters.entries, &self.tokens, self.temp, observer)? {
            self.events_required = true;
        }
        Ok(())
    }

    fn filter_features(&mut self, observer: &RunObserver) -> Result<()> {
        if filter_tokens(&mut self.features, &self.filters.features, &self.tokens, self.temp, observer)? {
            self.events_required = true;
        }
        Ok(())
    }

    // Drops events below the frequency threshold or touching a blacklisted
    // entry or feature. Entries and features left without any accepted
    // event are blacklisted in turn.
    fn filter_events(&mut self, observer: &RunObserver) -> Result<()> {
        let out = self.temp.create_file()?;
        let mut sink = self.pairs.open_sink(&out)?;
        let (filtered_entry, filtered_feature) = (self.entries.filtered, self.features.filtered);

        let mut accepted_entries: HashSet<TokenId> = HashSet::new();
        let mut accepted_features: HashSet<TokenId> = HashSet::new();
        let (mut entry_range, mut feature_range) = (IdRange::default(), IdRange::default());
        let (mut read, mut kept) = (0u64, 0u64);
        // weight of events whose whole entry went
        let mut spilled = 0.0;
        let mut current: Option<EntryTally> = None;

        for event in self.pairs.open_source(&self.events_active)? {
            let event = event?;
            read += 1;
            let TokenPair { id1: entry, id2: feature } = event.record;
            feature_range.include(feature);
            if entry == filtered_entry {
                spilled += event.weight;
                continue;
            }
            if current.as_ref().map(|t| t.entry) != Some(entry) {
                entry_range.include(entry);
                if let Some(tally) = current.take() {
                    tally.close(filtered_feature, &mut spilled, sink.as_mut())?;
                }
                current = Some(EntryTally::new(entry));
            }
            let Some(tally) = current.as_mut() else {
                continue;
            };

            if feature == filtered_feature {
                tally.filtered += event.weight;
            } else if event.weight >= self.filters.min_event_freq
                && !self.entries.blacklist.contains(&entry)
                && !self.features.blacklist.contains(&feature)
            {
                sink.write(event)?;
                accepted_entries.insert(entry);
                accepted_features.insert(feature);
                tally.kept += 1;
                kept += 1;
            } else {
                tally.filtered += event.weight;
                self.report.events_rejected += 1;
            }
        }
        if let Some(tally) = current.take() {
            tally.close(filtered_feature, &mut spilled, sink.as_mut())?;
        }
        if spilled != 0.0 {
            sink.write(Weighted::new(TokenPair::new(filtered_entry, filtered_feature), spilled))?;
        }
        sink.close()?;
        observer.info(&format!("accepted {} of {} events", kept, read));

        if self.events_active != self.events_input {
            self.temp.delete(&self.events_active)?;
        }
        self.events_active = out;
        self.events_required = false;

        let rejected_entries = entry_range.ids().filter(|id| !accepted_entries.contains(id));
        if self.entries.blacklist_all(rejected_entries) {
            self.entries.required = true;
        }
        let rejected_features = feature_range.ids().filter(|id| !accepted_features.contains(id));
        if self.features.blacklist_all(rejected_features) {
            self.features.required = true;
        }
        Ok(())
    }

    fn finish(&self, out: &FilterFiles) -> Result<()> {
        self.entries.finish(&out.entries, self.temp)?;
        self.features.finish(&out.features, self.temp)?;
        if self.events_active == self.events_input {
            copy_into_place(&self.events_input, &out.events)
        } else {
            move_file(&self.events_active, &out.events)?;
            self.temp.release(&self.events_active);
            Ok(())
        }
    }
}

// events of the entry currently streaming past
struct EntryTally {
    entry: TokenId,
    kept: u64,
    filtered: f64,
}

impl EntryTally {

    fn new(entry: TokenId) -> EntryTally {
        Self { entry, kept: 0, filtered: 0.0 }
    }

    // an entry with surviving events keeps its rejected weight under the
    // filtered feature, otherwise the weight moves to the filtered entry
    fn close(self, filtered_feature: TokenId, spilled: &mut f64, sink: &mut dyn RecordSink<Weighted<TokenPair>>) -> Result<()> {
        if self.filtered == 0.0 {
            return Ok(());
        }
        if self.kept == 0 {
            *spilled += self.filtered;
            Ok(())
        } else {
            sink.write(Weighted::new(TokenPair::new(self.entry, filtered_feature), self.filtered))
        }
    }
}

// One pass over the active entries or features file. Returns true when the
// blacklist grew.
fn filter_tokens(
    side: &mut Side,
    filter: &TokenFilter,
    codec: &BinaryCodec<Weighted<Token>>,
    temp: &TempFileFactory,
    observer: &RunObserver,
) -> Result<bool> {
    let out = temp.create_file()?;
    let mut sink = codec.open_sink(&out)?;
    let (mut read, mut kept, mut filtered_weight, mut grew) = (0u64, 0u64, 0.0, false);

    for record in codec.open_source(&side.active)? {
        let record = record?;
        read += 1;
        let id = record.record.id;
        if id == side.filtered {
            filtered_weight += record.weight;
        } else if !side.blacklist.contains(&id) && filter.accepts(record.weight, || side.names.value_of(id))? {
            sink.write(record)?;
            kept += 1;
        } else {
            grew |= side.blacklist.insert(id);
            filtered_weight += record.weight;
        }
    }
    // the filtered token has the largest id, appending keeps the file sorted
    if filtered_weight != 0.0 {
        sink.write(Weighted::new(Token::new(side.filtered), filtered_weight))?;
    }
    sink.close()?;
    observer.info(&format!("accepted {} of {} {}", kept, read, side.name));

    side.replace_active(out, temp)?;
    side.required = false;
    Ok(grew)
}
