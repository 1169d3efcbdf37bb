//! The archive metadata store: an append-only log of descriptors,
//! instance domains, labels and help text, decoded at open into hashed
//! indexes supporting point-in-time lookups.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use fxhash::FxHashMap;
use tracing::{debug, warn};

use crate::deriv::MetadataSource;
use crate::desc::Descriptor;
use crate::error::{Error, Result};
use crate::ident::{IndomId, InstId, MetricId};
use crate::labels::{LabelSet, LabelTarget};
use crate::timestamp::Timestamp;

pub mod indom;
pub mod record;

pub use indom::IndomCache;
pub use record::{ArchiveLabel, RawIndom, RawInstance, RawLabelRecord};

/// One timestamped group of label sets in a `(target, ident)` chain.
#[derive(Clone, Debug)]
pub struct LabelEntry {
    pub stamp: Timestamp,
    pub sets: Vec<LabelSet>,
}

/// Key for help-text lookups: the kind flags and the metric/indom id.
pub type TextKey = (u32, u32);

pub struct ArchiveMeta {
    label: ArchiveLabel,
    descs: FxHashMap<MetricId, Descriptor>,
    ids_by_name: FxHashMap<String, MetricId>,
    names_by_id: FxHashMap<MetricId, Vec<String>>,
    indoms: IndomCache,
    /// `(target, ident)` chains, newest first.
    labels: FxHashMap<u32, FxHashMap<u32, Vec<LabelEntry>>>,
    /// Most-recent wins.
    text: FxHashMap<TextKey, String>,
}

impl ArchiveMeta {
    /// Load the whole metadata file.  Loading happens exactly once per
    /// archive; a scan error aborts the load and the archive stays
    /// unusable.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<ArchiveMeta> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);
        let label = ArchiveLabel::read(&mut reader)?;
        let mut meta = ArchiveMeta {
            label,
            descs: FxHashMap::default(),
            ids_by_name: FxHashMap::default(),
            names_by_id: FxHashMap::default(),
            indoms: IndomCache::new(),
            labels: FxHashMap::default(),
            text: FxHashMap::default(),
        };

        let mut numpmid = 0usize;
        while let Some((typ, body)) = record::read_record(&mut reader)? {
            match typ {
                record::TYPE_DESC => {
                    let (desc, names) = record::decode_desc_body(&body)?;
                    meta.add_desc(&desc)?;
                    numpmid += 1;
                    for name in names {
                        meta.add_pmns_node(desc.pmid, name);
                    }
                }
                record::TYPE_INDOM | record::TYPE_INDOM_V2 => {
                    let raw = record::decode_indom_body(&body, typ)?;
                    if !raw.instances.is_empty() {
                        meta.indoms.add(raw, false);
                    }
                }
                record::TYPE_INDOM_DELTA => {
                    let raw = record::decode_indom_body(&body, typ)?;
                    meta.indoms.add(raw, true);
                }
                record::TYPE_LABEL | record::TYPE_LABEL_V2 => {
                    let raw = record::decode_label_body(&body, typ)?;
                    meta.add_labels(raw);
                }
                record::TYPE_TEXT => {
                    let (kind, ident, text) = record::decode_text_body(&body)?;
                    meta.add_text(kind, ident, text);
                }
                other => return Err(Error::RecordType(other)),
            }
        }

        if numpmid == 0 {
            debug!("metadata log holds no metrics");
            return Err(Error::LogRec);
        }
        meta.dedup_labels();
        Ok(meta)
    }

    pub fn label(&self) -> &ArchiveLabel {
        &self.label
    }

    /// Register a descriptor; rebinding an id with conflicting fields
    /// fails with the specific change error.
    fn add_desc(&mut self, desc: &Descriptor) -> Result<()> {
        if let Some(old) = self.descs.get(&desc.pmid) {
            if desc.typ != old.typ {
                return Err(Error::LogChangeType);
            }
            if desc.sem != old.sem {
                return Err(Error::LogChangeSem);
            }
            if desc.indom != old.indom {
                return Err(Error::LogChangeIndom);
            }
            if desc.units != old.units {
                return Err(Error::LogChangeUnits);
            }
            return Ok(());
        }
        self.descs.insert(desc.pmid, *desc);
        Ok(())
    }

    /// A duplicate name with a different id is recoverable: better to
    /// expose most of the archive than none of it.
    fn add_pmns_node(&mut self, pmid: MetricId, name: String) {
        if let Some(existing) = self.ids_by_name.get(&name) {
            if *existing != pmid {
                warn!(%pmid, name = %name, "duplicate metric name with different id ignored");
            }
            return;
        }
        self.ids_by_name.insert(name.clone(), pmid);
        self.names_by_id.entry(pmid).or_default().push(name);
    }

    fn add_labels(&mut self, raw: RawLabelRecord) {
        let target = raw.target.as_raw();
        let ident = if raw.target == LabelTarget::Context {
            u32::MAX
        } else {
            raw.ident
        };
        let chain = self
            .labels
            .entry(target)
            .or_default()
            .entry(ident)
            .or_default();
        let entry = LabelEntry {
            stamp: raw.stamp,
            sets: raw.sets,
        };
        let pos = chain
            .iter()
            .position(|e| e.stamp < entry.stamp)
            .unwrap_or(chain.len());
        chain.insert(pos, entry);
    }

    fn add_text(&mut self, kind: u32, ident: u32, text: String) {
        // most-recent wins when duplicates appear at load
        self.text.insert((kind, ident), text);
    }

    /// Walk each label chain newest-to-oldest and drop, from the newer
    /// of each adjacent pair, every label set also present in the
    /// older.  Per-instance label groups are atomic: they reduce only
    /// when the whole group matches.
    fn dedup_labels(&mut self) {
        for (target, chains) in self.labels.iter_mut() {
            let instances = *target == LabelTarget::Instances.as_raw();
            for chain in chains.values_mut() {
                let mut i = 0;
                while i + 1 < chain.len() {
                    let (newer, older) = {
                        let (a, b) = chain.split_at_mut(i + 1);
                        (&mut a[i], &b[0])
                    };
                    if instances
                        && (newer.sets.len() != older.sets.len()
                            || !newer
                                .sets
                                .iter()
                                .zip(&older.sets)
                                .all(|(n, o)| n.same(o)))
                    {
                        i += 1;
                        continue;
                    }
                    newer
                        .sets
                        .retain(|set| !older.sets.iter().any(|o| o.same(set)));
                    if newer.sets.is_empty() {
                        chain.remove(i);
                    } else {
                        i += 1;
                    }
                }
            }
        }
    }

    pub fn lookup_desc(&self, pmid: MetricId) -> Result<Descriptor> {
        self.descs
            .get(&pmid)
            .copied()
            .ok_or(Error::NoSuchMetricLog)
    }

    pub fn lookup_name(&self, name: &str) -> Result<MetricId> {
        self.ids_by_name
            .get(name)
            .copied()
            .ok_or(Error::NoSuchMetricLog)
    }

    pub fn metric_names(&self, pmid: MetricId) -> Result<&[String]> {
        self.names_by_id
            .get(&pmid)
            .map(|v| v.as_slice())
            .ok_or(Error::NoSuchMetricLog)
    }

    pub fn num_metrics(&self) -> usize {
        self.descs.len()
    }

    /// `(instlist, namelist)` in effect at `at`.
    pub fn get_indom(
        &mut self,
        indom: IndomId,
        at: Option<Timestamp>,
    ) -> Result<(Vec<InstId>, Vec<String>)> {
        let record = self.indoms.get(indom, at)?;
        let mut insts = Vec::with_capacity(record.instances.len());
        let mut names = Vec::with_capacity(record.instances.len());
        for instance in &record.instances {
            insts.push(instance.inst);
            names.push(instance.name.clone().unwrap_or_default());
        }
        Ok((insts, names))
    }

    /// Union of all instances ever bound in `indom`.
    pub fn get_indom_archive(&mut self, indom: IndomId) -> Result<Vec<RawInstance>> {
        self.indoms.all_instances(indom)
    }

    pub fn lookup_label(
        &self,
        target: LabelTarget,
        ident: u32,
        at: Option<Timestamp>,
    ) -> Result<&[LabelSet]> {
        let ident = if target == LabelTarget::Context {
            u32::MAX
        } else {
            ident
        };
        let chain = self
            .labels
            .get(&target.as_raw())
            .and_then(|chains| chains.get(&ident))
            .ok_or(Error::NoLabels)?;
        let entry = match at {
            None => chain.first(),
            Some(at) => chain.iter().find(|e| e.stamp <= at),
        };
        entry.map(|e| e.sets.as_slice()).ok_or(Error::NoLabels)
    }

    pub fn lookup_text(&self, kind: u32, ident: u32) -> Result<&str> {
        self.text
            .get(&(kind, ident))
            .map(|s| s.as_str())
            .ok_or(Error::NoHelpText)
    }

    #[cfg(test)]
    pub(crate) fn label_chain_len(&self, target: LabelTarget, ident: u32) -> usize {
        self.labels
            .get(&target.as_raw())
            .and_then(|chains| chains.get(&ident))
            .map(|chain| chain.len())
            .unwrap_or(0)
    }
}

// The archive is a metadata source for the expression engine, with
// interior mutability confined to the indom cache's reconstruction.
pub struct ArchiveSource(pub std::cell::RefCell<ArchiveMeta>);

impl ArchiveSource {
    pub fn new(meta: ArchiveMeta) -> ArchiveSource {
        ArchiveSource(std::cell::RefCell::new(meta))
    }
}

impl MetadataSource for ArchiveSource {
    fn desc(&self, pmid: MetricId) -> Result<Descriptor> {
        self.0.borrow().lookup_desc(pmid)
    }

    fn pmid(&self, name: &str) -> Result<MetricId> {
        self.0.borrow().lookup_name(name)
    }

    fn lookup_inst(&self, indom: IndomId, name: &str, at: Option<Timestamp>) -> Result<InstId> {
        self.0.borrow_mut().indoms.lookup_inst(indom, at, name)
    }

    fn inst_name(&self, indom: IndomId, inst: InstId, at: Option<Timestamp>) -> Result<String> {
        self.0.borrow_mut().indoms.inst_name(indom, at, inst)
    }

    fn indom_generation(&self, indom: IndomId, at: Option<Timestamp>) -> u64 {
        self.0.borrow_mut().indoms.generation(indom, at)
    }
}

/// Sequential writer for metadata logs; the counterpart of the loader,
/// and the producer used by tools that record archives.
pub struct ArchiveWriter<W: Write> {
    out: BufWriter<W>,
}

impl ArchiveWriter<File> {
    pub fn create<P: AsRef<Path>>(path: P, label: &ArchiveLabel) -> Result<ArchiveWriter<File>> {
        let file = File::create(path.as_ref())?;
        ArchiveWriter::new(file, label)
    }
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(out: W, label: &ArchiveLabel) -> Result<ArchiveWriter<W>> {
        let mut out = BufWriter::new(out);
        label.write(&mut out)?;
        Ok(ArchiveWriter { out })
    }

    pub fn put_desc(&mut self, desc: &Descriptor, names: &[String]) -> Result<()> {
        let body = record::encode_desc_body(desc, names);
        record::write_record(&mut self.out, record::TYPE_DESC, &body)
    }

    pub fn put_indom(&mut self, raw: &RawIndom, hires: bool) -> Result<()> {
        let typ = if hires {
            record::TYPE_INDOM
        } else {
            record::TYPE_INDOM_V2
        };
        let body = record::encode_indom_body(raw, typ);
        record::write_record(&mut self.out, typ, &body)
    }

    pub fn put_indom_delta(&mut self, raw: &RawIndom) -> Result<()> {
        let body = record::encode_indom_body(raw, record::TYPE_INDOM_DELTA);
        record::write_record(&mut self.out, record::TYPE_INDOM_DELTA, &body)
    }

    pub fn put_labels(&mut self, raw: &RawLabelRecord, hires: bool) -> Result<()> {
        let typ = if hires {
            record::TYPE_LABEL
        } else {
            record::TYPE_LABEL_V2
        };
        let body = record::encode_label_body(raw, typ);
        record::write_record(&mut self.out, typ, &body)
    }

    pub fn put_text(&mut self, kind: u32, ident: u32, text: &str) -> Result<()> {
        let body = record::encode_text_body(kind, ident, text);
        record::write_record(&mut self.out, record::TYPE_TEXT, &body)
    }

    pub fn finish(mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{MetricType, Semantics};
    use crate::pdu::text::{TEXT_HELP, TEXT_ONELINE, TEXT_PMID};
    use crate::units::Units;
    use serde_json::json;

    fn test_label() -> ArchiveLabel {
        ArchiveLabel {
            version: 3,
            pid: 42,
            start: Timestamp::new(1000, 0),
            hostname: "host".to_string(),
            timezone: "UTC".to_string(),
        }
    }

    fn desc(item: u32, typ: MetricType) -> Descriptor {
        Descriptor {
            pmid: MetricId::new(60, 0, item),
            typ,
            indom: IndomId::new(60, 1),
            sem: Semantics::Instant,
            units: Units::NONE,
        }
    }

    fn write_archive<F: FnOnce(&mut ArchiveWriter<&mut Vec<u8>>)>(f: F) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut writer = ArchiveWriter::new(&mut out, &test_label()).unwrap();
            f(&mut writer);
            writer.finish().unwrap();
        }
        out
    }

    fn open(bytes: &[u8]) -> Result<ArchiveMeta> {
        use std::io::Write as _;
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(bytes).unwrap();
        tmp.flush().unwrap();
        ArchiveMeta::open(tmp.path())
    }

    #[test]
    fn load_descriptors_and_names() {
        let bytes = write_archive(|w| {
            w.put_desc(&desc(1, MetricType::U64), &["disk.dev.read".to_string()])
                .unwrap();
            w.put_desc(&desc(2, MetricType::I32), &["disk.dev.qlen".to_string()])
                .unwrap();
        });
        let meta = open(&bytes).unwrap();
        assert_eq!(meta.num_metrics(), 2);
        assert_eq!(
            meta.lookup_name("disk.dev.read").unwrap(),
            MetricId::new(60, 0, 1)
        );
        assert_eq!(
            meta.lookup_desc(MetricId::new(60, 0, 2)).unwrap().typ,
            MetricType::I32
        );
        assert!(meta.lookup_name("nope").is_err());
    }

    #[test]
    fn conflicting_rebind_fails_with_specific_error() {
        let bytes = write_archive(|w| {
            w.put_desc(&desc(1, MetricType::U64), &["m.one".to_string()])
                .unwrap();
            w.put_desc(&desc(1, MetricType::I32), &["m.one".to_string()])
                .unwrap();
        });
        assert!(matches!(open(&bytes), Err(Error::LogChangeType)));

        let mut changed = desc(1, MetricType::U64);
        changed.sem = Semantics::Counter;
        let bytes = write_archive(|w| {
            w.put_desc(&desc(1, MetricType::U64), &["m.one".to_string()])
                .unwrap();
            w.put_desc(&changed, &["m.one".to_string()]).unwrap();
        });
        assert!(matches!(open(&bytes), Err(Error::LogChangeSem)));
    }

    #[test]
    fn identical_rebind_is_tolerated() {
        let bytes = write_archive(|w| {
            w.put_desc(&desc(1, MetricType::U64), &["m.one".to_string()])
                .unwrap();
            w.put_desc(&desc(1, MetricType::U64), &["m.one".to_string()])
                .unwrap();
        });
        assert_eq!(open(&bytes).unwrap().num_metrics(), 1);
    }

    #[test]
    fn empty_archive_is_rejected() {
        let bytes = write_archive(|_| {});
        assert!(matches!(open(&bytes), Err(Error::LogRec)));
    }

    #[test]
    fn indom_and_delta_round_trip_through_file() {
        let indom = IndomId::new(60, 1);
        let bytes = write_archive(|w| {
            w.put_desc(&desc(1, MetricType::U64), &["m.one".to_string()])
                .unwrap();
            w.put_indom(
                &RawIndom {
                    indom,
                    stamp: Timestamp::new(1, 0),
                    instances: vec![
                        RawInstance {
                            inst: 1,
                            name: Some("a".to_string()),
                        },
                        RawInstance {
                            inst: 2,
                            name: Some("b".to_string()),
                        },
                        RawInstance {
                            inst: 3,
                            name: Some("c".to_string()),
                        },
                    ],
                },
                true,
            )
            .unwrap();
            w.put_indom_delta(&RawIndom {
                indom,
                stamp: Timestamp::new(2, 0),
                instances: vec![
                    RawInstance {
                        inst: 2,
                        name: None,
                    },
                    RawInstance {
                        inst: 4,
                        name: Some("d".to_string()),
                    },
                ],
            })
            .unwrap();
        });
        let mut meta = open(&bytes).unwrap();
        let (insts, names) = meta
            .get_indom(indom, Some(Timestamp::new(2, 0)))
            .unwrap();
        assert_eq!(insts, vec![1, 3, 4]);
        assert_eq!(names, vec!["a", "c", "d"]);
    }

    #[test]
    fn label_chains_and_dedup() {
        let target = LabelTarget::Item;
        let ident = MetricId::new(60, 0, 1).0;
        let mut set_a = LabelSet::new(None);
        set_a.insert("agent", json!("linux"));
        let mut set_b = LabelSet::new(None);
        set_b.insert("hostname", json!("web1"));

        let bytes = write_archive(|w| {
            w.put_desc(&desc(1, MetricType::U64), &["m.one".to_string()])
                .unwrap();
            w.put_labels(
                &RawLabelRecord {
                    stamp: Timestamp::new(10, 0),
                    target,
                    ident,
                    sets: vec![set_a.clone()],
                },
                true,
            )
            .unwrap();
            // later record repeating the same set plus a new one; the
            // duplicate must be dropped by the dedup pass
            w.put_labels(
                &RawLabelRecord {
                    stamp: Timestamp::new(20, 0),
                    target,
                    ident,
                    sets: vec![set_a.clone(), set_b.clone()],
                },
                true,
            )
            .unwrap();
        });
        let meta = open(&bytes).unwrap();
        assert_eq!(meta.label_chain_len(target, ident), 2);
        let newest = meta.lookup_label(target, ident, None).unwrap();
        assert_eq!(newest.len(), 1);
        assert!(newest[0].same(&set_b));
        let old = meta
            .lookup_label(target, ident, Some(Timestamp::new(15, 0)))
            .unwrap();
        assert!(old[0].same(&set_a));
    }

    #[test]
    fn help_text_last_write_wins() {
        let ident = MetricId::new(60, 0, 1).0;
        let kind = TEXT_HELP | TEXT_PMID;
        let bytes = write_archive(|w| {
            w.put_desc(&desc(1, MetricType::U64), &["m.one".to_string()])
                .unwrap();
            w.put_text(kind, ident, "first").unwrap();
            w.put_text(kind, ident, "corrected").unwrap();
            w.put_text(TEXT_ONELINE | TEXT_PMID, ident, "one line").unwrap();
        });
        let meta = open(&bytes).unwrap();
        assert_eq!(meta.lookup_text(kind, ident).unwrap(), "corrected");
        assert_eq!(
            meta.lookup_text(TEXT_ONELINE | TEXT_PMID, ident).unwrap(),
            "one line"
        );
        assert!(meta.lookup_text(kind, 999).is_err());
    }

    #[test]
    fn truncated_file_is_a_scan_error() {
        let mut bytes = write_archive(|w| {
            w.put_desc(&desc(1, MetricType::U64), &["m.one".to_string()])
                .unwrap();
        });
        bytes.truncate(bytes.len() - 2);
        assert!(open(&bytes).is_err());
    }
}
