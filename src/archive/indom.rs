//! The in-memory instance-domain cache: per-indom chains of
//! timestamped records, newest first, with delta records reconstructed
//! on demand.
//!
//! Records live in an arena; chains hold arena indices, so walking
//! forwards and backwards in time is index arithmetic, not pointer
//! chasing.

use fxhash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use super::record::{RawIndom, RawInstance};
use crate::error::{Error, Result};
use crate::ident::{IndomId, InstId};
use crate::timestamp::Timestamp;

/// Above this many instances, aggregation queries switch from linear
/// scans to hashed de-duplication.
const BIG_INDOM: usize = 16;

#[derive(Clone, Debug)]
pub struct IndomRecord {
    pub indom: IndomId,
    pub stamp: Timestamp,
    pub is_delta: bool,
    pub instances: Vec<RawInstance>,
}

#[derive(Default)]
pub struct IndomCache {
    arena: Vec<IndomRecord>,
    /// Arena indices in strictly non-increasing timestamp order.
    buckets: FxHashMap<IndomId, Vec<usize>>,
}

/// Sort an instance list by ascending instance id.  Insertion sort:
/// the lists arrive close to sorted.
fn add_insts(instances: &mut Vec<RawInstance>) {
    for i in 1..instances.len() {
        let mut j = i;
        while j > 0 && instances[j].inst < instances[j - 1].inst {
            instances.swap(j, j - 1);
            j -= 1;
        }
    }
}

/// True when both records bind the same ids to the same names.  With
/// both lists sorted this is a linear comparison.
fn same_indom(a: &IndomRecord, b: &IndomRecord) -> bool {
    a.instances.len() == b.instances.len()
        && a.instances
            .iter()
            .zip(&b.instances)
            .all(|(x, y)| x.inst == y.inst && x.name == y.name)
}

impl IndomCache {
    pub fn new() -> IndomCache {
        IndomCache::default()
    }

    /// Insert one record, keeping the bucket ordered newest-first and
    /// collapsing duplicate snapshots within a time slot.  Delta
    /// records are never compared for equality.
    pub fn add(&mut self, raw: RawIndom, is_delta: bool) {
        let mut record = IndomRecord {
            indom: raw.indom,
            stamp: raw.stamp,
            is_delta,
            instances: raw.instances,
        };
        add_insts(&mut record.instances);

        let bucket = self.buckets.entry(record.indom).or_default();
        let mut pos = bucket.len();
        for (i, idx) in bucket.iter().enumerate() {
            let cached = &self.arena[*idx];
            if cached.stamp < record.stamp {
                pos = i;
                break;
            }
            if cached.stamp == record.stamp {
                // scan this time slot for a semantically equal
                // snapshot; if found, promote it to the slot head
                let slot_start = i;
                let mut scan = i;
                while scan < bucket.len() {
                    let candidate = &self.arena[bucket[scan]];
                    if candidate.stamp != record.stamp {
                        break;
                    }
                    if !record.is_delta
                        && !candidate.is_delta
                        && same_indom(candidate, &record)
                    {
                        let idx = bucket.remove(scan);
                        bucket.insert(slot_start, idx);
                        trace!(indom = %record.indom, "duplicate indom record collapsed");
                        return;
                    }
                    scan += 1;
                }
                pos = slot_start;
                break;
            }
        }
        let idx = self.arena.len();
        self.arena.push(record);
        bucket.insert(pos, idx);
    }

    /// Find the record in effect at `at` (or the newest when `at` is
    /// None).  Any delta record encountered on the walk is
    /// reconstructed in place, caching the full list.
    fn search(&mut self, indom: IndomId, at: Option<Timestamp>) -> Result<usize> {
        let bucket = self
            .buckets
            .get(&indom)
            .ok_or(Error::NoSuchIndomLog)?
            .clone();
        for (i, idx) in bucket.iter().enumerate() {
            if self.arena[*idx].is_delta {
                self.undelta(&bucket, i)?;
            }
            match at {
                None => return Ok(*idx),
                Some(at) => {
                    if self.arena[*idx].stamp <= at {
                        return Ok(*idx);
                    }
                }
            }
        }
        Err(Error::NoSuchIndomLog)
    }

    /// Reconstruct the delta record at `bucket[start]` (and any deltas
    /// between it and the nearest full snapshot further back in time).
    /// Each reconstructed record stops being a delta; repeat lookups
    /// find the cached full list.
    fn undelta(&mut self, bucket: &[usize], start: usize) -> Result<()> {
        // the chain runs newest-first; find the snapshot behind us
        let mut snapshot = None;
        for (i, idx) in bucket.iter().enumerate().skip(start + 1) {
            if !self.arena[*idx].is_delta {
                snapshot = Some(i);
                break;
            }
        }
        // a delta with no reachable snapshot is data corruption
        let snapshot = snapshot.ok_or_else(|| {
            debug!("delta indom chain without a full snapshot");
            Error::LogRec
        })?;

        // march forward in time from the snapshot, materialising each
        // delta into a full instance list
        let mut base = self.arena[bucket[snapshot]].instances.clone();
        for i in (start..snapshot).rev() {
            let idx = bucket[i];
            let record = &self.arena[idx];
            if !record.is_delta {
                base = record.instances.clone();
                continue;
            }
            let mut merged: Vec<RawInstance> = Vec::with_capacity(base.len());
            let (mut bi, mut di) = (0usize, 0usize);
            let delta = &record.instances;
            while bi < base.len() || di < delta.len() {
                if bi < base.len() && di < delta.len() {
                    if delta[di].name.is_none() && base[bi].inst == delta[di].inst {
                        // delete old instance
                        bi += 1;
                        di += 1;
                        continue;
                    }
                    if delta[di].name.is_some() && base[bi].inst > delta[di].inst {
                        // add new instance in sorted position
                        merged.push(delta[di].clone());
                        di += 1;
                        continue;
                    }
                }
                if bi < base.len() {
                    merged.push(base[bi].clone());
                    bi += 1;
                } else {
                    if delta[di].name.is_none() {
                        return Err(Error::LogRec);
                    }
                    merged.push(delta[di].clone());
                    di += 1;
                }
            }
            let record = &mut self.arena[idx];
            record.instances = merged.clone();
            record.is_delta = false;
            base = merged;
        }
        Ok(())
    }

    /// The instance list in effect at `at`.
    pub fn get(&mut self, indom: IndomId, at: Option<Timestamp>) -> Result<&IndomRecord> {
        let idx = self.search(indom, at)?;
        Ok(&self.arena[idx])
    }

    /// Map an external name to an instance id: full match first, then
    /// the classical match on the name up to its first space.
    pub fn lookup_inst(
        &mut self,
        indom: IndomId,
        at: Option<Timestamp>,
        name: &str,
    ) -> Result<InstId> {
        let record = self.get(indom, at)?;
        for instance in &record.instances {
            if instance.name.as_deref() == Some(name) {
                return Ok(instance.inst);
            }
        }
        for instance in &record.instances {
            if let Some(full) = &instance.name {
                if let Some(head) = full.split(' ').next() {
                    if head == name && full.contains(' ') {
                        return Ok(instance.inst);
                    }
                }
            }
        }
        Err(Error::NoSuchInstanceLog)
    }

    pub fn inst_name(
        &mut self,
        indom: IndomId,
        at: Option<Timestamp>,
        inst: InstId,
    ) -> Result<String> {
        let record = self.get(indom, at)?;
        record
            .instances
            .iter()
            .find(|i| i.inst == inst)
            .and_then(|i| i.name.clone())
            .ok_or(Error::NoSuchInstanceLog)
    }

    /// Every `(inst, name)` binding that ever existed for `indom`,
    /// newest binding wins.  Buckets holding a record with more than
    /// [`BIG_INDOM`] instances deduplicate through a hash set instead
    /// of a linear scan.
    pub fn all_instances(&mut self, indom: IndomId) -> Result<Vec<RawInstance>> {
        // make sure every record is in full form first
        let bucket = self
            .buckets
            .get(&indom)
            .ok_or(Error::NoSuchIndomLog)?
            .clone();
        for (i, idx) in bucket.iter().enumerate() {
            if self.arena[*idx].is_delta {
                self.undelta(&bucket, i)?;
            }
        }

        let big = bucket
            .iter()
            .any(|idx| self.arena[*idx].instances.len() > BIG_INDOM);
        let mut out: Vec<RawInstance> = Vec::new();
        if big {
            let mut seen: FxHashSet<InstId> = FxHashSet::default();
            for idx in &bucket {
                for instance in &self.arena[*idx].instances {
                    if seen.insert(instance.inst) {
                        out.push(instance.clone());
                    }
                }
            }
        } else {
            for idx in &bucket {
                for instance in &self.arena[*idx].instances {
                    if !out.iter().any(|o| o.inst == instance.inst) {
                        out.push(instance.clone());
                    }
                }
            }
        }
        out.sort_by_key(|i| i.inst);
        Ok(out)
    }

    /// Identifier of the record answering lookups at `at`; changes when
    /// that record changes.
    pub fn generation(&mut self, indom: IndomId, at: Option<Timestamp>) -> u64 {
        match self.search(indom, at) {
            Ok(idx) => {
                let stamp = self.arena[idx].stamp;
                (stamp.sec as u64) << 30 ^ stamp.nsec as u64 ^ (idx as u64) << 1
            }
            Err(_) => 0,
        }
    }

    /// Bucket timestamps for verification: newest first.
    #[cfg(test)]
    pub fn bucket_stamps(&self, indom: IndomId) -> Vec<Timestamp> {
        self.buckets
            .get(&indom)
            .map(|b| b.iter().map(|idx| self.arena[*idx].stamp).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDOM: IndomId = IndomId(0x4000_0001);

    fn inst(id: InstId, name: &str) -> RawInstance {
        RawInstance {
            inst: id,
            name: Some(name.to_string()),
        }
    }

    fn del(id: InstId) -> RawInstance {
        RawInstance {
            inst: id,
            name: None,
        }
    }

    fn raw(sec: i64, instances: Vec<RawInstance>) -> RawIndom {
        RawIndom {
            indom: INDOM,
            stamp: Timestamp::new(sec, 0),
            instances,
        }
    }

    #[test]
    fn instance_lists_are_sorted_on_insert() {
        let mut cache = IndomCache::new();
        cache.add(raw(1, vec![inst(3, "c"), inst(1, "a"), inst(2, "b")]), false);
        let record = cache.get(INDOM, None).unwrap();
        let ids: Vec<InstId> = record.instances.iter().map(|i| i.inst).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn buckets_are_newest_first() {
        let mut cache = IndomCache::new();
        cache.add(raw(1, vec![inst(1, "a")]), false);
        cache.add(raw(3, vec![inst(1, "a")]), false);
        cache.add(raw(2, vec![inst(1, "a")]), false);
        let stamps: Vec<i64> = cache
            .bucket_stamps(INDOM)
            .into_iter()
            .map(|t| t.sec)
            .collect();
        assert_eq!(stamps, vec![3, 2, 1]);
    }

    #[test]
    fn timestamped_lookup_picks_first_at_or_before() {
        let mut cache = IndomCache::new();
        cache.add(raw(10, vec![inst(1, "old")]), false);
        cache.add(raw(20, vec![inst(1, "new")]), false);
        let record = cache.get(INDOM, Some(Timestamp::new(15, 0))).unwrap();
        assert_eq!(record.instances[0].name.as_deref(), Some("old"));
        let record = cache.get(INDOM, Some(Timestamp::new(25, 0))).unwrap();
        assert_eq!(record.instances[0].name.as_deref(), Some("new"));
        assert!(cache.get(INDOM, Some(Timestamp::new(5, 0))).is_err());
    }

    #[test]
    fn duplicate_snapshots_are_collapsed() {
        let mut cache = IndomCache::new();
        cache.add(raw(5, vec![inst(1, "a"), inst(2, "b")]), false);
        cache.add(raw(5, vec![inst(2, "b"), inst(1, "a")]), false);
        assert_eq!(cache.bucket_stamps(INDOM).len(), 1);
    }

    #[test]
    fn scenario_delta_reconstruction() {
        let mut cache = IndomCache::new();
        cache.add(
            raw(1, vec![inst(1, "a"), inst(2, "b"), inst(3, "c")]),
            false,
        );
        cache.add(raw(2, vec![del(2), inst(4, "d")]), true);

        let record = cache.get(INDOM, Some(Timestamp::new(2, 0))).unwrap();
        let got: Vec<(InstId, &str)> = record
            .instances
            .iter()
            .map(|i| (i.inst, i.name.as_deref().unwrap()))
            .collect();
        assert_eq!(got, vec![(1, "a"), (3, "c"), (4, "d")]);
        // reconstruction is cached
        assert!(!record.is_delta);
    }

    #[test]
    fn chained_deltas_reconstruct_through_each_generation() {
        let mut cache = IndomCache::new();
        cache.add(raw(1, vec![inst(1, "a"), inst(2, "b")]), false);
        cache.add(raw(2, vec![del(1)]), true);
        cache.add(raw(3, vec![inst(5, "e")]), true);

        let record = cache.get(INDOM, Some(Timestamp::new(3, 0))).unwrap();
        let ids: Vec<InstId> = record.instances.iter().map(|i| i.inst).collect();
        assert_eq!(ids, vec![2, 5]);

        let record = cache.get(INDOM, Some(Timestamp::new(2, 0))).unwrap();
        let ids: Vec<InstId> = record.instances.iter().map(|i| i.inst).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn delta_without_snapshot_is_corruption() {
        let mut cache = IndomCache::new();
        cache.add(raw(2, vec![inst(4, "d")]), true);
        assert!(matches!(
            cache.get(INDOM, Some(Timestamp::new(2, 0))),
            Err(Error::LogRec)
        ));
    }

    #[test]
    fn name_lookup_with_space_rule() {
        let mut cache = IndomCache::new();
        cache.add(
            raw(1, vec![inst(1, "sda IDE drive"), inst(2, "sdb")]),
            false,
        );
        assert_eq!(cache.lookup_inst(INDOM, None, "sda").unwrap(), 1);
        assert_eq!(cache.lookup_inst(INDOM, None, "sda IDE drive").unwrap(), 1);
        assert_eq!(cache.lookup_inst(INDOM, None, "sdb").unwrap(), 2);
        assert!(cache.lookup_inst(INDOM, None, "sdc").is_err());
    }

    #[test]
    fn all_instances_unions_generations() {
        let mut cache = IndomCache::new();
        cache.add(raw(1, vec![inst(1, "a"), inst(2, "b")]), false);
        cache.add(raw(2, vec![inst(2, "b"), inst(3, "c")]), false);
        let all = cache.all_instances(INDOM).unwrap();
        let ids: Vec<InstId> = all.iter().map(|i| i.inst).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn all_instances_big_indom_path() {
        let mut cache = IndomCache::new();
        let many: Vec<RawInstance> = (0..20).map(|i| inst(i, "x")).collect();
        cache.add(raw(1, many), false);
        cache.add(raw(2, vec![inst(30, "y")]), false);
        let all = cache.all_instances(INDOM).unwrap();
        assert_eq!(all.len(), 21);
    }

    #[test]
    fn generation_tracks_record_changes() {
        let mut cache = IndomCache::new();
        cache.add(raw(10, vec![inst(1, "a")]), false);
        let g1 = cache.generation(INDOM, Some(Timestamp::new(15, 0)));
        cache.add(raw(20, vec![inst(2, "b")]), false);
        let g2 = cache.generation(INDOM, Some(Timestamp::new(25, 0)));
        assert_ne!(g1, g2);
        assert_eq!(g1, cache.generation(INDOM, Some(Timestamp::new(15, 0))));
    }
}
