//! Fetch integration: augmenting the outbound metric-id list with
//! expression operands, and rewriting the response with computed
//! values.

use tracing::debug;

use super::{bind::bind, eval::eval_expr, BindState, DerivedRegistry, MetadataSource};
use crate::error::Error;
use crate::ident::MetricId;
use crate::result::{FetchResult, FetchValue, ValueSet, WireValue};

impl DerivedRegistry {
    /// Walk the caller's metric-id list ahead of a fetch.  Derived ids
    /// are lazily bound and the real-metric operands they reference are
    /// appended (each once, and never when already requested).
    ///
    /// Returns `None` when the list holds no derived metrics and can be
    /// forwarded unmodified; otherwise the augmented list, with the
    /// caller's ids first so the post-processor can find their slots.
    pub fn prefetch(
        &mut self,
        src: &dyn MetadataSource,
        pmids: &[MetricId],
    ) -> Option<Vec<MetricId>> {
        self.fetch_numpmid = pmids.len();
        self.fetch_has_dm = false;

        let mut extra: Vec<MetricId> = Vec::new();
        let mut found_derived = false;
        for pmid in pmids {
            if !pmid.is_derived() {
                continue;
            }
            let metric = match self.metrics.iter_mut().find(|m| m.pmid == *pmid) {
                Some(metric) => metric,
                None => continue,
            };
            found_derived = true;
            if metric.state == BindState::Unbound {
                metric.state = match bind(&mut metric.expr, src) {
                    Ok(()) => BindState::Bound,
                    Err(err) => {
                        // soft failure: same outcome as a metric no
                        // agent supports
                        debug!(name = %metric.name, %err, "derived metric failed to bind");
                        BindState::Failed
                    }
                };
            }
            if metric.state == BindState::Bound {
                metric.expr.operand_pmids(&mut extra);
                self.fetch_has_dm = true;
            }
        }

        extra.retain(|x| !pmids.contains(x));
        let mut deduped: Vec<MetricId> = Vec::with_capacity(extra.len());
        for x in extra {
            if !deduped.contains(&x) {
                deduped.push(x);
            }
        }

        if deduped.is_empty() && !found_derived {
            return None;
        }
        debug!(added = deduped.len(), "derived metrics prefetch");
        let mut list = pmids.to_vec();
        list.extend(deduped);
        Some(list)
    }

    /// Rewrite a fetch response: every derived slot is replaced with
    /// the evaluated expression value, converted to the declared result
    /// type; the operand slots appended by [`prefetch`] are dropped.
    pub fn postfetch(&mut self, src: &dyn MetadataSource, result: FetchResult) -> FetchResult {
        if !self.fetch_has_dm {
            return result;
        }

        let mut rewritten = FetchResult::new(result.timestamp);
        for j in 0..self.fetch_numpmid {
            let vset = match result.vsets.get(j) {
                Some(vset) => vset,
                None => break,
            };
            if !vset.pmid.is_derived() {
                rewritten.vsets.push(vset.clone());
                continue;
            }
            let metric = self
                .metrics
                .iter_mut()
                .find(|m| m.pmid == vset.pmid && m.state == BindState::Bound);
            let metric = match metric {
                Some(metric) => metric,
                None => {
                    rewritten
                        .vsets
                        .push(ValueSet::error(vset.pmid, Error::NoSuchMetric.code()));
                    continue;
                }
            };
            match eval_expr(src, &mut metric.expr, &result) {
                Err(err) => rewritten.vsets.push(ValueSet::error(vset.pmid, err.code())),
                Ok(_) => {
                    let expr = &metric.expr;
                    let mut values = Vec::with_capacity(expr.info.ivlist.len());
                    let mut failed = None;
                    for ival in &expr.info.ivlist {
                        match WireValue::from_value(&ival.value) {
                            Ok(value) => values.push(FetchValue {
                                inst: ival.inst,
                                value,
                            }),
                            Err(err) => {
                                failed = Some(err);
                                break;
                            }
                        }
                    }
                    rewritten.vsets.push(match failed {
                        Some(err) => ValueSet::error(vset.pmid, err.code()),
                        None => ValueSet {
                            pmid: vset.pmid,
                            values: Ok(values),
                        },
                    });
                }
            }
        }
        rewritten
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deriv::MetadataSource;
    use crate::desc::{Descriptor, MetricType, Semantics};
    use crate::error::Result;
    use crate::ident::{IndomId, InstId, INST_NULL};
    use crate::timestamp::Timestamp;
    use crate::units::{TimeScale, Units};
    use crate::value::Value;

    struct Source;

    const COUNTER: MetricId = MetricId(0x0f00_0001);
    const GAUGE: MetricId = MetricId(0x0f00_0002);

    impl MetadataSource for Source {
        fn desc(&self, pmid: MetricId) -> Result<Descriptor> {
            if pmid == COUNTER {
                Ok(Descriptor {
                    pmid,
                    typ: MetricType::U64,
                    indom: IndomId::NULL,
                    sem: Semantics::Counter,
                    units: Units::time(TimeScale::Sec),
                })
            } else if pmid == GAUGE {
                Ok(Descriptor {
                    pmid,
                    typ: MetricType::I32,
                    indom: IndomId::new(3, 1),
                    sem: Semantics::Instant,
                    units: Units::NONE,
                })
            } else {
                Err(Error::NoSuchMetric)
            }
        }

        fn pmid(&self, name: &str) -> Result<MetricId> {
            match name {
                "cpu.busy" => Ok(COUNTER),
                "load.avg" => Ok(GAUGE),
                _ => Err(Error::NoSuchMetric),
            }
        }

        fn lookup_inst(&self, _: IndomId, _: &str, _: Option<Timestamp>) -> Result<InstId> {
            Err(Error::NoSuchInstance)
        }

        fn inst_name(&self, _: IndomId, inst: InstId, _: Option<Timestamp>) -> Result<String> {
            Ok(format!("inst{}", inst))
        }
    }

    fn result_with(
        ts: Timestamp,
        entries: Vec<(MetricId, Vec<(InstId, Value)>)>,
    ) -> FetchResult {
        let mut result = FetchResult::new(ts);
        for (pmid, values) in entries {
            result.vsets.push(ValueSet {
                pmid,
                values: Ok(values
                    .into_iter()
                    .map(|(inst, v)| FetchValue {
                        inst,
                        value: WireValue::from_value(&v).unwrap(),
                    })
                    .collect()),
            });
        }
        result
    }

    #[test]
    fn no_derived_ids_leave_fetch_unmodified() {
        let mut reg = DerivedRegistry::new();
        reg.register("x", "cpu.busy + 1").unwrap();
        assert!(reg.prefetch(&Source, &[COUNTER]).is_none());
    }

    #[test]
    fn prefetch_appends_operands_once() {
        let mut reg = DerivedRegistry::new();
        let d = reg.register("x", "cpu.busy + cpu.busy").unwrap();
        let list = reg.prefetch(&Source, &[d]).unwrap();
        assert_eq!(list, vec![d, COUNTER]);

        // operand already requested: nothing appended
        let list = reg.prefetch(&Source, &[d, COUNTER]).unwrap();
        assert_eq!(list, vec![d, COUNTER]);
    }

    #[test]
    fn postfetch_rewrites_derived_slot() {
        let mut reg = DerivedRegistry::new();
        let d = reg.register("x", "load.avg * 2").unwrap();
        let list = reg.prefetch(&Source, &[d]).unwrap();
        assert_eq!(list, vec![d, GAUGE]);

        let mut input = result_with(
            Timestamp::new(100, 0),
            vec![(GAUGE, vec![(1, Value::I32(4)), (2, Value::I32(5))])],
        );
        // the derived slot comes first, as the server would lay it out
        input.vsets.insert(0, ValueSet::error(d, -1));
        let out = reg.postfetch(&Source, input);
        assert_eq!(out.vsets.len(), 1);
        let values = out.vsets[0].values.as_ref().unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].value, WireValue::Insitu(8));
        assert_eq!(values[1].value, WireValue::Insitu(10));
    }

    #[test]
    fn unbound_derived_yields_metric_error() {
        let mut reg = DerivedRegistry::new();
        let d = reg.register("x", "no.such.metric + 1").unwrap();
        // bind fails soft; no operands and no bound expression
        assert!(reg.prefetch(&Source, &[d]).is_some());

        let mut reg2 = DerivedRegistry::new();
        let d2 = reg2.register("y", "load.avg + no.such.metric").unwrap();
        let list = reg2.prefetch(&Source, &[d2]).unwrap();
        assert_eq!(list, vec![d2]);
    }

    #[test]
    fn scenario_rate_over_two_fetches() {
        let mut reg = DerivedRegistry::new();
        let d = reg.register("busy.rate", "rate(cpu.busy)").unwrap();
        let list = reg.prefetch(&Source, &[d]).unwrap();
        assert_eq!(list, vec![d, COUNTER]);

        let mut first = result_with(
            Timestamp::new(0, 0),
            vec![(COUNTER, vec![(INST_NULL, Value::U64(100))])],
        );
        first.vsets.insert(0, ValueSet::error(d, -1));
        let out = reg.postfetch(&Source, first);
        // one sample only: no rate yet
        assert_eq!(out.vsets[0].values.as_ref().unwrap().len(), 0);

        reg.prefetch(&Source, &[d]).unwrap();
        let mut second = result_with(
            Timestamp::new(2, 0),
            vec![(COUNTER, vec![(INST_NULL, Value::U64(300))])],
        );
        second.vsets.insert(0, ValueSet::error(d, -1));
        let out = reg.postfetch(&Source, second);
        let values = out.vsets[0].values.as_ref().unwrap();
        assert_eq!(values.len(), 1);
        // (300 - 100) / 2s, seconds-per-second: dimensionless 100
        match &values[0].value {
            WireValue::Block(block) => {
                assert_eq!(block.to_value().unwrap(), Value::Double(100.0));
            }
            other => panic!("expected a value block, got {:?}", other),
        }
    }

    #[test]
    fn scenario_count_tolerates_child_error() {
        let mut reg = DerivedRegistry::new();
        let d = reg.register("n", "count(load.avg)").unwrap();
        reg.prefetch(&Source, &[d]).unwrap();

        let mut input = FetchResult::new(Timestamp::new(5, 0));
        input.vsets.push(ValueSet::error(d, -1));
        input
            .vsets
            .push(ValueSet::error(GAUGE, Error::NoSuchInstanceLog.code()));
        let out = reg.postfetch(&Source, input);
        let values = out.vsets[0].values.as_ref().unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, WireValue::Insitu(0));
    }
}
