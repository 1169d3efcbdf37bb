//! The expression walker: a pre-order recursion filling operand values
//! from the fetch result at the leaves and propagating computed value
//! lists towards the root.

use tracing::trace;

use super::{IVal, MetadataSource, Node, NodeInfo, NodeKind, Pattern, REGEX_INST_COMPACT};
use crate::desc::MetricType;
use crate::error::{Error, Result};
use crate::ident::{InstId, INST_NULL};
use crate::result::FetchResult;
use crate::value::{as_u32_flag, bin_op, promote, Value};

/// Release the previous value list, or capture it as the previous
/// generation when this node feeds a delta()/rate().  At most one old
/// generation is ever held.
fn free_ivlist(info: &mut NodeInfo) {
    if info.save_last {
        info.last_ivlist = Some(std::mem::take(&mut info.ivlist));
    } else {
        info.ivlist.clear();
    }
}

pub fn eval_expr(src: &dyn MetadataSource, node: &mut Node, rp: &FetchResult) -> Result<i32> {
    if let Some(left) = node.left.as_mut() {
        match eval_expr(src, left, rp) {
            Ok(_) => {}
            Err(err) => {
                if let NodeKind::Count = node.kind {
                    // count() maps child errors to the literal value 0
                    node.info.ivlist = vec![IVal {
                        inst: INST_NULL,
                        value: Value::U32(0),
                    }];
                    return Ok(1);
                }
                return Err(err);
            }
        }
    }
    if let Some(right) = node.right.as_mut() {
        eval_expr(src, right, rp)?;
    }

    let Node {
        kind,
        left,
        right,
        desc,
        info,
    } = node;

    match kind {
        NodeKind::Integer(lexeme) | NodeKind::Double(lexeme) => {
            if !info.parsed {
                // no syntax errors possible here, the parser vetted the
                // lexeme; only the width is decided late
                let value = match desc.typ {
                    MetricType::I32 => Value::I32(lexeme.parse().unwrap_or(0)),
                    MetricType::U32 => Value::U32(lexeme.parse().unwrap_or(0)),
                    MetricType::I64 => Value::I64(lexeme.parse().unwrap_or(0)),
                    MetricType::U64 => Value::U64(lexeme.parse().unwrap_or(0)),
                    MetricType::Float => Value::Float(lexeme.parse().unwrap_or(0.0)),
                    _ => Value::Double(lexeme.parse().unwrap_or(0.0)),
                };
                info.ivlist = vec![IVal {
                    inst: INST_NULL,
                    value,
                }];
                info.parsed = true;
            }
            Ok(1)
        }

        NodeKind::Name(_) => {
            let vset = rp
                .vsets
                .iter()
                .find(|vs| vs.pmid == info.pmid)
                .ok_or(Error::NoSuchMetric)?;
            free_ivlist(info);
            let values = match &vset.values {
                Err(code) => return Err(Error::from_code(*code)),
                Ok(values) => values,
            };
            for fv in values {
                info.ivlist.push(IVal {
                    inst: fv.inst,
                    value: fv.value.to_value(desc.typ)?,
                });
            }
            Ok(info.ivlist.len() as i32)
        }

        NodeKind::Delta | NodeKind::Rate => {
            let is_rate = matches!(kind, NodeKind::Rate);
            info.last_stamp = info.stamp;
            info.stamp = rp.timestamp;
            free_ivlist(info);
            let operand = left.as_ref().unwrap();
            let cur = &operand.info.ivlist;
            let empty = Vec::new();
            let prev = operand.info.last_ivlist.as_ref().unwrap_or(&empty);
            if cur.is_empty() || prev.is_empty() {
                return Ok(0);
            }
            let dt = info.stamp.seconds_since(&info.last_stamp);
            for (i, curval) in cur.iter().enumerate() {
                // usually position is preserved between fetches; fall
                // back to a search when the instances moved
                let mut j = if i < prev.len() { i } else { 0 };
                if prev[j].inst != curval.inst {
                    match prev.iter().position(|p| p.inst == curval.inst) {
                        Some(pos) => j = pos,
                        None => continue,
                    }
                }
                if is_rate {
                    let delta = curval.value.as_f64()? - prev[j].value.as_f64()?;
                    let mut rate = if dt != 0.0 { delta / dt } else { 0.0 };
                    if operand.desc.units.dim_time == 1 {
                        let scale = *info
                            .time_scale
                            .get_or_insert_with(|| operand.desc.units.time_scale_to_seconds());
                        rate *= scale;
                    }
                    info.ivlist.push(IVal {
                        inst: curval.inst,
                        value: Value::Double(rate),
                    });
                } else {
                    let value = bin_op(
                        operand.desc.typ,
                        crate::value::BinOp::Sub,
                        &curval.value,
                        1.0,
                        &prev[j].value,
                        1.0,
                    )
                    .map_err(|_| Error::Conv)?;
                    info.ivlist.push(IVal {
                        inst: curval.inst,
                        value,
                    });
                }
            }
            Ok(info.ivlist.len() as i32)
        }

        NodeKind::Not => {
            free_ivlist(info);
            let operand = left.as_ref().unwrap();
            for val in &operand.info.ivlist {
                info.ivlist.push(IVal {
                    inst: val.inst,
                    value: val.value.not()?,
                });
            }
            Ok(info.ivlist.len() as i32)
        }

        NodeKind::Neg => {
            free_ivlist(info);
            let operand = left.as_ref().unwrap();
            for val in &operand.info.ivlist {
                info.ivlist.push(IVal {
                    inst: val.inst,
                    value: val.value.negate()?,
                });
            }
            Ok(info.ivlist.len() as i32)
        }

        NodeKind::Colon => Ok(0),

        NodeKind::Quest => {
            free_ivlist(info);
            let guard = left.as_ref().unwrap();
            let colon = right.as_ref().unwrap();
            let then = colon.left.as_ref().unwrap();
            let otherwise = colon.right.as_ref().unwrap();
            if guard.info.ivlist.is_empty()
                || then.info.ivlist.is_empty()
                || otherwise.info.ivlist.is_empty()
            {
                return Ok(0);
            }
            let numval = then.info.ivlist.len().max(otherwise.info.ivlist.len());
            // instance ids come from whichever arm has an indom; at
            // most one of them does (validated at bind time)
            let pick_inst = if then.desc.indom.is_null() && !otherwise.desc.indom.is_null() {
                otherwise
            } else {
                then
            };
            let mut pick = then;
            for i in 0..numval {
                if i < guard.info.ivlist.len() {
                    pick = if guard.info.ivlist[i].value.is_nonzero()? {
                        then
                    } else {
                        otherwise
                    };
                }
                let arm = &pick.info.ivlist;
                let value = if i < arm.len() {
                    arm[i].value.clone()
                } else {
                    arm[0].value.clone()
                };
                let inst = pick_inst
                    .info
                    .ivlist
                    .get(i)
                    .map(|v| v.inst)
                    .unwrap_or(INST_NULL);
                info.ivlist.push(IVal { inst, value });
            }
            Ok(info.ivlist.len() as i32)
        }

        NodeKind::Rescale => {
            free_ivlist(info);
            let operand = left.as_ref().unwrap();
            let target = right.as_ref().unwrap().desc.units;
            let factor = operand.desc.units.scale_factor(&target)?;
            for val in &operand.info.ivlist {
                // elements that fail conversion are dropped
                let scaled = match val.value.as_f64() {
                    Ok(v) => v * factor,
                    Err(_) => continue,
                };
                let value = match desc.typ {
                    MetricType::Float => Value::Float(scaled as f32),
                    _ => Value::Double(scaled),
                };
                info.ivlist.push(IVal {
                    inst: val.inst,
                    value,
                });
            }
            Ok(info.ivlist.len() as i32)
        }

        NodeKind::Instant => {
            info.last_stamp = info.stamp;
            info.stamp = rp.timestamp;
            info.ivlist = left.as_ref().unwrap().info.ivlist.clone();
            Ok(info.ivlist.len() as i32)
        }

        NodeKind::Count => {
            let operand = left.as_ref().unwrap();
            info.ivlist = vec![IVal {
                inst: INST_NULL,
                value: Value::U32(operand.info.ivlist.len() as u32),
            }];
            Ok(1)
        }

        NodeKind::Scalar => {
            let operand = left.as_ref().unwrap();
            info.ivlist.clear();
            if let Some(first) = operand.info.ivlist.first() {
                info.ivlist.push(IVal {
                    inst: INST_NULL,
                    value: first.value.clone(),
                });
            }
            Ok(info.ivlist.len() as i32)
        }

        NodeKind::Avg => {
            let operand = left.as_ref().unwrap();
            // accumulate in float to minimise overflow
            let mut mean = 0f32;
            let n = operand.info.ivlist.len();
            for val in &operand.info.ivlist {
                mean += val.value.as_f64()? as f32 / n as f32;
            }
            info.ivlist = vec![IVal {
                inst: INST_NULL,
                value: Value::Float(mean),
            }];
            Ok(1)
        }

        NodeKind::Sum => {
            let operand = left.as_ref().unwrap();
            let mut acc = Value::zero(desc.typ)?;
            for val in &operand.info.ivlist {
                acc = bin_op(
                    desc.typ,
                    crate::value::BinOp::Add,
                    &acc,
                    1.0,
                    &val.value,
                    1.0,
                )?;
            }
            info.ivlist = vec![IVal {
                inst: INST_NULL,
                value: acc,
            }];
            Ok(1)
        }

        NodeKind::Max | NodeKind::Min => {
            let want_max = matches!(kind, NodeKind::Max);
            let operand = left.as_ref().unwrap();
            info.ivlist.clear();
            let mut best: Option<Value> = None;
            for val in &operand.info.ivlist {
                let promoted = val.value.promote_to(desc.typ)?;
                best = Some(match best {
                    None => promoted,
                    Some(current) => {
                        let keep_new = bin_op(
                            desc.typ,
                            if want_max {
                                crate::value::BinOp::Gt
                            } else {
                                crate::value::BinOp::Lt
                            },
                            &promoted,
                            1.0,
                            &current,
                            1.0,
                        )?;
                        if as_u32_flag(&keep_new) == Value::U32(1) {
                            promoted
                        } else {
                            current
                        }
                    }
                });
            }
            if let Some(best) = best {
                info.ivlist.push(IVal {
                    inst: INST_NULL,
                    value: best,
                });
            }
            Ok(info.ivlist.len() as i32)
        }

        NodeKind::Defined(_) => Ok(info.ivlist.len() as i32),

        NodeKind::Anon(_) | NodeKind::Scale(_) | NodeKind::Pattern(_) => Ok(0),

        NodeKind::FilterInst => {
            info.last_stamp = info.stamp;
            info.stamp = rp.timestamp;
            let pattern_node = left.as_mut().unwrap();
            let operand = right.as_ref().unwrap();
            let pattern = match &mut pattern_node.kind {
                NodeKind::Pattern(p) => p,
                _ => return Err(Error::BadType),
            };
            match pattern {
                Pattern::Regex {
                    re,
                    invert,
                    seen,
                    used,
                } => {
                    free_ivlist(info);
                    for val in &operand.info.ivlist {
                        let entry = seen.entry(val.inst).or_insert_with(|| {
                            let matched = match src.inst_name(
                                operand.desc.indom,
                                val.inst,
                                Some(rp.timestamp),
                            ) {
                                Ok(name) => {
                                    // canonical external name: strip at
                                    // the first space
                                    let name =
                                        name.split(' ').next().unwrap_or("").to_string();
                                    re.is_match(&name) != *invert
                                }
                                Err(_) => false,
                            };
                            super::InstUsage { matched, used: 0 }
                        });
                        entry.used += 1;
                        if entry.matched {
                            info.ivlist.push(val.clone());
                        }
                    }
                    *used += 1;
                    if *used >= REGEX_INST_COMPACT {
                        let before = seen.len();
                        seen.retain(|_, usage| usage.used >= REGEX_INST_COMPACT / 2);
                        for usage in seen.values_mut() {
                            usage.used = 0;
                        }
                        trace!(
                            culled = before - seen.len(),
                            kept = seen.len(),
                            "regex filter instance cache compacted"
                        );
                        *used = 0;
                    }
                }
                Pattern::Exact { name, cached } => {
                    info.ivlist.clear();
                    let generation =
                        src.indom_generation(operand.desc.indom, Some(rp.timestamp));
                    let inst = match cached {
                        Some((inst, gen)) if *gen == generation => *inst,
                        _ => {
                            match src.lookup_inst(operand.desc.indom, name, Some(rp.timestamp)) {
                                Ok(inst) => {
                                    *cached = Some((inst, generation));
                                    inst
                                }
                                Err(_) => return Ok(0),
                            }
                        }
                    };
                    if let Some(val) = operand.info.ivlist.iter().find(|v| v.inst == inst) {
                        info.ivlist.push(val.clone());
                    }
                }
            }
            Ok(info.ivlist.len() as i32)
        }

        NodeKind::Bin(op) => {
            let op = *op;
            free_ivlist(info);
            let lhs = left.as_ref().unwrap();
            let rhs = right.as_ref().unwrap();
            let lvals = &lhs.info.ivlist;
            let rvals = &rhs.info.ivlist;
            if lvals.is_empty() || rvals.is_empty() {
                return Ok(0);
            }
            let lscalar = lhs.desc.indom.is_null();
            let rscalar = rhs.desc.indom.is_null();
            let target = if lscalar {
                rvals.len()
            } else if rscalar {
                lvals.len()
            } else {
                lvals.len().min(rvals.len())
            };
            let res_type = if op.is_comparison() || op.is_boolean() {
                promote(lhs.desc.typ, rhs.desc.typ)?
            } else {
                desc.typ
            };
            let (mut i, mut j) = (0usize, 0usize);
            while info.ivlist.len() < target {
                if i >= lvals.len() || j >= rvals.len() {
                    break;
                }
                if !lscalar && !rscalar && lvals[i].inst != rvals[j].inst {
                    // joined by instance id; search the right operand
                    match rvals.iter().position(|v| v.inst == lvals[i].inst) {
                        Some(pos) => j = pos,
                        None => {
                            i += 1;
                            j = 0;
                            continue;
                        }
                    }
                }
                let raw = bin_op(
                    res_type,
                    op,
                    &lvals[i].value,
                    lhs.info.scale,
                    &rvals[j].value,
                    rhs.info.scale,
                )?;
                let value = if op.is_comparison() || op.is_boolean() {
                    as_u32_flag(&raw)
                } else {
                    raw
                };
                let inst = if !lscalar {
                    lvals[i].inst
                } else {
                    rvals[j].inst
                };
                info.ivlist.push(IVal { inst, value });
                if !lscalar {
                    i += 1;
                    if !rscalar {
                        j += 1;
                        if j >= rvals.len() {
                            j = 0;
                        }
                    }
                } else if !rscalar {
                    j += 1;
                }
            }
            Ok(info.ivlist.len() as i32)
        }
    }
}
