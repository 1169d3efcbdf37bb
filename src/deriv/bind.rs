//! Lazy binding: resolve metric names, synthesize a descriptor for
//! every interior node, and enforce the semantic rules the evaluator
//! relies on.

use btoi::btoi;

use super::{IVal, MetadataSource, Node, NodeKind};
use crate::desc::{MetricType, Semantics};
use crate::error::{Error, Result};
use crate::ident::{IndomId, MetricId, INST_NULL};
use crate::units::Units;
use crate::value::{promote, Value};

pub fn bind(node: &mut Node, src: &dyn MetadataSource) -> Result<()> {
    if let Some(left) = node.left.as_mut() {
        bind(left, src)?;
    }
    if let Some(right) = node.right.as_mut() {
        bind(right, src)?;
    }

    match &node.kind {
        NodeKind::Integer(lexeme) => {
            node.desc.typ = classify_integer(lexeme)?;
            node.desc.sem = Semantics::Discrete;
            node.desc.indom = IndomId::NULL;
        }
        NodeKind::Double(_) => {
            node.desc.typ = MetricType::Double;
            node.desc.sem = Semantics::Discrete;
            node.desc.indom = IndomId::NULL;
        }
        NodeKind::Name(name) => {
            let pmid = src.pmid(name)?;
            node.info.pmid = pmid;
            node.desc = src.desc(pmid)?;
        }
        NodeKind::Scale(units) => {
            node.desc.units = *units;
            node.desc.indom = IndomId::NULL;
        }
        NodeKind::Pattern(_) => {}
        NodeKind::Defined(name) => {
            node.desc.typ = MetricType::U32;
            node.desc.sem = Semantics::Discrete;
            node.desc.indom = IndomId::NULL;
            node.info.ivlist = vec![IVal {
                inst: INST_NULL,
                value: Value::U32(src.pmid(name).is_ok() as u32),
            }];
            node.info.parsed = true;
        }
        NodeKind::Anon(typ) => {
            node.desc.typ = *typ;
            node.desc.sem = Semantics::Instant;
            node.desc.indom = IndomId::NULL;
        }
        NodeKind::Neg => {
            let child = child_desc(node)?;
            require_numeric(child.typ)?;
            node.desc = child;
            node.desc.typ = match child.typ {
                MetricType::U32 => MetricType::I32,
                MetricType::U64 => MetricType::I64,
                other => other,
            };
        }
        NodeKind::Not => {
            let child = child_desc(node)?;
            require_numeric(child.typ)?;
            node.desc = child;
            node.desc.typ = MetricType::U32;
            node.desc.units = Units::NONE;
        }
        NodeKind::Bin(op) => {
            let left = node.left.as_ref().unwrap().desc;
            let right = node.right.as_ref().unwrap().desc;
            require_numeric(left.typ)?;
            require_numeric(right.typ)?;
            let promoted = promote(left.typ, right.typ)?;
            node.desc.indom = if left.indom.is_null() {
                right.indom
            } else {
                left.indom
            };
            if op.is_comparison() || op.is_boolean() {
                if !left.units.same_dimensions(&right.units)
                    && !left.units.is_dimensionless()
                    && !right.units.is_dimensionless()
                {
                    return Err(Error::Conv);
                }
                node.desc.typ = MetricType::U32;
                node.desc.units = Units::NONE;
                node.desc.sem = Semantics::Instant;
            } else {
                match op {
                    crate::value::BinOp::Add | crate::value::BinOp::Sub => {
                        if !left.units.same_dimensions(&right.units)
                            && !left.units.is_dimensionless()
                            && !right.units.is_dimensionless()
                        {
                            return Err(Error::Conv);
                        }
                        node.desc.typ = promoted;
                        node.desc.units = if left.units.is_dimensionless() {
                            right.units
                        } else {
                            left.units
                        };
                        node.desc.sem = if left.sem == Semantics::Counter
                            && right.sem == Semantics::Counter
                        {
                            Semantics::Counter
                        } else {
                            Semantics::Instant
                        };
                    }
                    crate::value::BinOp::Mul => {
                        node.desc.typ = promoted;
                        node.desc.units = combine_units(&left.units, &right.units, 1);
                        node.desc.sem = Semantics::Instant;
                    }
                    crate::value::BinOp::Div => {
                        // integer division is never exposed; the result
                        // is always computed at double precision
                        node.desc.typ = MetricType::Double;
                        node.desc.units = combine_units(&left.units, &right.units, -1);
                        node.desc.sem = Semantics::Instant;
                    }
                    _ => unreachable!(),
                }
            }
            // operand scale factors are only consulted for
            // double-precision computation
            if left.units.same_dimensions(&right.units) && left.units != right.units {
                let factor = right.units.scale_factor(&left.units)?;
                node.right.as_mut().unwrap().info.scale = factor;
            }
        }
        NodeKind::Quest => {
            let guard = node.left.as_ref().unwrap();
            require_numeric(guard.desc.typ)?;
            let colon = node.right.as_ref().unwrap();
            let then = colon.left.as_ref().unwrap().desc;
            let otherwise = colon.right.as_ref().unwrap().desc;
            let typ = if then.typ == MetricType::String || otherwise.typ == MetricType::String {
                if then.typ != otherwise.typ {
                    return Err(Error::BadType);
                }
                MetricType::String
            } else {
                promote(then.typ, otherwise.typ)?
            };
            // at most one indom across guard and both arms
            let mut indom = IndomId::NULL;
            for candidate in [guard.desc.indom, then.indom, otherwise.indom].iter() {
                if candidate.is_null() {
                    continue;
                }
                if !indom.is_null() && indom != *candidate {
                    return Err(Error::BadType);
                }
                indom = *candidate;
            }
            node.desc.typ = typ;
            node.desc.indom = indom;
            node.desc.sem = then.sem;
            node.desc.units = then.units;
            node.right.as_mut().unwrap().desc = node.desc;
        }
        NodeKind::Colon => {
            // descriptor filled in by the enclosing Quest
        }
        NodeKind::Avg => {
            let child = child_desc(node)?;
            require_numeric(child.typ)?;
            node.desc = child;
            node.desc.typ = MetricType::Float;
            node.desc.indom = IndomId::NULL;
        }
        NodeKind::Count => {
            node.desc.typ = MetricType::U32;
            node.desc.indom = IndomId::NULL;
            node.desc.sem = Semantics::Instant;
            node.desc.units = Units::count();
        }
        NodeKind::Sum | NodeKind::Max | NodeKind::Min => {
            let child = child_desc(node)?;
            require_numeric(child.typ)?;
            node.desc = child;
            node.desc.indom = IndomId::NULL;
        }
        NodeKind::Scalar => {
            let child = child_desc(node)?;
            node.desc = child;
            node.desc.indom = IndomId::NULL;
        }
        NodeKind::Delta => {
            let child = child_desc(node)?;
            require_numeric(child.typ)?;
            node.desc = child;
            node.desc.sem = Semantics::Instant;
            node.left.as_mut().unwrap().info.save_last = true;
        }
        NodeKind::Rate => {
            let child = child_desc(node)?;
            require_numeric(child.typ)?;
            if !(0..=1).contains(&child.units.dim_time) {
                return Err(Error::Conv);
            }
            node.desc = child;
            node.desc.typ = MetricType::Double;
            node.desc.sem = Semantics::Instant;
            node.desc.units.dim_time -= 1;
            if node.desc.units.dim_time == 0 {
                node.desc.units.scale_time = 0;
            }
            node.left.as_mut().unwrap().info.save_last = true;
        }
        NodeKind::Instant => {
            node.desc = child_desc(node)?;
            node.desc.sem = Semantics::Instant;
        }
        NodeKind::Rescale => {
            let child = child_desc(node)?;
            require_numeric(child.typ)?;
            let target = node.right.as_ref().unwrap().desc.units;
            if !child.units.same_dimensions(&target) {
                return Err(Error::Conv);
            }
            node.desc = child;
            node.desc.units = target;
            node.desc.typ = match child.typ {
                MetricType::Float => MetricType::Float,
                MetricType::Double => MetricType::Double,
                _ => MetricType::Double,
            };
        }
        NodeKind::FilterInst => {
            let operand = node.right.as_ref().unwrap().desc;
            if operand.indom.is_null() {
                return Err(Error::BadType);
            }
            node.desc = operand;
        }
    }
    node.desc.pmid = MetricId::NULL;
    Ok(())
}

fn child_desc(node: &Node) -> Result<crate::desc::Descriptor> {
    node.left
        .as_ref()
        .map(|child| child.desc)
        .ok_or(Error::BadType)
}

fn require_numeric(typ: MetricType) -> Result<()> {
    if typ.is_numeric() {
        Ok(())
    } else {
        Err(Error::BadType)
    }
}

fn classify_integer(lexeme: &str) -> Result<MetricType> {
    let bytes = lexeme.as_bytes();
    if btoi::<i32>(bytes).is_ok() {
        Ok(MetricType::I32)
    } else if btoi::<u32>(bytes).is_ok() {
        Ok(MetricType::U32)
    } else if btoi::<i64>(bytes).is_ok() {
        Ok(MetricType::I64)
    } else if btoi::<u64>(bytes).is_ok() {
        Ok(MetricType::U64)
    } else {
        Err(Error::Config(format!("bad numeric literal: {}", lexeme)))
    }
}

fn combine_units(left: &Units, right: &Units, sign: i8) -> Units {
    fn pick<T>(ldim: i8, lscale: T, rscale: T) -> T {
        if ldim != 0 {
            lscale
        } else {
            rscale
        }
    }
    Units {
        dim_space: left.dim_space + sign * right.dim_space,
        dim_time: left.dim_time + sign * right.dim_time,
        dim_count: left.dim_count + sign * right.dim_count,
        scale_space: pick(left.dim_space, left.scale_space, right.scale_space),
        scale_time: pick(left.dim_time, left.scale_time, right.scale_time),
        scale_count: pick(left.dim_count, left.scale_count, right.scale_count),
    }
}
