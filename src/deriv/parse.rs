//! The expression grammar, parsed with nom combinators.
//!
//! Precedence, loosest first: `?:`, `||`, `&&`, comparisons,
//! `+ -`, `* /`, unary `- !`, primaries.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_until, take_while1},
    character::complete::{char, digit1, multispace0, one_of},
    combinator::{map, opt, recognize, verify},
    multi::many0,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use regex::Regex;

use super::{Node, NodeKind, Pattern};
use crate::desc::MetricType;
use crate::error::{Error, Result};
use crate::units::parse_units;
use crate::value::BinOp;

pub fn parse_expr(src: &str) -> Result<Node> {
    match ternary(src.trim()) {
        Ok(("", node)) => Ok(node),
        Ok((rest, _)) => Err(Error::Config(format!(
            "trailing input in expression: {:?}",
            rest
        ))),
        Err(e) => Err(Error::Config(format!("expression syntax: {}", e))),
    }
}

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn ternary(input: &str) -> IResult<&str, Node> {
    let (input, guard) = or_expr(input)?;
    let (input, tail) = opt(tuple((
        ws(char('?')),
        ternary,
        ws(char(':')),
        ternary,
    )))(input)?;
    Ok(match tail {
        None => (input, guard),
        Some((_, then, _, otherwise)) => {
            let colon = Node::binary(NodeKind::Colon, then, otherwise);
            (input, Node::binary(NodeKind::Quest, guard, colon))
        }
    })
}

fn or_expr(input: &str) -> IResult<&str, Node> {
    let (input, init) = and_expr(input)?;
    let (input, rest) = many0(preceded(ws(tag("||")), and_expr))(input)?;
    Ok((
        input,
        rest.into_iter().fold(init, |acc, rhs| {
            Node::binary(NodeKind::Bin(BinOp::Or), acc, rhs)
        }),
    ))
}

fn and_expr(input: &str) -> IResult<&str, Node> {
    let (input, init) = rel_expr(input)?;
    let (input, rest) = many0(preceded(ws(tag("&&")), rel_expr))(input)?;
    Ok((
        input,
        rest.into_iter().fold(init, |acc, rhs| {
            Node::binary(NodeKind::Bin(BinOp::And), acc, rhs)
        }),
    ))
}

fn rel_op(input: &str) -> IResult<&str, BinOp> {
    alt((
        map(tag("<="), |_| BinOp::Leq),
        map(tag(">="), |_| BinOp::Geq),
        map(tag("=="), |_| BinOp::Eq),
        map(tag("!="), |_| BinOp::Neq),
        map(tag("<"), |_| BinOp::Lt),
        map(tag(">"), |_| BinOp::Gt),
    ))(input)
}

fn rel_expr(input: &str) -> IResult<&str, Node> {
    let (input, init) = add_expr(input)?;
    let (input, rest) = many0(pair(ws(rel_op), add_expr))(input)?;
    Ok((
        input,
        rest.into_iter().fold(init, |acc, (op, rhs)| {
            Node::binary(NodeKind::Bin(op), acc, rhs)
        }),
    ))
}

fn add_expr(input: &str) -> IResult<&str, Node> {
    let (input, init) = mul_expr(input)?;
    let (input, rest) = many0(pair(ws(one_of("+-")), mul_expr))(input)?;
    Ok((
        input,
        rest.into_iter().fold(init, |acc, (op, rhs)| {
            let op = if op == '+' { BinOp::Add } else { BinOp::Sub };
            Node::binary(NodeKind::Bin(op), acc, rhs)
        }),
    ))
}

fn mul_expr(input: &str) -> IResult<&str, Node> {
    let (input, init) = unary_expr(input)?;
    let (input, rest) = many0(pair(ws(one_of("*/")), unary_expr))(input)?;
    Ok((
        input,
        rest.into_iter().fold(init, |acc, (op, rhs)| {
            let op = if op == '*' { BinOp::Mul } else { BinOp::Div };
            Node::binary(NodeKind::Bin(op), acc, rhs)
        }),
    ))
}

fn unary_expr(input: &str) -> IResult<&str, Node> {
    alt((
        map(preceded(ws(char('-')), unary_expr), |operand| {
            Node::unary(NodeKind::Neg, operand)
        }),
        map(preceded(ws(char('!')), unary_expr), |operand| {
            Node::unary(NodeKind::Not, operand)
        }),
        primary,
    ))(input)
}

fn primary(input: &str) -> IResult<&str, Node> {
    alt((
        delimited(ws(char('(')), ternary, ws(char(')'))),
        number,
        function,
        metric_name,
    ))(input)
}

fn number(input: &str) -> IResult<&str, Node> {
    let (rest, lexeme) = recognize(tuple((
        digit1,
        opt(pair(char('.'), digit1)),
        opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
    )))(input)?;
    let kind = if lexeme.contains('.') || lexeme.contains('e') || lexeme.contains('E') {
        NodeKind::Double(lexeme.to_string())
    } else {
        NodeKind::Integer(lexeme.to_string())
    };
    Ok((rest, Node::new(kind)))
}

fn name_segment(input: &str) -> IResult<&str, &str> {
    verify(
        take_while1(|c: char| c.is_alphanumeric() || c == '_'),
        |s: &str| s.starts_with(|c: char| c.is_alphabetic() || c == '_'),
    )(input)
}

fn dotted_name(input: &str) -> IResult<&str, &str> {
    recognize(pair(name_segment, many0(pair(char('.'), name_segment))))(input)
}

fn metric_name(input: &str) -> IResult<&str, Node> {
    map(dotted_name, |name| {
        Node::new(NodeKind::Name(name.to_string()))
    })(input)
}

fn unary_fn(input: &str) -> IResult<&str, NodeKind> {
    // the name must be terminated by '(' so that metrics whose first
    // component happens to be e.g. "sum" still parse as names
    let (rest, name) = alt((
        tag("avg"),
        tag("count"),
        tag("sum"),
        tag("max"),
        tag("min"),
        tag("scalar"),
        tag("delta"),
        tag("rate"),
        tag("instant"),
    ))(input)?;
    if !rest.trim_start().starts_with('(') {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        )));
    }
    Ok((
        rest,
        match name {
            "avg" => NodeKind::Avg,
            "count" => NodeKind::Count,
            "sum" => NodeKind::Sum,
            "max" => NodeKind::Max,
            "min" => NodeKind::Min,
            "scalar" => NodeKind::Scalar,
            "delta" => NodeKind::Delta,
            "rate" => NodeKind::Rate,
            _ => NodeKind::Instant,
        },
    ))
}

fn quoted(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_until("\""), char('"'))(input)
}

fn regex_literal(input: &str) -> IResult<&str, (bool, &str)> {
    let (input, invert) = opt(ws(char('!')))(input)?;
    let (input, re) = delimited(char('/'), take_until("/"), char('/'))(input)?;
    Ok((input, (invert.is_some(), re)))
}

fn function(input: &str) -> IResult<&str, Node> {
    alt((
        map(
            pair(unary_fn, delimited(ws(char('(')), ternary, ws(char(')')))),
            |(kind, operand)| Node::unary(kind, operand),
        ),
        rescale_fn,
        matchinst_fn,
        filterinst_fn,
        defined_fn,
        anon_fn,
    ))(input)
}

fn rescale_fn(input: &str) -> IResult<&str, Node> {
    let (input, _) = tag("rescale")(input)?;
    let (input, (expr, _, units)) = delimited(
        ws(char('(')),
        tuple((ternary, ws(char(',')), quoted)),
        ws(char(')')),
    )(input)?;
    let units = match parse_units(units) {
        Ok(u) => u,
        Err(_) => {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::MapRes,
            )))
        }
    };
    Ok((
        input,
        Node::binary(NodeKind::Rescale, expr, Node::new(NodeKind::Scale(units))),
    ))
}

fn matchinst_fn(input: &str) -> IResult<&str, Node> {
    let (input, _) = tag("matchinst")(input)?;
    let (input, ((invert, re), _, expr)) = delimited(
        ws(char('(')),
        tuple((ws(regex_literal), ws(char(',')), ternary)),
        ws(char(')')),
    )(input)?;
    let re = match Regex::new(re) {
        Ok(re) => re,
        Err(_) => {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::MapRes,
            )))
        }
    };
    let pattern = Node::new(NodeKind::Pattern(Pattern::Regex {
        re,
        invert,
        seen: Default::default(),
        used: 0,
    }));
    Ok((input, Node::binary(NodeKind::FilterInst, pattern, expr)))
}

fn filterinst_fn(input: &str) -> IResult<&str, Node> {
    let (input, _) = tag("filterinst")(input)?;
    let (input, (name, _, expr)) = delimited(
        ws(char('(')),
        tuple((ws(quoted), ws(char(',')), ternary)),
        ws(char(')')),
    )(input)?;
    let pattern = Node::new(NodeKind::Pattern(Pattern::Exact {
        name: name.to_string(),
        cached: None,
    }));
    Ok((input, Node::binary(NodeKind::FilterInst, pattern, expr)))
}

fn defined_fn(input: &str) -> IResult<&str, Node> {
    let (input, _) = tag("defined")(input)?;
    let (input, name) = delimited(ws(char('(')), ws(dotted_name), ws(char(')')))(input)?;
    Ok((input, Node::new(NodeKind::Defined(name.to_string()))))
}

fn anon_fn(input: &str) -> IResult<&str, Node> {
    let (input, _) = tag("anon")(input)?;
    let (input, typename) = delimited(ws(char('(')), ws(dotted_name), ws(char(')')))(input)?;
    let typ = match typename {
        "32" | "i32" => MetricType::I32,
        "u32" => MetricType::U32,
        "64" | "i64" => MetricType::I64,
        "u64" => MetricType::U64,
        "float" => MetricType::Float,
        "double" => MetricType::Double,
        _ => {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::MapRes,
            )))
        }
    };
    Ok((input, Node::new(NodeKind::Anon(typ))))
}
